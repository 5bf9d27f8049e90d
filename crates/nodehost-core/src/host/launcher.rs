//! Starting and stopping host processes and containers.

use crate::context::{ApplicationHostType, EnvironmentMap};
use crate::error::{HostingError, Result};
use crate::ids::HostId;
use crate::ipc::messages::{
    actions, ActivateContainerReply, ActivateContainerRequest, Actor, ContainerDescription,
    DeactivateContainerRequest,
};
use crate::ipc::IpcClient;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Exit code reported for hosts the node stopped itself.
pub const DEACTIVATED_EXIT_CODE: i32 = 7147;

/// Everything needed to start one host.
#[derive(Debug, Clone)]
pub struct HostActivationRequest {
    pub host_id: HostId,
    pub host_type: ApplicationHostType,
    pub program: String,
    pub arguments: Vec<String>,
    pub working_folder: PathBuf,
    pub environment: EnvironmentMap,
    /// Set for container hosts.
    pub container: Option<ContainerDescription>,
}

/// A host that exited, as reported by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostTermination {
    pub host_id: HostId,
    pub exit_code: i32,
}

/// Starts and stops hosts.
#[async_trait]
pub trait HostActivator: Send + Sync {
    async fn activate(&self, request: HostActivationRequest, timeout: Duration) -> Result<()>;

    /// Stop a host and wait for it to go away.
    async fn deactivate(&self, host_id: &HostId, timeout: Duration) -> Result<()>;

    /// Kill a host without waiting.
    fn terminate(&self, host_id: &HostId);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum RunningHost {
    Process(oneshot::Sender<()>),
    Container(String),
}

/// [`HostActivator`] spawning processes locally and delegating containers to
/// the container activator service.
///
/// Process exits are reported on the termination channel handed out by
/// [`new`](Self::new).
pub struct ProcessHostActivator {
    node_id: String,
    binaries_folder: String,
    container_service: Option<Arc<IpcClient>>,
    running: Arc<Mutex<HashMap<HostId, RunningHost>>>,
    terminations: mpsc::UnboundedSender<HostTermination>,
}

impl ProcessHostActivator {
    pub fn new(
        node_id: impl Into<String>,
        binaries_folder: impl Into<PathBuf>,
        container_service: Option<Arc<IpcClient>>,
    ) -> (Self, mpsc::UnboundedReceiver<HostTermination>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let activator = Self {
            node_id: node_id.into(),
            binaries_folder: binaries_folder.into().display().to_string(),
            container_service,
            running: Arc::new(Mutex::new(HashMap::new())),
            terminations: tx,
        };
        (activator, rx)
    }

    pub fn running_count(&self) -> usize {
        lock(&self.running).len()
    }

    fn container_service(&self) -> Result<&Arc<IpcClient>> {
        self.container_service
            .as_ref()
            .ok_or_else(|| HostingError::OperationNotSupported("container activator service not connected".into()))
    }

    async fn activate_container(
        &self,
        request: HostActivationRequest,
        container: ContainerDescription,
        timeout: Duration,
    ) -> Result<()> {
        let service = self.container_service()?;
        let name = container.container_name.clone();
        let body = ActivateContainerRequest {
            app_host_id: request.host_id.to_string(),
            node_id: self.node_id.clone(),
            container: ContainerDescription {
                environment: request.environment,
                ..container
            },
            fabric_bin_folder: self.binaries_folder.clone(),
            gateway_ip_address: String::new(),
        };
        let reply: ActivateContainerReply = service
            .request(Actor::ContainerActivatorService, actions::ACTIVATE_CONTAINER, body, timeout)
            .await?;
        info!(host_id = %request.host_id, container = %name, container_id = %reply.container_id, "Container host started");
        lock(&self.running).insert(request.host_id, RunningHost::Container(name));
        Ok(())
    }

    fn spawn_process(&self, request: HostActivationRequest) -> Result<()> {
        let host_id = request.host_id;
        let mut child = Command::new(&request.program)
            .args(&request.arguments)
            .current_dir(&request.working_folder)
            .env_clear()
            .envs(&request.environment)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                warn!(host_id = %host_id, program = %request.program, error = %e, "Failed to spawn host");
                HostingError::OperationFailed(format!("failed to start {}: {e}", request.program))
            })?;
        info!(host_id = %host_id, program = %request.program, pid = ?child.id(), "Host process started");

        let (stop_tx, stop_rx) = oneshot::channel();
        lock(&self.running).insert(host_id, RunningHost::Process(stop_tx));

        let running = self.running.clone();
        let terminations = self.terminations.clone();
        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = stop_rx => None,
            };
            let exit_code = match exited {
                Some(Ok(status)) => status.code().unwrap_or(-1),
                Some(Err(e)) => {
                    warn!(host_id = %host_id, error = %e, "Failed to wait for host");
                    -1
                }
                None => {
                    if let Err(e) = child.start_kill() {
                        debug!(host_id = %host_id, error = %e, "Host already gone");
                    }
                    let _ = child.wait().await;
                    DEACTIVATED_EXIT_CODE
                }
            };
            lock(&running).remove(&host_id);
            debug!(host_id = %host_id, exit_code, "Host process exited");
            let _ = terminations.send(HostTermination { host_id, exit_code });
        });
        Ok(())
    }
}

#[async_trait]
impl HostActivator for ProcessHostActivator {
    async fn activate(&self, request: HostActivationRequest, timeout: Duration) -> Result<()> {
        match request.container.clone() {
            Some(container) => self.activate_container(request, container, timeout).await,
            None => self.spawn_process(request),
        }
    }

    async fn deactivate(&self, host_id: &HostId, timeout: Duration) -> Result<()> {
        let running = lock(&self.running).remove(host_id);
        match running {
            None => Err(HostingError::NotFound(format!("host {host_id}"))),
            Some(RunningHost::Process(stop)) => {
                let _ = stop.send(());
                Ok(())
            }
            Some(RunningHost::Container(name)) => {
                let body = DeactivateContainerRequest {
                    container_name: name,
                    graceful: true,
                    group_container_name: String::new(),
                };
                self.container_service()?
                    .request(Actor::ContainerActivatorService, actions::DEACTIVATE_CONTAINER, body, timeout)
                    .await
            }
        }
    }

    fn terminate(&self, host_id: &HostId) {
        let running = lock(&self.running).remove(host_id);
        match running {
            None => {}
            Some(RunningHost::Process(stop)) => {
                let _ = stop.send(());
            }
            Some(RunningHost::Container(name)) => {
                let Some(service) = self.container_service.clone() else {
                    return;
                };
                let host_id = *host_id;
                tokio::spawn(async move {
                    let body = DeactivateContainerRequest {
                        container_name: name,
                        graceful: false,
                        group_container_name: String::new(),
                    };
                    let result: Result<()> = service
                        .request(
                            Actor::ContainerActivatorService,
                            actions::DEACTIVATE_CONTAINER,
                            body,
                            Duration::from_secs(30),
                        )
                        .await;
                    if let Err(e) = result {
                        warn!(host_id = %host_id, error = %e, "Failed to terminate container host");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(program: &str, arguments: &[&str]) -> HostActivationRequest {
        HostActivationRequest {
            host_id: HostId::new(),
            host_type: ApplicationHostType::ActivatedSingleCodePackage,
            program: program.into(),
            arguments: arguments.iter().map(|a| a.to_string()).collect(),
            working_folder: std::env::temp_dir(),
            environment: EnvironmentMap::new(),
            container: None,
        }
    }

    #[tokio::test]
    async fn test_process_exit_is_reported() {
        let (activator, mut terminations) = ProcessHostActivator::new("N1", "/bin", None);
        let request = request("/bin/sh", &["-c", "exit 3"]);
        let host_id = request.host_id;

        activator.activate(request, Duration::from_secs(5)).await.unwrap();
        let termination = terminations.recv().await.unwrap();
        assert_eq!(termination, HostTermination { host_id, exit_code: 3 });
    }

    #[tokio::test]
    async fn test_deactivate_stops_process() {
        let (activator, mut terminations) = ProcessHostActivator::new("N1", "/bin", None);
        let request = request("/bin/sh", &["-c", "sleep 30"]);
        let host_id = request.host_id;

        activator.activate(request, Duration::from_secs(5)).await.unwrap();
        assert_eq!(activator.running_count(), 1);
        activator.deactivate(&host_id, Duration::from_secs(5)).await.unwrap();

        let termination = terminations.recv().await.unwrap();
        assert_eq!(termination.exit_code, DEACTIVATED_EXIT_CODE);
        assert!(matches!(
            activator.deactivate(&host_id, Duration::from_secs(5)).await,
            Err(HostingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_container_requires_service() {
        let (activator, _terminations) = ProcessHostActivator::new("N1", "/bin", None);
        let mut request = request("", &[]);
        request.container = Some(ContainerDescription::default());
        let err = activator.activate(request, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, HostingError::OperationNotSupported(_)));
    }
}
