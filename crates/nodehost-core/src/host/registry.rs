//! Registry of the application hosts running on this node.

use crate::error::{HostingError, Result};
use crate::host::activation::{ApplicationHostIsolationContext, CodePackageActivation, HostingHolder};
use crate::host::launcher::HostTermination;
use crate::host::proxy::{create_application_host_proxy, ApplicationHostProxy};
use crate::ids::HostId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Default)]
struct Hosts {
    by_id: HashMap<HostId, Arc<dyn ApplicationHostProxy>>,
    by_isolation: HashMap<ApplicationHostIsolationContext, HostId>,
}

/// Tracks host proxies by id and by isolation context.
///
/// # Thread Safety
///
/// Both indexes live behind one async `RwLock` so they never disagree.
pub struct ApplicationHostRegistry {
    holder: Arc<HostingHolder>,
    hosts: RwLock<Hosts>,
    /// Maximum number of hosts (0 = unlimited).
    max_hosts: usize,
    shutdown_notify: Arc<Notify>,
}

impl ApplicationHostRegistry {
    pub fn new(holder: Arc<HostingHolder>, max_hosts: usize) -> Self {
        Self {
            holder,
            hosts: RwLock::new(Hosts::default()),
            max_hosts,
            shutdown_notify: Arc::new(Notify::new()),
        }
    }

    pub fn holder(&self) -> &Arc<HostingHolder> {
        &self.holder
    }

    /// Return the host serving `activation`'s isolation context, creating
    /// and registering a new proxy if none exists.
    ///
    /// The returned flag is true for a freshly created proxy, which the
    /// caller must open.
    ///
    /// # Errors
    ///
    /// Returns `OperationFailed` if the host limit is reached.
    pub async fn get_or_create(
        &self,
        activation: CodePackageActivation,
    ) -> Result<(Arc<dyn ApplicationHostProxy>, bool)> {
        let isolation = ApplicationHostIsolationContext::for_activation(&self.holder.config, &activation);
        let mut hosts = self.hosts.write().await;

        if let Some(proxy) = hosts
            .by_isolation
            .get(&isolation)
            .and_then(|id| hosts.by_id.get(id))
        {
            return Ok((proxy.clone(), false));
        }
        self.check_limit(&hosts)?;

        let proxy = create_application_host_proxy(self.holder.clone(), isolation.clone(), activation);
        let host_id = proxy.host_id();
        hosts.by_isolation.insert(isolation.clone(), host_id);
        hosts.by_id.insert(host_id, proxy.clone());
        info!(host_id = %host_id, isolation = %isolation, host_type = %proxy.host_type(), "Application host registered");
        Ok((proxy, true))
    }

    /// Register an externally created proxy.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the id or isolation context is taken, or
    /// `OperationFailed` if the host limit is reached.
    pub async fn add(&self, proxy: Arc<dyn ApplicationHostProxy>) -> Result<()> {
        let host_id = proxy.host_id();
        let isolation = proxy.isolation_context().clone();
        let mut hosts = self.hosts.write().await;

        if hosts.by_id.contains_key(&host_id) || hosts.by_isolation.contains_key(&isolation) {
            return Err(HostingError::AlreadyExists(format!("application host {host_id} ({isolation})")));
        }
        self.check_limit(&hosts)?;

        hosts.by_isolation.insert(isolation, host_id);
        hosts.by_id.insert(host_id, proxy);
        debug!(host_id = %host_id, "Application host added");
        Ok(())
    }

    fn check_limit(&self, hosts: &Hosts) -> Result<()> {
        if self.max_hosts > 0 && hosts.by_id.len() >= self.max_hosts {
            return Err(HostingError::OperationFailed(format!(
                "max application host limit reached ({})",
                self.max_hosts
            )));
        }
        Ok(())
    }

    pub async fn find(&self, host_id: &HostId) -> Option<Arc<dyn ApplicationHostProxy>> {
        self.hosts.read().await.by_id.get(host_id).cloned()
    }

    pub async fn find_by_isolation(
        &self,
        isolation: &ApplicationHostIsolationContext,
    ) -> Option<Arc<dyn ApplicationHostProxy>> {
        let hosts = self.hosts.read().await;
        hosts.by_isolation.get(isolation).and_then(|id| hosts.by_id.get(id)).cloned()
    }

    /// Unregister a host. Returns the proxy if it was known.
    pub async fn remove(&self, host_id: &HostId) -> Option<Arc<dyn ApplicationHostProxy>> {
        let mut hosts = self.hosts.write().await;
        let proxy = hosts.by_id.remove(host_id)?;
        hosts.by_isolation.remove(proxy.isolation_context());
        debug!(host_id = %host_id, "Application host removed");
        Some(proxy)
    }

    pub async fn len(&self) -> usize {
        self.hosts.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop a host that exited and tell its proxy.
    pub async fn on_application_host_terminated(&self, host_id: &HostId, exit_code: i32) {
        match self.remove(host_id).await {
            Some(proxy) => proxy.on_application_host_terminated(exit_code),
            None => debug!(host_id = %host_id, exit_code, "Termination of unknown host ignored"),
        }
    }

    /// Consume host exits until [`shutdown`](Self::shutdown) is called or
    /// the channel closes.
    pub fn start_termination_monitor(
        self: &Arc<Self>,
        mut terminations: mpsc::UnboundedReceiver<HostTermination>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let shutdown_notify = Arc::clone(&self.shutdown_notify);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_notify.notified() => {
                        debug!("Host termination monitor shutting down");
                        break;
                    }

                    termination = terminations.recv() => {
                        let Some(HostTermination { host_id, exit_code }) = termination else {
                            break;
                        };
                        registry.on_application_host_terminated(&host_id, exit_code).await;
                    }
                }
            }
        })
    }

    /// Stop the termination monitor.
    pub fn shutdown(&self) {
        self.shutdown_notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostingConfig, NodeConfig};
    use crate::context::CodePackageContext;
    use crate::host::client::ApplicationHostClient;
    use crate::host::environment::EphemeralCredentialIssuer;
    use crate::host::launcher::{HostActivationRequest, HostActivator};
    use crate::host::state::HostProxyState;
    use crate::ids::{ApplicationId, CodePackageInstanceId, ServicePackageId, ServicePackageInstanceId};
    use crate::ipc::messages::{ApplicationHostCodePackageOperationRequest, DependentCodePackageEvent};
    use crate::model::{CodePackageDescription, EntryPointType};
    use async_trait::async_trait;
    use std::time::Duration;

    struct NoopActivator;

    #[async_trait]
    impl HostActivator for NoopActivator {
        async fn activate(&self, _: HostActivationRequest, _: Duration) -> Result<()> {
            Ok(())
        }
        async fn deactivate(&self, _: &HostId, _: Duration) -> Result<()> {
            Ok(())
        }
        fn terminate(&self, _: &HostId) {}
    }

    struct NoopClient;

    #[async_trait]
    impl ApplicationHostClient for NoopClient {
        async fn update_code_package_context(&self, _: &HostId, _: CodePackageContext, _: Duration) -> Result<()> {
            Ok(())
        }
        async fn code_package_operation(
            &self,
            _: ApplicationHostCodePackageOperationRequest,
            _: Duration,
        ) -> Result<()> {
            Ok(())
        }
        async fn send_dependent_code_package_event(&self, _: DependentCodePackageEvent) -> Result<()> {
            Ok(())
        }
    }

    fn registry(max_hosts: usize) -> Arc<ApplicationHostRegistry> {
        let holder = Arc::new(HostingHolder::new(
            NodeConfig::rooted_at("/srv/node", "N1"),
            HostingConfig::default(),
            Arc::new(NoopActivator),
            Arc::new(NoopClient),
            Arc::new(EphemeralCredentialIssuer),
        ));
        Arc::new(ApplicationHostRegistry::new(holder, max_hosts))
    }

    fn activation(code_package: &str, entry_point: EntryPointType) -> CodePackageActivation {
        let sp = ServicePackageId::new(ApplicationId::new("Calc", 1), "Front");
        let cp = CodePackageInstanceId::new(ServicePackageInstanceId::new(sp, ""), code_package);
        let context = CodePackageContext::new(cp, 1, 1, "1.0:1", "fabric:/Calc");
        CodePackageActivation::new(context, CodePackageDescription::new(code_package, entry_point))
    }

    #[tokio::test]
    async fn test_shared_isolation_reuses_host() {
        let registry = registry(0);
        let (first, created) = registry
            .get_or_create(activation("Code", EntryPointType::DllHost))
            .await
            .unwrap();
        assert!(created);
        let (second, created) = registry
            .get_or_create(activation("Setup", EntryPointType::DllHost))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first.host_id(), second.host_id());

        let (exe, created) = registry
            .get_or_create(activation("Worker", EntryPointType::Exe))
            .await
            .unwrap();
        assert!(created);
        assert_ne!(exe.host_id(), first.host_id());
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_limit_and_duplicates() {
        let registry = registry(1);
        let (proxy, _) = registry
            .get_or_create(activation("Code", EntryPointType::Exe))
            .await
            .unwrap();

        let err = registry.add(proxy.clone()).await.unwrap_err();
        assert!(matches!(err, HostingError::AlreadyExists(_)));

        let err = registry
            .get_or_create(activation("Other", EntryPointType::Exe))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HostingError::OperationFailed(_)));
    }

    #[tokio::test]
    async fn test_remove_clears_both_indexes() {
        let registry = registry(0);
        let (proxy, _) = registry
            .get_or_create(activation("Code", EntryPointType::Exe))
            .await
            .unwrap();
        let isolation = proxy.isolation_context().clone();

        assert!(registry.find_by_isolation(&isolation).await.is_some());
        assert!(registry.remove(&proxy.host_id()).await.is_some());
        assert!(registry.find(&proxy.host_id()).await.is_none());
        assert!(registry.find_by_isolation(&isolation).await.is_none());
        assert!(registry.remove(&proxy.host_id()).await.is_none());
    }

    #[tokio::test]
    async fn test_monitor_reports_terminations() {
        let registry = registry(0);
        let (proxy, _) = registry
            .get_or_create(activation("Code", EntryPointType::Exe))
            .await
            .unwrap();
        proxy.open(Duration::from_secs(5)).await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = registry.start_termination_monitor(rx);
        tx.send(HostTermination {
            host_id: proxy.host_id(),
            exit_code: 1,
        })
        .unwrap();
        drop(tx);
        monitor.await.unwrap();

        assert!(registry.is_empty().await);
        assert_eq!(proxy.state(), HostProxyState::Aborted);
        assert_eq!(proxy.core().exit_code(), Some(1));
    }
}
