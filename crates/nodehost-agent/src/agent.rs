//! Registration with the node host and container event forwarding.

use crate::config::AgentConfig;
use crate::handler::AgentHandler;
use crate::service::ContainerActivatorService;
use nodehost_core::ipc::messages::{
    actions, Actor, ContainerEventDescription, ContainerEventNotificationRequest,
    RegisterContainerActivatorServiceReply, RegisterContainerActivatorServiceRequest,
};
use nodehost_core::{HostingError, IpcClient, IpcServer, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The out-of-process container activator: serves container requests from
/// the node host and reports container events back to it.
pub struct ContainerActivatorAgent {
    config: AgentConfig,
    service: Arc<dyn ContainerActivatorService>,
    server: Option<IpcServer>,
    client: Option<Arc<IpcClient>>,
    event_forwarder: Option<JoinHandle<()>>,
}

impl ContainerActivatorAgent {
    pub fn new(config: AgentConfig, service: Arc<dyn ContainerActivatorService>) -> Self {
        Self {
            config,
            service,
            server: None,
            client: None,
            event_forwarder: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.server.as_ref().is_some_and(IpcServer::is_running) && self.client.is_some()
    }

    /// Start serving and register with the host.
    ///
    /// The request server is up before registration so the host can send
    /// container requests as soon as it accepts the agent. Event monitoring
    /// starts when the host reports a running container service; a failure
    /// there is logged and does not fail the open.
    ///
    /// # Errors
    ///
    /// Returns the registration failure, or `Timeout` if the host kept
    /// reporting a previous registration past `timeout`. Nothing stays
    /// running after an error.
    pub async fn open(&mut self, timeout: Duration) -> Result<RegisterContainerActivatorServiceReply> {
        let start = Instant::now();
        let handler = Arc::new(AgentHandler::new(Arc::clone(&self.service)));
        let mut server = IpcServer::bind(&self.config.listen_socket, handler).await?;

        let client = match IpcClient::connect(&self.config.host_socket).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                error!(path = %self.config.host_socket.display(), error = %e, "Failed to connect to host");
                server.shutdown().await;
                return Err(e);
            }
        };

        let reply = match self.register_with_host(&client, timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, "Registration with host failed");
                server.shutdown().await;
                return Err(e);
            }
        };

        if reply.is_container_service_present {
            match self.start_event_monitoring(&client, reply.event_since_time).await {
                Ok(forwarder) => self.event_forwarder = Some(forwarder),
                Err(e) => warn!(error = %e, "Container event monitoring unavailable"),
            }
        }

        self.server = Some(server);
        self.client = Some(client);
        info!(
            listen = %self.config.listen_socket.display(),
            container_service = reply.is_container_service_present,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Container activator agent opened"
        );
        Ok(reply)
    }

    /// Register until the host accepts, retrying while it still holds a
    /// previous registration of this agent.
    async fn register_with_host(
        &self,
        client: &IpcClient,
        timeout: Duration,
    ) -> Result<RegisterContainerActivatorServiceReply> {
        let deadline = Instant::now() + timeout;
        let request = RegisterContainerActivatorServiceRequest {
            process_id: std::process::id(),
            listen_address: self.config.listen_socket.display().to_string(),
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(HostingError::Timeout(timeout));
            }
            let result: Result<RegisterContainerActivatorServiceReply> = client
                .request(
                    Actor::ContainerActivatorServiceClient,
                    actions::REGISTER_CONTAINER_ACTIVATOR_SERVICE,
                    request.clone(),
                    remaining,
                )
                .await;
            match result {
                Ok(reply) => {
                    debug!(attempt, "Registered with host");
                    return Ok(reply);
                }
                Err(HostingError::AlreadyExists(message)) => {
                    debug!(attempt, message = %message, "Host still holds a previous registration, retrying");
                    let wait = self
                        .config
                        .registration_retry_interval
                        .min(deadline.saturating_duration_since(Instant::now()));
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn start_event_monitoring(&self, client: &Arc<IpcClient>, since: i64) -> Result<JoinHandle<()>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.service.start_event_monitoring(since, events_tx).await?;
        Ok(spawn_event_forwarder(
            Arc::clone(client),
            events_rx,
            self.config.request_timeout,
        ))
    }

    /// Stop event forwarding and the request server.
    pub async fn close(&mut self) {
        if let Some(forwarder) = self.event_forwarder.take() {
            forwarder.abort();
        }
        if let Some(mut server) = self.server.take() {
            server.shutdown().await;
        }
        self.client = None;
        info!("Container activator agent closed");
    }
}

/// Forward each container event to the host. Delivery failures are logged
/// and the event is dropped.
fn spawn_event_forwarder(
    client: Arc<IpcClient>,
    mut events: mpsc::UnboundedReceiver<ContainerEventDescription>,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let mut batch = vec![event];
            while let Ok(next) = events.try_recv() {
                batch.push(next);
            }
            let count = batch.len();
            let notification = ContainerEventNotificationRequest { events: batch };
            let result: Result<()> = client
                .request(
                    Actor::ContainerActivatorServiceClient,
                    actions::CONTAINER_EVENT_NOTIFICATION,
                    notification,
                    timeout,
                )
                .await;
            match result {
                Ok(()) => debug!(count, "Container events delivered"),
                Err(e) => warn!(count, error = %e, "Failed to deliver container events"),
            }
        }
        debug!("Container event stream closed");
    })
}
