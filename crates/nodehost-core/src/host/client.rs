//! Requests sent from the node to running application hosts.

use crate::context::CodePackageContext;
use crate::error::Result;
use crate::ids::HostId;
use crate::ipc::messages::{
    actions, Actor, ApplicationHostCodePackageOperationRequest, DependentCodePackageEvent,
    UpdateCodePackageContextRequest,
};
use crate::ipc::IpcClient;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Channel to the hosts started on this node.
#[async_trait]
pub trait ApplicationHostClient: Send + Sync {
    async fn update_code_package_context(
        &self,
        host_id: &HostId,
        context: CodePackageContext,
        timeout: Duration,
    ) -> Result<()>;

    async fn code_package_operation(
        &self,
        request: ApplicationHostCodePackageOperationRequest,
        timeout: Duration,
    ) -> Result<()>;

    async fn send_dependent_code_package_event(&self, event: DependentCodePackageEvent) -> Result<()>;
}

/// [`ApplicationHostClient`] over per-host Unix sockets named
/// `<socket folder>/<host id>.sock`.
pub struct IpcApplicationHostClient {
    socket_folder: PathBuf,
    event_timeout: Duration,
    connections: RwLock<HashMap<HostId, Arc<IpcClient>>>,
}

impl IpcApplicationHostClient {
    pub fn new(socket_folder: impl Into<PathBuf>, event_timeout: Duration) -> Self {
        Self {
            socket_folder: socket_folder.into(),
            event_timeout,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn socket_path(&self, host_id: &HostId) -> PathBuf {
        self.socket_folder.join(format!("{host_id}.sock"))
    }

    async fn connection(&self, host_id: &HostId) -> Result<Arc<IpcClient>> {
        if let Some(client) = self.connections.read().await.get(host_id) {
            return Ok(client.clone());
        }
        let client = Arc::new(IpcClient::connect(&self.socket_path(host_id)).await?);
        let mut connections = self.connections.write().await;
        Ok(connections.entry(*host_id).or_insert(client).clone())
    }

    /// Forget the connection of a host that went away.
    pub async fn disconnect(&self, host_id: &HostId) {
        if self.connections.write().await.remove(host_id).is_some() {
            tracing::debug!(host_id = %host_id, "Dropped application host connection");
        }
    }

    fn parse_host_id(host_id: &str) -> Result<HostId> {
        host_id.parse()
    }
}

#[async_trait]
impl ApplicationHostClient for IpcApplicationHostClient {
    async fn update_code_package_context(
        &self,
        host_id: &HostId,
        context: CodePackageContext,
        timeout: Duration,
    ) -> Result<()> {
        let client = self.connection(host_id).await?;
        let request = UpdateCodePackageContextRequest {
            host_id: host_id.to_string(),
            context,
        };
        client
            .request(
                Actor::ApplicationHost,
                actions::UPDATE_CODE_PACKAGE_CONTEXT,
                request,
                timeout,
            )
            .await
    }

    async fn code_package_operation(
        &self,
        request: ApplicationHostCodePackageOperationRequest,
        timeout: Duration,
    ) -> Result<()> {
        let host_id = Self::parse_host_id(&request.host_id)?;
        let client = self.connection(&host_id).await?;
        client
            .request(
                Actor::ApplicationHost,
                actions::APPLICATION_HOST_CODE_PACKAGE_OPERATION,
                request,
                timeout,
            )
            .await
    }

    async fn send_dependent_code_package_event(&self, event: DependentCodePackageEvent) -> Result<()> {
        let host_id = Self::parse_host_id(&event.host_id)?;
        let client = self.connection(&host_id).await?;
        client
            .request(
                Actor::ApplicationHost,
                actions::DEPENDENT_CODE_PACKAGE_EVENT,
                event,
                self.event_timeout,
            )
            .await
    }
}
