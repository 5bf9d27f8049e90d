//! The container runtime operations the agent serves.

use async_trait::async_trait;
use nodehost_core::ipc::messages::{
    ActivateContainerRequest, ContainerEventDescription, ContainerImageDescription,
    ContainerUpdateRoutesRequest, DeactivateContainerRequest, InvokeContainerApiReply,
    InvokeContainerApiRequest,
};
use nodehost_core::Result;
use std::time::Duration;
use tokio::sync::mpsc;

/// A container runtime the agent drives on behalf of the node host.
#[async_trait]
pub trait ContainerActivatorService: Send + Sync + 'static {
    /// Start a container. Returns its id.
    async fn activate_container(&self, request: ActivateContainerRequest, timeout: Duration) -> Result<String>;

    async fn deactivate_container(&self, request: DeactivateContainerRequest, timeout: Duration) -> Result<()>;

    async fn download_images(&self, images: Vec<ContainerImageDescription>, timeout: Duration) -> Result<()>;

    async fn delete_images(&self, images: Vec<String>, timeout: Duration) -> Result<()>;

    async fn update_routes(&self, request: ContainerUpdateRoutesRequest, timeout: Duration) -> Result<()>;

    async fn invoke_container_api(
        &self,
        request: InvokeContainerApiRequest,
        timeout: Duration,
    ) -> Result<InvokeContainerApiReply>;

    /// Start streaming container events newer than `since` (unix seconds)
    /// into `events`. Returns once the stream is running.
    async fn start_event_monitoring(
        &self,
        since: i64,
        events: mpsc::UnboundedSender<ContainerEventDescription>,
    ) -> Result<()>;
}
