//! Client for the privileged node activator.
//!
//! Network, firewall, certificate and container-group operations need
//! elevated rights, so hosting asks the activator to perform them.

use crate::error::Result;
use crate::ipc::messages::{
    actions, Actor, AssignIpAddressesReply, AssignIpAddressesRequest,
    ConfigureContainerCertificateExportRequest, ConfigureEndpointBindingAndFirewallPolicyRequest,
    ConfigureEndpointSecurityRequest, ContainerCertificatePaths, DeleteContainerImagesRequest,
    ManageOverlayNetworkResourcesReply, ManageOverlayNetworkResourcesRequest,
    SetupContainerGroupReply, SetupContainerGroupRequest,
};
use crate::ipc::IpcClient;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Operations the node activator performs on behalf of hosting.
#[async_trait]
pub trait ActivatorClient: Send + Sync {
    /// Assign (or with `cleanup`, release) open-network IPs.
    ///
    /// Returns `"<ip>,<code package>"` strings.
    async fn assign_ip_addresses(
        &self,
        request: AssignIpAddressesRequest,
        timeout: Duration,
    ) -> Result<Vec<String>>;

    /// Assign or release overlay network IP and MAC pairs.
    async fn manage_overlay_network_resources(
        &self,
        request: ManageOverlayNetworkResourcesRequest,
        timeout: Duration,
    ) -> Result<BTreeMap<String, BTreeMap<String, String>>>;

    /// Create (or with `cleanup`, tear down) a container group. Returns the
    /// pod container name.
    async fn setup_container_group(
        &self,
        request: SetupContainerGroupRequest,
        timeout: Duration,
    ) -> Result<String>;

    async fn configure_endpoint_security(
        &self,
        request: ConfigureEndpointSecurityRequest,
        timeout: Duration,
    ) -> Result<()>;

    async fn configure_endpoint_binding_and_firewall_policy(
        &self,
        request: ConfigureEndpointBindingAndFirewallPolicyRequest,
        timeout: Duration,
    ) -> Result<()>;

    async fn configure_container_certificate_export(
        &self,
        request: ConfigureContainerCertificateExportRequest,
        timeout: Duration,
    ) -> Result<ContainerCertificatePaths>;

    async fn cleanup_container_certificate_export(
        &self,
        paths: ContainerCertificatePaths,
        timeout: Duration,
    ) -> Result<()>;

    async fn delete_container_images(&self, images: Vec<String>, timeout: Duration) -> Result<()>;
}

/// [`ActivatorClient`] over an IPC connection.
pub struct IpcActivatorClient {
    client: Arc<IpcClient>,
}

impl IpcActivatorClient {
    pub fn new(client: Arc<IpcClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ActivatorClient for IpcActivatorClient {
    async fn assign_ip_addresses(
        &self,
        request: AssignIpAddressesRequest,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let reply: AssignIpAddressesReply = self
            .client
            .request(Actor::FabricActivator, actions::ASSIGN_IP_ADDRESSES, request, timeout)
            .await?;
        Ok(reply.assigned_ips)
    }

    async fn manage_overlay_network_resources(
        &self,
        request: ManageOverlayNetworkResourcesRequest,
        timeout: Duration,
    ) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
        let reply: ManageOverlayNetworkResourcesReply = self
            .client
            .request(
                Actor::FabricActivator,
                actions::MANAGE_OVERLAY_NETWORK_RESOURCES,
                request,
                timeout,
            )
            .await?;
        Ok(reply.assigned_resources)
    }

    async fn setup_container_group(
        &self,
        request: SetupContainerGroupRequest,
        timeout: Duration,
    ) -> Result<String> {
        let reply: SetupContainerGroupReply = self
            .client
            .request(Actor::FabricActivator, actions::SETUP_CONTAINER_GROUP, request, timeout)
            .await?;
        Ok(reply.container_name)
    }

    async fn configure_endpoint_security(
        &self,
        request: ConfigureEndpointSecurityRequest,
        timeout: Duration,
    ) -> Result<()> {
        self.client
            .request(
                Actor::FabricActivator,
                actions::CONFIGURE_ENDPOINT_SECURITY,
                request,
                timeout,
            )
            .await
    }

    async fn configure_endpoint_binding_and_firewall_policy(
        &self,
        request: ConfigureEndpointBindingAndFirewallPolicyRequest,
        timeout: Duration,
    ) -> Result<()> {
        self.client
            .request(
                Actor::FabricActivator,
                actions::CONFIGURE_ENDPOINT_BINDING_AND_FIREWALL_POLICY,
                request,
                timeout,
            )
            .await
    }

    async fn configure_container_certificate_export(
        &self,
        request: ConfigureContainerCertificateExportRequest,
        timeout: Duration,
    ) -> Result<ContainerCertificatePaths> {
        self.client
            .request(
                Actor::FabricActivator,
                actions::CONFIGURE_CONTAINER_CERTIFICATE_EXPORT,
                request,
                timeout,
            )
            .await
    }

    async fn cleanup_container_certificate_export(
        &self,
        paths: ContainerCertificatePaths,
        timeout: Duration,
    ) -> Result<()> {
        self.client
            .request(
                Actor::FabricActivator,
                actions::CLEANUP_CONTAINER_CERTIFICATE_EXPORT,
                paths,
                timeout,
            )
            .await
    }

    async fn delete_container_images(&self, images: Vec<String>, timeout: Duration) -> Result<()> {
        self.client
            .request(
                Actor::ContainerActivatorService,
                actions::DELETE_CONTAINER_IMAGES,
                DeleteContainerImagesRequest { images },
                timeout,
            )
            .await
    }
}
