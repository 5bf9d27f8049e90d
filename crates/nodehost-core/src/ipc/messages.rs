//! Request and reply bodies exchanged over IPC.
//!
//! Every request travels inside a [`RequestEnvelope`] that carries the actor
//! header and a timeout in ticks. Every reply is a [`Reply`] carrying an
//! error code and message next to the body.

use crate::context::{CodePackageContext, EnvironmentMap};
use crate::error::{ErrorCode, HostingError, Result};
use crate::model::{ContainerCertificateDescription, NetworkType, ResourceGovernanceDescription};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Action names used as JSON-RPC methods.
pub mod actions {
    pub const ACTIVATE_CONTAINER: &str = "ActivateContainerRequest";
    pub const DEACTIVATE_CONTAINER: &str = "DeactivateContainerRequest";
    pub const DOWNLOAD_CONTAINER_IMAGES: &str = "DownloadContainerImagesRequest";
    pub const DELETE_CONTAINER_IMAGES: &str = "DeleteContainerImagesRequest";
    pub const CONTAINER_UPDATE_ROUTES: &str = "ContainerUpdateRoutesRequest";
    pub const INVOKE_CONTAINER_API: &str = "InvokeContainerApiRequest";
    pub const UPDATE_CODE_PACKAGE_CONTEXT: &str = "UpdateCodePackageContextRequest";
    pub const APPLICATION_HOST_CODE_PACKAGE_OPERATION: &str =
        "ApplicationHostCodePackageOperationRequest";
    pub const DEPENDENT_CODE_PACKAGE_EVENT: &str = "DependentCodePackageEventNotification";
    pub const REGISTER_CONTAINER_ACTIVATOR_SERVICE: &str = "RegisterContainerActivatorService";
    pub const CONTAINER_EVENT_NOTIFICATION: &str = "ContainerEventNotificationRequest";

    pub const ASSIGN_IP_ADDRESSES: &str = "AssignIpAddressesRequest";
    pub const MANAGE_OVERLAY_NETWORK_RESOURCES: &str = "ManageOverlayNetworkResourcesRequest";
    pub const SETUP_CONTAINER_GROUP: &str = "SetupContainerGroupRequest";
    pub const CONFIGURE_ENDPOINT_SECURITY: &str = "ConfigureEndpointSecurityRequest";
    pub const CONFIGURE_ENDPOINT_BINDING_AND_FIREWALL_POLICY: &str =
        "ConfigureEndpointBindingAndFirewallPolicyRequest";
    pub const CONFIGURE_CONTAINER_CERTIFICATE_EXPORT: &str =
        "ConfigureContainerCertificateExportRequest";
    pub const CLEANUP_CONTAINER_CERTIFICATE_EXPORT: &str =
        "CleanupContainerCertificateExportRequest";
}

/// Logical endpoint a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Actor {
    /// The out-of-process container activator service.
    ContainerActivatorService,
    /// The node-side handler the container activator service registers with.
    ContainerActivatorServiceClient,
    /// A running application host.
    ApplicationHost,
    /// The privileged node activator.
    FabricActivator,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Convert a duration to 100ns ticks, saturating.
pub fn to_ticks(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos() / 100).unwrap_or(i64::MAX)
}

/// Convert 100ns ticks to a duration. Non-positive values become zero.
pub fn from_ticks(ticks: i64) -> Duration {
    if ticks <= 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos((ticks as u64).saturating_mul(100))
}

/// Request body with its actor header and timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope<T> {
    pub actor: Actor,
    pub timeout_ticks: i64,
    pub body: T,
}

impl<T> RequestEnvelope<T> {
    pub fn new(actor: Actor, timeout: Duration, body: T) -> Self {
        Self {
            actor,
            timeout_ticks: to_ticks(timeout),
            body,
        }
    }

    pub fn timeout(&self) -> Duration {
        from_ticks(self.timeout_ticks)
    }
}

/// Reply body with the operation's error code and message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de> + Default"))]
pub struct Reply<T = ()> {
    pub error: ErrorCode,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub body: T,
}

impl<T: Default> Reply<T> {
    pub fn ok(body: T) -> Self {
        Self {
            error: ErrorCode::Success,
            message: String::new(),
            body,
        }
    }

    pub fn failed(error: &HostingError) -> Self {
        Self {
            error: error.code(),
            message: error.reply_message(),
            body: T::default(),
        }
    }

    /// Build a reply from an operation result.
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(body) => Self::ok(body),
            Err(e) => Self::failed(&e),
        }
    }

    /// Turn the reply back into a result.
    pub fn into_result(self) -> Result<T> {
        match HostingError::from_reply(self.error, self.message) {
            Some(e) => Err(e),
            None => Ok(self.body),
        }
    }
}

// ============================================================================
// Container activator service
// ============================================================================

/// Everything needed to start one container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerDescription {
    pub container_name: String,
    pub image_name: String,
    pub application_name: String,
    pub service_name: String,
    pub code_package_name: String,
    #[serde(default)]
    pub entry_point: String,
    #[serde(default)]
    pub command_args: Vec<String>,
    #[serde(default)]
    pub environment: EnvironmentMap,
    /// Container port to host port.
    #[serde(default)]
    pub port_bindings: BTreeMap<String, String>,
    #[serde(default)]
    pub network_type: NetworkType,
    #[serde(default)]
    pub assigned_ip: String,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    /// Pod container whose namespaces this container joins.
    #[serde(default)]
    pub group_container_name: String,
    #[serde(default)]
    pub auto_remove: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivateContainerRequest {
    pub app_host_id: String,
    pub node_id: String,
    pub container: ContainerDescription,
    #[serde(default)]
    pub fabric_bin_folder: String,
    #[serde(default)]
    pub gateway_ip_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivateContainerReply {
    pub container_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeactivateContainerRequest {
    pub container_name: String,
    #[serde(default)]
    pub graceful: bool,
    #[serde(default)]
    pub group_container_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerImageDescription {
    pub image_name: String,
    #[serde(default)]
    pub repository_account: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadContainerImagesRequest {
    pub images: Vec<ContainerImageDescription>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteContainerImagesRequest {
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerUpdateRoutesRequest {
    pub container_id: String,
    pub container_name: String,
    pub gateway_ip_addresses: Vec<String>,
    #[serde(default)]
    pub auto_remove: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvokeContainerApiRequest {
    pub container_name: String,
    pub http_verb: String,
    pub uri_path: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub request_body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvokeContainerApiReply {
    pub status_code: u16,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub response_body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterContainerActivatorServiceRequest {
    pub process_id: u32,
    pub listen_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterContainerActivatorServiceReply {
    pub is_container_service_present: bool,
    #[serde(default)]
    pub is_container_service_managed: bool,
    /// Unix seconds from which events should be replayed.
    #[serde(default)]
    pub event_since_time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerEventDescription {
    pub event_type: String,
    pub container_id: String,
    #[serde(default)]
    pub container_name: String,
    pub time_stamp: i64,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub health_status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerEventNotificationRequest {
    pub events: Vec<ContainerEventDescription>,
}

// ============================================================================
// Application host
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCodePackageContextRequest {
    pub host_id: String,
    pub context: CodePackageContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodePackageOperationType {
    Activate,
    Deactivate,
    Abort,
}

impl fmt::Display for CodePackageOperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Start or stop code packages inside a running host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationHostCodePackageOperationRequest {
    pub host_id: String,
    pub operation_type: CodePackageOperationType,
    pub code_package_contexts: Vec<CodePackageContext>,
    #[serde(default)]
    pub environment: EnvironmentMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependentCodePackageEventType {
    Started,
    Terminated,
}

/// Lifecycle event of a code package started by another code package's host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependentCodePackageEvent {
    pub host_id: String,
    pub event_type: DependentCodePackageEventType,
    pub code_package: CodePackageContext,
    #[serde(default)]
    pub exit_code: i32,
}

// ============================================================================
// Node activator
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignIpAddressesRequest {
    pub service_package_id: String,
    pub code_packages: Vec<String>,
    pub cleanup: bool,
}

/// Assigned addresses as `"<ip>,<code package>"` strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignIpAddressesReply {
    pub assigned_ips: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OverlayNetworkAction {
    #[default]
    Assign,
    Release,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManageOverlayNetworkResourcesRequest {
    pub node_name: String,
    pub node_ip_address: String,
    pub service_package_id: String,
    /// Network name to the code packages joining it.
    pub code_package_networks: BTreeMap<String, Vec<String>>,
    pub action: OverlayNetworkAction,
}

/// Network name to code package to `"<ip>,<mac>"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManageOverlayNetworkResourcesReply {
    pub assigned_resources: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupContainerGroupRequest {
    pub service_package_id: String,
    pub assigned_ip: String,
    pub app_folder: String,
    pub app_id: String,
    pub app_number: u32,
    #[serde(default)]
    pub network_type: NetworkType,
    #[serde(default)]
    pub port_bindings: Vec<PortBinding>,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub resource_governance: ResourceGovernanceDescription,
    pub cleanup: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupContainerGroupReply {
    pub container_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureEndpointSecurityRequest {
    pub principal_sid: String,
    pub port: u16,
    pub is_https: bool,
    pub cleanup: bool,
    pub prefix: String,
    pub service_package_identifier: String,
    pub is_explicit_port: bool,
}

/// An SSL certificate bound to an endpoint port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCertificateBinding {
    pub port: u16,
    pub is_explicit_port: bool,
    pub principal_sid: String,
    pub x509_find_value: String,
    pub x509_store_name: String,
    pub x509_find_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureEndpointBindingAndFirewallPolicyRequest {
    pub node_id: String,
    pub service_package_id: String,
    pub endpoint_certificate_bindings: Vec<EndpointCertificateBinding>,
    pub cleanup: bool,
    pub cleanup_firewall_policy: bool,
    pub firewall_ports: Vec<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureContainerCertificateExportRequest {
    /// Code package name to the certificates it imports.
    pub certificate_refs: BTreeMap<String, Vec<ContainerCertificateDescription>>,
    pub work_directory: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerCertificatePaths {
    pub certificate_paths: BTreeMap<String, String>,
    pub certificate_password_paths: BTreeMap<String, String>,
}

impl ContainerCertificatePaths {
    pub fn is_empty(&self) -> bool {
        self.certificate_paths.is_empty() && self.certificate_password_paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_conversion() {
        assert_eq!(to_ticks(Duration::from_secs(1)), 10_000_000);
        assert_eq!(from_ticks(10_000_000), Duration::from_secs(1));
        assert_eq!(from_ticks(-5), Duration::ZERO);
        assert_eq!(to_ticks(Duration::MAX), i64::MAX);
    }

    #[test]
    fn test_reply_into_result() {
        let reply: Reply<SetupContainerGroupReply> = Reply::ok(SetupContainerGroupReply {
            container_name: "pod-1".into(),
        });
        assert_eq!(reply.into_result().unwrap().container_name, "pod-1");

        let failed: Reply<SetupContainerGroupReply> =
            Reply::failed(&HostingError::NotFound("group".into()));
        assert!(failed.into_result().unwrap_err().is(ErrorCode::NotFound));
    }

    #[test]
    fn test_unit_reply_deserializes_without_body() {
        let reply: Reply = serde_json::from_str(r#"{"error":"Success"}"#).unwrap();
        assert!(reply.into_result().is_ok());
    }

    #[test]
    fn test_envelope_timeout() {
        let envelope = RequestEnvelope::new(
            Actor::ContainerActivatorService,
            Duration::from_millis(1500),
            DeleteContainerImagesRequest::default(),
        );
        assert_eq!(envelope.timeout(), Duration::from_millis(1500));
    }
}
