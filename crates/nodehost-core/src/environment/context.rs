//! State accumulated while an environment is set up.

use crate::ids::{ApplicationId, ServicePackageInstanceId};
use crate::ipc::messages::{ContainerCertificatePaths, EndpointCertificateBinding};
use crate::principals::PrincipalsProviderContext;
use crate::resources::{EndpointResource, OverlayAssignment, OverlayAssignments};
use std::path::PathBuf;

/// Environment of one application: principals, default RunAs and log paths.
#[derive(Debug, Clone)]
pub struct ApplicationEnvironmentContext {
    application_id: ApplicationId,
    principals: Option<PrincipalsProviderContext>,
    default_run_as_sid: Option<String>,
    log_collection_paths: Vec<PathBuf>,
}

impl ApplicationEnvironmentContext {
    pub fn new(application_id: ApplicationId) -> Self {
        Self {
            application_id,
            principals: None,
            default_run_as_sid: None,
            log_collection_paths: Vec::new(),
        }
    }

    pub fn application_id(&self) -> &ApplicationId {
        &self.application_id
    }

    pub fn principals_context(&self) -> Option<&PrincipalsProviderContext> {
        self.principals.as_ref()
    }

    pub fn set_principals_context(&mut self, context: PrincipalsProviderContext) {
        self.principals = Some(context);
    }

    /// SID of the default RunAs principal, if the application declares one.
    pub fn default_run_as_sid(&self) -> Option<&str> {
        self.default_run_as_sid.as_deref()
    }

    pub fn set_default_run_as_sid(&mut self, sid: impl Into<String>) {
        self.default_run_as_sid = Some(sid.into());
    }

    pub fn log_collection_paths(&self) -> &[PathBuf] {
        &self.log_collection_paths
    }

    pub fn set_log_collection_paths(&mut self, paths: Vec<PathBuf>) {
        self.log_collection_paths = paths;
    }
}

/// Resources held by one service package activation.
///
/// Filled in stage by stage during setup and drained by cleanup.
#[derive(Debug, Clone)]
pub struct ServicePackageInstanceEnvironmentContext {
    service_package_instance_id: ServicePackageInstanceId,
    instance_id: i64,
    endpoints: Vec<EndpointResource>,
    /// `(code package, ip)` in assignment order.
    assigned_ips: Vec<(String, String)>,
    ip_addresses_assigned: bool,
    overlay: OverlayAssignments,
    overlay_assigned: bool,
    firewall_ports: Vec<u16>,
    certificate_bindings: Vec<EndpointCertificateBinding>,
    certificate_paths: ContainerCertificatePaths,
    container_group_required: bool,
    container_group_setup: bool,
    container_group_name: String,
}

impl ServicePackageInstanceEnvironmentContext {
    pub fn new(service_package_instance_id: ServicePackageInstanceId, instance_id: i64) -> Self {
        Self {
            service_package_instance_id,
            instance_id,
            endpoints: Vec::new(),
            assigned_ips: Vec::new(),
            ip_addresses_assigned: false,
            overlay: OverlayAssignments::new(),
            overlay_assigned: false,
            firewall_ports: Vec::new(),
            certificate_bindings: Vec::new(),
            certificate_paths: ContainerCertificatePaths::default(),
            container_group_required: false,
            container_group_setup: false,
            container_group_name: String::new(),
        }
    }

    pub fn service_package_instance_id(&self) -> &ServicePackageInstanceId {
        &self.service_package_instance_id
    }

    pub fn application_id(&self) -> &ApplicationId {
        self.service_package_instance_id.application_id()
    }

    pub fn instance_id(&self) -> i64 {
        self.instance_id
    }

    pub fn endpoints(&self) -> &[EndpointResource] {
        &self.endpoints
    }

    pub fn add_endpoint(&mut self, endpoint: EndpointResource) {
        self.endpoints.push(endpoint);
    }

    pub fn endpoint(&self, name: &str) -> Option<&EndpointResource> {
        self.endpoints.iter().find(|e| e.name() == name)
    }

    pub fn assigned_ips(&self) -> &[(String, String)] {
        &self.assigned_ips
    }

    pub fn set_assigned_ips(&mut self, assigned: Vec<(String, String)>) {
        self.assigned_ips = assigned;
        self.ip_addresses_assigned = true;
    }

    pub fn ip_addresses_assigned(&self) -> bool {
        self.ip_addresses_assigned
    }

    /// Open network IP of `code_package`.
    pub fn assigned_ip(&self, code_package: &str) -> Option<&str> {
        self.assigned_ips
            .iter()
            .find(|(cp, _)| cp == code_package)
            .map(|(_, ip)| ip.as_str())
    }

    /// IP shared by a container group: the first one assigned.
    pub fn group_ip(&self) -> Option<&str> {
        self.assigned_ips.first().map(|(_, ip)| ip.as_str())
    }

    pub fn overlay_assignments(&self) -> &OverlayAssignments {
        &self.overlay
    }

    pub fn set_overlay_assignments(&mut self, assignments: OverlayAssignments) {
        self.overlay = assignments;
        self.overlay_assigned = true;
    }

    pub fn overlay_assigned(&self) -> bool {
        self.overlay_assigned
    }

    pub fn overlay_assignment(&self, network: &str, code_package: &str) -> Option<&OverlayAssignment> {
        self.overlay.get(network).and_then(|cps| cps.get(code_package))
    }

    pub fn firewall_ports(&self) -> &[u16] {
        &self.firewall_ports
    }

    pub fn add_firewall_port(&mut self, port: u16) {
        self.firewall_ports.push(port);
    }

    /// Certificate bindings configured for the endpoints.
    pub fn certificate_bindings(&self) -> &[EndpointCertificateBinding] {
        &self.certificate_bindings
    }

    pub fn set_certificate_bindings(&mut self, bindings: Vec<EndpointCertificateBinding>) {
        self.certificate_bindings = bindings;
    }

    pub fn certificate_paths(&self) -> &ContainerCertificatePaths {
        &self.certificate_paths
    }

    pub fn set_certificate_paths(&mut self, paths: ContainerCertificatePaths) {
        self.certificate_paths = paths;
    }

    /// The containers share one network namespace.
    pub fn container_group_required(&self) -> bool {
        self.container_group_required
    }

    pub fn set_container_group_required(&mut self, required: bool) {
        self.container_group_required = required;
    }

    pub fn container_group_setup(&self) -> bool {
        self.container_group_setup
    }

    /// Marked before the group is requested so a failed request is still torn down.
    pub fn mark_container_group_setup(&mut self) {
        self.container_group_setup = true;
    }

    pub fn container_group_name(&self) -> &str {
        &self.container_group_name
    }

    pub fn set_container_group_name(&mut self, name: impl Into<String>) {
        self.container_group_name = name.into();
    }

    /// Forget every resource after a clean teardown.
    pub fn reset(&mut self) {
        self.endpoints.clear();
        self.assigned_ips.clear();
        self.ip_addresses_assigned = false;
        self.overlay.clear();
        self.overlay_assigned = false;
        self.firewall_ports.clear();
        self.certificate_bindings.clear();
        self.certificate_paths = ContainerCertificatePaths::default();
        self.container_group_setup = false;
        self.container_group_name.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
            && !self.ip_addresses_assigned
            && !self.overlay_assigned
            && self.firewall_ports.is_empty()
            && self.certificate_bindings.is_empty()
            && self.certificate_paths.is_empty()
            && !self.container_group_setup
    }
}
