//! Application and service package environment setup and teardown.

use crate::activator::ActivatorClient;
use crate::config::{HostingConfig, NodeConfig};
use crate::environment::cleanup::CleanupPlan;
use crate::environment::context::{
    ApplicationEnvironmentContext, ServicePackageInstanceEnvironmentContext,
};
use crate::environment::diagnostics::DiagnosticsProvider;
use crate::error::{HostingError, Result};
use crate::ids::{ApplicationId, ServicePackageInstanceId};
use crate::ipc::messages::{
    AssignIpAddressesRequest, ConfigureContainerCertificateExportRequest,
    ConfigureEndpointBindingAndFirewallPolicyRequest, ConfigureEndpointSecurityRequest,
    EndpointCertificateBinding, ManageOverlayNetworkResourcesRequest, OverlayNetworkAction,
    PortBinding, SetupContainerGroupRequest,
};
use crate::layout::RunLayout;
use crate::model::{
    ApplicationPackageDescription, EntryPointType, GrantAccessType, NetworkType,
    ServicePackageDescription,
};
use crate::principals::{
    AccountStore, ConfigureSecurityPrincipalRequest, NamedLocks, PrincipalsProvider,
    PrincipalsSettings,
};
use crate::resources::{self, EndpointProvider, EndpointResource};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Remaining time of a multi-stage operation.
#[derive(Debug, Clone, Copy)]
struct TimeoutHelper {
    start: Instant,
    original: Duration,
}

impl TimeoutHelper {
    fn new(original: Duration) -> Self {
        Self {
            start: Instant::now(),
            original,
        }
    }

    /// Time left, or `Timeout` once the budget is spent.
    fn remaining(&self) -> Result<Duration> {
        let remaining = self.original.saturating_sub(self.start.elapsed());
        if remaining.is_zero() {
            return Err(HostingError::Timeout(self.original));
        }
        Ok(remaining)
    }
}

/// Write `value` as JSON through a temporary file so readers never see a
/// partial document.
async fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = crate::layout::with_suffix(path, "tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn endpoint_security_request(
    endpoint: &EndpointResource,
    service_package_identifier: &str,
    cleanup: bool,
) -> ConfigureEndpointSecurityRequest {
    ConfigureEndpointSecurityRequest {
        principal_sid: endpoint
            .security
            .as_ref()
            .map(|s| s.principal_sid.clone())
            .unwrap_or_default(),
        port: endpoint.port(),
        is_https: endpoint.is_https(),
        cleanup,
        prefix: endpoint.prefix(),
        service_package_identifier: service_package_identifier.to_string(),
        is_explicit_port: endpoint.is_explicit_port(),
    }
}

/// Sets up and tears down the environment applications run in.
///
/// Setup is fail-fast: the first failing stage triggers a full cleanup and
/// its error is returned. Cleanup is exhaustive: every stage runs and the
/// last failure is reported.
pub struct EnvironmentManager {
    node: NodeConfig,
    config: HostingConfig,
    layout: RunLayout,
    activator: Arc<dyn ActivatorClient>,
    principals: PrincipalsProvider,
    endpoints: EndpointProvider,
    diagnostics: DiagnosticsProvider,
    opened: AtomicBool,
}

impl EnvironmentManager {
    pub fn new(
        node: NodeConfig,
        config: HostingConfig,
        activator: Arc<dyn ActivatorClient>,
        account_store: Arc<dyn AccountStore>,
    ) -> Self {
        let layout = RunLayout::new(&node.deployment_folder);
        let principals = PrincipalsProvider::new(
            node.node_id.clone(),
            PrincipalsSettings::from(&config),
            account_store,
            NamedLocks::new(&node.lock_folder),
        );
        let endpoints = EndpointProvider::new(
            config.endpoint_provider_enabled,
            config.application_port_range.clone(),
        );
        let diagnostics = DiagnosticsProvider::new(layout.clone());

        Self {
            node,
            config,
            layout,
            activator,
            principals,
            endpoints,
            diagnostics,
            opened: AtomicBool::new(false),
        }
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    pub fn principals(&self) -> &PrincipalsProvider {
        &self.principals
    }

    pub fn endpoint_provider(&self) -> &EndpointProvider {
        &self.endpoints
    }

    pub fn diagnostics(&self) -> &DiagnosticsProvider {
        &self.diagnostics
    }

    pub async fn open(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.layout.root()).await?;
        self.opened.store(true, Ordering::Release);
        info!(
            node_id = %self.node.node_id,
            deployment_folder = %self.layout.root().display(),
            "Environment manager opened"
        );
        Ok(())
    }

    /// Release every application's principals and refuse further work.
    pub async fn close(&self) {
        if !self.opened.swap(false, Ordering::AcqRel) {
            return;
        }
        self.principals.close().await;
        info!(node_id = %self.node.node_id, "Environment manager closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.opened.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(HostingError::ObjectClosed)
        }
    }

    /// Identifier the activator keys a service package activation by.
    pub fn get_service_package_identifier(service_package_instance_id: &str, instance_id: i64) -> String {
        format!("{service_package_instance_id}:{instance_id}")
    }

    fn service_package_identifier(ctx: &ServicePackageInstanceEnvironmentContext) -> String {
        Self::get_service_package_identifier(
            &ctx.service_package_instance_id().to_string(),
            ctx.instance_id(),
        )
    }

    // ========================================================================
    // Application
    // ========================================================================

    /// Set up the environment of an application.
    ///
    /// # Errors
    ///
    /// Principals declared while the RunAs policy is disabled fail with
    /// `OperationFailed`. A failure after principal setup cleans up the
    /// partially built environment before returning the original error.
    pub async fn setup_application(
        &self,
        app_id: &ApplicationId,
        package: &ApplicationPackageDescription,
        timeout: Duration,
    ) -> Result<ApplicationEnvironmentContext> {
        self.ensure_open()?;
        let start = Instant::now();
        let mut context = ApplicationEnvironmentContext::new(app_id.clone());

        self.diagnostics.setup_application_crash_dumps(app_id).await?;

        if !package.principals.is_empty() {
            if !self.config.run_as_policy_enabled {
                error!(app_id = %app_id, "Application declares principals but the RunAs policy is disabled");
                return Err(HostingError::OperationFailed(format!(
                    "RunAs policy is not enabled on node {}; application {} declares principals",
                    self.node.node_name, package.application_name
                )));
            }
            let request = ConfigureSecurityPrincipalRequest {
                application_id: app_id.to_string(),
                node_id: self.node.node_id.clone(),
                application_package_counter: app_id.application_number,
                principals: package.principals.clone(),
                allowed_user_creation_failure_count: package.allowed_user_creation_failure_count,
                update_existing: false,
            };
            let principals = self.principals.setup(request).await.map_err(|e| {
                error!(app_id = %app_id, error = %e, "Principals setup failed");
                e
            })?;
            context.set_principals_context(principals);
        }

        if let Err(e) = self.finish_application_setup(&mut context, package).await {
            return Err(self.cleanup_application_on_error(&mut context, e, timeout).await);
        }

        info!(
            app_id = %app_id,
            principals = context.principals_context().map_or(0, |p| p.principals().len()),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Application environment set up"
        );
        Ok(context)
    }

    async fn finish_application_setup(
        &self,
        context: &mut ApplicationEnvironmentContext,
        package: &ApplicationPackageDescription,
    ) -> Result<()> {
        let app_id = context.application_id().clone();

        if let Some(run_as) = &package.default_run_as {
            let sid = context
                .principals_context()
                .ok_or_else(|| HostingError::NotFound(format!("default RunAs principal {run_as}")))?
                .get_principal_id(run_as)?;
            debug!(app_id = %app_id, principal = %run_as, "Default RunAs principal resolved");
            context.set_default_run_as_sid(sid);
        }

        let sids = match context.principals_context() {
            Some(principals) if self.config.run_as_policy_enabled => principals.principal_sids(),
            _ => BTreeMap::new(),
        };
        let sids_file = self.layout.principal_sids_file(&app_id);
        write_json_file(&sids_file, &sids).await.map_err(|e| {
            HostingError::OperationFailed(format!(
                "failed to write {}: {e}",
                sids_file.display()
            ))
        })?;

        if !package.log_collection_policies.is_empty() {
            let log_folder = self.layout.log_folder(&app_id);
            let paths: Vec<_> = package
                .log_collection_policies
                .iter()
                .map(|policy| log_folder.join(&policy.path))
                .collect();
            self.diagnostics.add_log_collection_paths(&app_id, &paths).await?;
            context.set_log_collection_paths(paths);
        }
        Ok(())
    }

    async fn cleanup_application_on_error(
        &self,
        context: &mut ApplicationEnvironmentContext,
        error: HostingError,
        timeout: Duration,
    ) -> HostingError {
        error!(app_id = %context.application_id(), error = %error, "Application setup failed, cleaning up");
        if let Err(e) = self.cleanup_application(context, timeout).await {
            warn!(app_id = %context.application_id(), error = %e, "Cleanup after failed application setup failed");
        }
        error
    }

    /// Tear down the environment of an application.
    pub async fn cleanup_application(
        &self,
        context: &mut ApplicationEnvironmentContext,
        _timeout: Duration,
    ) -> Result<()> {
        let app_id = context.application_id().clone();
        let mut plan = CleanupPlan::new(&app_id);

        plan.record(
            "crash dumps",
            self.diagnostics.cleanup_application_crash_dumps(&app_id).await,
        );

        if self.config.run_as_policy_enabled && context.principals_context().is_some() {
            self.principals.cleanup(&app_id.to_string(), true).await.map_err(|e| {
                error!(app_id = %app_id, error = %e, "Principals cleanup failed");
                e
            })?;
        }

        if !context.log_collection_paths().is_empty() {
            plan.record(
                "log collection",
                self.diagnostics.remove_log_collection_paths(&app_id).await,
            );
        }

        let clean = plan.is_clean();
        plan.finish()?;
        if clean {
            info!(app_id = %app_id, "Application environment cleaned up");
        }
        Ok(())
    }

    /// Best-effort teardown used when an application is aborted.
    pub async fn abort_application(&self, context: &mut ApplicationEnvironmentContext) {
        if let Err(e) = self.cleanup_application(context, self.config.request_timeout).await {
            warn!(app_id = %context.application_id(), error = %e, "Aborting application environment failed");
        }
    }

    // ========================================================================
    // Service package instance
    // ========================================================================

    /// Set up the environment of one service package activation.
    ///
    /// # Arguments
    ///
    /// * `app_context` - Environment of the owning application
    /// * `service_package_instance_id` - Activation being set up
    /// * `instance_id` - Version instance of the activation
    /// * `description` - Digested service package
    /// * `timeout` - Budget for the whole pipeline
    ///
    /// # Errors
    ///
    /// Returns the first stage failure after tearing down everything the
    /// earlier stages set up.
    pub async fn setup_service_package_instance(
        &self,
        app_context: &ApplicationEnvironmentContext,
        service_package_instance_id: &ServicePackageInstanceId,
        instance_id: i64,
        description: &ServicePackageDescription,
        timeout: Duration,
    ) -> Result<ServicePackageInstanceEnvironmentContext> {
        self.ensure_open()?;
        let start = Instant::now();
        let helper = TimeoutHelper::new(timeout);
        let mut ctx =
            ServicePackageInstanceEnvironmentContext::new(service_package_instance_id.clone(), instance_id);

        let mut description = description.clone();
        description.populate_code_package_network_config();

        if let Err(e) = self
            .run_service_package_setup(app_context, &description, &mut ctx, helper)
            .await
        {
            error!(
                service_package = %service_package_instance_id,
                error = %e,
                "Service package setup failed, cleaning up"
            );
            if let Err(cleanup_error) = self.cleanup_service_package_instance(&mut ctx, timeout).await {
                warn!(
                    service_package = %service_package_instance_id,
                    error = %cleanup_error,
                    "Cleanup after failed service package setup failed"
                );
            }
            return Err(e);
        }

        info!(
            service_package = %service_package_instance_id,
            endpoints = ctx.endpoints().len(),
            container_group = %ctx.container_group_name(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Service package environment set up"
        );
        Ok(ctx)
    }

    async fn run_service_package_setup(
        &self,
        app_context: &ApplicationEnvironmentContext,
        description: &ServicePackageDescription,
        ctx: &mut ServicePackageInstanceEnvironmentContext,
        helper: TimeoutHelper,
    ) -> Result<()> {
        let identifier = Self::service_package_identifier(ctx);

        self.setup_diagnostics(description, ctx, &identifier).await?;
        self.assign_resources(description, ctx, &identifier, helper).await?;

        let defer_group = description.hyperv_isolated;
        if ctx.container_group_required() && !defer_group {
            self.setup_container_group(description, ctx, &identifier, helper.remaining()?)
                .await?;
        }

        let pending_acls = self.setup_endpoints(app_context, description, ctx)?;
        self.setup_endpoint_security(ctx, pending_acls, &identifier, helper)
            .await?;

        let bindings = self.get_endpoint_binding_policies(app_context, description, ctx.endpoints())?;
        ctx.set_certificate_bindings(bindings);
        self.configure_endpoint_binding_and_firewall(ctx, &identifier, helper)
            .await?;

        self.setup_container_certificates(description, ctx, helper).await?;
        self.write_resources(ctx).await?;

        if ctx.container_group_required() && defer_group {
            self.setup_container_group(description, ctx, &identifier, helper.remaining()?)
                .await?;
        }
        Ok(())
    }

    async fn setup_diagnostics(
        &self,
        description: &ServicePackageDescription,
        ctx: &ServicePackageInstanceEnvironmentContext,
        identifier: &str,
    ) -> Result<()> {
        let programs = description
            .code_packages
            .iter()
            .filter(|cp| cp.entry_point_type == EntryPointType::Exe)
            .map(|cp| cp.name.clone())
            .collect();
        self.diagnostics
            .setup_service_package_crash_dumps(ctx.application_id(), identifier, programs)
            .await?;
        self.diagnostics.setup_trace_session(identifier).await?;
        debug!(service_package = %identifier, "Diagnostics set up");
        Ok(())
    }

    /// Assign open and overlay network addresses to container code packages.
    async fn assign_resources(
        &self,
        description: &ServicePackageDescription,
        ctx: &mut ServicePackageInstanceEnvironmentContext,
        identifier: &str,
        helper: TimeoutHelper,
    ) -> Result<()> {
        let container_count = description.container_count();
        let group_required =
            container_count > 1 || (description.hyperv_isolated && container_count > 0);
        ctx.set_container_group_required(group_required);

        let mut open_code_packages: Vec<String> = description
            .code_packages
            .iter()
            .filter(|cp| cp.is_container() && cp.container_policies.network_config.open)
            .map(|cp| cp.name.clone())
            .collect();
        // A group shares the first code package's address.
        if group_required {
            open_code_packages.truncate(1);
        }

        if self.config.assign_ip_addresses_for_open_network && !open_code_packages.is_empty() {
            let request = AssignIpAddressesRequest {
                service_package_id: identifier.to_string(),
                code_packages: open_code_packages,
                cleanup: false,
            };
            let assigned = self
                .activator
                .assign_ip_addresses(request, helper.remaining()?)
                .await?;
            let assigned = resources::parse_assigned_ips(&assigned)?;
            debug!(service_package = %identifier, assigned = ?assigned, "Open network addresses assigned");
            ctx.set_assigned_ips(assigned);
        }

        let mut networks: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for cp in description.code_packages.iter().filter(|cp| cp.is_container()) {
            for network in &cp.container_policies.network_config.isolated_networks {
                networks.entry(network.clone()).or_default().push(cp.name.clone());
            }
        }
        if !networks.is_empty() {
            let request = ManageOverlayNetworkResourcesRequest {
                node_name: self.node.node_name.clone(),
                node_ip_address: self.node.ip_address_or_fqdn.clone(),
                service_package_id: identifier.to_string(),
                code_package_networks: networks,
                action: OverlayNetworkAction::Assign,
            };
            let assigned = self
                .activator
                .manage_overlay_network_resources(request, helper.remaining()?)
                .await?;
            let assigned = resources::parse_overlay_assignments(&assigned)?;
            debug!(service_package = %identifier, networks = assigned.len(), "Overlay network resources assigned");
            ctx.set_overlay_assignments(assigned);
        }
        Ok(())
    }

    fn container_group_network_type(ctx: &ServicePackageInstanceEnvironmentContext) -> NetworkType {
        if ctx.group_ip().is_some() {
            NetworkType::Open
        } else if !ctx.overlay_assignments().is_empty() {
            NetworkType::Isolated
        } else {
            NetworkType::Other
        }
    }

    /// Host port mappings for containers that have no address of their own.
    fn container_port_bindings(
        description: &ServicePackageDescription,
        ctx: &ServicePackageInstanceEnvironmentContext,
    ) -> Vec<PortBinding> {
        let mut bindings = Vec::new();
        for cp in description.code_packages.iter().filter(|cp| cp.is_container()) {
            for (endpoint_name, container_port) in &cp.container_policies.port_bindings {
                let host_port = ctx.endpoint(endpoint_name).map(|e| e.port()).or_else(|| {
                    description
                        .endpoints
                        .iter()
                        .find(|e| &e.endpoint.name == endpoint_name)
                        .map(|e| e.endpoint.port)
                });
                match host_port {
                    Some(host_port) if host_port != 0 => bindings.push(PortBinding {
                        container_port: *container_port,
                        host_port,
                    }),
                    _ => debug!(endpoint = %endpoint_name, "No host port yet, skipping binding"),
                }
            }
        }
        bindings
    }

    async fn setup_container_group(
        &self,
        description: &ServicePackageDescription,
        ctx: &mut ServicePackageInstanceEnvironmentContext,
        identifier: &str,
        timeout: Duration,
    ) -> Result<()> {
        let app_id = ctx.application_id().clone();
        let network_type = Self::container_group_network_type(ctx);
        let dns_servers = match network_type {
            NetworkType::Isolated => Vec::new(),
            NetworkType::Open | NetworkType::Other => vec![self.node.ip_address_or_fqdn.clone()],
        };
        let port_bindings = match network_type {
            NetworkType::Open => Vec::new(),
            _ => Self::container_port_bindings(description, ctx),
        };

        let request = SetupContainerGroupRequest {
            service_package_id: identifier.to_string(),
            assigned_ip: ctx.group_ip().unwrap_or_default().to_string(),
            app_folder: self.layout.application_folder(&app_id).display().to_string(),
            app_id: app_id.to_string(),
            app_number: app_id.application_number,
            network_type,
            port_bindings,
            dns_servers,
            resource_governance: description.resource_governance.clone(),
            cleanup: false,
        };

        ctx.mark_container_group_setup();
        let name = self.activator.setup_container_group(request, timeout).await?;
        info!(service_package = %identifier, container_group = %name, network = ?network_type, "Container group set up");
        ctx.set_container_group_name(name);
        Ok(())
    }

    fn endpoint_ip_address(
        &self,
        description: &ServicePackageDescription,
        ctx: &ServicePackageInstanceEnvironmentContext,
        code_package_ref: &str,
    ) -> String {
        if code_package_ref.is_empty() {
            return self.node.ip_address_or_fqdn.clone();
        }
        if let Some(ip) = ctx.assigned_ip(code_package_ref) {
            return ip.to_string();
        }
        let code_package = description.code_package(code_package_ref);
        if ctx.container_group_required() && code_package.is_some_and(|cp| cp.is_container()) {
            if let Some(ip) = ctx.group_ip() {
                return ip.to_string();
            }
        }
        if let Some(cp) = code_package {
            for network in &cp.container_policies.network_config.isolated_networks {
                if let Some(assignment) = ctx.overlay_assignment(network, code_package_ref) {
                    return assignment.ip_address.clone();
                }
            }
        }
        self.node.ip_address_or_fqdn.clone()
    }

    /// Resolve every endpoint's address, access and port.
    ///
    /// HTTP endpoints with an ACL are returned instead of being added to
    /// the context; they are added once their ACL is in place.
    fn setup_endpoints(
        &self,
        app_context: &ApplicationEnvironmentContext,
        description: &ServicePackageDescription,
        ctx: &mut ServicePackageInstanceEnvironmentContext,
    ) -> Result<Vec<EndpointResource>> {
        if description.endpoints.is_empty() {
            return Ok(Vec::new());
        }
        if !self.endpoints.is_enabled() {
            return Err(HostingError::EndpointProviderNotEnabled);
        }

        let mut pending = Vec::new();
        for digested in &description.endpoints {
            let result = self.setup_endpoint(app_context, description, ctx, digested);
            match result {
                Ok(resource) => {
                    if resource.endpoint.is_http() && resource.security.is_some() {
                        pending.push(resource);
                    } else {
                        ctx.add_endpoint(resource);
                    }
                }
                Err(e) => {
                    for resource in &pending {
                        if let Err(release_error) = self.endpoints.remove_endpoint(resource) {
                            warn!(endpoint = %resource.name(), error = %release_error, "Releasing endpoint failed");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(pending)
    }

    fn setup_endpoint(
        &self,
        app_context: &ApplicationEnvironmentContext,
        description: &ServicePackageDescription,
        ctx: &mut ServicePackageInstanceEnvironmentContext,
        digested: &crate::model::DigestedEndpoint,
    ) -> Result<EndpointResource> {
        let mut resource = EndpointResource::new(digested);
        resource.endpoint.ip_address_or_fqdn =
            self.endpoint_ip_address(description, ctx, &digested.endpoint.code_package_ref);

        if let Some(policy) = &digested.security_access_policy {
            if !policy.resource_ref.eq_ignore_ascii_case(resource.name()) {
                return Err(HostingError::InvalidArgument(format!(
                    "security access policy for {} is attached to endpoint {}",
                    policy.resource_ref,
                    resource.name()
                )));
            }
            let sid = app_context
                .principals_context()
                .ok_or_else(|| HostingError::NotFound(format!("principal {}", policy.principal_ref)))?
                .get_principal_id(&policy.principal_ref)?;
            resource.set_security(sid, policy.rights);
        } else if resource.endpoint.is_http() && !self.node.is_admin_user {
            resource.set_security(self.node.current_user_sid.clone(), GrantAccessType::Full);
        }

        if resource.is_explicit_port() {
            if self.config.firewall_policy_enabled {
                ctx.add_firewall_port(resource.port());
            }
        } else {
            self.endpoints.add_endpoint(&mut resource)?;
        }

        debug!(
            endpoint = %resource.name(),
            port = resource.port(),
            ip = %resource.endpoint.ip_address_or_fqdn,
            "Endpoint resolved"
        );
        Ok(resource)
    }

    /// Apply URL ACLs in parallel; only endpoints whose ACL succeeded are kept.
    async fn setup_endpoint_security(
        &self,
        ctx: &mut ServicePackageInstanceEnvironmentContext,
        pending: Vec<EndpointResource>,
        identifier: &str,
        helper: TimeoutHelper,
    ) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let timeout = helper.remaining()?;
        let results = join_all(pending.iter().map(|endpoint| {
            self.activator
                .configure_endpoint_security(endpoint_security_request(endpoint, identifier, false), timeout)
        }))
        .await;

        let mut last_error = None;
        for (endpoint, result) in pending.into_iter().zip(results) {
            match result {
                Ok(()) => ctx.add_endpoint(endpoint),
                Err(e) => {
                    warn!(endpoint = %endpoint.name(), port = endpoint.port(), error = %e, "Endpoint ACL failed");
                    if let Err(release_error) = self.endpoints.remove_endpoint(&endpoint) {
                        warn!(endpoint = %endpoint.name(), error = %release_error, "Releasing endpoint failed");
                    }
                    last_error = Some(e);
                }
            }
        }
        last_error.map_or(Ok(()), Err)
    }

    /// Certificate bindings for every endpoint that references a certificate.
    ///
    /// # Errors
    ///
    /// `NotFound` when an endpoint references a certificate the service
    /// package does not declare.
    pub fn get_endpoint_binding_policies(
        &self,
        app_context: &ApplicationEnvironmentContext,
        description: &ServicePackageDescription,
        endpoints: &[EndpointResource],
    ) -> Result<Vec<EndpointCertificateBinding>> {
        let principal_sid = app_context.default_run_as_sid().unwrap_or_default().to_string();
        let mut bindings = Vec::new();
        for endpoint in endpoints.iter().filter(|e| !e.certificate_ref.is_empty()) {
            let certificate = description
                .certificates
                .iter()
                .find(|c| c.name == endpoint.certificate_ref)
                .ok_or_else(|| {
                    HostingError::NotFound(format!(
                        "certificate {} of endpoint {}",
                        endpoint.certificate_ref,
                        endpoint.name()
                    ))
                })?;
            bindings.push(EndpointCertificateBinding {
                port: endpoint.port(),
                is_explicit_port: endpoint.is_explicit_port(),
                principal_sid: principal_sid.clone(),
                x509_find_value: certificate.x509_find_value.clone(),
                x509_store_name: certificate.x509_store_name.clone(),
                x509_find_type: certificate.x509_find_type.clone(),
            });
        }
        Ok(bindings)
    }

    async fn configure_endpoint_binding_and_firewall(
        &self,
        ctx: &ServicePackageInstanceEnvironmentContext,
        identifier: &str,
        helper: TimeoutHelper,
    ) -> Result<()> {
        let open_ports = self.config.firewall_policy_enabled && !ctx.firewall_ports().is_empty();
        if ctx.certificate_bindings().is_empty() && !open_ports {
            return Ok(());
        }
        let request = ConfigureEndpointBindingAndFirewallPolicyRequest {
            node_id: self.node.node_id.clone(),
            service_package_id: identifier.to_string(),
            endpoint_certificate_bindings: ctx.certificate_bindings().to_vec(),
            cleanup: false,
            cleanup_firewall_policy: false,
            firewall_ports: ctx.firewall_ports().to_vec(),
        };
        self.activator
            .configure_endpoint_binding_and_firewall_policy(request, helper.remaining()?)
            .await?;
        debug!(
            service_package = %identifier,
            bindings = ctx.certificate_bindings().len(),
            firewall_ports = ?ctx.firewall_ports(),
            "Endpoint bindings and firewall configured"
        );
        Ok(())
    }

    async fn setup_container_certificates(
        &self,
        description: &ServicePackageDescription,
        ctx: &mut ServicePackageInstanceEnvironmentContext,
        helper: TimeoutHelper,
    ) -> Result<()> {
        let certificate_refs: BTreeMap<_, _> = description
            .code_packages
            .iter()
            .filter(|cp| !cp.container_policies.certificate_refs.is_empty())
            .map(|cp| (cp.name.clone(), cp.container_policies.certificate_refs.clone()))
            .collect();
        if certificate_refs.is_empty() {
            return Ok(());
        }

        let folder = self
            .layout
            .certificates_folder(ctx.application_id(), &description.manifest_name);
        tokio::fs::create_dir_all(&folder).await?;

        let request = ConfigureContainerCertificateExportRequest {
            certificate_refs,
            work_directory: folder.display().to_string(),
        };
        let paths = self
            .activator
            .configure_container_certificate_export(request, helper.remaining()?)
            .await?;
        debug!(folder = %folder.display(), certificates = paths.certificate_paths.len(), "Container certificates exported");
        ctx.set_certificate_paths(paths);
        Ok(())
    }

    /// Persist the endpoint descriptor read by code packages.
    async fn write_resources(&self, ctx: &ServicePackageInstanceEnvironmentContext) -> Result<()> {
        let id = ctx.service_package_instance_id();
        let path = self.layout.endpoint_descriptor_file(
            id.application_id(),
            id.service_package_name(),
            &id.activation_id,
        );
        write_json_file(&path, &ctx.endpoints()).await.map_err(|e| {
            HostingError::OperationFailed(format!("failed to write {}: {e}", path.display()))
        })
    }

    /// Tear down one service package activation.
    ///
    /// Every step runs with the full `timeout`, whatever earlier steps took.
    /// The context is reset only when every step succeeded.
    pub async fn cleanup_service_package_instance(
        &self,
        ctx: &mut ServicePackageInstanceEnvironmentContext,
        timeout: Duration,
    ) -> Result<()> {
        let identifier = Self::service_package_identifier(ctx);
        let app_id = ctx.application_id().clone();
        let mut plan = CleanupPlan::new(&identifier);

        plan.record(
            "crash dumps",
            self.diagnostics
                .cleanup_service_package_crash_dumps(&identifier)
                .await,
        );

        if ctx.container_group_setup() {
            let request = SetupContainerGroupRequest {
                service_package_id: identifier.clone(),
                app_folder: self.layout.application_folder(&app_id).display().to_string(),
                app_id: app_id.to_string(),
                app_number: app_id.application_number,
                cleanup: true,
                ..Default::default()
            };
            let result = self.activator.setup_container_group(request, timeout).await;
            plan.record("container group", result.map(|_| ()));
        }

        if ctx.ip_addresses_assigned() {
            let request = AssignIpAddressesRequest {
                service_package_id: identifier.clone(),
                code_packages: ctx.assigned_ips().iter().map(|(cp, _)| cp.clone()).collect(),
                cleanup: true,
            };
            let result = self.activator.assign_ip_addresses(request, timeout).await;
            plan.record("ip addresses", result.map(|_| ()));
        }

        if ctx.overlay_assigned() {
            let code_package_networks = ctx
                .overlay_assignments()
                .iter()
                .map(|(network, cps)| (network.clone(), cps.keys().cloned().collect()))
                .collect();
            let request = ManageOverlayNetworkResourcesRequest {
                node_name: self.node.node_name.clone(),
                node_ip_address: self.node.ip_address_or_fqdn.clone(),
                service_package_id: identifier.clone(),
                code_package_networks,
                action: OverlayNetworkAction::Release,
            };
            let result = self
                .activator
                .manage_overlay_network_resources(request, timeout)
                .await;
            plan.record("overlay network", result.map(|_| ()));
        }

        let has_explicit_port = ctx.endpoints().iter().any(|e| e.is_explicit_port());
        let acl_endpoints: Vec<&EndpointResource> = ctx
            .endpoints()
            .iter()
            .filter(|e| e.endpoint.is_http() && e.security.is_some())
            .collect();
        let results = join_all(acl_endpoints.iter().map(|endpoint| {
            self.activator
                .configure_endpoint_security(endpoint_security_request(endpoint, &identifier, true), timeout)
        }))
        .await;
        for result in results {
            plan.record("endpoint security", result);
        }
        if self.endpoints.is_enabled() {
            for endpoint in ctx.endpoints() {
                plan.record("endpoint", self.endpoints.remove_endpoint(endpoint));
            }
        }

        plan.record(
            "trace session",
            self.diagnostics.cleanup_trace_session(&identifier).await,
        );

        let request = ConfigureEndpointBindingAndFirewallPolicyRequest {
            node_id: self.node.node_id.clone(),
            service_package_id: identifier.clone(),
            endpoint_certificate_bindings: ctx.certificate_bindings().to_vec(),
            cleanup: true,
            cleanup_firewall_policy: self.config.firewall_policy_enabled && has_explicit_port,
            firewall_ports: ctx.firewall_ports().to_vec(),
        };
        plan.record(
            "endpoint bindings",
            self.activator
                .configure_endpoint_binding_and_firewall_policy(request, timeout)
                .await,
        );

        if !ctx.certificate_paths().is_empty() {
            plan.record(
                "container certificates",
                self.activator
                    .cleanup_container_certificate_export(ctx.certificate_paths().clone(), timeout)
                    .await,
            );
        }

        let id = ctx.service_package_instance_id();
        let descriptor = self.layout.endpoint_descriptor_file(
            id.application_id(),
            id.service_package_name(),
            &id.activation_id,
        );
        let removed = match tokio::fs::remove_file(&descriptor).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other.map_err(HostingError::from),
        };
        plan.record("endpoint descriptor", removed);

        if plan.is_clean() {
            ctx.reset();
            info!(service_package = %identifier, "Service package environment cleaned up");
        }
        plan.finish()
    }

    /// Best-effort teardown used when an activation is aborted.
    pub async fn abort_service_package_instance(&self, ctx: &mut ServicePackageInstanceEnvironmentContext) {
        if let Err(e) = self
            .cleanup_service_package_instance(ctx, self.config.request_timeout)
            .await
        {
            warn!(
                service_package = %ctx.service_package_instance_id(),
                error = %e,
                code = %e.code(),
                "Aborting service package environment failed"
            );
        }
    }
}
