//! Application host proxies: the node-side handle of one sandbox.
//!
//! ```text
//!                   create_application_host_proxy
//!                               │
//!        ┌──────────────────────┼───────────────────────┐
//!        ▼                      ▼                       ▼
//!   InProcess            SingleCodePackage        MultiCodePackage
//!  (no child)        (one exe or container)   (one process, many code
//!                                              packages of a service package)
//! ```

use crate::context::{ApplicationHostContext, ApplicationHostType, CodePackageContext};
use crate::error::{ErrorCode, HostingError, Result};
use crate::host::activation::{ApplicationHostIsolationContext, CodePackageActivation, HostingHolder};
use crate::host::environment::build_host_environment;
use crate::host::launcher::HostActivationRequest;
use crate::host::state::HostProxyState;
use crate::ids::{CodePackageInstanceId, HostId, ServicePackageInstanceId};
use crate::ipc::messages::{
    ApplicationHostCodePackageOperationRequest, CodePackageOperationType, ContainerDescription,
    DependentCodePackageEvent,
};
use crate::model::EntryPointType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Shared proxy state
// ============================================================================

/// Identity and lifecycle shared by every proxy variant.
pub struct ProxyCore {
    host_id: HostId,
    host_type: ApplicationHostType,
    is_container_host: bool,
    isolation: ApplicationHostIsolationContext,
    holder: Arc<HostingHolder>,
    state: Mutex<HostProxyState>,
    exit_code: Mutex<Option<i32>>,
    created_at: DateTime<Utc>,
}

impl ProxyCore {
    fn new(
        host_type: ApplicationHostType,
        is_container_host: bool,
        isolation: ApplicationHostIsolationContext,
        holder: Arc<HostingHolder>,
    ) -> Self {
        Self {
            host_id: HostId::new(),
            host_type,
            is_container_host,
            isolation,
            holder,
            state: Mutex::new(HostProxyState::Created),
            exit_code: Mutex::new(None),
            created_at: Utc::now(),
        }
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn host_type(&self) -> ApplicationHostType {
        self.host_type
    }

    pub fn isolation_context(&self) -> &ApplicationHostIsolationContext {
        &self.isolation
    }

    pub fn service_package_instance_id(&self) -> &ServicePackageInstanceId {
        self.isolation.service_package_instance_id()
    }

    pub fn holder(&self) -> &HostingHolder {
        &self.holder
    }

    pub fn state(&self) -> HostProxyState {
        *lock(&self.state)
    }

    pub fn exit_code(&self) -> Option<i32> {
        *lock(&self.exit_code)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn host_context(&self) -> ApplicationHostContext {
        ApplicationHostContext::new(self.host_id, self.host_type, self.is_container_host)
            .with_code_package_activator_host(self.is_container_host)
    }

    /// Move to `next`, failing with `InvalidState` on an illegal edge.
    fn transition(&self, next: HostProxyState) -> Result<HostProxyState> {
        let mut state = lock(&self.state);
        if !state.can_transition_to(next) {
            return Err(HostingError::invalid_state(next, *state));
        }
        let previous = std::mem::replace(&mut *state, next);
        debug!(host_id = %self.host_id, from = %previous, to = %next, "Host proxy state changed");
        Ok(previous)
    }

    fn ensure_opened(&self) -> Result<()> {
        match self.state() {
            HostProxyState::Opened => Ok(()),
            HostProxyState::Closing | HostProxyState::Closed | HostProxyState::Aborted => {
                Err(HostingError::ObjectClosed)
            }
            other => Err(HostingError::invalid_state(HostProxyState::Opened, other)),
        }
    }

    /// Mark the proxy aborted. Returns false when it already was terminal.
    fn mark_aborted(&self) -> bool {
        self.transition(HostProxyState::Aborted).is_ok()
    }

    /// Abort the proxy and kill its host.
    fn abort_host(&self) {
        if self.mark_aborted() {
            warn!(host_id = %self.host_id, host_type = %self.host_type, "Aborting application host");
            self.holder.activator.terminate(&self.host_id);
        }
    }

    async fn start_host(&self, request: Result<HostActivationRequest>, timeout: Duration) -> Result<()> {
        self.transition(HostProxyState::Opening)?;
        let start = tokio::time::Instant::now();

        let request = match request {
            Ok(request) => request,
            Err(e) => {
                // The host was never started; a later open may succeed.
                let _ = self.transition(HostProxyState::Created);
                return Err(e);
            }
        };

        if let Err(e) = self.holder.activator.activate(request, timeout).await {
            error!(host_id = %self.host_id, error = %e, "Failed to start application host");
            self.mark_aborted();
            return Err(e);
        }
        self.transition(HostProxyState::Opened)?;
        info!(
            host_id = %self.host_id,
            host_type = %self.host_type,
            isolation = %self.isolation,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Application host opened"
        );
        Ok(())
    }

    async fn stop_host(&self, timeout: Duration) -> Result<()> {
        self.transition(HostProxyState::Closing)?;
        if let Err(e) = self.holder.activator.deactivate(&self.host_id, timeout).await {
            if !e.is(ErrorCode::NotFound) {
                warn!(host_id = %self.host_id, error = %e, "Graceful stop failed, aborting host");
                self.abort_host();
                return Err(e);
            }
        }
        self.transition(HostProxyState::Closed)?;
        info!(host_id = %self.host_id, "Application host closed");
        Ok(())
    }

    /// Push a new code package context to the host.
    ///
    /// A host that no longer knows the code package fails with
    /// `UpdateContextFailed`; any other failure aborts the proxy since the
    /// host's state is unknown.
    async fn update_context_over_ipc(&self, context: CodePackageContext, timeout: Duration) -> Result<()> {
        self.ensure_opened()?;
        let code_package = context.code_package_instance_id.clone();
        match self
            .holder
            .client
            .update_code_package_context(&self.host_id, context, timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is(ErrorCode::HostingCodePackageNotHosted) => {
                debug!(host_id = %self.host_id, code_package = %code_package, "Code package no longer hosted");
                Ok(())
            }
            Err(e) if e.is(ErrorCode::NotFound) => {
                warn!(host_id = %self.host_id, code_package = %code_package, "Host does not know code package");
                Err(HostingError::UpdateContextFailed(format!(
                    "host {} does not know {code_package}",
                    self.host_id
                )))
            }
            Err(e) => {
                error!(host_id = %self.host_id, code_package = %code_package, error = %e, "Context update failed");
                self.abort_host();
                Err(e)
            }
        }
    }

    fn on_terminated(&self, exit_code: i32) {
        *lock(&self.exit_code) = Some(exit_code);
        let uptime_secs = (Utc::now() - self.created_at).num_seconds();
        if exit_code == 0 {
            info!(host_id = %self.host_id, exit_code, uptime_secs, "Application host terminated");
        } else {
            warn!(host_id = %self.host_id, exit_code, uptime_secs, "Application host terminated");
        }
        if !matches!(self.state(), HostProxyState::Closing | HostProxyState::Closed) {
            self.mark_aborted();
        }
    }
}

// ============================================================================
// Proxy trait
// ============================================================================

/// Node-side handle of one application host.
///
/// Fine-grained code package operations default to `OperationNotSupported`;
/// callers probe for them and tolerate the error.
#[async_trait]
pub trait ApplicationHostProxy: Send + Sync {
    fn core(&self) -> &ProxyCore;

    fn host_id(&self) -> HostId {
        self.core().host_id()
    }

    fn host_type(&self) -> ApplicationHostType {
        self.core().host_type()
    }

    fn isolation_context(&self) -> &ApplicationHostIsolationContext {
        self.core().isolation_context()
    }

    fn state(&self) -> HostProxyState {
        self.core().state()
    }

    /// Whether the host runs `code_package`.
    fn hosts_code_package(&self, code_package: &CodePackageInstanceId) -> bool;

    async fn open(&self, timeout: Duration) -> Result<()>;

    async fn close(&self, timeout: Duration) -> Result<()> {
        self.core().stop_host(timeout).await
    }

    fn abort(&self) {
        self.core().abort_host();
    }

    async fn update_code_package_context(&self, context: CodePackageContext, timeout: Duration) -> Result<()>;

    async fn application_host_code_package_operation(
        &self,
        _operation: CodePackageOperationType,
        _contexts: Vec<CodePackageContext>,
        _timeout: Duration,
    ) -> Result<()> {
        Err(HostingError::OperationNotSupported(format!(
            "code package operations on {} hosts",
            self.host_type()
        )))
    }

    async fn send_dependent_code_package_event(&self, _event: DependentCodePackageEvent) -> Result<()> {
        Err(HostingError::OperationNotSupported(format!(
            "dependent code package events on {} hosts",
            self.host_type()
        )))
    }

    /// Kill the host without a graceful stop.
    fn terminate_externally(&self) {
        self.abort();
    }

    /// Called by the monitor once the host exited.
    fn on_application_host_terminated(&self, exit_code: i32) {
        self.core().on_terminated(exit_code);
    }
}

/// Pick and build the proxy variant for `activation`.
///
/// # Panics
///
/// Panics when the code package has no entry point.
pub fn create_application_host_proxy(
    holder: Arc<HostingHolder>,
    isolation: ApplicationHostIsolationContext,
    activation: CodePackageActivation,
) -> Arc<dyn ApplicationHostProxy> {
    let entry_point = activation.entry_point_type();
    assert!(
        entry_point != EntryPointType::None,
        "code package {} has no entry point",
        activation.code_package_instance_id()
    );

    if activation.description.is_implicit_type_host && holder.config.in_process_hosting_enabled {
        Arc::new(InProcessApplicationHostProxy::new(holder, isolation, activation))
    } else if matches!(entry_point, EntryPointType::Exe | EntryPointType::ContainerHost) {
        Arc::new(SingleCodePackageApplicationHostProxy::new(holder, isolation, activation))
    } else {
        Arc::new(MultiCodePackageApplicationHostProxy::new(holder, isolation, activation))
    }
}

// ============================================================================
// In-process
// ============================================================================

/// Hosts a guest service type inside the node process.
pub struct InProcessApplicationHostProxy {
    core: ProxyCore,
    context: Mutex<CodePackageContext>,
}

impl InProcessApplicationHostProxy {
    fn new(
        holder: Arc<HostingHolder>,
        isolation: ApplicationHostIsolationContext,
        activation: CodePackageActivation,
    ) -> Self {
        Self {
            core: ProxyCore::new(ApplicationHostType::ActivatedInProcess, false, isolation, holder),
            context: Mutex::new(activation.context),
        }
    }

    pub fn code_package_context(&self) -> CodePackageContext {
        lock(&self.context).clone()
    }
}

#[async_trait]
impl ApplicationHostProxy for InProcessApplicationHostProxy {
    fn core(&self) -> &ProxyCore {
        &self.core
    }

    fn hosts_code_package(&self, code_package: &CodePackageInstanceId) -> bool {
        &lock(&self.context).code_package_instance_id == code_package
    }

    async fn open(&self, _timeout: Duration) -> Result<()> {
        self.core.transition(HostProxyState::Opening)?;
        self.core.transition(HostProxyState::Opened)?;
        info!(host_id = %self.core.host_id, "In-process host opened");
        Ok(())
    }

    async fn close(&self, _timeout: Duration) -> Result<()> {
        self.core.transition(HostProxyState::Closing)?;
        self.core.transition(HostProxyState::Closed)?;
        Ok(())
    }

    fn abort(&self) {
        self.core.mark_aborted();
    }

    async fn update_code_package_context(&self, context: CodePackageContext, _timeout: Duration) -> Result<()> {
        self.core.ensure_opened()?;
        *lock(&self.context) = context;
        Ok(())
    }
}

// ============================================================================
// Single code package
// ============================================================================

/// One process or container running exactly one code package.
pub struct SingleCodePackageApplicationHostProxy {
    core: ProxyCore,
    activation: Mutex<CodePackageActivation>,
}

impl SingleCodePackageApplicationHostProxy {
    fn new(
        holder: Arc<HostingHolder>,
        isolation: ApplicationHostIsolationContext,
        activation: CodePackageActivation,
    ) -> Self {
        let is_container = activation.description.is_container();
        Self {
            core: ProxyCore::new(
                ApplicationHostType::ActivatedSingleCodePackage,
                is_container,
                isolation,
                holder,
            ),
            activation: Mutex::new(activation),
        }
    }

    pub fn code_package_context(&self) -> CodePackageContext {
        lock(&self.activation).context.clone()
    }

    fn container_description(&self, activation: &CodePackageActivation) -> ContainerDescription {
        let cp_id = activation.code_package_instance_id();
        let sp_id = &cp_id.service_package_instance_id;
        ContainerDescription {
            container_name: format!("sf-{}-{}", sp_id.application_id(), self.core.host_id)
                .to_lowercase(),
            image_name: activation.description.container_policies.image_name.clone(),
            application_name: activation.context.application_name.clone(),
            service_name: activation
                .exclusive_service_names
                .get(&sp_id.activation_id)
                .cloned()
                .unwrap_or_default(),
            code_package_name: cp_id.code_package_name.clone(),
            command_args: activation.arguments.clone(),
            network_type: activation.description.container_policies.network_config.primary_type(),
            ..Default::default()
        }
    }

    fn activation_request(&self) -> Result<HostActivationRequest> {
        let activation = lock(&self.activation).clone();
        let holder = self.core.holder();
        let environment = build_host_environment(
            holder,
            &self.core.host_context(),
            &self.core.host_id,
            &activation,
            true,
        )?;
        let container = activation
            .description
            .is_container()
            .then(|| self.container_description(&activation));
        Ok(HostActivationRequest {
            host_id: self.core.host_id,
            host_type: self.core.host_type,
            program: activation.program.clone(),
            arguments: activation.arguments.clone(),
            working_folder: holder.layout.work_folder(activation.context.application_id()),
            environment,
            container,
        })
    }
}

#[async_trait]
impl ApplicationHostProxy for SingleCodePackageApplicationHostProxy {
    fn core(&self) -> &ProxyCore {
        &self.core
    }

    fn hosts_code_package(&self, code_package: &CodePackageInstanceId) -> bool {
        lock(&self.activation).code_package_instance_id() == code_package
    }

    async fn open(&self, timeout: Duration) -> Result<()> {
        self.core.start_host(self.activation_request(), timeout).await
    }

    async fn update_code_package_context(&self, context: CodePackageContext, timeout: Duration) -> Result<()> {
        self.core.update_context_over_ipc(context.clone(), timeout).await?;
        lock(&self.activation).context = context;
        Ok(())
    }

    async fn application_host_code_package_operation(
        &self,
        operation: CodePackageOperationType,
        contexts: Vec<CodePackageContext>,
        timeout: Duration,
    ) -> Result<()> {
        if !self.core.is_container_host {
            return Err(HostingError::OperationNotSupported(
                "code package operations on process hosts".into(),
            ));
        }
        self.core.ensure_opened()?;
        let request = ApplicationHostCodePackageOperationRequest {
            host_id: self.core.host_id.to_string(),
            operation_type: operation,
            code_package_contexts: contexts,
            environment: Default::default(),
        };
        self.core.holder.client.code_package_operation(request, timeout).await
    }

    async fn send_dependent_code_package_event(&self, event: DependentCodePackageEvent) -> Result<()> {
        if !self.core.is_container_host {
            return Err(HostingError::OperationNotSupported(
                "dependent code package events on process hosts".into(),
            ));
        }
        self.core.ensure_opened()?;
        self.core.holder.client.send_dependent_code_package_event(event).await
    }
}

// ============================================================================
// Multi code package
// ============================================================================

/// One process hosting several code packages of a service package.
pub struct MultiCodePackageApplicationHostProxy {
    core: ProxyCore,
    first: CodePackageActivation,
    remove_runtime_access: bool,
    /// Code package name to its current context.
    code_packages: Mutex<BTreeMap<String, CodePackageContext>>,
}

impl MultiCodePackageApplicationHostProxy {
    fn new(
        holder: Arc<HostingHolder>,
        isolation: ApplicationHostIsolationContext,
        activation: CodePackageActivation,
    ) -> Self {
        let mut code_packages = BTreeMap::new();
        code_packages.insert(
            activation.context.code_package_instance_id.code_package_name.clone(),
            activation.context.clone(),
        );
        Self {
            core: ProxyCore::new(ApplicationHostType::ActivatedMultiCodePackage, false, isolation, holder),
            remove_runtime_access: activation.description.remove_runtime_access,
            first: activation,
            code_packages: Mutex::new(code_packages),
        }
    }

    /// Whether runtime connection variables are withheld from the host.
    pub fn remove_runtime_access(&self) -> bool {
        self.remove_runtime_access
    }

    pub fn code_package_names(&self) -> Vec<String> {
        lock(&self.code_packages).keys().cloned().collect()
    }

    fn activation_request(&self) -> Result<HostActivationRequest> {
        let holder = self.core.holder();
        let environment = build_host_environment(
            holder,
            &self.core.host_context(),
            &self.core.host_id,
            &self.first,
            false,
        )?;
        Ok(HostActivationRequest {
            host_id: self.core.host_id,
            host_type: self.core.host_type,
            program: self.first.program.clone(),
            arguments: self.first.arguments.clone(),
            working_folder: holder.layout.work_folder(self.first.context.application_id()),
            environment,
            container: None,
        })
    }
}

#[async_trait]
impl ApplicationHostProxy for MultiCodePackageApplicationHostProxy {
    fn core(&self) -> &ProxyCore {
        &self.core
    }

    fn hosts_code_package(&self, code_package: &CodePackageInstanceId) -> bool {
        &code_package.service_package_instance_id == self.core.service_package_instance_id()
            && lock(&self.code_packages).contains_key(&code_package.code_package_name)
    }

    async fn open(&self, timeout: Duration) -> Result<()> {
        self.core.start_host(self.activation_request(), timeout).await
    }

    async fn update_code_package_context(&self, context: CodePackageContext, timeout: Duration) -> Result<()> {
        self.core.update_context_over_ipc(context.clone(), timeout).await?;
        let name = context.code_package_instance_id.code_package_name.clone();
        lock(&self.code_packages).insert(name, context);
        Ok(())
    }

    async fn application_host_code_package_operation(
        &self,
        operation: CodePackageOperationType,
        contexts: Vec<CodePackageContext>,
        timeout: Duration,
    ) -> Result<()> {
        self.core.ensure_opened()?;
        let request = ApplicationHostCodePackageOperationRequest {
            host_id: self.core.host_id.to_string(),
            operation_type: operation,
            code_package_contexts: contexts.clone(),
            environment: Default::default(),
        };
        self.core.holder.client.code_package_operation(request, timeout).await?;

        let mut code_packages = lock(&self.code_packages);
        for context in contexts {
            let name = context.code_package_instance_id.code_package_name.clone();
            match operation {
                CodePackageOperationType::Activate => {
                    code_packages.insert(name, context);
                }
                CodePackageOperationType::Deactivate | CodePackageOperationType::Abort => {
                    code_packages.remove(&name);
                }
            }
        }
        debug!(host_id = %self.core.host_id, operation = %operation, hosted = code_packages.len(), "Code package operation done");
        Ok(())
    }

    async fn send_dependent_code_package_event(&self, event: DependentCodePackageEvent) -> Result<()> {
        self.core.ensure_opened()?;
        self.core.holder.client.send_dependent_code_package_event(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostingConfig, NodeConfig};
    use crate::host::client::ApplicationHostClient;
    use crate::host::environment::EphemeralCredentialIssuer;
    use crate::host::launcher::HostActivator;
    use crate::ids::{ApplicationId, ServicePackageId};
    use crate::model::CodePackageDescription;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingActivator {
        requests: Mutex<Vec<HostActivationRequest>>,
        fail_activate: bool,
        terminated: AtomicUsize,
    }

    #[async_trait]
    impl HostActivator for RecordingActivator {
        async fn activate(&self, request: HostActivationRequest, _: Duration) -> Result<()> {
            if self.fail_activate {
                return Err(HostingError::OperationFailed("spawn failed".into()));
            }
            lock(&self.requests).push(request);
            Ok(())
        }
        async fn deactivate(&self, _: &HostId, _: Duration) -> Result<()> {
            Ok(())
        }
        fn terminate(&self, _: &HostId) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Copy)]
    enum UpdateOutcome {
        Ok,
        NotHosted,
        Unknown,
        Broken,
    }

    struct ScriptedClient {
        update: UpdateOutcome,
        operations: Mutex<Vec<ApplicationHostCodePackageOperationRequest>>,
    }

    impl ScriptedClient {
        fn new(update: UpdateOutcome) -> Self {
            Self {
                update,
                operations: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ApplicationHostClient for ScriptedClient {
        async fn update_code_package_context(&self, _: &HostId, _: CodePackageContext, _: Duration) -> Result<()> {
            match self.update {
                UpdateOutcome::Ok => Ok(()),
                UpdateOutcome::NotHosted => Err(HostingError::HostingCodePackageNotHosted("Code".into())),
                UpdateOutcome::Unknown => Err(HostingError::NotFound("Code".into())),
                UpdateOutcome::Broken => Err(HostingError::OperationFailed("pipe closed".into())),
            }
        }
        async fn code_package_operation(
            &self,
            request: ApplicationHostCodePackageOperationRequest,
            _: Duration,
        ) -> Result<()> {
            lock(&self.operations).push(request);
            Ok(())
        }
        async fn send_dependent_code_package_event(&self, _: DependentCodePackageEvent) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        holder: Arc<HostingHolder>,
        activator: Arc<RecordingActivator>,
        client: Arc<ScriptedClient>,
    }

    fn fixture(config: HostingConfig, activator: RecordingActivator, update: UpdateOutcome) -> Fixture {
        let activator = Arc::new(activator);
        let client = Arc::new(ScriptedClient::new(update));
        let holder = Arc::new(HostingHolder::new(
            NodeConfig::rooted_at("/srv/node", "N1"),
            config,
            activator.clone(),
            client.clone(),
            Arc::new(EphemeralCredentialIssuer),
        ));
        Fixture {
            holder,
            activator,
            client,
        }
    }

    fn activation(code_package: &str, entry_point: EntryPointType) -> CodePackageActivation {
        let sp = ServicePackageId::new(ApplicationId::new("Calc", 1), "Front");
        let cp = CodePackageInstanceId::new(ServicePackageInstanceId::new(sp, ""), code_package);
        let context = CodePackageContext::new(cp, 1, 1, "1.0:1", "fabric:/Calc");
        let mut activation =
            CodePackageActivation::new(context, CodePackageDescription::new(code_package, entry_point));
        activation.program = "/bin/calc".into();
        activation
    }

    fn proxy_for(f: &Fixture, activation: CodePackageActivation) -> Arc<dyn ApplicationHostProxy> {
        let isolation = ApplicationHostIsolationContext::for_activation(&f.holder.config, &activation);
        create_application_host_proxy(f.holder.clone(), isolation, activation)
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_factory_picks_variant() {
        let f = fixture(HostingConfig::default(), RecordingActivator::default(), UpdateOutcome::Ok);
        assert_eq!(
            proxy_for(&f, activation("Code", EntryPointType::Exe)).host_type(),
            ApplicationHostType::ActivatedSingleCodePackage
        );
        assert_eq!(
            proxy_for(&f, activation("Code", EntryPointType::DllHost)).host_type(),
            ApplicationHostType::ActivatedMultiCodePackage
        );

        let config = HostingConfig::builder().in_process_hosting_enabled(true).build().unwrap();
        let f = fixture(config, RecordingActivator::default(), UpdateOutcome::Ok);
        let mut implicit = activation("Code", EntryPointType::DllHost);
        implicit.description.is_implicit_type_host = true;
        assert_eq!(
            proxy_for(&f, implicit).host_type(),
            ApplicationHostType::ActivatedInProcess
        );
    }

    #[test]
    #[should_panic(expected = "no entry point")]
    fn test_factory_rejects_missing_entry_point() {
        let f = fixture(HostingConfig::default(), RecordingActivator::default(), UpdateOutcome::Ok);
        let a = activation("Code", EntryPointType::None);
        let isolation = ApplicationHostIsolationContext::CodePackage(a.code_package_instance_id().clone());
        create_application_host_proxy(f.holder.clone(), isolation, a);
    }

    #[tokio::test]
    async fn test_open_and_close() {
        let f = fixture(HostingConfig::default(), RecordingActivator::default(), UpdateOutcome::Ok);
        let proxy = proxy_for(&f, activation("Code", EntryPointType::Exe));

        proxy.open(TIMEOUT).await.unwrap();
        assert_eq!(proxy.state(), HostProxyState::Opened);

        let requests = lock(&f.activator.requests);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].host_id, proxy.host_id());
        assert_eq!(requests[0].program, "/bin/calc");
        assert!(requests[0].container.is_none());
        assert_eq!(
            requests[0].environment.get("Fabric_NodeId").map(String::as_str),
            Some("N1")
        );
        drop(requests);

        proxy.close(TIMEOUT).await.unwrap();
        assert_eq!(proxy.state(), HostProxyState::Closed);
        assert!(proxy.open(TIMEOUT).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_start_aborts() {
        let activator = RecordingActivator {
            fail_activate: true,
            ..Default::default()
        };
        let f = fixture(HostingConfig::default(), activator, UpdateOutcome::Ok);
        let proxy = proxy_for(&f, activation("Code", EntryPointType::Exe));

        assert!(proxy.open(TIMEOUT).await.is_err());
        assert_eq!(proxy.state(), HostProxyState::Aborted);
    }

    #[tokio::test]
    async fn test_container_host_gets_container_description() {
        let f = fixture(HostingConfig::default(), RecordingActivator::default(), UpdateOutcome::Ok);
        let mut a = activation("Web", EntryPointType::ContainerHost);
        a.description.container_policies.image_name = "calc/web:1.0".into();
        let proxy = proxy_for(&f, a);

        proxy.open(TIMEOUT).await.unwrap();
        let requests = lock(&f.activator.requests);
        let container = requests[0].container.as_ref().unwrap();
        assert_eq!(container.image_name, "calc/web:1.0");
        assert_eq!(container.code_package_name, "Web");
        assert!(container.container_name.starts_with("sf-calc_app1-"));
    }

    #[tokio::test]
    async fn test_update_context_outcomes() {
        let cases = [
            (UpdateOutcome::Ok, None, HostProxyState::Opened),
            (UpdateOutcome::NotHosted, None, HostProxyState::Opened),
            (UpdateOutcome::Unknown, Some(ErrorCode::UpdateContextFailed), HostProxyState::Opened),
            (UpdateOutcome::Broken, Some(ErrorCode::OperationFailed), HostProxyState::Aborted),
        ];
        for (outcome, expected_error, expected_state) in cases {
            let f = fixture(HostingConfig::default(), RecordingActivator::default(), outcome);
            let a = activation("Code", EntryPointType::Exe);
            let context = a.context.clone();
            let proxy = proxy_for(&f, a);
            proxy.open(TIMEOUT).await.unwrap();

            let result = proxy.update_code_package_context(context, TIMEOUT).await;
            assert_eq!(result.err().map(|e| e.code()), expected_error);
            assert_eq!(proxy.state(), expected_state);
        }
    }

    #[tokio::test]
    async fn test_update_requires_open_host() {
        let f = fixture(HostingConfig::default(), RecordingActivator::default(), UpdateOutcome::Ok);
        let a = activation("Code", EntryPointType::Exe);
        let context = a.context.clone();
        let proxy = proxy_for(&f, a);

        let err = proxy.update_code_package_context(context, TIMEOUT).await.unwrap_err();
        assert!(err.is(ErrorCode::InvalidState));
    }

    #[tokio::test]
    async fn test_process_host_rejects_code_package_operations() {
        let f = fixture(HostingConfig::default(), RecordingActivator::default(), UpdateOutcome::Ok);
        let a = activation("Code", EntryPointType::Exe);
        let context = a.context.clone();
        let proxy = proxy_for(&f, a);
        proxy.open(TIMEOUT).await.unwrap();

        let err = proxy
            .application_host_code_package_operation(CodePackageOperationType::Activate, vec![context], TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::OperationNotSupported));
    }

    #[tokio::test]
    async fn test_multi_host_tracks_code_packages() {
        let f = fixture(HostingConfig::default(), RecordingActivator::default(), UpdateOutcome::Ok);
        let first = activation("Code", EntryPointType::DllHost);
        let second = activation("Setup", EntryPointType::DllHost);
        let proxy = proxy_for(&f, first.clone());
        assert!(proxy.hosts_code_package(first.code_package_instance_id()));
        assert!(!proxy.hosts_code_package(second.code_package_instance_id()));
        proxy.open(TIMEOUT).await.unwrap();

        proxy
            .application_host_code_package_operation(
                CodePackageOperationType::Activate,
                vec![first.context.clone(), second.context.clone()],
                TIMEOUT,
            )
            .await
            .unwrap();
        assert!(proxy.hosts_code_package(first.code_package_instance_id()));
        assert!(proxy.hosts_code_package(second.code_package_instance_id()));

        proxy
            .application_host_code_package_operation(
                CodePackageOperationType::Deactivate,
                vec![second.context.clone()],
                TIMEOUT,
            )
            .await
            .unwrap();
        assert!(!proxy.hosts_code_package(second.code_package_instance_id()));
        assert_eq!(lock(&f.client.operations).len(), 2);
    }

    #[tokio::test]
    async fn test_termination_aborts_open_host() {
        let f = fixture(HostingConfig::default(), RecordingActivator::default(), UpdateOutcome::Ok);
        let proxy = proxy_for(&f, activation("Code", EntryPointType::Exe));
        proxy.open(TIMEOUT).await.unwrap();

        proxy.on_application_host_terminated(3);
        assert_eq!(proxy.state(), HostProxyState::Aborted);
        assert_eq!(proxy.core().exit_code(), Some(3));
        assert_eq!(f.activator.terminated.load(Ordering::SeqCst), 0);

        proxy.terminate_externally();
        assert_eq!(f.activator.terminated.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_in_process_host_keeps_context() {
        let config = HostingConfig::builder().in_process_hosting_enabled(true).build().unwrap();
        let f = fixture(config, RecordingActivator::default(), UpdateOutcome::Broken);
        let mut a = activation("Code", EntryPointType::DllHost);
        a.description.is_implicit_type_host = true;
        let mut context = a.context.clone();
        let proxy = proxy_for(&f, a);

        proxy.open(TIMEOUT).await.unwrap();
        context.code_package_instance_seq_num = 9;
        proxy.update_code_package_context(context, TIMEOUT).await.unwrap();
        assert!(lock(&f.activator.requests).is_empty());
        proxy.close(TIMEOUT).await.unwrap();
        assert_eq!(proxy.state(), HostProxyState::Closed);
    }
}
