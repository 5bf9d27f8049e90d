//! Environment variables handed to application hosts.

use crate::context::{ApplicationHostContext, EnvironmentMap};
use crate::error::{HostingError, Result};
use crate::host::activation::{CodePackageActivation, HostingHolder};
use crate::ids::HostId;
use rand::RngCore;
use std::fmt::Write as _;

pub const ENV_RUNTIME_CONNECTION_ADDRESS: &str = "Fabric_RuntimeConnectionAddress";
pub const ENV_RUNTIME_SSL_CONNECTION_ADDRESS: &str = "Fabric_RuntimeSslConnectionAddress";
pub const ENV_RUNTIME_SSL_CONNECTION_CERT_KEY: &str = "Fabric_RuntimeSslConnectionCertKey";
pub const ENV_RUNTIME_SSL_CONNECTION_CERT_ENCODED_BYTES: &str =
    "Fabric_RuntimeSslConnectionCertEncodedBytes";
pub const ENV_RUNTIME_SSL_CONNECTION_CERT_THUMBPRINT: &str =
    "Fabric_RuntimeSslConnectionCertThumbprint";
pub const ENV_NODE_ID: &str = "Fabric_NodeId";
pub const ENV_NODE_NAME: &str = "Fabric_NodeName";
pub const ENV_PATH: &str = "PATH";
pub const ENV_TEMP: &str = "TEMP";
pub const ENV_TMP: &str = "TMP";

pub const PARTITION_ID_PLACEHOLDER: &str = "@PartitionId@";
pub const SERVICE_NAME_PLACEHOLDER: &str = "@ServiceName@";
pub const APPLICATION_NAME_PLACEHOLDER: &str = "@ApplicationName@";

const FABRIC_SCHEME: &str = "fabric:";

/// Every runtime connection variable, for hosts denied runtime access.
pub const RUNTIME_CONNECTION_VARIABLES: [&str; 7] = [
    ENV_RUNTIME_CONNECTION_ADDRESS,
    ENV_RUNTIME_SSL_CONNECTION_ADDRESS,
    ENV_RUNTIME_SSL_CONNECTION_CERT_KEY,
    ENV_RUNTIME_SSL_CONNECTION_CERT_ENCODED_BYTES,
    ENV_RUNTIME_SSL_CONNECTION_CERT_THUMBPRINT,
    ENV_NODE_ID,
    ENV_NODE_NAME,
];

// ============================================================================
// Client credentials
// ============================================================================

/// Client credential a host presents on a TLS runtime connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredential {
    pub private_key: String,
    pub encoded_bytes: String,
    pub thumbprint: String,
}

/// Issues per-host client credentials for TLS runtime connections.
pub trait ClientCredentialIssuer: Send + Sync {
    fn issue(&self, host_id: &HostId) -> Result<ClientCredential>;
}

/// Issues random single-use credentials.
#[derive(Debug, Default)]
pub struct EphemeralCredentialIssuer;

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02X}");
        out
    })
}

impl ClientCredentialIssuer for EphemeralCredentialIssuer {
    fn issue(&self, host_id: &HostId) -> Result<ClientCredential> {
        let mut key = [0u8; 32];
        rand::thread_rng()
            .try_fill_bytes(&mut key)
            .map_err(|e| HostingError::OperationFailed(format!("credential for {host_id}: {e}")))?;
        let mut encoded = host_id.as_uuid().as_bytes().to_vec();
        encoded.extend_from_slice(&key);
        Ok(ClientCredential {
            private_key: hex(&key),
            thumbprint: hex(&encoded[..20]),
            encoded_bytes: hex(&encoded),
        })
    }
}

// ============================================================================
// Assembly
// ============================================================================

/// Resolve a well-known placeholder value. Anything unresolved is returned
/// unchanged.
pub fn get_well_known_value(value: &str, activation: &CodePackageActivation) -> String {
    let activation_id = &activation.service_package_instance_id().activation_id;
    match value {
        PARTITION_ID_PLACEHOLDER if !activation_id.is_empty() => activation_id.clone(),
        SERVICE_NAME_PLACEHOLDER => activation
            .exclusive_service_names
            .get(activation_id)
            .cloned()
            .unwrap_or_else(|| value.to_string()),
        APPLICATION_NAME_PLACEHOLDER => {
            let name = &activation.context.application_name;
            name.strip_prefix(FABRIC_SCHEME).unwrap_or(name).to_string()
        }
        _ => value.to_string(),
    }
}

/// Add one declared variable, resolving placeholders.
pub fn add_environment_variable(
    env: &mut EnvironmentMap,
    name: &str,
    value: &str,
    activation: &CodePackageActivation,
) {
    env.insert(name.to_string(), get_well_known_value(value, activation));
}

/// PATH, TEMP and TMP of a host. Set even without runtime access.
pub fn get_current_process_environment_variables(
    holder: &HostingHolder,
    activation: &CodePackageActivation,
) -> EnvironmentMap {
    let mut env = EnvironmentMap::new();
    let binaries = holder.node.binaries_folder.display().to_string();
    let path = match std::env::var(ENV_PATH) {
        Ok(existing) if !existing.is_empty() => format!("{binaries}:{existing}"),
        _ => binaries,
    };
    env.insert(ENV_PATH.into(), path);

    let temp = holder
        .layout
        .temp_folder(activation.context.application_id())
        .display()
        .to_string();
    env.insert(ENV_TEMP.into(), temp.clone());
    env.insert(ENV_TMP.into(), temp);
    env
}

/// Add the host context and, unless runtime access is removed, the runtime
/// connection variables.
///
/// # Errors
///
/// Fails when a TLS client credential cannot be issued.
pub fn add_host_context_and_runtime_connection(
    env: &mut EnvironmentMap,
    holder: &HostingHolder,
    host_context: &ApplicationHostContext,
    host_id: &HostId,
    remove_runtime_access: bool,
) -> Result<()> {
    host_context.to_environment_map(env);

    if remove_runtime_access {
        for name in RUNTIME_CONNECTION_VARIABLES {
            env.remove(name);
        }
        tracing::debug!(host_id = %host_id, "Runtime access removed, skipping connection variables");
        return Ok(());
    }

    env.insert(ENV_NODE_ID.into(), holder.node.node_id.clone());
    env.insert(ENV_NODE_NAME.into(), holder.node.node_name.clone());

    let address = if !host_context.is_container_host {
        holder.node.runtime_connection_address.clone()
    } else if holder.config.container_apps_enabled {
        holder.node.container_runtime_connection_address.clone()
    } else {
        String::new()
    };

    if holder.config.ipc_tls_enabled {
        let credential = holder.credentials.issue(host_id).map_err(|e| {
            tracing::error!(host_id = %host_id, error = %e, "Failed to issue client credential");
            e
        })?;
        env.insert(ENV_RUNTIME_SSL_CONNECTION_ADDRESS.into(), address);
        env.insert(ENV_RUNTIME_SSL_CONNECTION_CERT_KEY.into(), credential.private_key);
        env.insert(
            ENV_RUNTIME_SSL_CONNECTION_CERT_ENCODED_BYTES.into(),
            credential.encoded_bytes,
        );
        env.insert(
            ENV_RUNTIME_SSL_CONNECTION_CERT_THUMBPRINT.into(),
            credential.thumbprint,
        );
    } else {
        env.insert(ENV_RUNTIME_CONNECTION_ADDRESS.into(), address);
    }
    Ok(())
}

/// Full environment of a host started for `activation`.
///
/// Declared variables come first so the variables the node sets always win.
pub fn build_host_environment(
    holder: &HostingHolder,
    host_context: &ApplicationHostContext,
    host_id: &HostId,
    activation: &CodePackageActivation,
    include_code_package_context: bool,
) -> Result<EnvironmentMap> {
    let mut env = EnvironmentMap::new();
    for (name, value) in &activation.description.environment {
        add_environment_variable(&mut env, name, value, activation);
    }
    env.extend(get_current_process_environment_variables(holder, activation));
    if include_code_package_context {
        activation.context.to_environment_map(&mut env);
    }
    add_host_context_and_runtime_connection(
        &mut env,
        holder,
        host_context,
        host_id,
        activation.description.remove_runtime_access,
    )?;
    tracing::trace!(host_id = %host_id, variables = env.len(), "Host environment assembled");
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostingConfig, NodeConfig};
    use crate::context::{ApplicationHostType, CodePackageContext};
    use crate::host::client::ApplicationHostClient;
    use crate::host::launcher::{HostActivationRequest, HostActivator};
    use crate::ids::{ApplicationId, CodePackageInstanceId, ServicePackageId, ServicePackageInstanceId};
    use crate::ipc::messages::{ApplicationHostCodePackageOperationRequest, DependentCodePackageEvent};
    use crate::model::{CodePackageDescription, EntryPointType};
    use async_trait::async_trait;
    use std::sync::Arc;
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

    struct FailingIssuer;

    impl ClientCredentialIssuer for FailingIssuer {
        fn issue(&self, _: &HostId) -> Result<ClientCredential> {
            Err(HostingError::OperationFailed("no key".into()))
        }
    }

    fn holder(config: HostingConfig, issuer: Arc<dyn ClientCredentialIssuer>) -> HostingHolder {
        let mut node = NodeConfig::rooted_at("/srv/node", "N1");
        node.container_runtime_connection_address = "10.0.0.1:19100".into();
        HostingHolder::new(node, config, Arc::new(NoopActivator), Arc::new(NoopClient), issuer)
    }

    fn activation(activation_id: &str) -> CodePackageActivation {
        let sp = ServicePackageId::new(ApplicationId::new("Calc", 1), "Front");
        let cp = CodePackageInstanceId::new(ServicePackageInstanceId::new(sp, activation_id), "Code");
        let context = CodePackageContext::new(cp, 1, 1, "1.0:1", "fabric:/Calc");
        CodePackageActivation::new(context, CodePackageDescription::new("Code", EntryPointType::Exe))
    }

    #[test]
    fn test_well_known_values() {
        let mut a = activation("7c9e6679");
        a.exclusive_service_names
            .insert("7c9e6679".into(), "fabric:/Calc/Svc".into());

        assert_eq!(get_well_known_value(PARTITION_ID_PLACEHOLDER, &a), "7c9e6679");
        assert_eq!(get_well_known_value(SERVICE_NAME_PLACEHOLDER, &a), "fabric:/Calc/Svc");
        assert_eq!(get_well_known_value(APPLICATION_NAME_PLACEHOLDER, &a), "/Calc");
        assert_eq!(get_well_known_value("plain", &a), "plain");
    }

    #[test]
    fn test_unresolved_placeholders_pass_through() {
        let a = activation("");
        assert_eq!(get_well_known_value(PARTITION_ID_PLACEHOLDER, &a), PARTITION_ID_PLACEHOLDER);
        assert_eq!(get_well_known_value(SERVICE_NAME_PLACEHOLDER, &a), SERVICE_NAME_PLACEHOLDER);
    }

    #[test]
    fn test_removed_runtime_access_keeps_path_and_temp() {
        let holder = holder(HostingConfig::default(), Arc::new(EphemeralCredentialIssuer));
        let mut a = activation("");
        a.description.remove_runtime_access = true;
        a.description
            .environment
            .insert(ENV_NODE_ID.into(), "spoofed".into());
        let host_id = HostId::new();
        let context = ApplicationHostContext::new(host_id, ApplicationHostType::ActivatedSingleCodePackage, false);

        let env = build_host_environment(&holder, &context, &host_id, &a, true).unwrap();
        for name in RUNTIME_CONNECTION_VARIABLES {
            assert!(!env.contains_key(name), "{name} should be absent");
        }
        assert!(env[ENV_PATH].starts_with("/srv/node/bin"));
        assert_eq!(env[ENV_TEMP], "/srv/node/apps/Calc_App1/temp");
        assert_eq!(env[ENV_TEMP], env[ENV_TMP]);
    }

    #[test]
    fn test_container_runtime_address() {
        let host_id = HostId::new();
        let container = ApplicationHostContext::new(host_id, ApplicationHostType::ActivatedSingleCodePackage, true);

        let enabled = holder(HostingConfig::default(), Arc::new(EphemeralCredentialIssuer));
        let env = build_host_environment(&enabled, &container, &host_id, &activation(""), true).unwrap();
        assert_eq!(env[ENV_RUNTIME_CONNECTION_ADDRESS], "10.0.0.1:19100");
        assert_eq!(env[ENV_NODE_ID], "N1");

        let disabled = holder(
            HostingConfig::builder().container_apps_enabled(false).build().unwrap(),
            Arc::new(EphemeralCredentialIssuer),
        );
        let env = build_host_environment(&disabled, &container, &host_id, &activation(""), true).unwrap();
        assert_eq!(env[ENV_RUNTIME_CONNECTION_ADDRESS], "");
    }

    #[test]
    fn test_tls_credentials() {
        let host_id = HostId::new();
        let context = ApplicationHostContext::new(host_id, ApplicationHostType::ActivatedMultiCodePackage, false);
        let config = HostingConfig::builder().ipc_tls_enabled(true).build().unwrap();

        let tls = holder(config.clone(), Arc::new(EphemeralCredentialIssuer));
        let env = build_host_environment(&tls, &context, &host_id, &activation(""), false).unwrap();
        assert_eq!(env[ENV_RUNTIME_SSL_CONNECTION_ADDRESS], "localhost:19100");
        assert_eq!(env[ENV_RUNTIME_SSL_CONNECTION_CERT_THUMBPRINT].len(), 40);
        assert!(!env.contains_key(ENV_RUNTIME_CONNECTION_ADDRESS));

        let failing = holder(config, Arc::new(FailingIssuer));
        assert!(build_host_environment(&failing, &context, &host_id, &activation(""), false).is_err());
    }
}
