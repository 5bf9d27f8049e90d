//! Host and code package contexts, and their environment variable encoding.
//!
//! A child process reconstructs both contexts from its environment block
//! without calling back into the node.

use crate::error::{HostingError, Result};
use crate::ids::{ApplicationId, CodePackageInstanceId, HostId, ServicePackageId, ServicePackageInstanceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Environment block passed to a sandbox.
pub type EnvironmentMap = BTreeMap<String, String>;

// ============================================================================
// Environment keys
// ============================================================================

pub const ENV_APPLICATION_HOST_ID: &str = "Fabric_ApplicationHostId";
pub const ENV_APPLICATION_HOST_TYPE: &str = "Fabric_ApplicationHostType";
pub const ENV_IS_CONTAINER_HOST: &str = "Fabric_IsContainerHost";
pub const ENV_IS_CODE_PACKAGE_ACTIVATOR_HOST: &str = "Fabric_IsCodePackageActivatorHost";
pub const ENV_NODE_INSTANCE_ID: &str = "Fabric_NodeInstanceId";

pub const ENV_CODE_PACKAGE_NAME: &str = "Fabric_CodePackageName";
pub const ENV_SERVICE_PACKAGE_NAME: &str = "Fabric_ServicePackageName";
pub const ENV_SERVICE_PACKAGE_ACTIVATION_ID: &str = "Fabric_ServicePackageActivationId";
pub const ENV_APPLICATION_ID: &str = "Fabric_ApplicationId";
pub const ENV_SERVICE_PACKAGE_VERSION_INSTANCE: &str = "Fabric_ServicePackageVersionInstance";
pub const ENV_SERVICE_PACKAGE_INSTANCE_SEQ_NUM: &str = "Fabric_ServicePackageInstanceSeqNum";
pub const ENV_CODE_PACKAGE_INSTANCE_SEQ_NUM: &str = "Fabric_CodePackageInstanceSeqNum";
pub const ENV_APPLICATION_NAME: &str = "Fabric_ApplicationName";

const HOST_CONTEXT_KEYS: [&str; 4] = [
    ENV_APPLICATION_HOST_ID,
    ENV_APPLICATION_HOST_TYPE,
    ENV_IS_CONTAINER_HOST,
    ENV_IS_CODE_PACKAGE_ACTIVATOR_HOST,
];

const CODE_PACKAGE_CONTEXT_KEYS: [&str; 8] = [
    ENV_CODE_PACKAGE_NAME,
    ENV_SERVICE_PACKAGE_NAME,
    ENV_SERVICE_PACKAGE_ACTIVATION_ID,
    ENV_APPLICATION_ID,
    ENV_SERVICE_PACKAGE_VERSION_INSTANCE,
    ENV_SERVICE_PACKAGE_INSTANCE_SEQ_NUM,
    ENV_CODE_PACKAGE_INSTANCE_SEQ_NUM,
    ENV_APPLICATION_NAME,
];

/// Count how many of `keys` are present; error when some but not all are.
fn check_key_set(env: &EnvironmentMap, keys: &[&str], what: &str) -> Result<()> {
    let present = keys.iter().filter(|k| env.contains_key(**k)).count();
    if present == 0 {
        return Err(HostingError::NotFound(format!("{what} environment")));
    }
    if present < keys.len() {
        return Err(HostingError::invalid_state(
            format!("{} {what} keys", keys.len()),
            format!("{present} keys"),
        ));
    }
    Ok(())
}

fn required<'a>(env: &'a EnvironmentMap, key: &str) -> Result<&'a str> {
    env.get(key)
        .map(String::as_str)
        .ok_or_else(|| HostingError::NotFound(key.to_string()))
}

fn parse_value<T: FromStr>(env: &EnvironmentMap, key: &str) -> Result<T> {
    let raw = required(env, key)?;
    raw.parse()
        .map_err(|_| HostingError::InvalidArgument(format!("{key}={raw}")))
}

// ============================================================================
// ApplicationHostContext
// ============================================================================

/// Kind of sandbox an application host runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplicationHostType {
    Invalid,
    /// Started outside the node, e.g. under a debugger.
    NonActivated,
    ActivatedSingleCodePackage,
    ActivatedMultiCodePackage,
    ActivatedInProcess,
}

impl ApplicationHostType {
    pub fn is_activated(&self) -> bool {
        matches!(
            self,
            Self::ActivatedSingleCodePackage | Self::ActivatedMultiCodePackage | Self::ActivatedInProcess
        )
    }
}

impl fmt::Display for ApplicationHostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid => write!(f, "Invalid"),
            Self::NonActivated => write!(f, "NonActivated"),
            Self::ActivatedSingleCodePackage => write!(f, "Activated_SingleCodePackage"),
            Self::ActivatedMultiCodePackage => write!(f, "Activated_MultiCodePackage"),
            Self::ActivatedInProcess => write!(f, "Activated_InProcess"),
        }
    }
}

impl FromStr for ApplicationHostType {
    type Err = HostingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Invalid" => Ok(Self::Invalid),
            "NonActivated" => Ok(Self::NonActivated),
            "Activated_SingleCodePackage" => Ok(Self::ActivatedSingleCodePackage),
            "Activated_MultiCodePackage" => Ok(Self::ActivatedMultiCodePackage),
            "Activated_InProcess" => Ok(Self::ActivatedInProcess),
            other => Err(HostingError::InvalidArgument(format!(
                "unknown host type: {other}"
            ))),
        }
    }
}

/// Identifies one sandbox instance. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationHostContext {
    pub host_id: String,
    pub host_type: ApplicationHostType,
    pub is_container_host: bool,
    pub is_code_package_activator_host: bool,
    #[serde(default)]
    pub node_instance_id: u64,
}

impl ApplicationHostContext {
    pub fn new(host_id: HostId, host_type: ApplicationHostType, is_container_host: bool) -> Self {
        Self {
            host_id: host_id.to_string(),
            host_type,
            is_container_host,
            is_code_package_activator_host: false,
            node_instance_id: 0,
        }
    }

    /// Context for a host that was not started by the node.
    pub fn non_activated() -> Self {
        Self::new(HostId::new(), ApplicationHostType::NonActivated, false)
    }

    pub fn with_node_instance_id(mut self, node_instance_id: u64) -> Self {
        self.node_instance_id = node_instance_id;
        self
    }

    pub fn with_code_package_activator_host(mut self, enabled: bool) -> Self {
        self.is_code_package_activator_host = enabled;
        self
    }

    /// Write this context into `env`.
    pub fn to_environment_map(&self, env: &mut EnvironmentMap) {
        env.insert(ENV_APPLICATION_HOST_ID.into(), self.host_id.clone());
        env.insert(ENV_APPLICATION_HOST_TYPE.into(), self.host_type.to_string());
        env.insert(ENV_IS_CONTAINER_HOST.into(), self.is_container_host.to_string());
        env.insert(
            ENV_IS_CODE_PACKAGE_ACTIVATOR_HOST.into(),
            self.is_code_package_activator_host.to_string(),
        );
        env.insert(ENV_NODE_INSTANCE_ID.into(), self.node_instance_id.to_string());
    }

    /// Rebuild a context from `env`.
    ///
    /// Returns `NotFound` when no host keys are present and `InvalidState`
    /// when only some of them are.
    pub fn from_environment_map(env: &EnvironmentMap) -> Result<Self> {
        check_key_set(env, &HOST_CONTEXT_KEYS, "application host context")?;
        let node_instance_id = match env.get(ENV_NODE_INSTANCE_ID) {
            Some(_) => parse_value(env, ENV_NODE_INSTANCE_ID)?,
            None => 0,
        };
        Ok(Self {
            host_id: required(env, ENV_APPLICATION_HOST_ID)?.to_string(),
            host_type: parse_value(env, ENV_APPLICATION_HOST_TYPE)?,
            is_container_host: parse_value(env, ENV_IS_CONTAINER_HOST)?,
            is_code_package_activator_host: parse_value(env, ENV_IS_CODE_PACKAGE_ACTIVATOR_HOST)?,
            node_instance_id,
        })
    }

    /// Like [`from_environment_map`](Self::from_environment_map), but a
    /// missing context yields a fresh non-activated one.
    pub fn from_environment_or_non_activated(env: &EnvironmentMap) -> Result<Self> {
        match Self::from_environment_map(env) {
            Err(HostingError::NotFound(_)) => Ok(Self::non_activated()),
            other => other,
        }
    }
}

impl fmt::Display for ApplicationHostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ HostId={}, Type={}, Container={} }}",
            self.host_id, self.host_type, self.is_container_host
        )
    }
}

// ============================================================================
// CodePackageContext
// ============================================================================

/// Identifies one running code package within a host.
///
/// Equality ignores case in the application name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodePackageContext {
    pub code_package_instance_id: CodePackageInstanceId,
    pub code_package_instance_seq_num: i64,
    pub service_package_instance_seq_num: i64,
    pub service_package_version_instance: String,
    pub application_name: String,
}

impl CodePackageContext {
    pub fn new(
        code_package_instance_id: CodePackageInstanceId,
        code_package_instance_seq_num: i64,
        service_package_instance_seq_num: i64,
        service_package_version_instance: impl Into<String>,
        application_name: impl Into<String>,
    ) -> Self {
        Self {
            code_package_instance_id,
            code_package_instance_seq_num,
            service_package_instance_seq_num,
            service_package_version_instance: service_package_version_instance.into(),
            application_name: application_name.into(),
        }
    }

    pub fn application_id(&self) -> &ApplicationId {
        self.code_package_instance_id
            .service_package_instance_id
            .application_id()
    }

    /// Write this context into `env`.
    pub fn to_environment_map(&self, env: &mut EnvironmentMap) {
        let sp_instance = &self.code_package_instance_id.service_package_instance_id;
        env.insert(
            ENV_CODE_PACKAGE_NAME.into(),
            self.code_package_instance_id.code_package_name.clone(),
        );
        env.insert(
            ENV_SERVICE_PACKAGE_NAME.into(),
            sp_instance.service_package_name().to_string(),
        );
        env.insert(
            ENV_SERVICE_PACKAGE_ACTIVATION_ID.into(),
            sp_instance.activation_id.clone(),
        );
        env.insert(ENV_APPLICATION_ID.into(), sp_instance.application_id().to_string());
        env.insert(
            ENV_SERVICE_PACKAGE_VERSION_INSTANCE.into(),
            self.service_package_version_instance.clone(),
        );
        env.insert(
            ENV_SERVICE_PACKAGE_INSTANCE_SEQ_NUM.into(),
            self.service_package_instance_seq_num.to_string(),
        );
        env.insert(
            ENV_CODE_PACKAGE_INSTANCE_SEQ_NUM.into(),
            self.code_package_instance_seq_num.to_string(),
        );
        env.insert(ENV_APPLICATION_NAME.into(), self.application_name.clone());
    }

    /// Rebuild a context from `env`.
    ///
    /// Returns `NotFound` when no code package keys are present and
    /// `InvalidState` when only some of them are.
    pub fn from_environment_map(env: &EnvironmentMap) -> Result<Self> {
        check_key_set(env, &CODE_PACKAGE_CONTEXT_KEYS, "code package context")?;

        let application_id: ApplicationId = parse_value(env, ENV_APPLICATION_ID)?;
        let sp_id = ServicePackageId::new(application_id, required(env, ENV_SERVICE_PACKAGE_NAME)?);
        let sp_instance =
            ServicePackageInstanceId::new(sp_id, required(env, ENV_SERVICE_PACKAGE_ACTIVATION_ID)?);

        Ok(Self {
            code_package_instance_id: CodePackageInstanceId::new(
                sp_instance,
                required(env, ENV_CODE_PACKAGE_NAME)?,
            ),
            code_package_instance_seq_num: parse_value(env, ENV_CODE_PACKAGE_INSTANCE_SEQ_NUM)?,
            service_package_instance_seq_num: parse_value(
                env,
                ENV_SERVICE_PACKAGE_INSTANCE_SEQ_NUM,
            )?,
            service_package_version_instance: required(env, ENV_SERVICE_PACKAGE_VERSION_INSTANCE)?
                .to_string(),
            application_name: required(env, ENV_APPLICATION_NAME)?.to_string(),
        })
    }
}

impl PartialEq for CodePackageContext {
    fn eq(&self, other: &Self) -> bool {
        self.code_package_instance_id == other.code_package_instance_id
            && self.code_package_instance_seq_num == other.code_package_instance_seq_num
            && self.service_package_instance_seq_num == other.service_package_instance_seq_num
            && self.service_package_version_instance == other.service_package_version_instance
            && self
                .application_name
                .eq_ignore_ascii_case(&other.application_name)
    }
}

impl Eq for CodePackageContext {}

impl fmt::Display for CodePackageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ Id={}, CpSeq={}, SpSeq={}, Version={}, App={} }}",
            self.code_package_instance_id,
            self.code_package_instance_seq_num,
            self.service_package_instance_seq_num,
            self.service_package_version_instance,
            self.application_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_context(activation_id: &str) -> CodePackageContext {
        let sp = ServicePackageId::new(ApplicationId::new("CalcType", 4), "CalcPkg");
        CodePackageContext::new(
            CodePackageInstanceId::new(ServicePackageInstanceId::new(sp, activation_id), "Code"),
            7,
            3,
            "1.0:1.0:42",
            "fabric:/Calc",
        )
    }

    #[test]
    fn test_code_package_context_round_trip() {
        for activation_id in ["", "5f0c3a7e-5d6b-4b7b-8a3b-7c1f3f2e9d10"] {
            let context = sample_context(activation_id);
            let mut env = EnvironmentMap::new();
            context.to_environment_map(&mut env);
            let rebuilt = CodePackageContext::from_environment_map(&env).unwrap();
            assert_eq!(rebuilt, context);
        }
    }

    #[test]
    fn test_equality_ignores_application_name_case() {
        let a = sample_context("");
        let mut b = a.clone();
        b.application_name = "FABRIC:/calc".into();
        assert_eq!(a, b);
        b.code_package_instance_seq_num += 1;
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_env_is_not_found() {
        let env = EnvironmentMap::new();
        let err = CodePackageContext::from_environment_map(&env).unwrap_err();
        assert!(matches!(err, HostingError::NotFound(_)));
    }

    #[test]
    fn test_partial_env_is_invalid_state() {
        let mut env = EnvironmentMap::new();
        sample_context("").to_environment_map(&mut env);
        env.remove(ENV_APPLICATION_NAME);
        let err = CodePackageContext::from_environment_map(&env).unwrap_err();
        assert!(matches!(err, HostingError::InvalidState { .. }));
    }

    #[test]
    fn test_host_context_round_trip() {
        let context = ApplicationHostContext::new(
            HostId::new(),
            ApplicationHostType::ActivatedMultiCodePackage,
            false,
        )
        .with_node_instance_id(131_000_000)
        .with_code_package_activator_host(true);
        let mut env = EnvironmentMap::new();
        context.to_environment_map(&mut env);
        assert_eq!(ApplicationHostContext::from_environment_map(&env).unwrap(), context);
    }

    #[test]
    fn test_missing_host_context_is_non_activated() {
        let env = EnvironmentMap::new();
        let context = ApplicationHostContext::from_environment_or_non_activated(&env).unwrap();
        assert_eq!(context.host_type, ApplicationHostType::NonActivated);
        assert!(!context.host_type.is_activated());
    }

    #[test]
    fn test_partial_host_context_is_invalid_state() {
        let mut env = EnvironmentMap::new();
        env.insert(ENV_APPLICATION_HOST_ID.into(), HostId::new().to_string());
        let err = ApplicationHostContext::from_environment_or_non_activated(&env).unwrap_err();
        assert!(matches!(err, HostingError::InvalidState { .. }));
    }
}
