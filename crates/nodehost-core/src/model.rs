//! Digested package descriptions consumed by hosting.
//!
//! These are produced by the (external) image model layer after manifest
//! parsing. Only the fields hosting decisions depend on are modelled.

use crate::context::EnvironmentMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Code packages
// ============================================================================

/// How a code package's entry point is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryPointType {
    None,
    Exe,
    ContainerHost,
    DllHost,
}

impl fmt::Display for EntryPointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Network a container code package joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NetworkType {
    /// Node NAT network.
    #[default]
    Other,
    /// Flat network with a dedicated IP per code package.
    Open,
    /// Per-application overlay network.
    Isolated,
}

/// Per code package network flags derived from service package network policies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodePackageNetworkConfig {
    pub open: bool,
    pub other: bool,
    /// Isolated network names this code package joins.
    pub isolated_networks: Vec<String>,
}

impl CodePackageNetworkConfig {
    pub fn is_isolated(&self) -> bool {
        !self.isolated_networks.is_empty()
    }

    pub fn primary_type(&self) -> NetworkType {
        if self.open {
            NetworkType::Open
        } else if self.is_isolated() {
            NetworkType::Isolated
        } else {
            NetworkType::Other
        }
    }
}

/// A certificate exported into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerCertificateDescription {
    pub name: String,
    pub x509_store_name: String,
    pub x509_find_type: String,
    pub x509_find_value: String,
    #[serde(default)]
    pub data_package_ref: String,
    #[serde(default)]
    pub relative_path: String,
}

/// Container-specific policies of a code package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPolicies {
    pub image_name: String,
    #[serde(default)]
    pub network_config: CodePackageNetworkConfig,
    #[serde(default)]
    pub certificate_refs: Vec<ContainerCertificateDescription>,
    /// Maps endpoint name to the container port it binds.
    #[serde(default)]
    pub port_bindings: BTreeMap<String, u16>,
}

/// One code package as seen by hosting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodePackageDescription {
    pub name: String,
    pub version: String,
    pub entry_point_type: EntryPointType,
    /// Hosts implicit service types only.
    #[serde(default)]
    pub is_implicit_type_host: bool,
    /// Declared environment variables, before placeholder substitution.
    #[serde(default)]
    pub environment: EnvironmentMap,
    #[serde(default)]
    pub run_as_user: Option<String>,
    #[serde(default)]
    pub container_policies: ContainerPolicies,
    /// Keeps the sandbox from calling back into the node.
    #[serde(default)]
    pub remove_runtime_access: bool,
}

impl CodePackageDescription {
    pub fn new(name: impl Into<String>, entry_point_type: EntryPointType) -> Self {
        Self {
            name: name.into(),
            version: "1.0".into(),
            entry_point_type,
            is_implicit_type_host: false,
            environment: EnvironmentMap::new(),
            run_as_user: None,
            container_policies: ContainerPolicies::default(),
            remove_runtime_access: false,
        }
    }

    pub fn is_container(&self) -> bool {
        self.entry_point_type == EntryPointType::ContainerHost
    }
}

// ============================================================================
// Endpoints
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointProtocol {
    Http,
    Https,
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EndpointType {
    #[default]
    Internal,
    Input,
}

/// Declared endpoint. A zero port requests a dynamic one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescription {
    pub name: String,
    pub protocol: EndpointProtocol,
    #[serde(default)]
    pub endpoint_type: EndpointType,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub explicit_port_specified: bool,
    #[serde(default)]
    pub code_package_ref: String,
    #[serde(default)]
    pub path_suffix: String,
    /// Resolved at setup time.
    #[serde(default)]
    pub ip_address_or_fqdn: String,
}

impl EndpointDescription {
    pub fn new(name: impl Into<String>, protocol: EndpointProtocol) -> Self {
        Self {
            name: name.into(),
            protocol,
            endpoint_type: EndpointType::Internal,
            port: 0,
            explicit_port_specified: false,
            code_package_ref: String::new(),
            path_suffix: String::new(),
            ip_address_or_fqdn: String::new(),
        }
    }

    /// Declare a fixed port that bypasses dynamic allocation.
    pub fn with_explicit_port(mut self, port: u16) -> Self {
        self.port = port;
        self.explicit_port_specified = true;
        self
    }

    pub fn with_code_package_ref(mut self, code_package: impl Into<String>) -> Self {
        self.code_package_ref = code_package.into();
        self
    }

    pub fn is_http(&self) -> bool {
        matches!(self.protocol, EndpointProtocol::Http | EndpointProtocol::Https)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrantAccessType {
    Read,
    Full,
}

/// Grants a principal rights on an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityAccessPolicy {
    pub resource_ref: String,
    pub principal_ref: String,
    pub rights: GrantAccessType,
}

/// Endpoint with its optional binding and access policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestedEndpoint {
    pub endpoint: EndpointDescription,
    /// Name of a certificate in the service package's digested certificates.
    #[serde(default)]
    pub certificate_ref: String,
    #[serde(default)]
    pub security_access_policy: Option<SecurityAccessPolicy>,
}

impl From<EndpointDescription> for DigestedEndpoint {
    fn from(endpoint: EndpointDescription) -> Self {
        Self {
            endpoint,
            certificate_ref: String::new(),
            security_access_policy: None,
        }
    }
}

/// A certificate a service package declares for endpoint binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCertificateDescription {
    pub name: String,
    pub x509_find_value: String,
    pub x509_store_name: String,
    pub x509_find_type: String,
}

// ============================================================================
// Service packages
// ============================================================================

/// Service package level network policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub network_type: NetworkType,
    #[serde(default)]
    pub network_name: String,
    /// Code packages the policy applies to; empty means all.
    #[serde(default)]
    pub code_package_refs: Vec<String>,
}

/// Resource limits for a container group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGovernanceDescription {
    /// CPU limit in thousandths of a core; zero means unlimited.
    #[serde(default)]
    pub cpu_millicores: u32,
    #[serde(default)]
    pub memory_in_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePackageDescription {
    pub manifest_name: String,
    pub manifest_version: String,
    pub code_packages: Vec<CodePackageDescription>,
    #[serde(default)]
    pub endpoints: Vec<DigestedEndpoint>,
    #[serde(default)]
    pub certificates: Vec<EndpointCertificateDescription>,
    #[serde(default)]
    pub network_policies: Vec<NetworkPolicy>,
    #[serde(default)]
    pub resource_governance: ResourceGovernanceDescription,
    #[serde(default)]
    pub hyperv_isolated: bool,
    /// Exclusive-activation service names keyed by activation id.
    #[serde(default)]
    pub exclusive_service_names: BTreeMap<String, String>,
}

impl ServicePackageDescription {
    pub fn new(manifest_name: impl Into<String>) -> Self {
        Self {
            manifest_name: manifest_name.into(),
            manifest_version: "1.0".into(),
            code_packages: Vec::new(),
            endpoints: Vec::new(),
            certificates: Vec::new(),
            network_policies: Vec::new(),
            resource_governance: ResourceGovernanceDescription::default(),
            hyperv_isolated: false,
            exclusive_service_names: BTreeMap::new(),
        }
    }

    pub fn code_package(&self, name: &str) -> Option<&CodePackageDescription> {
        self.code_packages.iter().find(|cp| cp.name == name)
    }

    pub fn container_count(&self) -> usize {
        self.code_packages.iter().filter(|cp| cp.is_container()).count()
    }

    /// Apply network policies to each container code package's network flags.
    pub fn populate_code_package_network_config(&mut self) {
        let policies = self.network_policies.clone();
        for cp in self.code_packages.iter_mut().filter(|cp| cp.is_container()) {
            let config = &mut cp.container_policies.network_config;
            for policy in &policies {
                let applies = policy.code_package_refs.is_empty()
                    || policy.code_package_refs.iter().any(|r| r == &cp.name);
                if !applies {
                    continue;
                }
                match policy.network_type {
                    NetworkType::Open => config.open = true,
                    NetworkType::Other => config.other = true,
                    NetworkType::Isolated => {
                        if !config.isolated_networks.contains(&policy.network_name) {
                            config.isolated_networks.push(policy.network_name.clone());
                        }
                    }
                }
            }
        }
    }
}

// ============================================================================
// Principals
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityPrincipalAccountType {
    LocalUser,
    DomainUser,
    NetworkService,
    LocalService,
    LocalSystem,
    ManagedServiceAccount,
}

/// A RunAs user declared by an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityUserDescription {
    pub name: String,
    pub account_type: SecurityPrincipalAccountType,
    /// Account name for non-local accounts.
    #[serde(default)]
    pub account_name: String,
    /// Logical names of groups this user joins.
    #[serde(default)]
    pub parent_application_groups: Vec<String>,
    #[serde(default)]
    pub parent_system_groups: Vec<String>,
    #[serde(default)]
    pub ntlm_authentication_enabled: bool,
    /// Certificate thumbprint backing NTLM authentication, when required.
    #[serde(default)]
    pub x509_find_value: String,
}

impl SecurityUserDescription {
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            account_type: SecurityPrincipalAccountType::LocalUser,
            account_name: String::new(),
            parent_application_groups: Vec::new(),
            parent_system_groups: Vec::new(),
            ntlm_authentication_enabled: false,
            x509_find_value: String::new(),
        }
    }

    pub fn with_parent_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parent_application_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_local_user(&self) -> bool {
        self.account_type == SecurityPrincipalAccountType::LocalUser
    }
}

/// A group declared by an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupDescription {
    pub name: String,
    #[serde(default)]
    pub domain_groups: Vec<String>,
    #[serde(default)]
    pub system_groups: Vec<String>,
    #[serde(default)]
    pub ntlm_authentication_enabled: bool,
}

impl SecurityGroupDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain_groups: Vec::new(),
            system_groups: Vec::new(),
            ntlm_authentication_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalsDescription {
    #[serde(default)]
    pub users: Vec<SecurityUserDescription>,
    #[serde(default)]
    pub groups: Vec<SecurityGroupDescription>,
}

impl PrincipalsDescription {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.groups.is_empty()
    }
}

/// Log folder an application asks to have collected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCollectionPolicy {
    /// Relative to the application log folder; empty means the folder itself.
    #[serde(default)]
    pub path: String,
}

/// Application-wide environment declared by an application package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationPackageDescription {
    pub application_name: String,
    #[serde(default)]
    pub principals: PrincipalsDescription,
    #[serde(default)]
    pub default_run_as: Option<String>,
    #[serde(default)]
    pub log_collection_policies: Vec<LogCollectionPolicy>,
    /// Tolerated certificate-missing user failures before setup fails.
    #[serde(default)]
    pub allowed_user_creation_failure_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_populate_network_config() {
        let mut sp = ServicePackageDescription::new("Pkg");
        sp.code_packages = vec![
            CodePackageDescription::new("Front", EntryPointType::ContainerHost),
            CodePackageDescription::new("Back", EntryPointType::ContainerHost),
            CodePackageDescription::new("Exe", EntryPointType::Exe),
        ];
        sp.network_policies = vec![
            NetworkPolicy {
                network_type: NetworkType::Open,
                network_name: String::new(),
                code_package_refs: vec!["Front".into()],
            },
            NetworkPolicy {
                network_type: NetworkType::Isolated,
                network_name: "appnet".into(),
                code_package_refs: Vec::new(),
            },
        ];

        sp.populate_code_package_network_config();

        let front = &sp.code_package("Front").unwrap().container_policies.network_config;
        assert!(front.open);
        assert_eq!(front.isolated_networks, vec!["appnet".to_string()]);
        assert_eq!(front.primary_type(), NetworkType::Open);

        let back = &sp.code_package("Back").unwrap().container_policies.network_config;
        assert!(!back.open);
        assert_eq!(back.primary_type(), NetworkType::Isolated);

        let exe = &sp.code_package("Exe").unwrap().container_policies.network_config;
        assert_eq!(exe, &CodePackageNetworkConfig::default());
        assert_eq!(sp.container_count(), 2);
    }

    #[test]
    fn test_endpoint_helpers() {
        let ep = EndpointDescription::new("Web", EndpointProtocol::Https).with_explicit_port(443);
        assert!(ep.is_http());
        assert!(ep.explicit_port_specified);
        assert!(!EndpointDescription::new("Raw", EndpointProtocol::Tcp).is_http());
    }
}
