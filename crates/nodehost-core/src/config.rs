//! Hosting and node configuration.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use crate::error::HostingError;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

/// Comment prefix written on every OS account created for an application.
pub const APPLICATION_COMMENT_PREFIX: &str = "WinFabApplication";

/// Comment written on the per-application local group.
pub const APPLICATION_LOCAL_GROUP_COMMENT: &str = "WinFabApplication-LocalGroup";

/// Prefix of the per-application local group name.
pub const APPLICATION_GROUP_NAME_PREFIX: &str = "WF-App-";

/// Prefix of the named lock guarding an account's comment.
pub const PRINCIPAL_MUTEX_PREFIX: &str = "Global\\WinFabPrincipal_";

/// Hosting behavior switches and timers.
#[derive(Debug, Clone)]
pub struct HostingConfig {
    /// Allow applications to declare RunAs users and groups.
    pub run_as_policy_enabled: bool,
    /// Allocate ports and ACLs for declared endpoints.
    pub endpoint_provider_enabled: bool,
    /// Open firewall ports for explicit-port endpoints.
    pub firewall_policy_enabled: bool,
    /// Force NTLM authentication policy on every principal.
    pub ntlm_authentication_enabled: bool,
    /// Host implicit service types inside the node process.
    pub in_process_hosting_enabled: bool,
    /// Hand containers a runtime connection address.
    pub container_apps_enabled: bool,
    /// The runtime IPC server requires client certificates.
    pub ipc_tls_enabled: bool,
    /// Default timeout for hosting requests.
    pub request_timeout: Duration,
    /// Delay before retrying deferred user creation.
    pub user_creation_retry_timeout: Duration,
    /// Interval between orphan content scans (zero disables cleanup).
    pub cache_cleanup_scan_interval: Duration,
    /// Delay before retrying a failed scan.
    pub cache_cleanup_backoff_interval: Duration,
    /// Consecutive scan failures tolerated before a cycle gives up.
    pub cache_cleanup_max_continuous_failures: u32,
    /// Delete container images no manifest references.
    pub prune_container_images: bool,
    /// Image name fragments never pruned.
    pub container_images_to_skip: Vec<String>,
    /// Dynamic port range handed out to endpoints.
    pub application_port_range: RangeInclusive<u16>,
    /// Give open-network container code packages their own IP address.
    pub assign_ip_addresses_for_open_network: bool,
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self {
            run_as_policy_enabled: false,
            endpoint_provider_enabled: true,
            firewall_policy_enabled: true,
            ntlm_authentication_enabled: false,
            in_process_hosting_enabled: false,
            container_apps_enabled: true,
            ipc_tls_enabled: false,
            request_timeout: Duration::from_secs(30),
            user_creation_retry_timeout: Duration::from_secs(60),
            cache_cleanup_scan_interval: Duration::from_secs(3600),
            cache_cleanup_backoff_interval: Duration::from_secs(60),
            cache_cleanup_max_continuous_failures: 3,
            prune_container_images: false,
            container_images_to_skip: Vec::new(),
            application_port_range: 20000..=30000,
            assign_ip_addresses_for_open_network: true,
        }
    }
}

impl HostingConfig {
    /// Create a new config builder.
    pub fn builder() -> HostingConfigBuilder {
        HostingConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `NODEHOST_RUN_AS_POLICY_ENABLED` | `false` |
    /// | `NODEHOST_ENDPOINT_PROVIDER_ENABLED` | `true` |
    /// | `NODEHOST_FIREWALL_POLICY_ENABLED` | `true` |
    /// | `NODEHOST_NTLM_AUTHENTICATION_ENABLED` | `false` |
    /// | `NODEHOST_IN_PROCESS_HOSTING_ENABLED` | `false` |
    /// | `NODEHOST_CONTAINER_APPS_ENABLED` | `true` |
    /// | `NODEHOST_IPC_TLS_ENABLED` | `false` |
    /// | `NODEHOST_REQUEST_TIMEOUT_SECS` | `30` |
    /// | `NODEHOST_USER_CREATION_RETRY_TIMEOUT_SECS` | `60` |
    /// | `NODEHOST_CACHE_CLEANUP_SCAN_INTERVAL_SECS` | `3600` |
    /// | `NODEHOST_CACHE_CLEANUP_BACKOFF_INTERVAL_SECS` | `60` |
    /// | `NODEHOST_CACHE_CLEANUP_MAX_CONTINUOUS_FAILURES` | `3` |
    /// | `NODEHOST_PRUNE_CONTAINER_IMAGES` | `false` |
    /// | `NODEHOST_CONTAINER_IMAGES_TO_SKIP` | empty (`\|`-separated) |
    /// | `NODEHOST_APPLICATION_PORT_RANGE` | `20000-30000` |
    /// | `NODEHOST_ASSIGN_IP_ADDRESSES_FOR_OPEN_NETWORK` | `true` |
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            run_as_policy_enabled: env_flag("NODEHOST_RUN_AS_POLICY_ENABLED")
                .unwrap_or(default.run_as_policy_enabled),
            endpoint_provider_enabled: env_flag("NODEHOST_ENDPOINT_PROVIDER_ENABLED")
                .unwrap_or(default.endpoint_provider_enabled),
            firewall_policy_enabled: env_flag("NODEHOST_FIREWALL_POLICY_ENABLED")
                .unwrap_or(default.firewall_policy_enabled),
            ntlm_authentication_enabled: env_flag("NODEHOST_NTLM_AUTHENTICATION_ENABLED")
                .unwrap_or(default.ntlm_authentication_enabled),
            in_process_hosting_enabled: env_flag("NODEHOST_IN_PROCESS_HOSTING_ENABLED")
                .unwrap_or(default.in_process_hosting_enabled),
            container_apps_enabled: env_flag("NODEHOST_CONTAINER_APPS_ENABLED")
                .unwrap_or(default.container_apps_enabled),
            ipc_tls_enabled: env_flag("NODEHOST_IPC_TLS_ENABLED").unwrap_or(default.ipc_tls_enabled),
            request_timeout: env_secs("NODEHOST_REQUEST_TIMEOUT_SECS")
                .unwrap_or(default.request_timeout),
            user_creation_retry_timeout: env_secs("NODEHOST_USER_CREATION_RETRY_TIMEOUT_SECS")
                .unwrap_or(default.user_creation_retry_timeout),
            cache_cleanup_scan_interval: env_secs("NODEHOST_CACHE_CLEANUP_SCAN_INTERVAL_SECS")
                .unwrap_or(default.cache_cleanup_scan_interval),
            cache_cleanup_backoff_interval: env_secs("NODEHOST_CACHE_CLEANUP_BACKOFF_INTERVAL_SECS")
                .unwrap_or(default.cache_cleanup_backoff_interval),
            cache_cleanup_max_continuous_failures: std::env::var(
                "NODEHOST_CACHE_CLEANUP_MAX_CONTINUOUS_FAILURES",
            )
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.cache_cleanup_max_continuous_failures),
            prune_container_images: env_flag("NODEHOST_PRUNE_CONTAINER_IMAGES")
                .unwrap_or(default.prune_container_images),
            container_images_to_skip: std::env::var("NODEHOST_CONTAINER_IMAGES_TO_SKIP")
                .map(|v| parse_image_skip_list(&v))
                .unwrap_or(default.container_images_to_skip),
            application_port_range: std::env::var("NODEHOST_APPLICATION_PORT_RANGE")
                .ok()
                .and_then(|v| parse_port_range(&v))
                .unwrap_or(default.application_port_range),
            assign_ip_addresses_for_open_network: env_flag(
                "NODEHOST_ASSIGN_IP_ADDRESSES_FOR_OPEN_NETWORK",
            )
            .unwrap_or(default.assign_ip_addresses_for_open_network),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), HostingError> {
        if self.request_timeout.is_zero() {
            return Err(HostingError::InvalidArgument(
                "request_timeout must be > 0".into(),
            ));
        }
        if self.application_port_range.is_empty() {
            return Err(HostingError::InvalidArgument(
                "application_port_range must not be empty".into(),
            ));
        }
        if self.cache_cleanup_backoff_interval.is_zero() {
            return Err(HostingError::InvalidArgument(
                "cache_cleanup_backoff_interval must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for HostingConfig.
#[derive(Debug, Default)]
pub struct HostingConfigBuilder {
    config: HostingConfig,
}

impl HostingConfigBuilder {
    /// Allow or forbid RunAs principals.
    pub fn run_as_policy_enabled(mut self, enabled: bool) -> Self {
        self.config.run_as_policy_enabled = enabled;
        self
    }

    /// Enable or disable the endpoint provider.
    pub fn endpoint_provider_enabled(mut self, enabled: bool) -> Self {
        self.config.endpoint_provider_enabled = enabled;
        self
    }

    /// Enable or disable firewall configuration for explicit ports.
    pub fn firewall_policy_enabled(mut self, enabled: bool) -> Self {
        self.config.firewall_policy_enabled = enabled;
        self
    }

    pub fn ntlm_authentication_enabled(mut self, enabled: bool) -> Self {
        self.config.ntlm_authentication_enabled = enabled;
        self
    }

    pub fn in_process_hosting_enabled(mut self, enabled: bool) -> Self {
        self.config.in_process_hosting_enabled = enabled;
        self
    }

    pub fn container_apps_enabled(mut self, enabled: bool) -> Self {
        self.config.container_apps_enabled = enabled;
        self
    }

    pub fn ipc_tls_enabled(mut self, enabled: bool) -> Self {
        self.config.ipc_tls_enabled = enabled;
        self
    }

    /// Set the default request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the deferred user creation retry delay.
    pub fn user_creation_retry_timeout(mut self, timeout: Duration) -> Self {
        self.config.user_creation_retry_timeout = timeout;
        self
    }

    /// Set the orphan content scan interval.
    pub fn cache_cleanup_scan_interval(mut self, interval: Duration) -> Self {
        self.config.cache_cleanup_scan_interval = interval;
        self
    }

    pub fn cache_cleanup_backoff_interval(mut self, interval: Duration) -> Self {
        self.config.cache_cleanup_backoff_interval = interval;
        self
    }

    pub fn cache_cleanup_max_continuous_failures(mut self, count: u32) -> Self {
        self.config.cache_cleanup_max_continuous_failures = count;
        self
    }

    /// Enable container image pruning with an optional skip list.
    pub fn prune_container_images(mut self, enabled: bool, skip: &str) -> Self {
        self.config.prune_container_images = enabled;
        self.config.container_images_to_skip = parse_image_skip_list(skip);
        self
    }

    /// Set the dynamic port range.
    pub fn application_port_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.config.application_port_range = range;
        self
    }

    pub fn assign_ip_addresses_for_open_network(mut self, enabled: bool) -> Self {
        self.config.assign_ip_addresses_for_open_network = enabled;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<HostingConfig, HostingError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Node identity and on-disk layout.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub node_name: String,
    /// Address published in endpoint descriptors when no network assignment applies.
    pub ip_address_or_fqdn: String,
    /// Root of every application instance folder.
    pub deployment_folder: PathBuf,
    /// Root of the image cache (`None` disables the cache).
    pub image_cache_folder: Option<PathBuf>,
    /// Logical directories mapped into applications as symbolic links.
    pub logical_application_directories: Vec<PathBuf>,
    /// Folder holding node binaries, prepended to PATH.
    pub binaries_folder: PathBuf,
    /// Address sandboxes use to connect back to the runtime.
    pub runtime_connection_address: String,
    /// Address containers use to connect back to the runtime.
    pub container_runtime_connection_address: String,
    /// Folder holding named lock files and the account store.
    pub lock_folder: PathBuf,
    /// SID of the account the node runs as, granted implicit HTTP ACLs.
    pub current_user_sid: String,
    /// The node runs with administrative rights and needs no implicit ACLs.
    pub is_admin_user: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            node_name: String::new(),
            ip_address_or_fqdn: "localhost".into(),
            deployment_folder: PathBuf::from("/var/lib/nodehost/apps"),
            image_cache_folder: None,
            logical_application_directories: Vec::new(),
            binaries_folder: PathBuf::from("/opt/nodehost/bin"),
            runtime_connection_address: "localhost:19100".into(),
            container_runtime_connection_address: String::new(),
            lock_folder: PathBuf::from("/var/lib/nodehost/locks"),
            current_user_sid: String::new(),
            is_admin_user: false,
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `NODEHOST_NODE_ID` | empty |
    /// | `NODEHOST_NODE_NAME` | empty |
    /// | `NODEHOST_NODE_ADDRESS` | `localhost` |
    /// | `NODEHOST_DEPLOYMENT_FOLDER` | `/var/lib/nodehost/apps` |
    /// | `NODEHOST_IMAGE_CACHE_FOLDER` | unset (cache disabled) |
    /// | `NODEHOST_BINARIES_FOLDER` | `/opt/nodehost/bin` |
    /// | `NODEHOST_RUNTIME_ADDRESS` | `localhost:19100` |
    /// | `NODEHOST_CONTAINER_RUNTIME_ADDRESS` | empty |
    /// | `NODEHOST_LOCK_FOLDER` | `/var/lib/nodehost/locks` |
    /// | `NODEHOST_LOGICAL_APPLICATION_DIRECTORIES` | empty (`:`-separated) |
    /// | `NODEHOST_CURRENT_USER_SID` | empty |
    /// | `NODEHOST_IS_ADMIN_USER` | `false` |
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            node_id: std::env::var("NODEHOST_NODE_ID").unwrap_or(default.node_id),
            node_name: std::env::var("NODEHOST_NODE_NAME").unwrap_or(default.node_name),
            ip_address_or_fqdn: std::env::var("NODEHOST_NODE_ADDRESS")
                .unwrap_or(default.ip_address_or_fqdn),
            deployment_folder: std::env::var("NODEHOST_DEPLOYMENT_FOLDER")
                .map(PathBuf::from)
                .unwrap_or(default.deployment_folder),
            image_cache_folder: std::env::var("NODEHOST_IMAGE_CACHE_FOLDER")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            logical_application_directories: std::env::var("NODEHOST_LOGICAL_APPLICATION_DIRECTORIES")
                .map(|v| {
                    v.split(':')
                        .filter(|s| !s.is_empty())
                        .map(PathBuf::from)
                        .collect()
                })
                .unwrap_or(default.logical_application_directories),
            binaries_folder: std::env::var("NODEHOST_BINARIES_FOLDER")
                .map(PathBuf::from)
                .unwrap_or(default.binaries_folder),
            runtime_connection_address: std::env::var("NODEHOST_RUNTIME_ADDRESS")
                .unwrap_or(default.runtime_connection_address),
            container_runtime_connection_address: std::env::var(
                "NODEHOST_CONTAINER_RUNTIME_ADDRESS",
            )
            .unwrap_or(default.container_runtime_connection_address),
            lock_folder: std::env::var("NODEHOST_LOCK_FOLDER")
                .map(PathBuf::from)
                .unwrap_or(default.lock_folder),
            current_user_sid: std::env::var("NODEHOST_CURRENT_USER_SID")
                .unwrap_or(default.current_user_sid),
            is_admin_user: env_flag("NODEHOST_IS_ADMIN_USER").unwrap_or(default.is_admin_user),
        }
    }

    /// Node config rooted at `root`, used by tests and tools.
    pub fn rooted_at(root: impl Into<PathBuf>, node_id: impl Into<String>) -> Self {
        let root = root.into();
        let node_id = node_id.into();
        Self {
            node_name: format!("Node.{node_id}"),
            node_id,
            deployment_folder: root.join("apps"),
            image_cache_folder: Some(root.join("cache")),
            binaries_folder: root.join("bin"),
            lock_folder: root.join("locks"),
            current_user_sid: "S-1-5-21-1000".into(),
            ..Self::default()
        }
    }
}

/// Split a `|`-separated image skip list, dropping empty entries.
pub fn parse_image_skip_list(value: &str) -> Vec<String> {
    value
        .split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_port_range(value: &str) -> Option<RangeInclusive<u16>> {
    let (start, end) = value.split_once('-')?;
    let start: u16 = start.trim().parse().ok()?;
    let end: u16 = end.trim().parse().ok()?;
    Some(start..=end)
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| v != "false" && v != "0")
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}
