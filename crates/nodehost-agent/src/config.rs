//! Configuration for the container activator agent.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the agent process.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Socket the agent serves container requests on.
    pub listen_socket: PathBuf,

    /// Socket of the node host the agent registers with.
    pub host_socket: PathBuf,

    /// Container command-line program (default: `docker`).
    pub container_cli: String,

    /// Network open-network containers join.
    pub open_network_name: String,

    /// Delay between registration attempts while the host still knows a
    /// previous agent.
    pub registration_retry_interval: Duration,

    /// Budget for registering with the host.
    pub request_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_socket: PathBuf::from("/run/nodehost/container-activator.sock"),
            host_socket: PathBuf::from("/run/nodehost/activator.sock"),
            container_cli: "docker".into(),
            open_network_name: "nodehost_open".into(),
            registration_retry_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `NODEHOST_AGENT_LISTEN_SOCKET` | `/run/nodehost/container-activator.sock` |
    /// | `NODEHOST_AGENT_HOST_SOCKET` | `/run/nodehost/activator.sock` |
    /// | `NODEHOST_AGENT_CONTAINER_CLI` | `docker` |
    /// | `NODEHOST_AGENT_OPEN_NETWORK` | `nodehost_open` |
    /// | `NODEHOST_AGENT_REGISTRATION_RETRY_MS` | `1000` |
    /// | `NODEHOST_AGENT_REQUEST_TIMEOUT_SECS` | `60` |
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            listen_socket: std::env::var("NODEHOST_AGENT_LISTEN_SOCKET")
                .map(PathBuf::from)
                .unwrap_or(default.listen_socket),
            host_socket: std::env::var("NODEHOST_AGENT_HOST_SOCKET")
                .map(PathBuf::from)
                .unwrap_or(default.host_socket),
            container_cli: std::env::var("NODEHOST_AGENT_CONTAINER_CLI")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(default.container_cli),
            open_network_name: std::env::var("NODEHOST_AGENT_OPEN_NETWORK")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(default.open_network_name),
            registration_retry_interval: std::env::var("NODEHOST_AGENT_REGISTRATION_RETRY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.registration_retry_interval),
            request_timeout: std::env::var("NODEHOST_AGENT_REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.request_timeout),
        }
    }

    /// Validate configuration, logging warnings for likely mistakes.
    pub fn validate_warn(&self) {
        if self.listen_socket == self.host_socket {
            tracing::warn!(path = %self.listen_socket.display(), "Listen and host sockets are the same path");
        }
        if self.registration_retry_interval.is_zero() {
            tracing::warn!("Registration retry interval is zero; retries will spin");
        }
        if let Some(parent) = self.listen_socket.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tracing::warn!(path = %parent.display(), "Listen socket directory does not exist");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 6] = [
        "NODEHOST_AGENT_LISTEN_SOCKET",
        "NODEHOST_AGENT_HOST_SOCKET",
        "NODEHOST_AGENT_CONTAINER_CLI",
        "NODEHOST_AGENT_OPEN_NETWORK",
        "NODEHOST_AGENT_REGISTRATION_RETRY_MS",
        "NODEHOST_AGENT_REQUEST_TIMEOUT_SECS",
    ];

    fn clear() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_env() {
        clear();
        let config = AgentConfig::from_env();
        assert_eq!(config.container_cli, "docker");
        assert_eq!(config.registration_retry_interval, Duration::from_secs(1));
        assert_eq!(config.host_socket, PathBuf::from("/run/nodehost/activator.sock"));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear();
        std::env::set_var("NODEHOST_AGENT_CONTAINER_CLI", "podman");
        std::env::set_var("NODEHOST_AGENT_REGISTRATION_RETRY_MS", "250");
        std::env::set_var("NODEHOST_AGENT_REQUEST_TIMEOUT_SECS", "not-a-number");

        let config = AgentConfig::from_env();
        assert_eq!(config.container_cli, "podman");
        assert_eq!(config.registration_retry_interval, Duration::from_millis(250));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        clear();
    }
}
