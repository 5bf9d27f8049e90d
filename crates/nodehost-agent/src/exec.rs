//! Container runtime driven through its command-line program.
//!
//! Every operation is one CLI invocation via `tokio::process`; the event
//! stream is a long-running `events` process whose JSON lines are forwarded
//! to the host.

use crate::service::ContainerActivatorService;
use async_trait::async_trait;
use nodehost_core::ipc::messages::{
    ActivateContainerRequest, ContainerDescription, ContainerEventDescription,
    ContainerImageDescription, ContainerUpdateRoutesRequest, DeactivateContainerRequest,
    InvokeContainerApiReply, InvokeContainerApiRequest,
};
use nodehost_core::model::NetworkType;
use nodehost_core::{HostingError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Maximum output size in bytes (1 MB).
const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Truncate a string to max bytes, preserving UTF-8 boundaries.
fn truncate_output(s: String, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_string();
    truncated.push_str("\n... [output truncated]");
    truncated
}

/// Map a failed CLI invocation to the error the host expects.
fn classify_failure(args: &[String], stderr: &str) -> HostingError {
    let message = format!("{} failed: {}", args.first().map(String::as_str).unwrap_or(""), stderr.trim());
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("no such container") || lower.contains("no such image") || lower.contains("not found") {
        HostingError::NotFound(message)
    } else if lower.contains("already in use") || lower.contains("conflict") {
        HostingError::AlreadyExists(message)
    } else {
        HostingError::OperationFailed(message)
    }
}

/// Container runtime behind a docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct ContainerCli {
    program: String,
    open_network_name: String,
}

impl ContainerCli {
    pub fn new(program: impl Into<String>, open_network_name: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            open_network_name: open_network_name.into(),
        }
    }

    /// Run one CLI command and return its stdout.
    async fn run(&self, args: Vec<String>, timeout: Duration) -> Result<String> {
        debug!(program = %self.program, args = ?args, "running container command");
        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(timeout, output)
            .await
            .map_err(|_| HostingError::Timeout(timeout))?
            .map_err(|e| HostingError::OperationFailed(format!("failed to run {}: {e}", self.program)))?;

        let stdout = truncate_output(String::from_utf8_lossy(&output.stdout).into_owned(), MAX_OUTPUT_SIZE);
        let stderr = truncate_output(String::from_utf8_lossy(&output.stderr).into_owned(), MAX_OUTPUT_SIZE);
        trace!(stdout = %stdout, stderr = %stderr, "container command output");

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            debug!(exit_code, stderr = %stderr.trim(), "container command failed");
            return Err(classify_failure(&args, &stderr));
        }
        Ok(stdout)
    }

    /// Arguments of the `run` command that starts `container`.
    pub fn run_args(&self, container: &ContainerDescription) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--detach".to_string()];
        args.extend(["--name".to_string(), container.container_name.clone()]);
        if container.auto_remove {
            args.push("--rm".into());
        }
        for (key, value) in &container.environment {
            args.extend(["--env".to_string(), format!("{key}={value}")]);
        }

        if !container.group_container_name.is_empty() {
            args.extend(["--network".to_string(), format!("container:{}", container.group_container_name)]);
        } else {
            match container.network_type {
                NetworkType::Open if !container.assigned_ip.is_empty() => {
                    args.extend(["--network".to_string(), self.open_network_name.clone()]);
                    args.extend(["--ip".to_string(), container.assigned_ip.clone()]);
                }
                _ => {
                    for (container_port, host_port) in &container.port_bindings {
                        args.extend(["--publish".to_string(), format!("{host_port}:{container_port}")]);
                    }
                }
            }
            for dns in &container.dns_servers {
                args.extend(["--dns".to_string(), dns.clone()]);
            }
        }

        let labels = [
            ("nodehost.application", &container.application_name),
            ("nodehost.service", &container.service_name),
            ("nodehost.code_package", &container.code_package_name),
        ];
        for (label, value) in labels {
            if !value.is_empty() {
                args.extend(["--label".to_string(), format!("{label}={value}")]);
            }
        }

        if !container.entry_point.is_empty() {
            args.extend(["--entrypoint".to_string(), container.entry_point.clone()]);
        }
        args.push(container.image_name.clone());
        args.extend(container.command_args.iter().cloned());
        args
    }

    /// CLI command answering a container API path, with `{id}` standing for
    /// the container.
    pub fn api_args(request: &InvokeContainerApiRequest) -> Result<Vec<String>> {
        let path = request.uri_path.replace("{id}", &request.container_name);
        let path = path.split('?').next().unwrap_or_default().trim_matches('/');
        let segments: Vec<&str> = path.split('/').collect();
        if !request.http_verb.eq_ignore_ascii_case("GET") {
            return Err(HostingError::OperationNotSupported(format!(
                "{} {}",
                request.http_verb, request.uri_path
            )));
        }
        match segments.as_slice() {
            ["containers", name, "json"] => Ok(vec!["inspect".into(), (*name).into()]),
            ["containers", name, "logs"] => Ok(vec!["logs".into(), (*name).into()]),
            ["containers", name, "stats"] => Ok(vec![
                "stats".into(),
                "--no-stream".into(),
                "--format".into(),
                "{{json .}}".into(),
                (*name).into(),
            ]),
            _ => Err(HostingError::OperationNotSupported(format!(
                "{} {}",
                request.http_verb, request.uri_path
            ))),
        }
    }
}

#[async_trait]
impl ContainerActivatorService for ContainerCli {
    async fn activate_container(&self, request: ActivateContainerRequest, timeout: Duration) -> Result<String> {
        let container = &request.container;
        let stdout = self.run(self.run_args(container), timeout).await?;
        let container_id = stdout.trim().to_string();
        info!(
            container = %container.container_name,
            container_id = %container_id,
            app_host_id = %request.app_host_id,
            "Container activated"
        );
        Ok(container_id)
    }

    async fn deactivate_container(&self, request: DeactivateContainerRequest, timeout: Duration) -> Result<()> {
        let verb = if request.graceful { "stop" } else { "kill" };
        self.run(vec![verb.into(), request.container_name.clone()], timeout)
            .await?;
        info!(container = %request.container_name, graceful = request.graceful, "Container deactivated");
        Ok(())
    }

    async fn download_images(&self, images: Vec<ContainerImageDescription>, timeout: Duration) -> Result<()> {
        for image in images {
            self.run(vec!["pull".into(), image.image_name.clone()], timeout)
                .await?;
            info!(image = %image.image_name, "Container image downloaded");
        }
        Ok(())
    }

    async fn delete_images(&self, images: Vec<String>, timeout: Duration) -> Result<()> {
        let mut last_error = None;
        for image in images {
            match self.run(vec!["rmi".into(), image.clone()], timeout).await {
                Ok(_) => info!(image = %image, "Container image deleted"),
                Err(HostingError::NotFound(_)) => debug!(image = %image, "Container image already gone"),
                Err(e) => {
                    warn!(image = %image, error = %e, "Failed to delete container image");
                    last_error = Some(e);
                }
            }
        }
        last_error.map_or(Ok(()), Err)
    }

    async fn update_routes(&self, request: ContainerUpdateRoutesRequest, timeout: Duration) -> Result<()> {
        let Some(gateway) = request.gateway_ip_addresses.first() else {
            return Err(HostingError::InvalidArgument(format!(
                "no gateway for container {}",
                request.container_name
            )));
        };
        let mut args = vec!["exec".to_string(), request.container_name.clone()];
        args.extend(["ip", "route", "replace", "default", "via"].map(String::from));
        args.push(gateway.clone());
        self.run(args, timeout).await?;
        debug!(container = %request.container_name, gateway = %gateway, "Container routes updated");
        Ok(())
    }

    async fn invoke_container_api(
        &self,
        request: InvokeContainerApiRequest,
        timeout: Duration,
    ) -> Result<InvokeContainerApiReply> {
        let args = Self::api_args(&request)?;
        let response_body = self.run(args, timeout).await?;
        Ok(InvokeContainerApiReply {
            status_code: 200,
            content_type: "application/json".into(),
            response_body,
        })
    }

    async fn start_event_monitoring(
        &self,
        since: i64,
        events: mpsc::UnboundedSender<ContainerEventDescription>,
    ) -> Result<()> {
        let mut args = vec![
            "events".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
            "--filter".to_string(),
            "type=container".to_string(),
        ];
        if since > 0 {
            args.extend(["--since".to_string(), since.to_string()]);
        }

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HostingError::OperationFailed(format!("failed to start event stream: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HostingError::OperationFailed("event stream has no stdout".into()))?;

        info!(program = %self.program, since, "Container event monitoring started");
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Some(event) = parse_event(&line) else {
                            trace!(line = %line, "Ignoring container event line");
                            continue;
                        };
                        if events.send(event).is_err() {
                            debug!("Event receiver dropped, stopping event stream");
                            break;
                        }
                    }
                    Ok(None) => {
                        warn!("Container event stream ended");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read container event stream");
                        break;
                    }
                }
            }
            if let Err(e) = child.kill().await {
                debug!(error = %e, "Event stream process already exited");
            }
        });
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CliEvent {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    time: i64,
    #[serde(rename = "Actor", default)]
    actor: CliActor,
}

#[derive(Debug, Default, Deserialize)]
struct CliActor {
    #[serde(rename = "Attributes", default)]
    attributes: BTreeMap<String, String>,
}

/// Parse one `events --format '{{json .}}'` line. Non-container events and
/// garbage yield `None`.
pub fn parse_event(line: &str) -> Option<ContainerEventDescription> {
    let event: CliEvent = serde_json::from_str(line.trim()).ok()?;
    if event.kind != "container" || event.id.is_empty() {
        return None;
    }
    let (event_type, health_status) = match event.action.split_once(':') {
        Some((kind, status)) => (kind.trim().to_string(), Some(status.trim().to_string())),
        None => (event.action.clone(), None),
    };
    Some(ContainerEventDescription {
        event_type,
        container_id: event.id,
        container_name: event.actor.attributes.get("name").cloned().unwrap_or_default(),
        time_stamp: event.time,
        exit_code: event
            .actor
            .attributes
            .get("exitCode")
            .and_then(|c| c.parse().ok()),
        health_status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> ContainerCli {
        ContainerCli::new("docker", "nodehost_open")
    }

    #[test]
    fn test_run_args_for_nat_container() {
        let mut container = ContainerDescription {
            container_name: "sf-calc_app1-1".into(),
            image_name: "calc/front:1.0".into(),
            application_name: "fabric:/Calc".into(),
            command_args: vec!["--verbose".into()],
            auto_remove: true,
            ..Default::default()
        };
        container.environment.insert("Fabric_NodeId".into(), "N1".into());
        container.port_bindings.insert("80".into(), "30001".into());

        let args = cli().run_args(&container);
        assert_eq!(&args[..4], ["run", "--detach", "--name", "sf-calc_app1-1"]);
        assert!(args.contains(&"--rm".to_string()));
        assert!(args.contains(&"Fabric_NodeId=N1".to_string()));
        assert!(args.contains(&"30001:80".to_string()));
        assert!(args.contains(&"nodehost.application=fabric:/Calc".to_string()));
        assert_eq!(&args[args.len() - 2..], ["calc/front:1.0", "--verbose"]);
    }

    #[test]
    fn test_run_args_for_open_and_grouped_containers() {
        let open = ContainerDescription {
            container_name: "a".into(),
            image_name: "img".into(),
            network_type: NetworkType::Open,
            assigned_ip: "10.0.0.9".into(),
            ..Default::default()
        };
        let args = cli().run_args(&open);
        let joined = args.join(" ");
        assert!(joined.contains("--network nodehost_open --ip 10.0.0.9"));

        let grouped = ContainerDescription {
            group_container_name: "pod".into(),
            ..open
        };
        let joined = cli().run_args(&grouped).join(" ");
        assert!(joined.contains("--network container:pod"));
        assert!(!joined.contains("--ip"));
    }

    #[test]
    fn test_api_args() {
        let request = InvokeContainerApiRequest {
            container_name: "sf-calc".into(),
            http_verb: "GET".into(),
            uri_path: "/containers/{id}/logs?stdout=true".into(),
            ..Default::default()
        };
        assert_eq!(ContainerCli::api_args(&request).unwrap(), vec!["logs", "sf-calc"]);

        let post = InvokeContainerApiRequest {
            http_verb: "POST".into(),
            ..request
        };
        assert!(matches!(
            ContainerCli::api_args(&post),
            Err(HostingError::OperationNotSupported(_))
        ));
    }

    #[test]
    fn test_parse_event() {
        let line = r#"{"status":"die","id":"abc","from":"img","Type":"container","Action":"die","Actor":{"ID":"abc","Attributes":{"exitCode":"137","name":"sf-calc"}},"time":1700000000}"#;
        let event = parse_event(line).unwrap();
        assert_eq!(event.event_type, "die");
        assert_eq!(event.container_name, "sf-calc");
        assert_eq!(event.exit_code, Some(137));
        assert_eq!(event.time_stamp, 1_700_000_000);

        let health = r#"{"Type":"container","Action":"health_status: unhealthy","id":"abc","time":1}"#;
        let event = parse_event(health).unwrap();
        assert_eq!(event.event_type, "health_status");
        assert_eq!(event.health_status.as_deref(), Some("unhealthy"));

        assert!(parse_event(r#"{"Type":"network","Action":"connect","id":"n1"}"#).is_none());
        assert!(parse_event("not json").is_none());
    }

    #[test]
    fn test_classify_failure() {
        let args = vec!["rmi".to_string()];
        assert!(matches!(
            classify_failure(&args, "Error: No such image: calc:1"),
            HostingError::NotFound(_)
        ));
        assert!(matches!(
            classify_failure(&args, "Conflict. The container name is already in use"),
            HostingError::AlreadyExists(_)
        ));
        assert!(matches!(classify_failure(&args, "boom"), HostingError::OperationFailed(_)));
    }

    #[test]
    fn test_truncate_output() {
        assert_eq!(truncate_output("short".into(), 10), "short");
        let out = truncate_output("héllo".into(), 2);
        assert!(out.starts_with('h'));
        assert!(out.ends_with("[output truncated]"));
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let cli = ContainerCli::new("/nonexistent/container-cli", "open");
        let err = cli
            .delete_images(vec!["calc:1".into()], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, HostingError::OperationFailed(_)));
    }
}
