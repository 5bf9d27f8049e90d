//! Integration tests for nodehost-core.
//!
//! These run against real Unix sockets and temporary directories; no
//! activator or container runtime is needed.
//!
//! Run with: `cargo test -p nodehost-core --test integration`

use async_trait::async_trait;
use filetime::FileTime;
use nodehost_core::ipc::handle_action;
use nodehost_core::ipc::messages::{
    actions, AssignIpAddressesRequest, ConfigureContainerCertificateExportRequest,
    ConfigureEndpointBindingAndFirewallPolicyRequest, ConfigureEndpointSecurityRequest,
    ContainerCertificatePaths, DeleteContainerImagesRequest, EndpointCertificateBinding,
    ManageOverlayNetworkResourcesRequest, RequestEnvelope, SetupContainerGroupRequest,
};
use nodehost_core::ipc::protocol::{error_codes, Request, Response};
use nodehost_core::layout::{checksum_file, StoreLayout};
use nodehost_core::{
    ActivatorClient, ApplicationId, ApplicationPackageDescription, ApplicationQueryClient,
    ApplicationTracker, CodePackageDescription, DeletionManager, EntryPointType,
    EnvironmentManager, HostingConfig, HostingError, InMemoryAccountStore, IpcActivatorClient,
    IpcClient, IpcServer, NodeConfig, ProvisionedPackages, RequestHandler, Result,
    SecurityGroupCleaner, ServicePackageDescription, ServicePackageId, ServicePackageInstanceId,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

const TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// IPC round trip
// ============================================================================

#[derive(Default)]
struct ActivatorService {
    bindings: Mutex<Vec<ConfigureEndpointBindingAndFirewallPolicyRequest>>,
}

#[async_trait]
impl RequestHandler for ActivatorService {
    async fn handle(&self, request: Request) -> Response {
        let Request { id, method, params, .. } = request;
        match method.as_str() {
            actions::CONFIGURE_ENDPOINT_BINDING_AND_FIREWALL_POLICY => {
                handle_action(id, &method, params, |envelope: RequestEnvelope<ConfigureEndpointBindingAndFirewallPolicyRequest>| async move {
                    self.bindings.lock().unwrap().push(envelope.body);
                    Ok(())
                })
                .await
            }
            actions::DELETE_CONTAINER_IMAGES => {
                handle_action(id, &method, params, |envelope: RequestEnvelope<DeleteContainerImagesRequest>| async move {
                    let images = envelope.body.images.join(",");
                    Err::<(), _>(HostingError::NotFound(format!("image {images}")))
                })
                .await
            }
            _ => Response::error(id, error_codes::METHOD_NOT_FOUND, format!("unknown action {method}")),
        }
    }
}

async fn serve(dir: &Path, service: Arc<ActivatorService>) -> (IpcServer, IpcActivatorClient) {
    let socket = dir.join("activator.sock");
    let server = IpcServer::bind(&socket, service).await.unwrap();
    let client = IpcClient::connect(&socket).await.unwrap();
    (server, IpcActivatorClient::new(Arc::new(client)))
}

#[tokio::test]
async fn test_binding_cleanup_request_crosses_the_socket_intact() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(ActivatorService::default());
    let (mut server, client) = serve(dir.path(), service.clone()).await;

    let request = ConfigureEndpointBindingAndFirewallPolicyRequest {
        node_id: "N1".into(),
        service_package_id: "Calc_App1:Front:4".into(),
        endpoint_certificate_bindings: vec![
            EndpointCertificateBinding {
                port: 8443,
                is_explicit_port: true,
                principal_sid: "S-1-5-21-7".into(),
                x509_find_value: "AB12".into(),
                x509_store_name: "My".into(),
                x509_find_type: "FindByThumbprint".into(),
            },
            EndpointCertificateBinding {
                port: 443,
                is_explicit_port: false,
                principal_sid: "S-1-5-21-7".into(),
                x509_find_value: "CD34".into(),
                x509_store_name: "My".into(),
                x509_find_type: "FindByThumbprint".into(),
            },
        ],
        cleanup: true,
        cleanup_firewall_policy: true,
        firewall_ports: vec![30001, 8080, 30000],
    };

    client
        .configure_endpoint_binding_and_firewall_policy(request.clone(), TIMEOUT)
        .await
        .unwrap();

    let received = service.bindings.lock().unwrap().clone();
    assert_eq!(received, vec![request]);
    assert_eq!(received[0].firewall_ports, vec![30001, 8080, 30000]);
    assert_eq!(received[0].endpoint_certificate_bindings[1].port, 443);

    server.shutdown().await;
    assert!(!dir.path().join("activator.sock").exists());
}

#[tokio::test]
async fn test_remote_error_keeps_its_kind() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, client) = serve(dir.path(), Arc::default()).await;

    let err = client
        .delete_container_images(vec!["calc/front:1.0".into()], TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, HostingError::NotFound(ref m) if m.contains("calc/front:1.0")));
    assert!(err.is_retryable());

    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_action_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, _) = serve(dir.path(), Arc::default()).await;
    let client = IpcClient::connect(&dir.path().join("activator.sock")).await.unwrap();

    client.ping().await.unwrap();
    let result: Result<serde_json::Value> = client.call(actions::SETUP_CONTAINER_GROUP, serde_json::json!({})).await;
    assert!(result.is_err());

    server.shutdown().await;
}

// ============================================================================
// Environment pipeline
// ============================================================================

#[derive(Default)]
struct CountingActivator {
    calls: Mutex<Vec<&'static str>>,
    binding_requests: Mutex<Vec<ConfigureEndpointBindingAndFirewallPolicyRequest>>,
}

impl CountingActivator {
    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ActivatorClient for CountingActivator {
    async fn assign_ip_addresses(&self, _: AssignIpAddressesRequest, _: Duration) -> Result<Vec<String>> {
        self.record("assign_ip_addresses");
        Ok(Vec::new())
    }

    async fn manage_overlay_network_resources(
        &self,
        _: ManageOverlayNetworkResourcesRequest,
        _: Duration,
    ) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
        self.record("manage_overlay_network_resources");
        Ok(BTreeMap::new())
    }

    async fn setup_container_group(&self, _: SetupContainerGroupRequest, _: Duration) -> Result<String> {
        self.record("setup_container_group");
        Ok(String::new())
    }

    async fn configure_endpoint_security(&self, _: ConfigureEndpointSecurityRequest, _: Duration) -> Result<()> {
        self.record("configure_endpoint_security");
        Ok(())
    }

    async fn configure_endpoint_binding_and_firewall_policy(
        &self,
        request: ConfigureEndpointBindingAndFirewallPolicyRequest,
        _: Duration,
    ) -> Result<()> {
        self.record("configure_endpoint_binding_and_firewall_policy");
        self.binding_requests.lock().unwrap().push(request);
        Ok(())
    }

    async fn configure_container_certificate_export(
        &self,
        _: ConfigureContainerCertificateExportRequest,
        _: Duration,
    ) -> Result<ContainerCertificatePaths> {
        self.record("configure_container_certificate_export");
        Ok(ContainerCertificatePaths::default())
    }

    async fn cleanup_container_certificate_export(&self, _: ContainerCertificatePaths, _: Duration) -> Result<()> {
        self.record("cleanup_container_certificate_export");
        Ok(())
    }

    async fn delete_container_images(&self, _: Vec<String>, _: Duration) -> Result<()> {
        self.record("delete_container_images");
        Ok(())
    }
}

#[tokio::test]
async fn test_service_package_without_endpoints_needs_no_activator() {
    let dir = tempfile::tempdir().unwrap();
    let activator = Arc::new(CountingActivator::default());
    let manager = EnvironmentManager::new(
        NodeConfig::rooted_at(dir.path(), "N1"),
        HostingConfig::default(),
        activator.clone(),
        Arc::new(InMemoryAccountStore::new()),
    );
    manager.open().await.unwrap();

    let app_id = ApplicationId::new("Calc", 1);
    let app_context = manager
        .setup_application(&app_id, &ApplicationPackageDescription::default(), TIMEOUT)
        .await
        .unwrap();

    let mut description = ServicePackageDescription::new("Front");
    description.code_packages = vec![CodePackageDescription::new("Code", EntryPointType::Exe)];
    let sp_instance = ServicePackageInstanceId::shared(ServicePackageId::new(app_id, "Front"));

    let mut context = manager
        .setup_service_package_instance(&app_context, &sp_instance, 1, &description, TIMEOUT)
        .await
        .unwrap();
    assert!(context.endpoints().is_empty());
    assert!(activator.calls().is_empty());

    manager
        .cleanup_service_package_instance(&mut context, TIMEOUT)
        .await
        .unwrap();
    let requests = activator.binding_requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].cleanup);
    assert!(!requests[0].cleanup_firewall_policy);
    assert!(requests[0].firewall_ports.is_empty());

    manager.close().await;
}

// ============================================================================
// Deletion
// ============================================================================

struct StaticQuery {
    provisioned: ProvisionedPackages,
}

#[async_trait]
impl ApplicationQueryClient for StaticQuery {
    async fn get_deleted_applications(&self, _: Vec<String>, _: Duration) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn get_provisioned_packages(&self, _: &str, _: Duration) -> Result<ProvisionedPackages> {
        Ok(self.provisioned.clone())
    }
}

struct NoApplications;

impl ApplicationTracker for NoApplications {
    fn contains(&self, _: &ApplicationId) -> Result<bool> {
        Ok(false)
    }
}

#[async_trait]
impl SecurityGroupCleaner for NoApplications {
    async fn cleanup_application_security_groups(&self, _: &[String]) -> Result<Vec<ApplicationId>> {
        Ok(Vec::new())
    }
}

fn set_mtime(path: &Path, time: SystemTime) {
    filetime::set_file_mtime(path, FileTime::from_system_time(time)).unwrap();
}

#[tokio::test]
async fn test_cache_cleanup_keeps_referenced_and_recent_content() {
    let dir = tempfile::tempdir().unwrap();
    let node = NodeConfig::rooted_at(dir.path(), "N1");
    let cache = StoreLayout::new(node.image_cache_folder.clone().unwrap());
    let shared = StoreLayout::shared(&node.deployment_folder);
    let old = SystemTime::now() - Duration::from_secs(600);

    let referenced = cache.package_folder("Calc", "Front", "Code", "1.0");
    let stale = cache.package_folder("Calc", "Front", "Code", "0.8");
    let recent = cache.package_folder("Calc", "Front", "Code", "0.9");
    for folder in [&referenced, &stale, &recent] {
        fs::create_dir_all(folder).unwrap();
        fs::write(checksum_file(folder), b"sum").unwrap();
        set_mtime(&checksum_file(folder), old);
        set_mtime(folder, old);
    }
    // Rewritten by a download that finished after the scan started.
    set_mtime(&checksum_file(&recent), SystemTime::now() + Duration::from_secs(600));

    let shared_referenced = shared.package_folder("Calc", "Front", "Code", "1.0");
    let shared_stale = shared.package_folder("Calc", "Front", "Config", "0.8");
    for folder in [&shared_referenced, &shared_stale] {
        fs::create_dir_all(folder).unwrap();
        set_mtime(folder, old);
    }

    let query = StaticQuery {
        provisioned: ProvisionedPackages {
            code_packages: vec!["Front:Code:1.0".into()],
            ..Default::default()
        },
    };
    let manager = DeletionManager::new(
        node,
        HostingConfig::default(),
        Arc::new(query),
        Arc::new(NoApplications),
        Arc::new(NoApplications),
        Arc::new(CountingActivator::default()),
    )
    .unwrap();

    manager.cleanup_app_type_folders().await.unwrap();

    assert!(referenced.exists());
    assert!(checksum_file(&referenced).exists());
    assert!(!stale.exists());
    assert!(!checksum_file(&stale).exists());
    assert!(checksum_file(&recent).exists());
    assert!(shared_referenced.exists());
    assert!(!shared_stale.exists());
}
