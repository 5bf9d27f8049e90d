//! # nodehost-core
//!
//! Application hosting for a cluster node: starting the sandboxes code
//! packages run in, preparing their environment and cleaning up after them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      nodehost-core (node)                    │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌──────────────────────┐     ┌───────────────────────────┐  │
//! │  │ EnvironmentManager   │────▶│ PrincipalsProvider        │  │
//! │  │ - setup_application  │     │ EndpointProvider          │  │
//! │  │ - setup_service_     │     │ DiagnosticsProvider       │  │
//! │  │   package_instance   │     └───────────────────────────┘  │
//! │  └──────────────────────┘                │                   │
//! │             │                            ▼                   │
//! │             │                 ┌───────────────────────────┐  │
//! │             └────────────────▶│ ActivatorClient (IPC)     │  │
//! │                               └───────────────────────────┘  │
//! │  ┌──────────────────────┐                ▲                   │
//! │  │ ApplicationHost-     │                │ delete images     │
//! │  │ Registry             │     ┌───────────────────────────┐  │
//! │  │ - get_or_create()    │     │ DeletionManager           │  │
//! │  └──────────────────────┘     │ - instance folder scan    │  │
//! │             │                 │ - application type scan   │  │
//! │             ▼                 └───────────────────────────┘  │
//! │  ┌──────────────────────┐     ┌───────────────────────────┐  │
//! │  │ ApplicationHostProxy │────▶│ HostActivator             │  │
//! │  │ InProcess / Single / │     │ (processes, containers)   │  │
//! │  │ MultiCodePackage     │     └───────────────────────────┘  │
//! │  └──────────────────────┘                                    │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//!                               │ Unix socket
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │          nodehost-agent (container activator service)        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use nodehost_core::{
//!     ApplicationId, ApplicationPackageDescription, EnvironmentManager, HostingConfig,
//!     InMemoryAccountStore, IpcActivatorClient, IpcClient, NodeConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> nodehost_core::Result<()> {
//! let node = NodeConfig::from_env();
//! let config = HostingConfig::from_env();
//! let ipc = IpcClient::connect(std::path::Path::new("/run/nodehost/activator.sock")).await?;
//! let activator = Arc::new(IpcActivatorClient::new(Arc::new(ipc)));
//!
//! let environment = EnvironmentManager::new(node, config, activator, Arc::new(InMemoryAccountStore::new()));
//! environment.open().await?;
//!
//! let app_id = ApplicationId::new("Calc", 1);
//! let package = ApplicationPackageDescription::default();
//! let context = environment
//!     .setup_application(&app_id, &package, std::time::Duration::from_secs(30))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Host Proxies**: Per-variant lifecycle of application hosts
//! - **Environment Setup**: Principals, endpoints, containers and diagnostics with rollback
//! - **Security Principals**: Account state machine with deferred user creation
//! - **Content Cleanup**: Periodic deletion of orphaned application content
//! - **IPC**: Line-delimited JSON-RPC over Unix sockets

pub mod activator;
pub mod config;
pub mod context;
pub mod deletion;
pub mod environment;
pub mod error;
pub mod host;
pub mod ids;
pub mod ipc;
pub mod layout;
pub mod model;
pub mod principals;
pub mod resources;

pub use activator::{ActivatorClient, IpcActivatorClient};
pub use config::{HostingConfig, HostingConfigBuilder, NodeConfig};
pub use context::{ApplicationHostContext, ApplicationHostType, CodePackageContext, EnvironmentMap};
pub use deletion::{
    ApplicationQueryClient, ApplicationTracker, DeletionManager, DeletionStats, ProvisionedPackages,
    SecurityGroupCleaner,
};
pub use environment::{
    ApplicationEnvironmentContext, EnvironmentManager, ServicePackageInstanceEnvironmentContext,
};
pub use error::{ErrorCode, HostingError, Result};
pub use host::{
    create_application_host_proxy, ApplicationHostIsolationContext, ApplicationHostProxy,
    ApplicationHostRegistry, CodePackageActivation, HostProxyState, HostingHolder,
};
pub use ids::{
    ApplicationId, CodePackageInstanceId, HostId, ServicePackageId, ServicePackageInstanceId,
};
pub use ipc::{IpcClient, IpcServer, RequestHandler};
pub use model::{
    ApplicationPackageDescription, CodePackageDescription, EndpointDescription, EntryPointType,
    ServicePackageDescription,
};
pub use principals::{AccountStore, FileAccountStore, InMemoryAccountStore, PrincipalsProvider};
