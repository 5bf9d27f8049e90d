//! Application hosts: the processes and containers code packages run in.

pub mod activation;
pub mod client;
pub mod environment;
pub mod launcher;
pub mod proxy;
pub mod registry;
pub mod state;

pub use activation::{ApplicationHostIsolationContext, CodePackageActivation, HostingHolder};
pub use client::{ApplicationHostClient, IpcApplicationHostClient};
pub use environment::{ClientCredential, ClientCredentialIssuer, EphemeralCredentialIssuer};
pub use launcher::{HostActivationRequest, HostActivator, HostTermination, ProcessHostActivator};
pub use proxy::{create_application_host_proxy, ApplicationHostProxy, ProxyCore};
pub use registry::ApplicationHostRegistry;
pub use state::HostProxyState;
