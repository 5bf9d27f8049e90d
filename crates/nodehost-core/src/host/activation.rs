//! Inputs shared by every application host proxy.

use crate::config::{HostingConfig, NodeConfig};
use crate::context::CodePackageContext;
use crate::host::client::ApplicationHostClient;
use crate::host::environment::ClientCredentialIssuer;
use crate::host::launcher::HostActivator;
use crate::ids::{CodePackageInstanceId, ServicePackageInstanceId};
use crate::layout::RunLayout;
use crate::model::{CodePackageDescription, EntryPointType};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Node services a proxy needs to start, reach and stop its host.
pub struct HostingHolder {
    pub node: NodeConfig,
    pub config: HostingConfig,
    pub layout: RunLayout,
    pub activator: Arc<dyn HostActivator>,
    pub client: Arc<dyn ApplicationHostClient>,
    pub credentials: Arc<dyn ClientCredentialIssuer>,
}

impl HostingHolder {
    pub fn new(
        node: NodeConfig,
        config: HostingConfig,
        activator: Arc<dyn HostActivator>,
        client: Arc<dyn ApplicationHostClient>,
        credentials: Arc<dyn ClientCredentialIssuer>,
    ) -> Self {
        let layout = RunLayout::new(&node.deployment_folder);
        Self {
            node,
            config,
            layout,
            activator,
            client,
            credentials,
        }
    }
}

/// One code package about to be activated.
#[derive(Debug, Clone)]
pub struct CodePackageActivation {
    pub context: CodePackageContext,
    pub description: CodePackageDescription,
    /// Principal the host runs as; empty for the node's own account.
    pub run_as_id: String,
    /// Executable started for `Exe` and multi-code-package hosts.
    pub program: String,
    pub arguments: Vec<String>,
    /// Activation id to the service name it was created for.
    pub exclusive_service_names: BTreeMap<String, String>,
}

impl CodePackageActivation {
    pub fn new(context: CodePackageContext, description: CodePackageDescription) -> Self {
        Self {
            context,
            description,
            run_as_id: String::new(),
            program: String::new(),
            arguments: Vec::new(),
            exclusive_service_names: BTreeMap::new(),
        }
    }

    pub fn code_package_instance_id(&self) -> &CodePackageInstanceId {
        &self.context.code_package_instance_id
    }

    pub fn service_package_instance_id(&self) -> &ServicePackageInstanceId {
        &self.context.code_package_instance_id.service_package_instance_id
    }

    pub fn entry_point_type(&self) -> EntryPointType {
        self.description.entry_point_type
    }
}

/// Key deciding which activations share one host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ApplicationHostIsolationContext {
    /// A host of its own for one code package.
    CodePackage(CodePackageInstanceId),
    /// A host shared by the code packages of a service package that run as
    /// the same principal.
    ServicePackage {
        run_as_id: String,
        service_package_instance_id: ServicePackageInstanceId,
    },
}

impl ApplicationHostIsolationContext {
    /// Isolation an activation gets under `config`.
    pub fn for_activation(config: &HostingConfig, activation: &CodePackageActivation) -> Self {
        let dedicated = (activation.description.is_implicit_type_host && config.in_process_hosting_enabled)
            || matches!(
                activation.entry_point_type(),
                EntryPointType::Exe | EntryPointType::ContainerHost
            );
        if dedicated {
            Self::CodePackage(activation.code_package_instance_id().clone())
        } else {
            Self::ServicePackage {
                run_as_id: activation.run_as_id.clone(),
                service_package_instance_id: activation.service_package_instance_id().clone(),
            }
        }
    }

    pub fn service_package_instance_id(&self) -> &ServicePackageInstanceId {
        match self {
            Self::CodePackage(id) => &id.service_package_instance_id,
            Self::ServicePackage {
                service_package_instance_id,
                ..
            } => service_package_instance_id,
        }
    }
}

impl fmt::Display for ApplicationHostIsolationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CodePackage(id) => write!(f, "CodePackage({id})"),
            Self::ServicePackage {
                run_as_id,
                service_package_instance_id,
            } => write!(f, "ServicePackage({service_package_instance_id}, RunAs={run_as_id})"),
        }
    }
}
