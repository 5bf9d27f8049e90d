//! Identifiers for applications, service packages, code packages and hosts.

use crate::error::HostingError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Type name of the built-in system application.
pub const SYSTEM_APPLICATION_TYPE: &str = "__FabricSystem";

/// Application number of the built-in system application.
pub const SYSTEM_APPLICATION_NUMBER: u32 = u32::MAX;

/// Identifies one application instance on a node, formatted `<Type>_App<N>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApplicationId {
    pub application_type_name: String,
    pub application_number: u32,
}

impl ApplicationId {
    pub fn new(application_type_name: impl Into<String>, application_number: u32) -> Self {
        Self {
            application_type_name: application_type_name.into(),
            application_number,
        }
    }

    /// The system application, whose accounts are shared by every node process.
    pub fn system() -> Self {
        Self::new(SYSTEM_APPLICATION_TYPE, SYSTEM_APPLICATION_NUMBER)
    }

    pub fn is_system(&self) -> bool {
        self.application_type_name == SYSTEM_APPLICATION_TYPE
            && self.application_number == SYSTEM_APPLICATION_NUMBER
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_App{}", self.application_type_name, self.application_number)
    }
}

impl FromStr for ApplicationId {
    type Err = HostingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (type_name, number) = s
            .rsplit_once("_App")
            .ok_or_else(|| HostingError::InvalidArgument(format!("not an application id: {s}")))?;
        if type_name.is_empty() {
            return Err(HostingError::InvalidArgument(format!(
                "not an application id: {s}"
            )));
        }
        let number = number
            .parse()
            .map_err(|_| HostingError::InvalidArgument(format!("not an application id: {s}")))?;
        Ok(Self::new(type_name, number))
    }
}

/// A service package within an application, formatted `<ApplicationId>:<Name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServicePackageId {
    pub application_id: ApplicationId,
    pub service_package_name: String,
}

impl ServicePackageId {
    pub fn new(application_id: ApplicationId, service_package_name: impl Into<String>) -> Self {
        Self {
            application_id,
            service_package_name: service_package_name.into(),
        }
    }
}

impl fmt::Display for ServicePackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.application_id, self.service_package_name)
    }
}

/// One activation of a service package.
///
/// Shared activations carry an empty activation id; exclusive activations
/// carry the GUID of the owning partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServicePackageInstanceId {
    pub service_package_id: ServicePackageId,
    #[serde(default)]
    pub activation_id: String,
}

impl ServicePackageInstanceId {
    pub fn new(service_package_id: ServicePackageId, activation_id: impl Into<String>) -> Self {
        Self {
            service_package_id,
            activation_id: activation_id.into(),
        }
    }

    /// Shared activation of a service package.
    pub fn shared(service_package_id: ServicePackageId) -> Self {
        Self::new(service_package_id, "")
    }

    pub fn application_id(&self) -> &ApplicationId {
        &self.service_package_id.application_id
    }

    pub fn service_package_name(&self) -> &str {
        &self.service_package_id.service_package_name
    }

    pub fn is_exclusive(&self) -> bool {
        !self.activation_id.is_empty()
    }
}

impl fmt::Display for ServicePackageInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.activation_id.is_empty() {
            write!(f, "{}", self.service_package_id)
        } else {
            write!(f, "{}:{}", self.service_package_id, self.activation_id)
        }
    }
}

/// One code package of a service package instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CodePackageInstanceId {
    pub service_package_instance_id: ServicePackageInstanceId,
    pub code_package_name: String,
}

impl CodePackageInstanceId {
    pub fn new(
        service_package_instance_id: ServicePackageInstanceId,
        code_package_name: impl Into<String>,
    ) -> Self {
        Self {
            service_package_instance_id,
            code_package_name: code_package_name.into(),
        }
    }
}

impl fmt::Display for CodePackageInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.service_package_instance_id, self.code_package_name
        )
    }
}

/// Unique identifier for an application host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostId(Uuid);

impl HostId {
    /// Create a new random host ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for HostId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for HostId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for HostId {
    type Err = HostingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| HostingError::InvalidArgument(format!("invalid host id {s}: {e}")))
    }
}
