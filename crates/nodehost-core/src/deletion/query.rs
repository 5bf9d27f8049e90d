//! What the deletion scans ask the rest of the cluster.

use crate::error::Result;
use crate::ids::ApplicationId;
use crate::environment::EnvironmentManager;
use crate::principals::PrincipalsProvider;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Packages of an application type still provisioned in the cluster.
///
/// Package ids are `"<service manifest>:<package>:<version>"` and manifest
/// ids `"<service manifest>:<version>"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProvisionedPackages {
    #[serde(default)]
    pub code_packages: Vec<String>,
    #[serde(default)]
    pub config_packages: Vec<String>,
    #[serde(default)]
    pub data_packages: Vec<String>,
    #[serde(default)]
    pub service_manifests: Vec<String>,
}

impl ProvisionedPackages {
    /// Code, config and data package ids together.
    pub fn packages(&self) -> impl Iterator<Item = &String> {
        self.code_packages
            .iter()
            .chain(&self.config_packages)
            .chain(&self.data_packages)
    }
}

/// Authoritative application state, owned by the cluster manager.
#[async_trait]
pub trait ApplicationQueryClient: Send + Sync {
    /// Which of `application_ids` are deleted cluster-wide.
    async fn get_deleted_applications(
        &self,
        application_ids: Vec<String>,
        timeout: Duration,
    ) -> Result<Vec<String>>;

    async fn get_provisioned_packages(
        &self,
        application_type: &str,
        timeout: Duration,
    ) -> Result<ProvisionedPackages>;
}

/// Applications currently active on this node.
pub trait ApplicationTracker: Send + Sync {
    fn contains(&self, app_id: &ApplicationId) -> Result<bool>;
}

/// Removes the local security groups of deleted applications.
#[async_trait]
pub trait SecurityGroupCleaner: Send + Sync {
    /// Returns the ids whose group is gone.
    async fn cleanup_application_security_groups(&self, application_ids: &[String]) -> Result<Vec<ApplicationId>>;
}

#[async_trait]
impl SecurityGroupCleaner for PrincipalsProvider {
    async fn cleanup_application_security_groups(&self, application_ids: &[String]) -> Result<Vec<ApplicationId>> {
        PrincipalsProvider::cleanup_application_security_groups(self, application_ids).await
    }
}

#[async_trait]
impl SecurityGroupCleaner for EnvironmentManager {
    async fn cleanup_application_security_groups(&self, application_ids: &[String]) -> Result<Vec<ApplicationId>> {
        self.principals().cleanup_application_security_groups(application_ids).await
    }
}

/// Split a package id into manifest name, package name and version.
pub(crate) fn parse_package_id(id: &str) -> Option<(&str, &str, &str)> {
    let mut tokens = id.split(':').filter(|t| !t.is_empty());
    Some((tokens.next()?, tokens.next()?, tokens.next()?))
}

/// Split a manifest id into manifest name and version.
pub(crate) fn parse_manifest_id(id: &str) -> Option<(&str, &str)> {
    let mut tokens = id.split(':').filter(|t| !t.is_empty());
    Some((tokens.next()?, tokens.next()?))
}
