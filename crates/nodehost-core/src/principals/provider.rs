//! Per-node registry of application principals.

use crate::error::{ErrorCode, HostingError, Result};
use crate::ids::ApplicationId;
use crate::principals::application::{
    ApplicationPrincipals, ConfigureSecurityPrincipalRequest, PrincipalInformation,
    PrincipalsSettings, SecurityPrincipal,
};
use crate::principals::lock::NamedLocks;
use crate::principals::store::AccountStore;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Principal SIDs handed to an application's environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrincipalsProviderContext {
    principals: Vec<PrincipalInformation>,
}

impl PrincipalsProviderContext {
    pub fn new(principals: Vec<PrincipalInformation>) -> Self {
        Self { principals }
    }

    pub fn principals(&self) -> &[PrincipalInformation] {
        &self.principals
    }

    pub fn is_empty(&self) -> bool {
        self.principals.is_empty()
    }

    /// SID of the principal with logical name `name`.
    pub fn get_principal_id(&self, name: &str) -> Result<String> {
        self.principals
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.sid.clone())
            .ok_or_else(|| HostingError::NotFound(format!("principal {name}")))
    }

    /// Logical name to SID, as persisted in the principal SIDs file.
    pub fn principal_sids(&self) -> BTreeMap<String, String> {
        self.principals
            .iter()
            .map(|p| (p.name.clone(), p.sid.clone()))
            .collect()
    }
}

/// Run blocking account work off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| HostingError::OperationFailed(format!("principals task failed: {e}")))?
}

/// Owns one [`ApplicationPrincipals`] per application on this node.
pub struct PrincipalsProvider {
    node_id: String,
    settings: PrincipalsSettings,
    store: Arc<dyn AccountStore>,
    locks: NamedLocks,
    principals: RwLock<HashMap<String, Arc<ApplicationPrincipals>>>,
}

impl PrincipalsProvider {
    pub fn new(
        node_id: impl Into<String>,
        settings: PrincipalsSettings,
        store: Arc<dyn AccountStore>,
        locks: NamedLocks,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            settings,
            store,
            locks,
            principals: RwLock::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Set up the principals of `request.application_id`.
    ///
    /// An application that is already set up is updated when the request
    /// asks for it and left as is otherwise.
    pub async fn setup(&self, request: ConfigureSecurityPrincipalRequest) -> Result<PrincipalsProviderContext> {
        let app_id = request.application_id.clone();
        let existing = self.principals.read().await.get(&app_id).cloned();

        let principals = match existing {
            Some(principals) => {
                if request.update_existing {
                    let target = Arc::clone(&principals);
                    blocking(move || target.update_application_principals(request)).await?;
                }
                principals
            }
            None => {
                let principals = ApplicationPrincipals::new(
                    request,
                    self.settings.clone(),
                    Arc::clone(&self.store),
                    self.locks.clone(),
                );
                let target = Arc::clone(&principals);
                if let Err(e) = blocking(move || target.open()).await {
                    tracing::warn!(app_id = %app_id, error = %e, "Principal setup failed, aborting");
                    let target = Arc::clone(&principals);
                    blocking(move || {
                        target.abort();
                        Ok(())
                    })
                    .await?;
                    return Err(e);
                }
                self.principals
                    .write()
                    .await
                    .insert(app_id.clone(), Arc::clone(&principals));
                principals
            }
        };

        let information = blocking(move || principals.get_security_principal_information()).await?;
        tracing::info!(app_id = %app_id, principals = information.len(), "Principals set up");
        Ok(PrincipalsProviderContext::new(information))
    }

    /// Close an application's principals, deleting the accounts when `remove` is set.
    pub async fn cleanup(&self, application_id: &str, remove: bool) -> Result<()> {
        let Some(principals) = self.principals.write().await.remove(application_id) else {
            tracing::debug!(app_id = %application_id, "No principals to clean up");
            return Ok(());
        };
        blocking(move || principals.close_application_principals(remove)).await
    }

    pub async fn get_principal_information(&self, application_id: &str) -> Result<Vec<PrincipalInformation>> {
        let principals = self.lookup(application_id).await?;
        blocking(move || principals.get_security_principal_information()).await
    }

    pub async fn get_security_user(&self, application_id: &str, name: &str) -> Result<SecurityPrincipal> {
        let principals = self.lookup(application_id).await?;
        let name = name.to_string();
        blocking(move || principals.get_security_user(&name)).await
    }

    async fn lookup(&self, application_id: &str) -> Result<Arc<ApplicationPrincipals>> {
        self.principals
            .read()
            .await
            .get(application_id)
            .cloned()
            .ok_or_else(|| HostingError::NotFound(format!("principals of {application_id}")))
    }

    /// Delete the local groups of deleted applications.
    ///
    /// Returns the ids whose group is gone, including groups that never existed.
    pub async fn cleanup_application_security_groups(&self, application_ids: &[String]) -> Result<Vec<ApplicationId>> {
        let mut parsed = Vec::with_capacity(application_ids.len());
        for id in application_ids {
            parsed.push(id.parse::<ApplicationId>()?);
        }

        let store = Arc::clone(&self.store);
        let node_id = self.node_id.clone();
        blocking(move || {
            let mut deleted = Vec::with_capacity(parsed.len());
            for app_id in parsed {
                let group = ApplicationPrincipals::application_local_group_name(&node_id, app_id.application_number);
                match store.delete_account(&group) {
                    Ok(()) => tracing::info!(app_id = %app_id, group = %group, "Deleted application group"),
                    Err(e) if e.is(ErrorCode::NotFound) => {
                        tracing::debug!(app_id = %app_id, group = %group, "Application group already gone")
                    }
                    Err(e) => {
                        tracing::warn!(app_id = %app_id, group = %group, error = %e, "Deleting application group failed");
                        return Err(e);
                    }
                }
                deleted.push(app_id);
            }
            Ok(deleted)
        })
        .await
    }

    /// Sweep accounts left behind by `node_id`, optionally for one application.
    pub async fn cleanup_environment(&self, node_id: &str, application_id: &str) -> Result<()> {
        let store = Arc::clone(&self.store);
        let locks = self.locks.clone();
        let node_id = node_id.to_string();
        let application_id = application_id.to_string();
        blocking(move || {
            ApplicationPrincipals::cleanup_environment(store.as_ref(), &locks, &node_id, &application_id);
            Ok(())
        })
        .await
    }

    /// Close every application's principals.
    pub async fn close(&self) {
        let all: Vec<_> = self.principals.write().await.drain().collect();
        for (app_id, principals) in all {
            if let Err(e) = blocking(move || principals.close()).await {
                tracing::warn!(app_id = %app_id, error = %e, "Closing principals failed");
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.principals.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PrincipalsDescription, SecurityGroupDescription, SecurityUserDescription};
    use crate::principals::store::{AccountKind, AccountSpec, InMemoryAccountStore};
    use std::time::Duration;

    fn provider(dir: &std::path::Path, store: Arc<InMemoryAccountStore>) -> PrincipalsProvider {
        PrincipalsProvider::new(
            "N1",
            PrincipalsSettings {
                ntlm_authentication_enabled: false,
                user_creation_retry_timeout: Duration::from_secs(1),
            },
            store,
            NamedLocks::new(dir),
        )
    }

    fn request(app_id: &str, counter: u32) -> ConfigureSecurityPrincipalRequest {
        ConfigureSecurityPrincipalRequest {
            application_id: app_id.into(),
            node_id: "N1".into(),
            application_package_counter: counter,
            principals: PrincipalsDescription {
                users: vec![SecurityUserDescription::local("Worker")],
                groups: vec![SecurityGroupDescription::new("Readers")],
            },
            allowed_user_creation_failure_count: 0,
            update_existing: false,
        }
    }

    #[tokio::test]
    async fn test_setup_returns_sids() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryAccountStore::new());
        let provider = provider(dir.path(), store.clone());

        let context = provider.setup(request("Calc_App1", 1)).await.unwrap();
        assert_eq!(context.principals().len(), 2);
        assert!(context.get_principal_id("Worker").unwrap().starts_with("S-1-5-21-"));
        assert!(matches!(context.get_principal_id("Nobody"), Err(HostingError::NotFound(_))));
        assert_eq!(context.principal_sids().len(), 2);

        // A second setup reuses the existing principals.
        let again = provider.setup(request("Calc_App1", 1)).await.unwrap();
        assert_eq!(again, context);
        assert_eq!(provider.len().await, 1);
    }

    #[tokio::test]
    async fn test_abortable_setup_is_aborted_and_not_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryAccountStore::new());
        let provider = provider(dir.path(), store.clone());

        let mut request = request("Calc_App2", 2);
        request.principals.users[0].x509_find_value = "ABCD".into();
        let err = provider.setup(request).await.unwrap_err();

        assert!(matches!(err, HostingError::ApplicationPrincipalAbortable));
        assert_eq!(provider.len().await, 0);
        // The group created before the user failed was removed by the abort.
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_removes_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryAccountStore::new());
        let provider = provider(dir.path(), store.clone());

        provider.setup(request("Calc_App1", 1)).await.unwrap();
        provider.cleanup("Calc_App1", true).await.unwrap();

        assert_eq!(provider.len().await, 0);
        // The per-application group outlives the principals.
        assert_eq!(store.len(), 1);
        assert!(provider.get_principal_information("Calc_App1").await.is_err());
        provider.cleanup("Calc_App1", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_application_security_groups() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryAccountStore::new());
        store
            .create_account("WF-App-4-N1", &AccountSpec::new(AccountKind::Group, "x"))
            .unwrap();
        let provider = provider(dir.path(), store.clone());

        let deleted = provider
            .cleanup_application_security_groups(&["Calc_App4".into(), "Other_App9".into()])
            .await
            .unwrap();
        assert_eq!(deleted, vec![ApplicationId::new("Calc", 4), ApplicationId::new("Other", 9)]);
        assert!(store.is_empty());

        let err = provider
            .cleanup_application_security_groups(&["garbage".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, HostingError::InvalidArgument(_)));
    }
}
