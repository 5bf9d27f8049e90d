//! Crash dump, trace session and log collection registrations.

use crate::error::{HostingError, Result};
use crate::ids::ApplicationId;
use crate::layout::RunLayout;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tokio::sync::RwLock;

/// Crash dump folder name under an application's log folder.
pub const CRASH_DUMPS_FOLDER_NAME: &str = "CrashDumps";

/// Node-wide diagnostics registrations of deployed applications.
#[derive(Debug)]
pub struct DiagnosticsProvider {
    layout: RunLayout,
    /// Application id to crash dump folder.
    crash_dump_folders: RwLock<HashMap<String, PathBuf>>,
    /// Service package identifier to the executables whose dumps are collected.
    crash_dump_programs: RwLock<BTreeMap<String, Vec<String>>>,
    /// Service package identifier to trace session name.
    trace_sessions: RwLock<BTreeMap<String, String>>,
    /// Application id to collected log folders.
    log_collection: RwLock<HashMap<String, Vec<PathBuf>>>,
}

impl DiagnosticsProvider {
    pub fn new(layout: RunLayout) -> Self {
        Self {
            layout,
            crash_dump_folders: RwLock::new(HashMap::new()),
            crash_dump_programs: RwLock::new(BTreeMap::new()),
            trace_sessions: RwLock::new(BTreeMap::new()),
            log_collection: RwLock::new(HashMap::new()),
        }
    }

    pub fn crash_dump_folder(&self, app_id: &ApplicationId) -> PathBuf {
        self.layout.log_folder(app_id).join(CRASH_DUMPS_FOLDER_NAME)
    }

    /// Create the crash dump folder of an application.
    pub async fn setup_application_crash_dumps(&self, app_id: &ApplicationId) -> Result<()> {
        let folder = self.crash_dump_folder(app_id);
        tokio::fs::create_dir_all(&folder).await?;
        tracing::debug!(app_id = %app_id, folder = %folder.display(), "Crash dump folder ready");
        self.crash_dump_folders
            .write()
            .await
            .insert(app_id.to_string(), folder);
        Ok(())
    }

    pub async fn cleanup_application_crash_dumps(&self, app_id: &ApplicationId) -> Result<()> {
        self.crash_dump_folders.write().await.remove(&app_id.to_string());
        Ok(())
    }

    /// Collect dumps of `programs` started for a service package.
    pub async fn setup_service_package_crash_dumps(
        &self,
        app_id: &ApplicationId,
        service_package_identifier: &str,
        programs: Vec<String>,
    ) -> Result<()> {
        if !self
            .crash_dump_folders
            .read()
            .await
            .contains_key(&app_id.to_string())
        {
            return Err(HostingError::NotFound(format!("crash dump folder of {app_id}")));
        }
        self.crash_dump_programs
            .write()
            .await
            .insert(service_package_identifier.to_string(), programs);
        Ok(())
    }

    pub async fn cleanup_service_package_crash_dumps(&self, service_package_identifier: &str) -> Result<()> {
        self.crash_dump_programs
            .write()
            .await
            .remove(service_package_identifier);
        Ok(())
    }

    pub async fn setup_trace_session(&self, service_package_identifier: &str) -> Result<()> {
        let session = format!("nodehost-{service_package_identifier}");
        self.trace_sessions
            .write()
            .await
            .insert(service_package_identifier.to_string(), session);
        Ok(())
    }

    pub async fn cleanup_trace_session(&self, service_package_identifier: &str) -> Result<()> {
        self.trace_sessions
            .write()
            .await
            .remove(service_package_identifier);
        Ok(())
    }

    /// Register the folders collected for an application, creating them.
    pub async fn add_log_collection_paths(&self, app_id: &ApplicationId, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            tokio::fs::create_dir_all(path).await?;
        }
        self.log_collection
            .write()
            .await
            .entry(app_id.to_string())
            .or_default()
            .extend(paths.iter().cloned());
        Ok(())
    }

    pub async fn remove_log_collection_paths(&self, app_id: &ApplicationId) -> Result<()> {
        self.log_collection.write().await.remove(&app_id.to_string());
        Ok(())
    }

    pub async fn log_collection_paths(&self, app_id: &ApplicationId) -> Vec<PathBuf> {
        self.log_collection
            .read()
            .await
            .get(&app_id.to_string())
            .cloned()
            .unwrap_or_default()
    }

    pub async fn crash_dump_programs(&self, service_package_identifier: &str) -> Option<Vec<String>> {
        self.crash_dump_programs
            .read()
            .await
            .get(service_package_identifier)
            .cloned()
    }

    pub async fn has_trace_session(&self, service_package_identifier: &str) -> bool {
        self.trace_sessions
            .read()
            .await
            .contains_key(service_package_identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_service_package_needs_application_crash_dumps() {
        let dir = tempfile::tempdir().unwrap();
        let provider = DiagnosticsProvider::new(RunLayout::new(dir.path()));
        let app = ApplicationId::new("Calc", 1);

        let err = provider
            .setup_service_package_crash_dumps(&app, "Calc_App1:Front:0", vec!["front".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, HostingError::NotFound(_)));

        provider.setup_application_crash_dumps(&app).await.unwrap();
        assert!(provider.crash_dump_folder(&app).is_dir());
        provider
            .setup_service_package_crash_dumps(&app, "Calc_App1:Front:0", vec!["front".into()])
            .await
            .unwrap();
        assert_eq!(
            provider.crash_dump_programs("Calc_App1:Front:0").await,
            Some(vec!["front".to_string()])
        );

        provider
            .cleanup_service_package_crash_dumps("Calc_App1:Front:0")
            .await
            .unwrap();
        assert!(provider.crash_dump_programs("Calc_App1:Front:0").await.is_none());
    }

    #[tokio::test]
    async fn test_log_collection_paths() {
        let dir = tempfile::tempdir().unwrap();
        let provider = DiagnosticsProvider::new(RunLayout::new(dir.path()));
        let app = ApplicationId::new("Calc", 1);
        let path = dir.path().join("Calc_App1/log/app");

        provider.add_log_collection_paths(&app, &[path.clone()]).await.unwrap();
        assert!(path.is_dir());
        assert_eq!(provider.log_collection_paths(&app).await, vec![path]);

        provider.remove_log_collection_paths(&app).await.unwrap();
        assert!(provider.log_collection_paths(&app).await.is_empty());
    }
}
