//! On-disk layout of deployed applications and cached packages.
//!
//! Two shapes exist. The run layout is one folder per application instance
//! under the deployment folder. The store layout groups package content by
//! application type and is used by both the image cache and the shared
//! package folder.

use crate::ids::ApplicationId;
use std::path::{Path, PathBuf};

/// Name of the shared package folder under the deployment folder.
pub const SHARED_FOLDER_NAME: &str = "_shared";

/// Name of the store folder under the image cache and shared folders.
pub const STORE_FOLDER_NAME: &str = "Store";

/// Marker written into a folder once its archive is fully extracted.
pub const ARCHIVE_MARKER_FILE_NAME: &str = ".extracted";

pub const CHECKSUM_EXTENSION: &str = "checksum";
pub const ARCHIVE_EXTENSION: &str = "zip";

/// Sibling lock taken while image cache content is written or deleted.
pub const CACHE_LOCK_EXTENSION: &str = "CacheLock";

/// Per-instance folders that are never package content.
pub const TRANSIENT_FOLDER_NAMES: [&str; 5] = ["apps", "work", "temp", "log", "settings"];

/// Folder suffixes of in-flight package writes.
pub const TRANSIENT_FOLDER_SUFFIXES: [&str; 2] = [".new", ".isstmp"];

/// Append `.<extension>` to the final component of `path`.
pub fn with_suffix(path: &Path, extension: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".");
    os.push(extension);
    PathBuf::from(os)
}

/// Checksum file guarding `path`.
pub fn checksum_file(path: &Path) -> PathBuf {
    with_suffix(path, CHECKSUM_EXTENSION)
}

/// Archive a package folder is extracted from.
pub fn archive_file(folder: &Path) -> PathBuf {
    with_suffix(folder, ARCHIVE_EXTENSION)
}

pub fn cache_lock_file(path: &Path) -> PathBuf {
    with_suffix(path, CACHE_LOCK_EXTENSION)
}

fn manifest_file_name(service_manifest_name: &str, version: &str) -> String {
    format!("{service_manifest_name}.Manifest.{version}.xml")
}

fn package_folder_name(service_manifest_name: &str, package_name: &str, version: &str) -> String {
    format!("{service_manifest_name}.{package_name}.{version}")
}

// ============================================================================
// Run layout
// ============================================================================

/// Paths under the deployment folder.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn application_folder(&self, app_id: &ApplicationId) -> PathBuf {
        self.root.join(app_id.to_string())
    }

    pub fn work_folder(&self, app_id: &ApplicationId) -> PathBuf {
        self.application_folder(app_id).join("work")
    }

    pub fn log_folder(&self, app_id: &ApplicationId) -> PathBuf {
        self.application_folder(app_id).join("log")
    }

    pub fn temp_folder(&self, app_id: &ApplicationId) -> PathBuf {
        self.application_folder(app_id).join("temp")
    }

    /// Principal name to SID map read by code packages.
    pub fn principal_sids_file(&self, app_id: &ApplicationId) -> PathBuf {
        self.work_folder(app_id).join("PrincipalSids.json")
    }

    /// Endpoint descriptor of one service package activation.
    pub fn endpoint_descriptor_file(
        &self,
        app_id: &ApplicationId,
        service_package_name: &str,
        activation_id: &str,
    ) -> PathBuf {
        let name = if activation_id.is_empty() {
            format!("{service_package_name}.Endpoints.json")
        } else {
            format!("{service_package_name}.{activation_id}.Endpoints.json")
        };
        self.work_folder(app_id).join(name)
    }

    /// Folder container certificates are exported to.
    pub fn certificates_folder(&self, app_id: &ApplicationId, service_package_name: &str) -> PathBuf {
        self.work_folder(app_id)
            .join(format!("Certificates_{service_package_name}"))
    }

    pub fn service_manifest_file(
        &self,
        app_id: &ApplicationId,
        service_manifest_name: &str,
        version: &str,
    ) -> PathBuf {
        self.application_folder(app_id)
            .join(manifest_file_name(service_manifest_name, version))
    }

    /// Code, config or data package folder of an instance.
    ///
    /// `linked` selects the versionless name used when the folder is a
    /// symbolic link into the shared folder.
    pub fn package_folder(
        &self,
        app_id: &ApplicationId,
        service_manifest_name: &str,
        package_name: &str,
        version: &str,
        linked: bool,
    ) -> PathBuf {
        let name = if linked {
            format!("{service_manifest_name}.{package_name}")
        } else {
            package_folder_name(service_manifest_name, package_name, version)
        };
        self.application_folder(app_id).join(name)
    }

    /// Per-code-package counter used to number container log folders.
    pub fn code_package_instance_counter_file(
        &self,
        app_id: &ApplicationId,
        service_package_name: &str,
        code_package_name: &str,
    ) -> PathBuf {
        self.log_folder(app_id)
            .join("Containers")
            .join(format!("{service_package_name}_{code_package_name}"))
            .join("codepackageinstanceid")
    }
}

// ============================================================================
// Store layout
// ============================================================================

/// Paths under `<root>/Store/<application type>`.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    store: PathBuf,
}

impl StoreLayout {
    /// Store layout of a folder that contains a `Store` subfolder.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            store: root.as_ref().join(STORE_FOLDER_NAME),
        }
    }

    /// Store layout of the shared folder under `deployment_folder`.
    pub fn shared(deployment_folder: impl AsRef<Path>) -> Self {
        Self::new(deployment_folder.as_ref().join(SHARED_FOLDER_NAME))
    }

    pub fn store_folder(&self) -> &Path {
        &self.store
    }

    pub fn application_type_folder(&self, application_type: &str) -> PathBuf {
        self.store.join(application_type)
    }

    pub fn service_manifest_file(
        &self,
        application_type: &str,
        service_manifest_name: &str,
        version: &str,
    ) -> PathBuf {
        self.application_type_folder(application_type)
            .join(manifest_file_name(service_manifest_name, version))
    }

    pub fn service_manifest_checksum_file(
        &self,
        application_type: &str,
        service_manifest_name: &str,
        version: &str,
    ) -> PathBuf {
        checksum_file(&self.service_manifest_file(application_type, service_manifest_name, version))
    }

    pub fn package_folder(
        &self,
        application_type: &str,
        service_manifest_name: &str,
        package_name: &str,
        version: &str,
    ) -> PathBuf {
        self.application_type_folder(application_type)
            .join(package_folder_name(service_manifest_name, package_name, version))
    }

    pub fn package_checksum_file(
        &self,
        application_type: &str,
        service_manifest_name: &str,
        package_name: &str,
        version: &str,
    ) -> PathBuf {
        checksum_file(&self.package_folder(application_type, service_manifest_name, package_name, version))
    }

    /// Per-instance subtree kept under an application type.
    pub fn application_instance_folder(&self, app_id: &ApplicationId) -> PathBuf {
        self.application_type_folder(&app_id.application_type_name)
            .join("apps")
            .join(app_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_layout_paths() {
        let layout = RunLayout::new("/d");
        let app = ApplicationId::new("Calc", 3);

        assert_eq!(layout.principal_sids_file(&app), PathBuf::from("/d/Calc_App3/work/PrincipalSids.json"));
        assert_eq!(
            layout.endpoint_descriptor_file(&app, "Front", ""),
            PathBuf::from("/d/Calc_App3/work/Front.Endpoints.json")
        );
        assert_eq!(
            layout.endpoint_descriptor_file(&app, "Front", "a1"),
            PathBuf::from("/d/Calc_App3/work/Front.a1.Endpoints.json")
        );
        assert_eq!(
            layout.certificates_folder(&app, "Front"),
            PathBuf::from("/d/Calc_App3/work/Certificates_Front")
        );
        assert_eq!(
            layout.package_folder(&app, "Front", "Code", "1.0", false),
            PathBuf::from("/d/Calc_App3/Front.Code.1.0")
        );
        assert_eq!(
            layout.package_folder(&app, "Front", "Code", "1.0", true),
            PathBuf::from("/d/Calc_App3/Front.Code")
        );
    }

    #[test]
    fn test_store_layout_paths() {
        let cache = StoreLayout::new("/cache");
        assert_eq!(
            cache.package_checksum_file("CalcType", "Front", "Code", "1.0"),
            PathBuf::from("/cache/Store/CalcType/Front.Code.1.0.checksum")
        );
        assert_eq!(
            cache.service_manifest_checksum_file("CalcType", "Front", "1.0"),
            PathBuf::from("/cache/Store/CalcType/Front.Manifest.1.0.xml.checksum")
        );
        assert_eq!(
            cache.application_instance_folder(&ApplicationId::new("CalcType", 2)),
            PathBuf::from("/cache/Store/CalcType/apps/CalcType_App2")
        );

        let shared = StoreLayout::shared("/d");
        assert_eq!(shared.store_folder(), Path::new("/d/_shared/Store"));
    }

    #[test]
    fn test_suffix_helpers() {
        let folder = Path::new("/x/Front.Code.1.0");
        assert_eq!(archive_file(folder), PathBuf::from("/x/Front.Code.1.0.zip"));
        assert_eq!(cache_lock_file(folder), PathBuf::from("/x/Front.Code.1.0.CacheLock"));
    }
}
