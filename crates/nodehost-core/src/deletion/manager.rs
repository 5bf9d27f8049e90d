//! Periodic garbage collection of deployed application content.
//!
//! Each cycle runs two scans, each retried with backoff:
//!
//! 1. **Application instances**: folders of applications this node no
//!    longer runs are deleted once the cluster confirms the application is
//!    gone.
//! 2. **Application types**: package content in the image cache, shared and
//!    instance folders that no provisioned package references is deleted if
//!    it predates the scan.

use crate::activator::ActivatorClient;
use crate::config::{HostingConfig, NodeConfig};
use crate::deletion::content::{
    delete_if_not_modified_since, get_checksum_content, get_content, subdirectory_names, ContentSet,
    ManifestReader,
};
use crate::deletion::query::{
    parse_manifest_id, parse_package_id, ApplicationQueryClient, ApplicationTracker,
    ProvisionedPackages, SecurityGroupCleaner,
};
use crate::error::{HostingError, Result};
use crate::ids::ApplicationId;
use crate::layout::{archive_file, RunLayout, StoreLayout};
use futures::future::join_all;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| HostingError::OperationFailed(format!("deletion task failed: {e}")))?
}

// ============================================================================
// Statistics
// ============================================================================

/// Counters of the deletion manager.
#[derive(Debug, Default)]
pub struct DeletionStats {
    /// Cycles started.
    pub cycles: AtomicU64,
    /// Cycles that ended in an error.
    pub failures: AtomicU64,
    /// Files and folders deleted.
    pub deleted: AtomicU64,
}

impl DeletionStats {
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn deleted(&self) -> u64 {
        self.deleted.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Application type scan
// ============================================================================

/// Content found on disk at the checkpoint, grouped by application type.
struct AppTypeScan {
    checkpoint: SystemTime,
    run: RunLayout,
    image_cache: Option<StoreLayout>,
    shared: StoreLayout,
    reader: ManifestReader,
    instances: BTreeMap<String, BTreeSet<ApplicationId>>,
    image_cache_checksums: BTreeMap<String, ContentSet>,
    image_cache_content: BTreeMap<String, ContentSet>,
    shared_content: BTreeMap<String, ContentSet>,
    instance_content: BTreeMap<String, ContentSet>,
    app_types: BTreeSet<String>,
    /// Container image to the manifests that reference it.
    image_map: BTreeMap<String, BTreeSet<PathBuf>>,
}

/// What deleting unused content left behind.
#[derive(Debug, Default)]
struct AppTypeOutcome {
    deleted: u64,
    unused_images: Vec<String>,
}

impl AppTypeScan {
    fn collect(
        node: &NodeConfig,
        reader: ManifestReader,
        prune_images: bool,
    ) -> Self {
        let run = RunLayout::new(&node.deployment_folder);
        let mut instances: BTreeMap<String, BTreeSet<ApplicationId>> = BTreeMap::new();
        for app_id in instance_folder_ids(run.root()) {
            instances
                .entry(app_id.application_type_name.clone())
                .or_default()
                .insert(app_id);
        }

        let mut scan = Self {
            checkpoint: SystemTime::now(),
            run,
            image_cache: node.image_cache_folder.as_ref().map(StoreLayout::new),
            shared: StoreLayout::shared(&node.deployment_folder),
            reader,
            instances,
            image_cache_checksums: BTreeMap::new(),
            image_cache_content: BTreeMap::new(),
            shared_content: BTreeMap::new(),
            instance_content: BTreeMap::new(),
            app_types: BTreeSet::new(),
            image_map: BTreeMap::new(),
        };
        scan.process_image_cache(prune_images);
        scan.process_shared_folder();
        scan.process_instance_folders();
        scan
    }

    fn record(map: &mut BTreeMap<String, ContentSet>, types: &mut BTreeSet<String>, app_type: &str, contents: ContentSet) {
        if !contents.is_empty() {
            map.insert(app_type.to_string(), contents);
            types.insert(app_type.to_string());
        }
    }

    fn process_image_cache(&mut self, prune_images: bool) {
        let Some(cache) = self.image_cache.clone() else {
            return;
        };
        for app_type in subdirectory_names(cache.store_folder()) {
            let folder = cache.application_type_folder(&app_type);

            let mut contents = ContentSet::new();
            get_content(&folder, &self.reader, &mut contents);
            Self::record(&mut self.image_cache_content, &mut self.app_types, &app_type, contents);

            let mut checksums = ContentSet::new();
            get_checksum_content(&folder, &mut checksums);
            Self::record(&mut self.image_cache_checksums, &mut self.app_types, &app_type, checksums);

            if prune_images {
                self.add_container_images(&folder);
            }
        }
    }

    fn add_container_images(&mut self, folder: &Path) {
        let mut manifests = ContentSet::new();
        get_content(folder, &self.reader, &mut manifests);
        for manifest in manifests.into_iter().filter(|p| p.is_file()) {
            match self.reader.image_names(&manifest) {
                Ok(images) => {
                    for image in images {
                        self.image_map.entry(image).or_default().insert(manifest.clone());
                    }
                }
                Err(e) => debug!(manifest = %manifest.display(), error = %e, "Failed to read manifest images"),
            }
        }
    }

    fn process_shared_folder(&mut self) {
        for app_type in subdirectory_names(self.shared.store_folder()) {
            let mut contents = ContentSet::new();
            get_content(&self.shared.application_type_folder(&app_type), &self.reader, &mut contents);
            Self::record(&mut self.shared_content, &mut self.app_types, &app_type, contents);
        }
    }

    fn process_instance_folders(&mut self) {
        for (app_type, app_ids) in &self.instances {
            let mut contents = ContentSet::new();
            for app_id in app_ids {
                get_content(&self.run.application_folder(app_id), &self.reader, &mut contents);
            }
            Self::record(&mut self.instance_content, &mut self.app_types, app_type, contents);
        }
    }

    fn remove_used_packages(
        &mut self,
        app_type: &str,
        provisioned: &ProvisionedPackages,
        sets: &mut TypeContent,
    ) {
        let app_ids = self.instances.get(app_type).cloned().unwrap_or_default();

        for id in provisioned.packages() {
            let Some((manifest, package, version)) = parse_package_id(id) else {
                warn!(app_type = %app_type, package_id = %id, "Failed to parse package id");
                continue;
            };
            if let Some(cache) = &self.image_cache {
                let folder = cache.package_folder(app_type, manifest, package, version);
                sets.image_cache.remove(&archive_file(&folder));
                sets.image_cache.remove(&folder);
                sets.checksums
                    .remove(&cache.package_checksum_file(app_type, manifest, package, version));
            }

            let shared = self.shared.package_folder(app_type, manifest, package, version);
            sets.shared.remove(&archive_file(&shared));
            sets.shared.remove(&shared);

            for app_id in &app_ids {
                for linked in [false, true] {
                    sets.instance
                        .remove(&self.run.package_folder(app_id, manifest, package, version, linked));
                }
            }
        }

        for id in &provisioned.service_manifests {
            let Some((manifest, version)) = parse_manifest_id(id) else {
                warn!(app_type = %app_type, manifest_id = %id, "Failed to parse manifest id");
                continue;
            };
            if let Some(cache) = &self.image_cache {
                let file = cache.service_manifest_file(app_type, manifest, version);
                sets.image_cache.remove(&file);
                sets.checksums
                    .remove(&cache.service_manifest_checksum_file(app_type, manifest, version));
                if file.is_file() {
                    match self.reader.image_names(&file) {
                        Ok(images) => {
                            for image in images {
                                self.image_map.remove(&image);
                            }
                        }
                        Err(e) => debug!(manifest = %file.display(), error = %e, "Failed to read manifest images"),
                    }
                }
            }
            for app_id in &app_ids {
                sets.instance.remove(&self.run.service_manifest_file(app_id, manifest, version));
            }
        }
    }

    /// Delete every unreferenced item of one application type.
    ///
    /// Checksums go first; if one cannot be deleted, the rest of the type is
    /// left alone.
    fn delete_unused(&self, app_type: &str, sets: TypeContent) -> u64 {
        let mut deleted = 0;
        for checksum in &sets.checksums {
            match delete_if_not_modified_since(checksum, self.checkpoint, true) {
                Ok(removed) => deleted += u64::from(removed),
                Err(e) => {
                    error!(
                        app_type = %app_type,
                        path = %checksum.display(),
                        error = %e,
                        "Failed to delete checksum, skipping application type"
                    );
                    return deleted;
                }
            }
        }

        let groups = [
            (&sets.image_cache, true),
            (&sets.shared, false),
            (&sets.instance, false),
        ];
        for (contents, acquire_cache_lock) in groups {
            for path in contents {
                match delete_if_not_modified_since(path, self.checkpoint, acquire_cache_lock) {
                    Ok(true) => {
                        deleted += 1;
                        info!(app_type = %app_type, path = %path.display(), "Deleted application type content");
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(app_type = %app_type, path = %path.display(), error = %e, "Failed to delete application type content")
                    }
                }
            }
        }
        deleted
    }

    fn delete_unreferenced(mut self, provisioned: Vec<(String, ProvisionedPackages)>, images_to_skip: &[String]) -> AppTypeOutcome {
        let mut outcome = AppTypeOutcome::default();
        for (app_type, packages) in provisioned {
            let mut sets = TypeContent {
                checksums: self.image_cache_checksums.get(&app_type).cloned().unwrap_or_default(),
                image_cache: self.image_cache_content.get(&app_type).cloned().unwrap_or_default(),
                shared: self.shared_content.get(&app_type).cloned().unwrap_or_default(),
                instance: self.instance_content.get(&app_type).cloned().unwrap_or_default(),
            };
            self.remove_used_packages(&app_type, &packages, &mut sets);
            outcome.deleted += self.delete_unused(&app_type, sets);
        }

        outcome.unused_images = self
            .image_map
            .keys()
            .filter(|image| !images_to_skip.iter().any(|skip| image.contains(skip.as_str())))
            .cloned()
            .collect();
        outcome
    }
}

/// Candidate content of one application type.
struct TypeContent {
    checksums: ContentSet,
    image_cache: ContentSet,
    shared: ContentSet,
    instance: ContentSet,
}

/// Application ids of the instance folders under `deployment_folder`,
/// without the system application.
fn instance_folder_ids(deployment_folder: &Path) -> Vec<ApplicationId> {
    subdirectory_names(deployment_folder)
        .into_iter()
        .filter_map(|name| name.parse::<ApplicationId>().ok())
        .filter(|id| !id.is_system())
        .collect()
}

fn remove_folder(path: &Path) -> std::io::Result<()> {
    if std::fs::symlink_metadata(path)?.file_type().is_symlink() {
        std::fs::remove_file(path)
    } else {
        std::fs::remove_dir_all(path)
    }
}

// ============================================================================
// Deletion manager
// ============================================================================

/// Periodically deletes content of removed applications.
pub struct DeletionManager {
    node: NodeConfig,
    config: HostingConfig,
    query: Arc<dyn ApplicationQueryClient>,
    tracker: Arc<dyn ApplicationTracker>,
    security_groups: Arc<dyn SecurityGroupCleaner>,
    activator: Arc<dyn ActivatorClient>,
    reader: ManifestReader,
    opened: AtomicBool,
    shutdown_notify: Arc<Notify>,
    scan_handle: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<DeletionStats>,
}

impl DeletionManager {
    pub fn new(
        node: NodeConfig,
        config: HostingConfig,
        query: Arc<dyn ApplicationQueryClient>,
        tracker: Arc<dyn ApplicationTracker>,
        security_groups: Arc<dyn SecurityGroupCleaner>,
        activator: Arc<dyn ActivatorClient>,
    ) -> Result<Self> {
        Ok(Self {
            node,
            config,
            query,
            tracker,
            security_groups,
            activator,
            reader: ManifestReader::new()?,
            opened: AtomicBool::new(false),
            shutdown_notify: Arc::new(Notify::new()),
            scan_handle: Mutex::new(None),
            stats: Arc::new(DeletionStats::default()),
        })
    }

    pub fn stats(&self) -> &DeletionStats {
        &self.stats
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// Delay before the first cycle, or `None` when cleanup is disabled.
    ///
    /// Nodes start somewhere in `[interval, 2 * interval)` so a cluster
    /// does not scan in lockstep.
    pub fn initial_delay(interval: Duration) -> Option<Duration> {
        if interval.is_zero() || interval == Duration::MAX {
            return None;
        }
        let range = if interval < Duration::MAX / 2 { interval } else { interval / 2 };
        let range_ms = u64::try_from(range.as_millis()).unwrap_or(u64::MAX / 2).max(1);
        let offset = rand::thread_rng().gen_range(0..range_ms);
        Some(Duration::from_millis(range_ms + offset))
    }

    /// Open the manager and schedule the periodic scan.
    pub fn open(self: &Arc<Self>) {
        if self.opened.swap(true, Ordering::AcqRel) {
            warn!("Deletion manager already open");
            return;
        }

        let interval = self.config.cache_cleanup_scan_interval;
        match Self::initial_delay(interval) {
            Some(first) => {
                let manager = Arc::clone(self);
                let handle = tokio::spawn(async move { manager.scan_loop(first).await });
                *self.scan_handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                info!(first_scan_ms = first.as_millis() as u64, interval_ms = interval.as_millis() as u64, "Deletion manager opened");
            }
            None => info!(interval = ?interval, "Deletion manager cleanup disabled by scan interval"),
        }
    }

    /// Stop scanning and cancel a cycle in progress.
    pub async fn close(&self) {
        if !self.opened.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown_notify.notify_one();
        let handle = self.scan_handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = ?e, "Deletion scan task panicked");
            }
        }
        info!(
            cycles = self.stats.cycles(),
            failures = self.stats.failures(),
            deleted = self.stats.deleted(),
            "Deletion manager closed"
        );
    }

    async fn scan_loop(self: Arc<Self>, first: Duration) {
        let mut delay = first;
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_notify.notified() => {
                    debug!("Deletion scan loop shutting down");
                    break;
                }

                _ = async {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = self.run_cycle().await {
                        warn!(error = %e, "Deletion cycle failed");
                    }
                } => {
                    delay = self.config.cache_cleanup_scan_interval;
                    debug!(next_scan_ms = delay.as_millis() as u64, "Scheduled next deletion cycle");
                }
            }
        }
    }

    /// Run both scans once.
    ///
    /// # Errors
    ///
    /// Returns `ObjectClosed` when the manager is not open, or the last
    /// scan error once retries are exhausted.
    pub async fn run_cycle(&self) -> Result<()> {
        if !self.is_open() {
            return Err(HostingError::ObjectClosed);
        }
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        let start = tokio::time::Instant::now();

        let mut failures = 0;
        let result = async {
            self.with_retry("application instances", &mut failures, || self.cleanup_app_instance_folders())
                .await?;
            self.with_retry("application types", &mut failures, || self.cleanup_app_type_folders())
                .await
        }
        .await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => info!(elapsed_ms, deleted = self.stats.deleted(), "Deletion cycle completed"),
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!(elapsed_ms, error = %e, "Deletion cycle gave up");
            }
        }
        result
    }

    async fn with_retry<F, Fut>(&self, scan: &str, failures: &mut u32, mut f: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        loop {
            match f().await {
                Ok(()) => {
                    *failures = 0;
                    return Ok(());
                }
                Err(e) => {
                    *failures += 1;
                    if !e.is_retryable() || *failures > self.config.cache_cleanup_max_continuous_failures {
                        return Err(e);
                    }
                    let backoff = self.config.cache_cleanup_backoff_interval;
                    warn!(scan, failures = *failures, backoff_ms = backoff.as_millis() as u64, error = %e, "Deletion scan failed, retrying");
                    tokio::time::sleep(backoff).await;
                    if !self.is_open() {
                        return Err(HostingError::ObjectClosed);
                    }
                }
            }
        }
    }

    /// Delete the folders of applications the cluster reports deleted.
    pub async fn cleanup_app_instance_folders(&self) -> Result<()> {
        let mut candidates = Vec::new();
        for app_id in instance_folder_ids(&self.node.deployment_folder) {
            match self.tracker.contains(&app_id) {
                Ok(false) => candidates.push(app_id.to_string()),
                Ok(true) => {}
                Err(e) => debug!(app_id = %app_id, error = %e, "Failed to check application, skipping"),
            }
        }
        if candidates.is_empty() {
            debug!("No orphaned application instance folders");
            return Ok(());
        }

        let timeout = self.config.request_timeout;
        let deleted = self
            .query
            .get_deleted_applications(candidates, timeout)
            .await
            .inspect_err(|e| warn!(error = %e, "Deleted applications query failed"))?;
        if deleted.is_empty() {
            return Ok(());
        }

        let app_ids = match self.security_groups.cleanup_application_security_groups(&deleted).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Failed to clean up application security groups");
                Vec::new()
            }
        };

        let node = self.node.clone();
        let count = blocking(move || Ok(delete_instance_folders(&node, &app_ids))).await?;
        self.stats.deleted.fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    /// Delete package content no provisioned application type references.
    pub async fn cleanup_app_type_folders(&self) -> Result<()> {
        let node = self.node.clone();
        let reader = self.reader.clone();
        let prune_images = self.config.prune_container_images;
        let scan = blocking(move || Ok(AppTypeScan::collect(&node, reader, prune_images))).await?;

        let timeout = self.config.request_timeout;
        let queries = scan.app_types.iter().map(|app_type| async move {
            let result = self.query.get_provisioned_packages(app_type, timeout).await;
            (app_type.clone(), result)
        });
        let mut provisioned = Vec::with_capacity(scan.app_types.len());
        for (app_type, result) in join_all(queries).await {
            match result {
                Ok(packages) => provisioned.push((app_type, packages)),
                Err(e) => {
                    warn!(app_type = %app_type, error = %e, "Provisioned packages query failed");
                    return Err(e);
                }
            }
        }

        let skip = self.config.container_images_to_skip.clone();
        let outcome = blocking(move || Ok(scan.delete_unreferenced(provisioned, &skip))).await?;
        self.stats.deleted.fetch_add(outcome.deleted, Ordering::Relaxed);

        if prune_images && !outcome.unused_images.is_empty() {
            let count = outcome.unused_images.len();
            match self.activator.delete_container_images(outcome.unused_images, timeout).await {
                Ok(()) => info!(count, "Pruned unused container images"),
                Err(e) => warn!(count, error = %e, "Failed to remove container images"),
            }
        }
        Ok(())
    }
}

/// Delete the instance, logical-directory and image cache folders of
/// deleted applications. Returns how many folders went away.
fn delete_instance_folders(node: &NodeConfig, app_ids: &[ApplicationId]) -> u64 {
    let run = RunLayout::new(&node.deployment_folder);
    let mut folders = Vec::new();

    for app_id in app_ids {
        let instance = run.application_folder(app_id);
        if instance.is_dir() {
            for logical in &node.logical_application_directories {
                let link = logical.join(&node.node_id).join(app_id.to_string());
                if link.symlink_metadata().is_ok() {
                    folders.push(link);
                }
            }
            folders.push(instance);
        }

        if let Some(cache) = &node.image_cache_folder {
            let cached = StoreLayout::new(cache).application_instance_folder(app_id);
            if cached.is_dir() {
                folders.push(cached);
            }
        }
    }

    let mut deleted = 0;
    for folder in folders {
        match remove_folder(&folder) {
            Ok(()) => {
                deleted += 1;
                info!(path = %folder.display(), "Deleted application instance folder");
            }
            Err(e) => warn!(path = %folder.display(), error = %e, "Failed to delete application instance folder"),
        }
    }
    deleted
}
