//! Filesystem side of the deletion scans: finding package content and
//! deleting it without racing concurrent writers.

use crate::error::{HostingError, Result};
use crate::layout::{
    cache_lock_file, ARCHIVE_EXTENSION, ARCHIVE_MARKER_FILE_NAME, CHECKSUM_EXTENSION,
    TRANSIENT_FOLDER_NAMES, TRANSIENT_FOLDER_SUFFIXES,
};
use regex::Regex;
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Candidate paths of one application type.
pub type ContentSet = BTreeSet<PathBuf>;

/// Recognizes service manifests and pulls container image names out of them.
#[derive(Debug, Clone)]
pub struct ManifestReader {
    manifest: Regex,
    image_name: Regex,
}

impl ManifestReader {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| HostingError::InvalidArgument(format!("bad pattern {pattern}: {e}")))
        };
        Ok(Self {
            manifest: compile(r"<ServiceManifest[\s>]")?,
            image_name: compile(r"<ImageName>\s*([^<]*?)\s*</ImageName>")?,
        })
    }

    /// Whether `path` holds a service manifest. Unreadable files are not.
    pub fn is_service_manifest(&self, path: &Path) -> bool {
        match fs::read_to_string(path) {
            Ok(text) => self.manifest.is_match(&text),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Skipping unreadable manifest candidate");
                false
            }
        }
    }

    /// Container images the code packages of a manifest run.
    pub fn image_names(&self, path: &Path) -> Result<Vec<String>> {
        let text = fs::read_to_string(path)?;
        Ok(self
            .image_name
            .captures_iter(&text)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .filter(|name| !name.is_empty())
            .collect())
    }
}

/// Names of the subdirectories of `folder`; empty when it does not exist.
pub fn subdirectory_names(folder: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(folder) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}

fn top_level_files(folder: &Path, extension: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(folder) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(extension))
        })
        .collect()
}

fn is_transient_folder(name: &str) -> bool {
    TRANSIENT_FOLDER_NAMES.iter().any(|t| name.eq_ignore_ascii_case(t))
        || TRANSIENT_FOLDER_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Package content directly under `folder`: service manifests, archives and
/// package folders. Checksums are collected separately.
pub fn get_content(folder: &Path, reader: &ManifestReader, contents: &mut ContentSet) {
    for manifest in top_level_files(folder, "xml") {
        if reader.is_service_manifest(&manifest) {
            contents.insert(manifest);
        }
    }
    contents.extend(top_level_files(folder, ARCHIVE_EXTENSION));
    for name in subdirectory_names(folder) {
        if !is_transient_folder(&name) {
            contents.insert(folder.join(name));
        }
    }
}

pub fn get_checksum_content(folder: &Path, contents: &mut ContentSet) {
    contents.extend(top_level_files(folder, CHECKSUM_EXTENSION));
}

/// Exclusive, non-blocking hold on the `.CacheLock` sibling of a path.
struct CacheLock {
    lock: fd_lock::RwLock<fs::File>,
}

impl CacheLock {
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(cache_lock_file(path))?;
        Ok(Self {
            lock: fd_lock::RwLock::new(file),
        })
    }
}

fn modified(metadata: &fs::Metadata) -> Result<SystemTime> {
    Ok(metadata.modified()?)
}

/// Delete `path` if it was last written at or before `checkpoint`.
///
/// Image cache content is deleted under its `.CacheLock`; a lock held by a
/// writer fails the call. The lock file itself goes once the call is done
/// with it. An extracted folder loses its `.extracted` marker before
/// anything else so a partial delete never looks complete. Symbolic links
/// are removed without touching their target.
///
/// Returns whether anything was deleted.
pub fn delete_if_not_modified_since(path: &Path, checkpoint: SystemTime, acquire_cache_lock: bool) -> Result<bool> {
    if !acquire_cache_lock {
        return delete_unlocked(path, checkpoint);
    }

    let lock_path = cache_lock_file(path);
    let mut cache_lock = CacheLock::open(path)?;
    let _guard = cache_lock.lock.try_write().map_err(|e| {
        HostingError::OperationFailed(format!("content {} is in use: {e}", path.display()))
    })?;

    let result = delete_unlocked(path, checkpoint);
    match fs::remove_file(&lock_path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %lock_path.display(), error = %e, "Failed to delete cache lock"),
    }
    result
}

fn delete_unlocked(path: &Path, checkpoint: SystemTime) -> Result<bool> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if modified(&metadata)? > checkpoint {
        debug!(path = %path.display(), "Content changed during scan, keeping it");
        return Ok(false);
    }

    if metadata.is_dir() {
        let marker = path.join(ARCHIVE_MARKER_FILE_NAME);
        match fs::remove_file(&marker) {
            Ok(()) => debug!(path = %marker.display(), "Deleted archive marker"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %marker.display(), error = %e, "Failed to delete archive marker");
                return Err(e.into());
            }
        }
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(true)
}
