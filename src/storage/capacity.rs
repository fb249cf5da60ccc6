//! Usage accounting and eviction of old files

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageUsage {
    pub total_files: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    pub files_deleted: u64,
    pub bytes_freed: u64,
    pub errors: u64,
    pub deleted: Vec<PathBuf>,
}

fn is_dicom_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
}

/// Count `.dcm` files under `root`; a missing root is empty
pub fn scan_usage(root: &Path) -> StorageUsage {
    let mut usage = StorageUsage::default();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || !is_dicom_file(entry.path()) {
            continue;
        }
        match entry.metadata() {
            Ok(meta) => {
                usage.total_files += 1;
                usage.total_bytes += meta.len();
            }
            Err(e) => tracing::warn!("Cannot stat {}: {}", entry.path().display(), e),
        }
    }
    usage
}

/// Delete the oldest `.dcm` files older than `retention` until `target_bytes` are
/// freed or nothing eligible is left, then prune empty directories.
pub fn evict(root: &Path, retention: Duration, target_bytes: u64, now: SystemTime) -> CleanupStats {
    let mut stats = CleanupStats::default();
    let cutoff = now.checked_sub(retention).unwrap_or(SystemTime::UNIX_EPOCH);

    let mut candidates: Vec<(SystemTime, u64, PathBuf)> = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || !is_dicom_file(entry.path()) {
            continue;
        }
        match entry.metadata() {
            Ok(meta) => {
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                if modified < cutoff {
                    candidates.push((modified, meta.len(), entry.into_path()));
                }
            }
            Err(e) => {
                tracing::error!("Cannot stat {}: {}", entry.path().display(), e);
                stats.errors += 1;
            }
        }
    }
    candidates.sort();

    for (_, size, path) in candidates {
        if stats.bytes_freed >= target_bytes {
            break;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!("Evicted {}", path.display());
                stats.files_deleted += 1;
                stats.bytes_freed += size;
                stats.deleted.push(path);
            }
            Err(e) => {
                tracing::error!("Failed to evict {}: {}", path.display(), e);
                stats.errors += 1;
            }
        }
    }

    prune_empty_dirs(root);
    stats
}

/// Remove empty directories below `root`, keeping `root` itself
pub fn prune_empty_dirs(root: &Path) {
    for entry in WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_dir() {
            // fails harmlessly when the directory still has content
            let _ = std::fs::remove_dir(entry.path());
        }
    }
}
