use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};

use crate::config::{ConfigError, ConfigStore, HotSettings};
use crate::txlog::{TransactionLog, TransactionRecord, TransactionStatus, TransactionType};

pub mod capacity;
pub mod database_manager;
pub mod placement;

pub use capacity::{CleanupStats, StorageUsage};
pub use placement::ObjectAttributes;

/// Error type for storage operations
#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    Config(ConfigError),
    /// The write would take usage past the ceiling and eviction could not help
    CapacityExceeded {
        used: u64,
        incoming: u64,
        ceiling: u64,
    },
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "IO error: {}", e),
            StorageError::Config(e) => write!(f, "Configuration error: {}", e),
            StorageError::CapacityExceeded {
                used,
                incoming,
                ceiling,
            } => write!(
                f,
                "Storage capacity exceeded: {} used + {} incoming > {} bytes",
                used, incoming, ceiling
            ),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

impl From<ConfigError> for StorageError {
    fn from(err: ConfigError) -> Self {
        StorageError::Config(err)
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A file written under the storage root, announced to downstream consumers
#[derive(Debug, Clone, Serialize)]
pub struct StoredObject {
    pub path: PathBuf,
    pub bytes: u64,
    pub attributes: ObjectAttributes,
    pub received_at: DateTime<Utc>,
}

const DOWNSTREAM_CAPACITY: usize = 256;

pub fn downstream_channel() -> broadcast::Sender<StoredObject> {
    broadcast::channel(DOWNSTREAM_CAPACITY).0
}

/// Places, writes and accounts for received objects.
///
/// Storage policy and the capacity budget are read from the [`ConfigStore`] on every
/// call, never cached here.
pub struct StorageEngine {
    config: Arc<dyn ConfigStore>,
    txlog: Option<TransactionLog>,
    downstream: broadcast::Sender<StoredObject>,
    // capacity check, write and usage update happen as one step
    write_lock: Mutex<()>,
}

impl StorageEngine {
    pub fn new(config: Arc<dyn ConfigStore>, txlog: Option<TransactionLog>) -> Self {
        Self::with_downstream(config, txlog, downstream_channel())
    }

    /// Publish stored objects on a channel owned by the caller
    pub fn with_downstream(
        config: Arc<dyn ConfigStore>,
        txlog: Option<TransactionLog>,
        downstream: broadcast::Sender<StoredObject>,
    ) -> Self {
        Self {
            config,
            txlog,
            downstream,
            write_lock: Mutex::new(()),
        }
    }

    /// Receive every object stored while `trigger_downstream` is on
    pub fn subscribe(&self) -> broadcast::Receiver<StoredObject> {
        self.downstream.subscribe()
    }

    pub async fn settings(&self) -> StorageResult<HotSettings> {
        Ok(self.config.hot().await?)
    }

    /// Write one Part 10 file. No partial file is left behind on failure.
    pub async fn store(&self, attrs: &ObjectAttributes, file: Vec<u8>) -> StorageResult<StoredObject> {
        let settings = self.config.hot().await?;
        let incoming = file.len() as u64;

        let _guard = self.write_lock.lock().await;
        self.ensure_capacity(&settings, incoming).await?;

        let received = Local::now();
        let path = placement::place(attrs, &settings, received)?;
        let target = path.clone();
        let replaced = tokio::task::spawn_blocking(move || write_atomically(&target, &file))
            .await
            .map_err(|e| std::io::Error::other(format!("write task failed: {}", e)))??;

        self.config
            .record_usage(incoming as i64 - replaced.unwrap_or(0) as i64)
            .await;
        drop(_guard);

        let stored = StoredObject {
            path,
            bytes: incoming,
            attributes: attrs.clone(),
            received_at: received.with_timezone(&Utc),
        };

        if settings.copy_to_secondary {
            if let Some(secondary) = &settings.secondary_root {
                self.copy_to_secondary(&stored, secondary).await;
            }
        }
        if settings.trigger_downstream {
            // no subscriber is not an error
            let _ = self.downstream.send(stored.clone());
        }
        Ok(stored)
    }

    async fn ensure_capacity(&self, settings: &HotSettings, incoming: u64) -> StorageResult<()> {
        if settings.is_unlimited() {
            return Ok(());
        }
        let ceiling = settings.max_storage_bytes;
        let used = self.config.used_bytes().await;
        if used.saturating_add(incoming) <= ceiling {
            return Ok(());
        }
        if !settings.eviction_enabled {
            tracing::warn!(
                "Storage ceiling reached: {} used + {} incoming > {}",
                used,
                incoming,
                ceiling
            );
            return Err(StorageError::CapacityExceeded {
                used,
                incoming,
                ceiling,
            });
        }

        let deficit = used.saturating_add(incoming) - ceiling;
        self.evict(settings, deficit).await?;

        let used = self.config.used_bytes().await;
        if used.saturating_add(incoming) > ceiling {
            tracing::error!("Storage still full after eviction");
            return Err(StorageError::CapacityExceeded {
                used,
                incoming,
                ceiling,
            });
        }
        Ok(())
    }

    async fn evict(&self, settings: &HotSettings, target: u64) -> StorageResult<CleanupStats> {
        let root = settings.root.clone();
        let retention = settings.retention();
        tracing::warn!(
            "🧹 Evicting files older than {} day(s) to free {} bytes",
            settings.retention_days,
            target
        );
        let stats = tokio::task::spawn_blocking(move || {
            capacity::evict(&root, retention, target, std::time::SystemTime::now())
        })
        .await
        .map_err(|e| std::io::Error::other(format!("eviction task failed: {}", e)))?;

        self.config.record_usage(-(stats.bytes_freed as i64)).await;
        tracing::info!(
            "Eviction deleted {} file(s), freed {} bytes, {} error(s)",
            stats.files_deleted,
            stats.bytes_freed,
            stats.errors
        );
        self.log_cleanup(&stats, target);
        Ok(stats)
    }

    /// Run one eviction pass if usage is above the ceiling
    pub async fn enforce_ceiling(&self) -> StorageResult<Option<CleanupStats>> {
        let settings = self.config.hot().await?;
        let used = self.config.used_bytes().await;
        if settings.is_unlimited() || !settings.eviction_enabled || used <= settings.max_storage_bytes {
            return Ok(None);
        }
        let _guard = self.write_lock.lock().await;
        let stats = self.evict(&settings, used - settings.max_storage_bytes).await?;
        Ok(Some(stats))
    }

    fn log_cleanup(&self, stats: &CleanupStats, target: u64) {
        let Some(txlog) = &self.txlog else {
            return;
        };
        let status = if stats.errors == 0 && stats.bytes_freed >= target {
            TransactionStatus::Success
        } else if stats.files_deleted > 0 {
            TransactionStatus::Warning
        } else {
            TransactionStatus::Failure
        };
        let mut record = TransactionRecord::new(TransactionType::Cleanup, status);
        record.object_count = Some(stats.files_deleted as u32);
        record.file_size = Some(stats.bytes_freed);
        if status != TransactionStatus::Success {
            record.error_message = Some(format!(
                "freed {} of {} bytes, {} error(s)",
                stats.bytes_freed, target, stats.errors
            ));
        }
        if let Err(e) = txlog.append(&record) {
            tracing::error!("Failed to record cleanup: {}", e);
        }
    }

    async fn copy_to_secondary(&self, stored: &StoredObject, secondary_root: &Path) {
        let Some(file_name) = stored.path.file_name() else {
            return;
        };
        let target = placement::series_directory(secondary_root, &stored.attributes).join(file_name);
        let source = stored.path.clone();
        let result = tokio::task::spawn_blocking(move || -> std::io::Result<PathBuf> {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&source, &target)?;
            Ok(target)
        })
        .await;
        match result {
            Ok(Ok(target)) => tracing::debug!("Copied to secondary storage: {}", target.display()),
            Ok(Err(e)) => tracing::error!("Secondary copy of {} failed: {}", stored.path.display(), e),
            Err(e) => tracing::error!("Secondary copy task failed: {}", e),
        }
    }
}

/// Write through a temporary file in the target directory, then rename.
///
/// Returns the size of the file that was replaced, if any.
fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<Option<u64>> {
    let directory = path
        .parent()
        .ok_or_else(|| std::io::Error::other("target has no parent directory"))?;
    std::fs::create_dir_all(directory)?;
    let replaced = std::fs::metadata(path).ok().map(|m| m.len());

    let mut temp = tempfile::Builder::new()
        .prefix(".incoming-")
        .suffix(".part")
        .tempfile_in(directory)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(replaced)
}
