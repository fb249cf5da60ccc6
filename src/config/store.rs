//! Where hot and cold settings come from.
//!
//! Cold settings are read once per `start()`. Everything else (storage policy, the
//! allow-list, peers and the capacity budget) is read through [`ConfigStore`] at the
//! moment it is needed, so operators can change it while associations are running.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::config::{
    merge_allow_list, AllowedAe, ColdSnapshot, ConfigError, HotSettings, NodeConfig, Peer,
};
use crate::storage::capacity;

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Listener, access and database settings; read once by `start()`
    async fn cold(&self) -> Result<ColdSnapshot, ConfigError>;

    /// Storage policy, read on every store
    async fn hot(&self) -> Result<HotSettings, ConfigError>;

    /// Allow-list entries merged with peers that may call in
    async fn allow_list(&self) -> Result<Vec<AllowedAe>, ConfigError>;

    async fn peers(&self) -> Result<Vec<Peer>, ConfigError>;

    /// Bytes currently stored under the storage root
    async fn used_bytes(&self) -> u64;

    /// Adjust the usage counter after a write or an eviction
    async fn record_usage(&self, delta: i64);
}

fn apply_delta(counter: &AtomicU64, delta: i64) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
        Some(if delta >= 0 {
            current.saturating_add(delta.unsigned_abs())
        } else {
            current.saturating_sub(delta.unsigned_abs())
        })
    });
}

/// Configuration backed by a TOML file that is re-read on every call
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
    used: AtomicU64,
}

impl FileConfigStore {
    /// Validate the file once and measure the storage root
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let store = Self {
            path: path.into(),
            used: AtomicU64::new(0),
        };
        store.load().await?;
        store.rescan_usage().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<NodeConfig, ConfigError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ConfigError::Read {
                path: self.path.clone(),
                source,
            })?;
        NodeConfig::from_toml_str(&text)
    }

    /// Replace the usage counter with a fresh scan of the storage root
    pub async fn rescan_usage(&self) -> Result<u64, ConfigError> {
        let root = self.load().await?.storage.root;
        let usage = tokio::task::spawn_blocking(move || capacity::scan_usage(&root))
            .await
            .map_err(|e| ConfigError::invalid(format!("usage scan failed: {}", e)))?;
        self.used.store(usage.total_bytes, Ordering::SeqCst);
        tracing::info!(
            "📦 Storage usage: {} file(s), {} bytes",
            usage.total_files,
            usage.total_bytes
        );
        Ok(usage.total_bytes)
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn cold(&self) -> Result<ColdSnapshot, ConfigError> {
        Ok(self.load().await?.cold_snapshot())
    }

    async fn hot(&self) -> Result<HotSettings, ConfigError> {
        Ok(self.load().await?.storage)
    }

    async fn allow_list(&self) -> Result<Vec<AllowedAe>, ConfigError> {
        let config = self.load().await?;
        Ok(merge_allow_list(&config.allowed_ae, &config.peers))
    }

    async fn peers(&self) -> Result<Vec<Peer>, ConfigError> {
        Ok(self.load().await?.peers)
    }

    async fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    async fn record_usage(&self, delta: i64) {
        apply_delta(&self.used, delta);
    }
}

/// Configuration held in memory, for embedding and tests
#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    config: RwLock<NodeConfig>,
    used: AtomicU64,
}

impl InMemoryConfigStore {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config: RwLock::new(config),
            used: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> NodeConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Edit the configuration in place
    pub fn update(&self, edit: impl FnOnce(&mut NodeConfig)) {
        let mut guard = match self.config.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        edit(&mut guard);
    }

    pub fn set_hot(&self, settings: HotSettings) {
        self.update(|config| config.storage = settings);
    }

    pub fn set_used_bytes(&self, bytes: u64) {
        self.used.store(bytes, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn cold(&self) -> Result<ColdSnapshot, ConfigError> {
        let config = self.snapshot();
        config.validate()?;
        Ok(config.cold_snapshot())
    }

    async fn hot(&self) -> Result<HotSettings, ConfigError> {
        Ok(self.snapshot().storage)
    }

    async fn allow_list(&self) -> Result<Vec<AllowedAe>, ConfigError> {
        let config = self.snapshot();
        Ok(merge_allow_list(&config.allowed_ae, &config.peers))
    }

    async fn peers(&self) -> Result<Vec<Peer>, ConfigError> {
        Ok(self.snapshot().peers)
    }

    async fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    async fn record_usage(&self, delta: i64) {
        apply_delta(&self.used, delta);
    }
}
