use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dimse::DimseConfig;
use serde::{Deserialize, Serialize};

use crate::config::{normalize_ae, AllowedAe, ConfigError, LoggingConfig, Peer};

/// The whole configuration file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub dimse: DimseConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub allowed_ae: Vec<AllowedAe>,
    #[serde(default)]
    pub peers: Vec<Peer>,
}

impl NodeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dimse.validate()?;
        self.storage.validate()?;

        let mut seen = HashSet::new();
        for entry in &self.allowed_ae {
            dimse::config::validate_ae_title(entry.ae_title.trim())?;
            if !seen.insert(normalize_ae(&entry.ae_title)) {
                return Err(ConfigError::invalid(format!(
                    "allowed AE '{}' is listed twice",
                    entry.ae_title.trim()
                )));
            }
        }

        let mut names = HashSet::new();
        for peer in &self.peers {
            peer.validate()?;
            if !names.insert(peer.name.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "peer '{}' is defined twice",
                    peer.name
                )));
            }
        }
        Ok(())
    }

    pub fn cold_snapshot(&self) -> ColdSnapshot {
        ColdSnapshot {
            dimse: self.dimse.clone(),
            access: self.access.clone(),
            paths: self.paths.clone(),
            refresh_interval: self.service.refresh_interval(),
        }
    }

    pub fn peer(&self, name: &str) -> Result<&Peer, ConfigError> {
        self.peers
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| ConfigError::UnknownPeer(name.to_string()))
    }
}

/// Settings read once by `start()`; changing them needs a restart
#[derive(Debug, Clone)]
pub struct ColdSnapshot {
    pub dimse: DimseConfig,
    pub access: AccessConfig,
    pub paths: PathsConfig,
    pub refresh_interval: Option<Duration>,
}

/// Settings read on every store and eviction decision
pub type HotSettings = StorageSettings;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AccessConfig {
    #[serde(default)]
    pub require_calling_ae_validation: bool,
    #[serde(default)]
    pub require_ip_validation: bool,
    #[serde(default)]
    pub allowed_ip_addresses: Vec<IpAddr>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    #[serde(default = "default_index_db")]
    pub index_db: PathBuf,
    #[serde(default = "default_txlog_db")]
    pub txlog_db: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            index_db: default_index_db(),
            txlog_db: default_txlog_db(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Re-read hot settings on this period, in seconds
    #[serde(default)]
    pub refresh_interval_secs: Option<u64>,
}

impl ServiceConfig {
    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Directory layout under the storage root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageLayout {
    Flat,
    ByPatient,
    ByStudy,
    #[default]
    BySeries,
    ByDate,
}

/// File name policy inside the target directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingPolicy {
    #[default]
    SopUid,
    InstanceNumber,
    Timestamp,
    AutoIncrement,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StorageSettings {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub layout: StorageLayout,
    #[serde(default)]
    pub naming: NamingPolicy,
    /// Capacity ceiling in bytes, 0 for unlimited
    #[serde(default)]
    pub max_storage_bytes: u64,
    #[serde(default)]
    pub eviction_enabled: bool,
    /// Files younger than this are never evicted
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_true")]
    pub validate_on_receive: bool,
    #[serde(default)]
    pub reject_invalid: bool,
    #[serde(default)]
    pub copy_to_secondary: bool,
    #[serde(default)]
    pub secondary_root: Option<PathBuf>,
    #[serde(default)]
    pub trigger_downstream: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            layout: StorageLayout::default(),
            naming: NamingPolicy::default(),
            max_storage_bytes: 0,
            eviction_enabled: false,
            retention_days: default_retention_days(),
            validate_on_receive: true,
            reject_invalid: false,
            copy_to_secondary: false,
            secondary_root: None,
            trigger_downstream: false,
        }
    }
}

impl StorageSettings {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_storage_bytes == 0
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::invalid("storage root must not be empty"));
        }
        if self.copy_to_secondary && self.secondary_root.is_none() {
            return Err(ConfigError::invalid(
                "copy_to_secondary is set but secondary_root is missing",
            ));
        }
        Ok(())
    }
}

fn default_index_db() -> PathBuf {
    PathBuf::from("data/index.redb")
}

fn default_txlog_db() -> PathBuf {
    PathBuf::from("data/transactions.redb")
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("data/incoming")
}

fn default_retention_days() -> u32 {
    30
}

fn default_true() -> bool {
    true
}
