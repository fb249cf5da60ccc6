mod logging_config;
mod peers;
pub mod config;
pub mod store;

pub use config::{
    AccessConfig, ColdSnapshot, HotSettings, NamingPolicy, NodeConfig, PathsConfig,
    ServiceConfig, StorageLayout, StorageSettings,
};
pub use logging_config::LoggingConfig;
pub use peers::{merge_allow_list, normalize_ae, AllowedAe, Peer};
pub use store::{ConfigStore, FileConfigStore, InMemoryConfigStore};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid DIMSE settings: {0}")]
    Dimse(#[from] dimse::DimseError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unknown peer '{0}'")]
    UnknownPeer(String),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ConfigError::Invalid(msg.into())
    }
}
