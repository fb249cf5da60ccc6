//! Configuration types for DIMSE services

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::types::ServiceSet;
use crate::{uids, DEFAULT_DIMSE_PORT};

/// Configuration for DIMSE services.
///
/// Everything here is read once when the listener starts; changing it requires a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimseConfig {
    /// Local Application Entity Title
    #[serde(default = "default_aet")]
    pub local_aet: String,

    /// Bind address for SCP listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port for SCP listener (0 binds an ephemeral port)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum PDU size we are willing to receive
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,

    /// Outbound TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Timeout for association negotiation and release in milliseconds
    #[serde(default = "default_acse_timeout")]
    pub acse_timeout_ms: u64,

    /// Timeout waiting for a DIMSE response in milliseconds
    #[serde(default = "default_dimse_timeout")]
    pub dimse_timeout_ms: u64,

    /// Idle time allowed between requests on an open association in milliseconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Time in-flight associations get to finish after stop is requested
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Maximum number of concurrent associations
    #[serde(default = "default_max_associations")]
    pub max_associations: u32,

    /// Interactions offered during negotiation
    #[serde(default)]
    pub services: ServiceSet,

    /// Accepted transfer syntaxes (in order of preference)
    #[serde(default = "default_transfer_syntaxes")]
    pub transfer_syntaxes: Vec<String>,

    /// Storage SOP classes accepted for C-STORE and offered for C-GET
    #[serde(default = "default_storage_sop_classes")]
    pub storage_sop_classes: Vec<String>,
}

/// Configuration for a remote DICOM node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Remote Application Entity Title
    pub ae_title: String,

    /// Remote host address
    pub host: String,

    /// Remote port
    pub port: u16,

    /// Connection timeout in milliseconds (overrides global setting)
    pub connect_timeout_ms: Option<u64>,

    /// Maximum PDU size for this node (overrides global setting)
    pub max_pdu: Option<u32>,
}

impl Default for DimseConfig {
    fn default() -> Self {
        Self {
            local_aet: default_aet(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            max_pdu: default_max_pdu(),
            connect_timeout_ms: default_connect_timeout(),
            acse_timeout_ms: default_acse_timeout(),
            dimse_timeout_ms: default_dimse_timeout(),
            idle_timeout_ms: default_idle_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
            max_associations: default_max_associations(),
            services: ServiceSet::default(),
            transfer_syntaxes: default_transfer_syntaxes(),
            storage_sop_classes: default_storage_sop_classes(),
        }
    }
}

impl DimseConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn acse_timeout(&self) -> Duration {
        Duration::from_millis(self.acse_timeout_ms)
    }

    pub fn dimse_timeout(&self) -> Duration {
        Duration::from_millis(self.dimse_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Whether a storage SOP class is accepted
    pub fn accepts_storage_class(&self, uid: &str) -> bool {
        let uid = uids::trim_uid(uid);
        self.storage_sop_classes.iter().any(|s| s == uid)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_ae_title(&self.local_aet)?;

        if self.max_pdu < 4096 || self.max_pdu > 131072 {
            return Err(crate::error::DimseError::config(
                "Max PDU size must be between 4096 and 131072 bytes",
            ));
        }

        if self.max_associations == 0 {
            return Err(crate::error::DimseError::config(
                "max_associations must be at least 1",
            ));
        }

        if self.transfer_syntaxes.is_empty() {
            return Err(crate::error::DimseError::config(
                "At least one transfer syntax must be enabled",
            ));
        }

        for ts in &self.transfer_syntaxes {
            if crate::message::transfer_syntax(ts).is_err() {
                return Err(crate::error::DimseError::config(format!(
                    "Unknown transfer syntax: {}",
                    ts
                )));
            }
        }

        Ok(())
    }
}

/// AE titles are 1 to 16 characters of printable ASCII without backslash
pub fn validate_ae_title(ae: &str) -> crate::error::Result<()> {
    let trimmed = ae.trim();
    if trimmed.is_empty() || trimmed.len() > 16 {
        return Err(crate::error::DimseError::InvalidAeTitle(format!(
            "'{}' must be 1-16 characters",
            ae
        )));
    }
    if trimmed.chars().any(|c| !c.is_ascii_graphic() && c != ' ' || c == '\\') {
        return Err(crate::error::DimseError::InvalidAeTitle(format!(
            "'{}' contains invalid characters",
            ae
        )));
    }
    Ok(())
}

impl RemoteNode {
    /// Create a new remote node configuration
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            connect_timeout_ms: None,
            max_pdu: None,
        }
    }

    /// Set connection timeout for this node
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_pdu(mut self, max_pdu: u32) -> Self {
        self.max_pdu = Some(max_pdu);
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate the remote node configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_ae_title(&self.ae_title)?;

        if self.host.is_empty() {
            return Err(crate::error::DimseError::config(
                "Remote host cannot be empty",
            ));
        }

        if self.port == 0 {
            return Err(crate::error::DimseError::config(
                "Remote port must be greater than 0",
            ));
        }

        Ok(())
    }
}

// Default value functions
fn default_aet() -> String {
    "DICOM_NODE".to_string()
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    DEFAULT_DIMSE_PORT
}

fn default_max_pdu() -> u32 {
    16384
}

fn default_connect_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_acse_timeout() -> u64 {
    30_000
}

fn default_dimse_timeout() -> u64 {
    60_000
}

fn default_idle_timeout() -> u64 {
    120_000
}

fn default_shutdown_grace() -> u64 {
    5_000
}

fn default_transfer_syntaxes() -> Vec<String> {
    vec![
        uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
        uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
        uids::EXPLICIT_VR_BIG_ENDIAN.to_string(),
        uids::JPEG_BASELINE.to_string(),
        uids::JPEG_LOSSLESS_SV1.to_string(),
        uids::JPEG_2000_LOSSLESS.to_string(),
        uids::RLE_LOSSLESS.to_string(),
    ]
}

fn default_storage_sop_classes() -> Vec<String> {
    uids::STORAGE_SOP_CLASSES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_associations() -> u32 {
    10
}
