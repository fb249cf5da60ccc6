use std::net::IpAddr;

use dimse::{Interaction, QueryRetrieveModel, RemoteNode, DEFAULT_DIMSE_PORT};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Remote node known to this service.
///
/// The same entry describes how we call the peer (`ae_title`, `host`, `port`) and,
/// when `allow_incoming` is set, how the peer is allowed to call us.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Peer {
    pub name: String,
    pub ae_title: String,
    pub host: String,
    #[serde(default = "default_peer_port")]
    pub port: u16,
    /// AE title the peer uses when it calls us; defaults to `ae_title`
    #[serde(default)]
    pub incoming_ae_title: Option<String>,
    #[serde(default)]
    pub allow_incoming: bool,
    #[serde(default)]
    pub expected_ip: Option<IpAddr>,
    #[serde(default = "default_true")]
    pub supports_find: bool,
    #[serde(default = "default_true")]
    pub supports_move: bool,
    #[serde(default = "default_true")]
    pub supports_get: bool,
    #[serde(default = "default_peer_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub max_pdu: Option<u32>,
    #[serde(default)]
    pub query_retrieve_model: QueryRetrieveModel,
    /// C-MOVE destination to request when retrieving from this peer
    #[serde(default)]
    pub move_destination_ae: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl Peer {
    pub fn new(name: impl Into<String>, ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            incoming_ae_title: None,
            allow_incoming: false,
            expected_ip: None,
            supports_find: true,
            supports_move: true,
            supports_get: true,
            timeout_secs: default_peer_timeout(),
            max_pdu: None,
            query_retrieve_model: QueryRetrieveModel::default(),
            move_destination_ae: None,
            is_active: true,
        }
    }

    pub fn remote_node(&self) -> RemoteNode {
        let node = RemoteNode::new(self.ae_title.trim(), self.host.clone(), self.port)
            .with_timeout(self.timeout_secs.saturating_mul(1000));
        match self.max_pdu {
            Some(max_pdu) => node.with_max_pdu(max_pdu),
            None => node,
        }
    }

    pub fn incoming_ae(&self) -> &str {
        self.incoming_ae_title
            .as_deref()
            .unwrap_or(&self.ae_title)
            .trim()
    }

    /// Capability flags; echo and store are always allowed
    pub fn supports(&self, interaction: Interaction) -> bool {
        match interaction {
            Interaction::Echo | Interaction::Store => true,
            Interaction::Find => self.supports_find,
            Interaction::Move => self.supports_move,
            Interaction::Get => self.supports_get,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("peer name must not be empty"));
        }
        dimse::config::validate_ae_title(self.ae_title.trim())?;
        if let Some(incoming) = &self.incoming_ae_title {
            dimse::config::validate_ae_title(incoming.trim())?;
        }
        if let Some(destination) = &self.move_destination_ae {
            dimse::config::validate_ae_title(destination.trim())?;
        }
        if self.port == 0 {
            return Err(ConfigError::invalid(format!(
                "peer '{}' has port 0",
                self.name
            )));
        }
        Ok(())
    }
}

/// An AE title allowed to open associations with us
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct AllowedAe {
    pub ae_title: String,
    #[serde(default)]
    pub expected_ip: Option<IpAddr>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl AllowedAe {
    pub fn new(ae_title: impl Into<String>) -> Self {
        Self {
            ae_title: normalize_ae(&ae_title.into()),
            expected_ip: None,
            description: None,
            active: true,
        }
    }

    pub fn with_expected_ip(mut self, ip: IpAddr) -> Self {
        self.expected_ip = Some(ip);
        self
    }

    /// Whether a caller with this AE title and address matches the entry
    pub fn admits(&self, calling_ae: &str, remote_ip: IpAddr) -> bool {
        self.active
            && self.ae_title == normalize_ae(calling_ae)
            && self.expected_ip.map_or(true, |ip| ip == remote_ip)
    }
}

/// AE titles compare trimmed and upper-cased
pub fn normalize_ae(ae: &str) -> String {
    ae.trim().to_ascii_uppercase()
}

/// The allow-list as seen at association time: explicit entries plus every active
/// peer that may call in. Explicit entries win when both name the same AE.
pub fn merge_allow_list(allowed: &[AllowedAe], peers: &[Peer]) -> Vec<AllowedAe> {
    let mut merged: Vec<AllowedAe> = allowed
        .iter()
        .map(|entry| AllowedAe {
            ae_title: normalize_ae(&entry.ae_title),
            ..entry.clone()
        })
        .collect();

    for peer in peers.iter().filter(|p| p.allow_incoming && p.is_active) {
        let ae = normalize_ae(peer.incoming_ae());
        if merged.iter().any(|entry| entry.ae_title == ae) {
            continue;
        }
        merged.push(AllowedAe {
            ae_title: ae,
            expected_ip: peer.expected_ip,
            description: Some(format!("peer {}", peer.name)),
            active: true,
        });
    }
    merged
}

fn default_peer_port() -> u16 {
    DEFAULT_DIMSE_PORT
}

fn default_peer_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}
