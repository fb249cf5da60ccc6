//! DIMSE (DICOM Message Service Element) implementation
//!
//! This crate provides both Service Class Provider (SCP) and Service Class User (SCU)
//! implementations for DICOM networking on tokio, with PDUs encoded by `dicom-ul`.
//!
//! # Features
//! - Upper layer PDU codec and association negotiation (acceptor and requestor)
//! - Inbound DIMSE services (SCP): C-ECHO, C-STORE, C-FIND, C-MOVE, C-GET
//! - Outbound DIMSE services (SCU): C-ECHO, C-FIND, C-MOVE, C-GET, C-STORE
//! - Domain decisions (access control, storage, index lookups, audit) are delegated
//!   to a [`scp::ServiceProvider`] supplied by the embedding application

pub mod association;
pub mod config;
pub mod error;
pub mod files;
pub mod message;
pub mod pdu;
pub mod scp;
pub mod scu;
pub mod types;
pub mod uids;

// Re-export commonly used types
pub use association::{Association, AssociationPeer, PresentationContext};
pub use config::{DimseConfig, RemoteNode};
pub use error::{DimseError, Result};
pub use scp::{
    Admission, AuditDetail, AuditEvent, AuditKind, AuditOutcome, DimseScp, ProviderFailure,
    QueryRequest, ReceivedObject, RejectReason, RetrieveItem, ServiceProvider, StoreOutcome,
    StoreSink,
};
pub use scu::{DimseScu, FindOutcome, RetrieveSummary, StoreReport};
pub use types::{
    DimseStatus, Interaction, Priority, QueryLevel, QueryRetrieveModel, ServiceSet,
    SubOperationCounts,
};

/// Default DICOM port
pub const DEFAULT_DIMSE_PORT: u16 = 11112;
