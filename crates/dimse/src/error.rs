//! Error types for DIMSE operations

use thiserror::Error;

/// Result type alias for DIMSE operations
pub type Result<T> = std::result::Result<T, DimseError>;

/// Error types that can occur during DIMSE operations
#[derive(Error, Debug)]
pub enum DimseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Malformed PDU: {0}")]
    Pdu(String),

    #[error("DICOM parsing error: {0}")]
    DicomParsing(String),

    #[error("DICOM object error: {0}")]
    DicomObject(String),

    #[error("Association rejected (result {result}, source {source_id}, reason {reason})")]
    AssociationRejected {
        result: u8,
        source_id: u8,
        reason: u8,
    },

    #[error("Association aborted by peer (source {source_id}, reason {reason})")]
    AssociationAborted { source_id: u8, reason: u8 },

    #[error("Association released unexpectedly")]
    AssociationReleased,

    #[error("No accepted presentation context for {0}")]
    NoPresentationContext(String),

    #[error("DIMSE operation failed: {0}")]
    OperationFailed(String),

    #[error("Invalid AE Title: {0}")]
    InvalidAeTitle(String),

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

impl DimseError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new malformed PDU error
    pub fn pdu(msg: impl Into<String>) -> Self {
        Self::Pdu(msg.into())
    }

    /// Create a new operation failed error
    pub fn operation_failed(msg: impl Into<String>) -> Self {
        Self::OperationFailed(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DimseError::Network(_)
                | DimseError::Timeout(_)
                | DimseError::AssociationRejected { .. }
        )
    }

    /// Whether the error means the transport is gone and the association cannot continue
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DimseError::Network(_)
                | DimseError::Pdu(_)
                | DimseError::Timeout(_)
                | DimseError::AssociationAborted { .. }
                | DimseError::AssociationReleased
        )
    }
}
