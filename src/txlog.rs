//! Append-only audit trail of every association and DIMSE exchange.
//!
//! Records are JSON values in a redb table keyed by a monotonically increasing
//! sequence number. There is no update or delete path.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dimse::{AssociationPeer, AuditEvent, AuditKind, AuditOutcome, Interaction};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::storage::database_manager::{DatabaseError, DatabaseManager, DatabaseOperation};

const TRANSACTIONS: TableDefinition<u64, &str> = TableDefinition::new("transactions");

#[derive(Debug, Error)]
pub enum TxLogError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Malformed transaction record: {0}")]
    Record(#[from] serde_json::Error),
}

impl From<redb::TableError> for TxLogError {
    fn from(e: redb::TableError) -> Self {
        TxLogError::Database(e.into())
    }
}

impl From<redb::StorageError> for TxLogError {
    fn from(e: redb::StorageError) -> Self {
        TxLogError::Database(e.into())
    }
}

pub type Result<T> = std::result::Result<T, TxLogError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    #[serde(rename = "C-ECHO")]
    Echo,
    #[serde(rename = "C-STORE")]
    Store,
    #[serde(rename = "C-FIND")]
    Find,
    #[serde(rename = "C-MOVE")]
    Move,
    #[serde(rename = "C-GET")]
    Get,
    #[serde(rename = "ASSOCIATION")]
    Association,
    #[serde(rename = "CLEANUP")]
    Cleanup,
    /// A command the node could not map to a service, answered with 0x0211
    #[serde(rename = "UNRECOGNIZED")]
    Unrecognized,
}

impl From<Interaction> for TransactionType {
    fn from(interaction: Interaction) -> Self {
        match interaction {
            Interaction::Echo => TransactionType::Echo,
            Interaction::Store => TransactionType::Store,
            Interaction::Find => TransactionType::Find,
            Interaction::Move => TransactionType::Move,
            Interaction::Get => TransactionType::Get,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Success,
    Warning,
    Failure,
    Rejected,
    Timeout,
    Aborted,
}

impl From<AuditOutcome> for TransactionStatus {
    fn from(outcome: AuditOutcome) -> Self {
        match outcome {
            AuditOutcome::Success => TransactionStatus::Success,
            AuditOutcome::Warning => TransactionStatus::Warning,
            AuditOutcome::Failure => TransactionStatus::Failure,
            AuditOutcome::Rejected => TransactionStatus::Rejected,
            AuditOutcome::Timeout => TransactionStatus::Timeout,
            AuditOutcome::Aborted => TransactionStatus::Aborted,
        }
    }
}

/// One audit entry. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub calling_ae: Option<String>,
    pub called_ae: Option<String>,
    pub remote_ip: Option<String>,
    pub remote_port: Option<u16>,
    pub patient_id: Option<String>,
    pub study_uid: Option<String>,
    pub series_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
    pub sop_class_uid: Option<String>,
    pub file_path: Option<String>,
    pub file_size: Option<u64>,
    pub transfer_syntax: Option<String>,
    pub duration_ms: Option<u64>,
    pub object_count: Option<u32>,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
}

impl TransactionRecord {
    pub fn new(transaction_type: TransactionType, status: TransactionStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            transaction_type,
            status,
            calling_ae: None,
            called_ae: None,
            remote_ip: None,
            remote_port: None,
            patient_id: None,
            study_uid: None,
            series_uid: None,
            sop_instance_uid: None,
            sop_class_uid: None,
            file_path: None,
            file_size: None,
            transfer_syntax: None,
            duration_ms: None,
            object_count: None,
            status_code: None,
            error_message: None,
        }
    }

    pub fn with_peer(mut self, peer: &AssociationPeer) -> Self {
        self.calling_ae = Some(peer.calling_ae.clone());
        self.called_ae = Some(peer.called_ae.clone());
        self.remote_ip = Some(peer.remote_addr.ip().to_string());
        self.remote_port = Some(peer.remote_addr.port());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

impl From<&AuditEvent> for TransactionRecord {
    fn from(event: &AuditEvent) -> Self {
        let transaction_type = match event.kind {
            AuditKind::Association => TransactionType::Association,
            AuditKind::Exchange(interaction) => interaction.into(),
            AuditKind::Unrecognized { .. } => TransactionType::Unrecognized,
        };
        let detail = &event.detail;
        let mut record = TransactionRecord::new(transaction_type, event.outcome.into())
            .with_peer(&event.peer);

        record.patient_id = detail.patient_id.clone();
        record.study_uid = detail.study_uid.clone();
        record.series_uid = detail.series_uid.clone();
        record.sop_instance_uid = detail.sop_instance_uid.clone();
        record.sop_class_uid = detail.sop_class_uid.clone();
        record.file_path = detail.file_path.clone();
        record.file_size = detail.bytes;
        record.transfer_syntax = detail.transfer_syntax.clone();
        record.duration_ms = Some(event.duration.as_millis() as u64);
        record.status_code = detail.status;
        record.object_count = detail
            .counts
            .map(|c| u32::from(c.completed) + u32::from(c.failed) + u32::from(c.warning))
            .or(detail.matches);
        if event.outcome != AuditOutcome::Success {
            record.error_message = detail.message.clone();
        }
        record
    }
}

/// Handle on the transaction table
#[derive(Clone)]
pub struct TransactionLog {
    db: Arc<Database>,
}

impl TransactionLog {
    pub fn open(path: &Path) -> Result<Self> {
        let db = DatabaseManager::global().get_or_create_database(path)?;
        DatabaseOperation::write::<_, _, TxLogError>(&db, |txn| {
            txn.open_table(TRANSACTIONS)?;
            Ok(())
        })?;
        Ok(Self { db })
    }

    /// Append a record and return its sequence number
    pub fn append(&self, record: &TransactionRecord) -> Result<u64> {
        let json = serde_json::to_string(record)?;
        DatabaseOperation::write(&self.db, |txn| {
            let mut table = txn.open_table(TRANSACTIONS)?;
            let next = match table.last()? {
                Some((key, _)) => key.value() + 1,
                None => 1,
            };
            table.insert(next, json.as_str())?;
            Ok(next)
        })
    }

    pub fn append_event(&self, event: &AuditEvent) -> Result<u64> {
        self.append(&TransactionRecord::from(event))
    }

    pub fn len(&self) -> Result<u64> {
        DatabaseOperation::read(&self.db, |txn| {
            Ok(txn.open_table(TRANSACTIONS)?.len()?)
        })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Newest records first. Only for audit views and tests.
    pub fn recent(&self, limit: usize) -> Result<Vec<TransactionRecord>> {
        DatabaseOperation::read(&self.db, |txn| {
            let table = txn.open_table(TRANSACTIONS)?;
            let mut records = Vec::new();
            for entry in table.iter()?.rev().take(limit) {
                let (_, value) = entry?;
                records.push(serde_json::from_str(value.value())?);
            }
            Ok(records)
        })
    }
}

impl std::fmt::Debug for TransactionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionLog").finish_non_exhaustive()
    }
}
