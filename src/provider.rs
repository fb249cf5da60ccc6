//! The node's answers to the DIMSE service hooks.
//!
//! [`NodeProvider`] decides admission from the allow-list, stores objects through the
//! [`StorageEngine`], answers queries and locates retrieve items from the
//! [`SeriesIndex`], and records every audit event in the [`TransactionLog`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dimse::files::{self, FileIdentity};
use dimse::{
    message, Admission, AssociationPeer, AuditDetail, AuditEvent, AuditKind, AuditOutcome,
    DimseStatus, ProviderFailure, QueryLevel, QueryRequest, ReceivedObject, RejectReason,
    RemoteNode, RetrieveItem, ServiceProvider, StoreOutcome, StoreSink,
};
use futures_util::stream::{self, BoxStream, StreamExt};
use walkdir::WalkDir;

use crate::config::{normalize_ae, ColdSnapshot, ConfigStore};
use crate::index::identifier::{filters_from, response_identifier};
use crate::index::{IndexError, SeriesIndex, SeriesRecord};
use crate::service::ServiceStats;
use crate::storage::{ObjectAttributes, StorageEngine, StorageError};
use crate::txlog::TransactionLog;

/// Attributes an object must carry when validation on receive is on
const REQUIRED_ATTRIBUTES: [(dicom_core::Tag, &str); 4] = [
    (tags::PATIENT_ID, "PatientID"),
    (tags::STUDY_INSTANCE_UID, "StudyInstanceUID"),
    (tags::SERIES_INSTANCE_UID, "SeriesInstanceUID"),
    (tags::SOP_INSTANCE_UID, "SOPInstanceUID"),
];

pub struct NodeProvider {
    config: Arc<dyn ConfigStore>,
    cold: Arc<ColdSnapshot>,
    index: SeriesIndex,
    txlog: TransactionLog,
    storage: Arc<StorageEngine>,
    stats: Arc<ServiceStats>,
}

impl NodeProvider {
    pub fn new(
        config: Arc<dyn ConfigStore>,
        cold: Arc<ColdSnapshot>,
        index: SeriesIndex,
        txlog: TransactionLog,
        storage: Arc<StorageEngine>,
        stats: Arc<ServiceStats>,
    ) -> Self {
        Self {
            config,
            cold,
            index,
            txlog,
            storage,
            stats,
        }
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    pub fn txlog(&self) -> &TransactionLog {
        &self.txlog
    }

    pub fn index(&self) -> &SeriesIndex {
        &self.index
    }

    pub fn local_ae(&self) -> &str {
        &self.cold.dimse.local_aet
    }

    async fn index_task<T, F>(&self, work: F) -> Result<T, ProviderFailure>
    where
        T: Send + 'static,
        F: FnOnce(SeriesIndex) -> Result<T, IndexError> + Send + 'static,
    {
        let index = self.index.clone();
        match tokio::task::spawn_blocking(move || work(index)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(IndexError::UnsupportedLevel(level))) => Err(ProviderFailure::new(
                DimseStatus::CANNOT_UNDERSTAND,
                format!("query level {} is not supported", level),
            )),
            Ok(Err(e)) => {
                tracing::error!("Index lookup failed: {}", e);
                Err(ProviderFailure::new(
                    DimseStatus::PROCESSING_FAILURE,
                    format!("index unavailable: {}", e),
                ))
            }
            Err(e) => Err(ProviderFailure::new(
                DimseStatus::PROCESSING_FAILURE,
                format!("index task failed: {}", e),
            )),
        }
    }
}

impl std::fmt::Debug for NodeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeProvider")
            .field("local_ae", &self.cold.dimse.local_aet)
            .finish_non_exhaustive()
    }
}

fn object_attributes(dataset: &InMemDicomObject, object: &ReceivedObject) -> ObjectAttributes {
    let text = |tag| message::get_string(dataset, tag).unwrap_or_default();
    let non_empty = |value: String, fallback: &str| {
        if value.is_empty() {
            fallback.to_string()
        } else {
            value
        }
    };
    ObjectAttributes {
        patient_id: text(tags::PATIENT_ID),
        study_uid: text(tags::STUDY_INSTANCE_UID),
        series_uid: text(tags::SERIES_INSTANCE_UID),
        sop_instance_uid: non_empty(text(tags::SOP_INSTANCE_UID), &object.sop_instance_uid),
        sop_class_uid: non_empty(text(tags::SOP_CLASS_UID), &object.sop_class_uid),
        instance_number: message::get_string(dataset, tags::INSTANCE_NUMBER)
            .and_then(|n| n.trim().parse().ok()),
    }
}

fn missing_attributes(dataset: &InMemDicomObject) -> Vec<&'static str> {
    REQUIRED_ATTRIBUTES
        .iter()
        .filter(|(tag, _)| {
            message::get_string(dataset, *tag).map_or(true, |value| value.is_empty())
        })
        .map(|(_, name)| *name)
        .collect()
}

/// Files of one series directory in name order, skipping hidden and temporary files
fn series_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .map(|e| e.into_path())
        .collect()
}

fn retrieve_items(records: Vec<SeriesRecord>, sop_instances: &[String]) -> Vec<RetrieveItem> {
    let mut items = Vec::new();
    for record in records {
        let found = if record.root_path.is_dir() {
            series_files(&record.root_path)
        } else {
            Vec::new()
        };
        let paths: Vec<PathBuf> = if sop_instances.is_empty() {
            found
        } else {
            found
                .into_iter()
                .filter(|path| {
                    files::read_identity(path)
                        .map(|identity| sop_instances.contains(&identity.sop_instance_uid))
                        .unwrap_or(false)
                })
                .collect()
        };

        if paths.is_empty() {
            tracing::warn!(
                "Series {} has no files under {}",
                record.series_uid,
                record.root_path.display()
            );
            items.push(RetrieveItem {
                label: format!("series {} ({})", record.series_uid, record.root_path.display()),
                path: None,
            });
            continue;
        }
        for path in paths {
            items.push(RetrieveItem {
                label: path.display().to_string(),
                path: Some(path),
            });
        }
    }
    items
}

#[async_trait]
impl StoreSink for NodeProvider {
    async fn store(&self, origin: &AssociationPeer, object: ReceivedObject) -> StoreOutcome {
        let settings = match self.storage.settings().await {
            Ok(settings) => settings,
            Err(e) => {
                self.stats.error();
                return StoreOutcome::failure(DimseStatus::PROCESSING_FAILURE, e.to_string());
            }
        };

        let dataset = match message::read_dataset(&object.data, &object.transfer_syntax) {
            Ok(dataset) => dataset,
            Err(e) => {
                tracing::warn!(
                    "Unreadable object {} from {}: {}",
                    object.sop_instance_uid,
                    origin.calling_ae,
                    e
                );
                self.stats.error();
                return StoreOutcome::failure(
                    DimseStatus::CANNOT_UNDERSTAND,
                    format!("cannot parse data set: {}", e),
                );
            }
        };
        let attrs = object_attributes(&dataset, &object);

        let mut warning = None;
        if settings.validate_on_receive {
            let missing = missing_attributes(&dataset);
            if !missing.is_empty() {
                let message = format!("missing required attributes: {}", missing.join(", "));
                if settings.reject_invalid {
                    tracing::warn!(
                        "Rejecting {} from {}: {}",
                        attrs.sop_instance_uid,
                        origin.calling_ae,
                        message
                    );
                    self.stats.error();
                    return StoreOutcome::failure(DimseStatus::CANNOT_UNDERSTAND, message);
                }
                tracing::warn!("Storing {} anyway: {}", attrs.sop_instance_uid, message);
                warning = Some(message);
            }
        }

        let identity = FileIdentity {
            sop_class_uid: attrs.sop_class_uid.clone(),
            sop_instance_uid: attrs.sop_instance_uid.clone(),
            transfer_syntax: object.transfer_syntax.clone(),
        };
        let file = match files::encode_part10(&identity, &object.data) {
            Ok(file) => file,
            Err(e) => {
                tracing::error!("Cannot build file for {}: {}", attrs.sop_instance_uid, e);
                self.stats.error();
                return StoreOutcome::failure(DimseStatus::PROCESSING_FAILURE, e.to_string());
            }
        };

        match self.storage.store(&attrs, file).await {
            Ok(stored) => {
                self.stats.file_received(stored.bytes);
                tracing::debug!("📦 Stored {}", stored.path.display());
                let detail = AuditDetail {
                    patient_id: Some(attrs.patient_id.clone()),
                    study_uid: Some(attrs.study_uid.clone()),
                    series_uid: Some(attrs.series_uid.clone()),
                    sop_instance_uid: Some(attrs.sop_instance_uid.clone()),
                    sop_class_uid: Some(attrs.sop_class_uid.clone()),
                    file_path: Some(stored.path.display().to_string()),
                    bytes: Some(stored.bytes),
                    message: warning.clone(),
                    ..Default::default()
                };
                let mut outcome = StoreOutcome::success(detail);
                if warning.is_some() {
                    outcome.outcome = AuditOutcome::Warning;
                }
                outcome
            }
            Err(StorageError::CapacityExceeded {
                used,
                incoming,
                ceiling,
            }) => {
                self.stats.error();
                let mut outcome = StoreOutcome::failure(
                    DimseStatus::OUT_OF_RESOURCES,
                    format!(
                        "storage full: {} used + {} incoming exceeds {} bytes",
                        used, incoming, ceiling
                    ),
                );
                outcome.detail.patient_id = Some(attrs.patient_id);
                outcome.detail.study_uid = Some(attrs.study_uid);
                outcome.detail.series_uid = Some(attrs.series_uid);
                outcome
            }
            Err(e) => {
                tracing::error!("Failed to write {}: {}", attrs.sop_instance_uid, e);
                self.stats.error();
                StoreOutcome::failure(DimseStatus::PROCESSING_FAILURE, e.to_string())
            }
        }
    }
}

#[async_trait]
impl ServiceProvider for NodeProvider {
    async fn admit(&self, peer: &AssociationPeer) -> Admission {
        if normalize_ae(&peer.called_ae) != normalize_ae(&self.cold.dimse.local_aet) {
            return Admission::Reject(RejectReason::CalledAeNotRecognized);
        }

        let access = &self.cold.access;
        let remote_ip = peer.remote_addr.ip();
        if access.require_ip_validation && !access.allowed_ip_addresses.contains(&remote_ip) {
            return Admission::Reject(RejectReason::AddressNotAllowed);
        }

        if access.require_calling_ae_validation {
            let allow_list = match self.config.allow_list().await {
                Ok(list) => list,
                Err(e) => {
                    tracing::error!("Cannot read allow-list, refusing {}: {}", peer.calling_ae, e);
                    return Admission::Reject(RejectReason::CallingAeNotRecognized);
                }
            };
            let calling = normalize_ae(&peer.calling_ae);
            let entries: Vec<_> = allow_list
                .iter()
                .filter(|entry| entry.active && entry.ae_title == calling)
                .collect();
            if entries.is_empty() {
                return Admission::Reject(RejectReason::CallingAeNotRecognized);
            }
            if !entries
                .iter()
                .any(|entry| entry.admits(&peer.calling_ae, remote_ip))
            {
                return Admission::Reject(RejectReason::AddressNotAllowed);
            }
        }
        Admission::Accept
    }

    async fn find(
        &self,
        peer: &AssociationPeer,
        request: &QueryRequest,
    ) -> Result<BoxStream<'static, InMemDicomObject>, ProviderFailure> {
        let level = request.level;
        let filters = filters_from(&request.identifier);
        tracing::debug!(
            "C-FIND from {} at {} with {} filter(s)",
            peer.calling_ae,
            level,
            filters.len()
        );
        let matches = self
            .index_task(move |index| index.query(level, &filters))
            .await?;

        let retrieve_ae = self.local_ae().to_string();
        let responses: Vec<InMemDicomObject> = matches
            .iter()
            .map(|found| response_identifier(&request.identifier, found, &retrieve_ae))
            .collect();
        Ok(stream::iter(responses).boxed())
    }

    async fn locate(
        &self,
        peer: &AssociationPeer,
        request: &QueryRequest,
    ) -> Result<Vec<RetrieveItem>, ProviderFailure> {
        let filters = filters_from(&request.identifier);
        if filters.is_empty() {
            return Err(ProviderFailure::new(
                DimseStatus::CANNOT_UNDERSTAND,
                "retrieve identifier has no keys",
            ));
        }
        let sop_instances: Vec<String> = if request.level == QueryLevel::Image {
            message::get_string(&request.identifier, tags::SOP_INSTANCE_UID)
                .filter(|uids| !uids.is_empty())
                .map(|uids| uids.split('\\').map(|u| u.trim().to_string()).collect())
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let items = self
            .index_task(move |index| {
                let records = index.matching_series(&filters)?;
                Ok(retrieve_items(records, &sop_instances))
            })
            .await?;
        tracing::info!(
            "🔄 Located {} item(s) at {} level for {}",
            items.len(),
            request.level,
            peer.calling_ae
        );
        Ok(items)
    }

    async fn resolve_destination(&self, ae_title: &str) -> Option<RemoteNode> {
        let wanted = normalize_ae(ae_title);
        let peers = match self.config.peers().await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::error!("Cannot read peers: {}", e);
                return None;
            }
        };
        peers
            .iter()
            .find(|peer| peer.is_active && normalize_ae(&peer.ae_title) == wanted)
            .map(|peer| peer.remote_node())
    }

    async fn audit(&self, event: AuditEvent) {
        match (event.kind, event.outcome) {
            (AuditKind::Association, AuditOutcome::Success) => self.stats.connection_accepted(),
            (AuditKind::Association, AuditOutcome::Rejected) => self.stats.connection_rejected(),
            (AuditKind::Exchange(_), AuditOutcome::Failure) => self.stats.error(),
            (AuditKind::Unrecognized { .. }, _) => self.stats.error(),
            _ => {}
        }
        let txlog = self.txlog.clone();
        let result = tokio::task::spawn_blocking(move || txlog.append_event(&event)).await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!("Failed to record transaction: {}", e),
            Err(e) => tracing::error!("Transaction log task failed: {}", e),
        }
    }
}
