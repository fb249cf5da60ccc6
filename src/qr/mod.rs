//! Query/Retrieve client: echo, query, retrieve and push against configured peers.

pub mod jobs;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dicom_json_tool::model::ResultRow;
use dicom_object::InMemDicomObject;
use dimse::{
    AssociationPeer, AuditDetail, AuditEvent, AuditKind, DimseConfig, DimseError, DimseScu,
    DimseStatus, FindOutcome, Interaction, QueryLevel, ReceivedObject, StoreOutcome, StoreSink,
};
use serde::Serialize;
use thiserror::Error;

use crate::config::{ConfigError, ConfigStore, Peer};
use crate::txlog::{TransactionLog, TransactionRecord, TransactionStatus, TransactionType};

pub use jobs::{JobStatus, QueryJob, RetrieveJob, RetrieveMode, RetrieveProgress, RetrieveTarget};

#[derive(Debug, Error)]
pub enum QrError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Peer '{0}' is not active")]
    InactivePeer(String),

    #[error("Peer '{peer}' does not support {interaction}")]
    Unsupported {
        peer: String,
        interaction: Interaction,
    },

    #[error("Invalid query: {0}")]
    Query(#[from] dicom_json_tool::ConvertError),

    #[error(transparent)]
    Dimse(#[from] DimseError),
}

pub type Result<T> = std::result::Result<T, QrError>;

/// Outcome of a connection test
#[derive(Debug, Clone, Serialize)]
pub struct EchoResult {
    pub peer: String,
    pub success: bool,
    pub status: Option<u16>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushReport {
    pub path: PathBuf,
    pub status: Option<u16>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushSummary {
    pub peer: String,
    pub succeeded: usize,
    pub failed: usize,
    pub reports: Vec<PushReport>,
}

/// Store sink for C-GET sub-operations: delegates storing and records each object
struct AuditingSink {
    inner: Arc<dyn StoreSink>,
    txlog: Option<TransactionLog>,
}

#[async_trait]
impl StoreSink for AuditingSink {
    async fn store(&self, origin: &AssociationPeer, object: ReceivedObject) -> StoreOutcome {
        let started = Instant::now();
        let sop_class_uid = object.sop_class_uid.clone();
        let sop_instance_uid = object.sop_instance_uid.clone();
        let transfer_syntax = object.transfer_syntax.clone();
        let outcome = self.inner.store(origin, object).await;

        if let Some(txlog) = &self.txlog {
            let mut detail: AuditDetail = outcome.detail.clone();
            detail.status = Some(outcome.status);
            detail.sop_class_uid.get_or_insert(sop_class_uid);
            detail.sop_instance_uid.get_or_insert(sop_instance_uid);
            detail.transfer_syntax.get_or_insert(transfer_syntax);
            let event = AuditEvent {
                kind: AuditKind::Exchange(Interaction::Store),
                outcome: outcome.outcome,
                peer: origin.clone(),
                detail,
                duration: started.elapsed(),
            };
            if let Err(e) = txlog.append_event(&event) {
                tracing::error!("Failed to record C-GET sub-operation: {}", e);
            }
        }
        outcome
    }
}

/// Client side of query/retrieve. Peers are looked up fresh for every call.
pub struct QrClient {
    scu: DimseScu,
    config: Arc<dyn ConfigStore>,
    sink: Arc<AuditingSink>,
    txlog: Option<TransactionLog>,
}

impl QrClient {
    /// `sink` receives objects pulled with C-GET; it is normally the same sink that
    /// serves inbound C-STORE.
    pub fn new(
        dimse: DimseConfig,
        config: Arc<dyn ConfigStore>,
        sink: Arc<dyn StoreSink>,
        txlog: Option<TransactionLog>,
    ) -> Self {
        Self {
            scu: DimseScu::new(dimse),
            config,
            sink: Arc::new(AuditingSink {
                inner: sink,
                txlog: txlog.clone(),
            }),
            txlog,
        }
    }

    pub fn local_ae(&self) -> &str {
        &self.scu.config().local_aet
    }

    async fn peer(&self, name: &str) -> Result<Peer> {
        let peers = self.config.peers().await?;
        let peer = peers
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| ConfigError::UnknownPeer(name.to_string()))?;
        if !peer.is_active {
            return Err(QrError::InactivePeer(peer.name));
        }
        Ok(peer)
    }

    fn require(peer: &Peer, interaction: Interaction) -> Result<()> {
        if peer.supports(interaction) {
            Ok(())
        } else {
            Err(QrError::Unsupported {
                peer: peer.name.clone(),
                interaction,
            })
        }
    }

    fn record(&self, peer: &Peer, record: TransactionRecord) {
        let Some(txlog) = &self.txlog else {
            return;
        };
        let mut record = record;
        record.calling_ae = Some(self.local_ae().to_string());
        record.called_ae = Some(peer.ae_title.clone());
        record.remote_ip = Some(peer.host.clone());
        record.remote_port = Some(peer.port);
        if let Err(e) = txlog.append(&record) {
            tracing::error!("Failed to record transaction: {}", e);
        }
    }

    /// Verify connectivity with C-ECHO. Failures are reported, not returned.
    pub async fn echo(&self, peer_name: &str) -> Result<EchoResult> {
        let peer = self.peer(peer_name).await?;
        let started = Instant::now();
        let result = self.scu.echo(&peer.remote_node()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let echo = match result {
            Ok(status) => EchoResult {
                peer: peer.name.clone(),
                success: status.is_success(),
                status: Some(status.code()),
                duration_ms,
                error: (!status.is_success()).then(|| format!("peer answered {}", status)),
            },
            Err(e) => {
                tracing::warn!("C-ECHO to {} failed: {}", peer.name, e);
                EchoResult {
                    peer: peer.name.clone(),
                    success: false,
                    status: None,
                    duration_ms,
                    error: Some(e.to_string()),
                }
            }
        };

        let status = if echo.success {
            TransactionStatus::Success
        } else {
            TransactionStatus::Failure
        };
        let mut record = TransactionRecord::new(TransactionType::Echo, status);
        record.duration_ms = Some(duration_ms);
        record.status_code = echo.status;
        record.error_message = echo.error.clone();
        self.record(&peer, record);
        Ok(echo)
    }

    /// Run a C-FIND with `Keyword=Value` filters; return keys default per level
    pub async fn query(
        &self,
        peer_name: &str,
        level: QueryLevel,
        parameters: Vec<(String, String)>,
    ) -> Result<QueryJob> {
        let peer = self.peer(peer_name).await?;
        Self::require(&peer, Interaction::Find)?;

        let return_keys: Vec<String> = default_return_keys(level)
            .iter()
            .map(|k| k.to_string())
            .collect();
        let identifier =
            dicom_json_tool::build_identifier(level.as_str(), &parameters, &return_keys)?;

        let mut job = QueryJob::new(&peer.name, level, parameters);
        job.status = JobStatus::InProgress;
        let started = Instant::now();
        let outcome = self
            .scu
            .find(&peer.remote_node(), peer.query_retrieve_model, level, &identifier)
            .await;

        settle_query(&mut job, outcome, started.elapsed(), |matched| {
            dicom_json_tool::to_row(level.as_str(), matched)
        });

        tracing::info!(
            "Query {} on {} finished {} with {} result(s)",
            job.id,
            peer.name,
            job.status,
            job.results.len()
        );
        let status = match job.status {
            JobStatus::Completed => TransactionStatus::Success,
            _ => TransactionStatus::Failure,
        };
        let mut record = TransactionRecord::new(TransactionType::Find, status);
        record.duration_ms = job.duration.map(|d| d.as_millis() as u64);
        record.object_count = Some(job.results.len() as u32);
        record.error_message = job.error.clone();
        self.record(&peer, record);
        Ok(job)
    }

    /// Create and run a retrieve job
    pub async fn retrieve(
        &self,
        peer_name: &str,
        target: RetrieveTarget,
        mode: RetrieveMode,
    ) -> Result<RetrieveJob> {
        let mut job = RetrieveJob::new(peer_name, target, mode);
        self.run_retrieve(&mut job).await?;
        Ok(job)
    }

    /// Run a job created by the caller, so it can subscribe to progress first.
    ///
    /// Only configuration problems are returned as errors; a failed exchange leaves
    /// the job in the failed state.
    pub async fn run_retrieve(&self, job: &mut RetrieveJob) -> Result<()> {
        let peer = self.peer(&job.peer).await?;
        let interaction = match job.mode {
            RetrieveMode::Move => Interaction::Move,
            RetrieveMode::Get => Interaction::Get,
        };
        Self::require(&peer, interaction)?;

        let node = peer.remote_node();
        let level = job.level();
        let identifier = job.target.identifier();
        let started = Instant::now();
        job.begin();

        let outcome = {
            let tracker = &*job;
            let progress = |counts| tracker.record(counts);
            match tracker.mode {
                RetrieveMode::Move => {
                    let destination = peer
                        .move_destination_ae
                        .clone()
                        .unwrap_or_else(|| self.local_ae().to_string());
                    self.scu
                        .move_(
                            &node,
                            peer.query_retrieve_model,
                            level,
                            &identifier,
                            destination.trim(),
                            progress,
                        )
                        .await
                }
                RetrieveMode::Get => {
                    self.scu
                        .get(
                            &node,
                            peer.query_retrieve_model,
                            level,
                            &identifier,
                            self.sink.as_ref(),
                            progress,
                        )
                        .await
                }
            }
        };

        match outcome {
            Ok(summary) => {
                let error = match summary.status {
                    DimseStatus::Failure(_) | DimseStatus::Cancel => {
                        Some(format!("peer answered {}", summary.status))
                    }
                    _ => None,
                };
                job.settle(summary.counts, summary.total, error);
            }
            Err(e) => {
                tracing::warn!("{} from {} failed: {}", job.mode, peer.name, e);
                job.fail(e.to_string());
            }
        }

        let progress = job.progress();
        tracing::info!(
            "Retrieve {} from {} finished {}: {} completed, {} failed, {} warning of {}",
            job.id,
            peer.name,
            progress.status,
            progress.completed,
            progress.failed,
            progress.warning,
            progress.total
        );
        let status = match progress.status {
            JobStatus::Completed => TransactionStatus::Success,
            JobStatus::Partial => TransactionStatus::Warning,
            _ => TransactionStatus::Failure,
        };
        let mut record = TransactionRecord::new(interaction.into(), status);
        record.study_uid = Some(job.target.study_uid.clone());
        record.series_uid = job.target.series_uid.clone();
        record.sop_instance_uid = job.target.sop_instance_uid.clone();
        record.duration_ms = Some(started.elapsed().as_millis() as u64);
        record.object_count = Some(progress.completed + progress.failed + progress.warning);
        record.error_message = job.error.clone();
        self.record(&peer, record);
        Ok(())
    }

    /// Send local files to a peer with C-STORE, one transaction per file
    pub async fn push(&self, peer_name: &str, files: &[PathBuf]) -> Result<PushSummary> {
        let peer = self.peer(peer_name).await?;
        let started = Instant::now();
        let reports = match self.scu.store(&peer.remote_node(), files).await {
            Ok(reports) => reports
                .into_iter()
                .map(|r| PushReport {
                    status: r.status.map(DimseStatus::code),
                    error: match (&r.error, r.status) {
                        (Some(e), _) => Some(e.clone()),
                        (None, Some(status)) if !r.is_success() => {
                            Some(format!("peer answered {}", status))
                        }
                        _ => None,
                    },
                    path: r.path,
                })
                .collect::<Vec<_>>(),
            Err(e) => {
                tracing::warn!("C-STORE push to {} failed: {}", peer.name, e);
                files
                    .iter()
                    .map(|path| PushReport {
                        path: path.clone(),
                        status: None,
                        error: Some(e.to_string()),
                    })
                    .collect()
            }
        };
        let elapsed = started.elapsed();

        for report in &reports {
            let status = if report.error.is_none() {
                TransactionStatus::Success
            } else {
                TransactionStatus::Failure
            };
            let mut record = TransactionRecord::new(TransactionType::Store, status);
            record.file_path = Some(report.path.display().to_string());
            record.file_size = std::fs::metadata(&report.path).ok().map(|m| m.len());
            record.status_code = report.status;
            record.duration_ms = Some(per_file(elapsed, reports.len()));
            record.error_message = report.error.clone();
            self.record(&peer, record);
        }

        let failed = reports.iter().filter(|r| r.error.is_some()).count();
        tracing::info!(
            "Pushed {} file(s) to {}: {} failed",
            reports.len(),
            peer.name,
            failed
        );
        Ok(PushSummary {
            peer: peer.name,
            succeeded: reports.len() - failed,
            failed,
            reports,
        })
    }
}

fn per_file(elapsed: Duration, files: usize) -> u64 {
    (elapsed.as_millis() / files.max(1) as u128) as u64
}

/// Return keys requested when the caller gives none
pub fn default_return_keys(level: QueryLevel) -> &'static [&'static str] {
    match level {
        QueryLevel::Patient => &[
            "PatientName",
            "PatientID",
            "PatientBirthDate",
            "NumberOfPatientRelatedStudies",
        ],
        QueryLevel::Study => &[
            "PatientName",
            "PatientID",
            "StudyInstanceUID",
            "StudyDate",
            "StudyDescription",
            "AccessionNumber",
            "ModalitiesInStudy",
            "NumberOfStudyRelatedSeries",
            "NumberOfStudyRelatedInstances",
        ],
        QueryLevel::Series => &[
            "PatientID",
            "StudyInstanceUID",
            "SeriesInstanceUID",
            "SeriesNumber",
            "SeriesDescription",
            "Modality",
            "NumberOfSeriesRelatedInstances",
        ],
        QueryLevel::Image => &[
            "StudyInstanceUID",
            "SeriesInstanceUID",
            "SOPInstanceUID",
            "SOPClassUID",
            "InstanceNumber",
        ],
    }
}

/// Move a query job to its final state; every outcome ends completed or failed
fn settle_query<F>(
    job: &mut QueryJob,
    outcome: dimse::Result<FindOutcome>,
    elapsed: Duration,
    to_row: F,
) where
    F: Fn(&InMemDicomObject) -> dicom_json_tool::Result<ResultRow>,
{
    match outcome {
        Ok(found) if found.status.is_success() => {
            let rows: std::result::Result<Vec<_>, _> = found.matches.iter().map(to_row).collect();
            match rows {
                Ok(rows) => job.complete(rows, elapsed),
                Err(e) => {
                    tracing::warn!("Cannot convert a C-FIND match from {}: {}", job.peer, e);
                    job.fail(e.to_string(), elapsed);
                }
            }
        }
        Ok(found) => {
            job.fail(format!("peer answered {}", found.status), elapsed);
        }
        Err(e) => {
            tracing::warn!("C-FIND to {} failed: {}", job.peer, e);
            job.fail(e.to_string(), elapsed);
        }
    }
}
