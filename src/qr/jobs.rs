use std::time::Duration;

use chrono::{DateTime, Utc};
use dicom_core::VR;
use dicom_dictionary_std::tags;
use dicom_json_tool::model::ResultRow;
use dicom_object::InMemDicomObject;
use dimse::{message, QueryLevel, SubOperationCounts};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Partial,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Partial | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Partial => "partial",
            JobStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// A C-FIND against a peer and its ordered results
#[derive(Debug, Clone, Serialize)]
pub struct QueryJob {
    pub id: Uuid,
    pub peer: String,
    pub level: QueryLevel,
    /// `Keyword=Value` filters as given
    pub parameters: Vec<(String, String)>,
    pub status: JobStatus,
    pub results: Vec<ResultRow>,
    pub started_at: DateTime<Utc>,
    pub duration: Option<Duration>,
    pub error: Option<String>,
}

impl QueryJob {
    pub fn new(peer: impl Into<String>, level: QueryLevel, parameters: Vec<(String, String)>) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer: peer.into(),
            level,
            parameters,
            status: JobStatus::Pending,
            results: Vec::new(),
            started_at: Utc::now(),
            duration: None,
            error: None,
        }
    }

    pub(crate) fn complete(&mut self, results: Vec<ResultRow>, duration: Duration) {
        self.results = results;
        self.status = JobStatus::Completed;
        self.duration = Some(duration);
    }

    pub(crate) fn fail(&mut self, error: impl Into<String>, duration: Duration) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.duration = Some(duration);
    }
}

/// Push (C-MOVE) or pull (C-GET)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrieveMode {
    Move,
    Get,
}

impl std::str::FromStr for RetrieveMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "move" | "c-move" => Ok(RetrieveMode::Move),
            "get" | "c-get" => Ok(RetrieveMode::Get),
            other => Err(format!("unknown retrieve mode '{}', expected move or get", other)),
        }
    }
}

impl std::fmt::Display for RetrieveMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RetrieveMode::Move => "C-MOVE",
            RetrieveMode::Get => "C-GET",
        })
    }
}

/// What to retrieve. The deepest UID given sets the level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveTarget {
    pub study_uid: String,
    pub series_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
}

impl RetrieveTarget {
    pub fn study(study_uid: impl Into<String>) -> Self {
        Self {
            study_uid: study_uid.into(),
            ..Default::default()
        }
    }

    pub fn series(study_uid: impl Into<String>, series_uid: impl Into<String>) -> Self {
        Self {
            study_uid: study_uid.into(),
            series_uid: Some(series_uid.into()),
            sop_instance_uid: None,
        }
    }

    pub fn level(&self) -> QueryLevel {
        if self.sop_instance_uid.is_some() {
            QueryLevel::Image
        } else if self.series_uid.is_some() {
            QueryLevel::Series
        } else {
            QueryLevel::Study
        }
    }

    pub fn identifier(&self) -> InMemDicomObject {
        let mut identifier = message::identifier(self.level());
        message::put_str(&mut identifier, tags::STUDY_INSTANCE_UID, VR::UI, &self.study_uid);
        if let Some(series) = &self.series_uid {
            message::put_str(&mut identifier, tags::SERIES_INSTANCE_UID, VR::UI, series);
        }
        if let Some(instance) = &self.sop_instance_uid {
            message::put_str(&mut identifier, tags::SOP_INSTANCE_UID, VR::UI, instance);
        }
        identifier
    }
}

/// Counters and status of a running retrieve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetrieveProgress {
    pub status: JobStatus,
    pub total: u32,
    pub remaining: u32,
    pub completed: u32,
    pub failed: u32,
    pub warning: u32,
}

impl Default for RetrieveProgress {
    fn default() -> Self {
        Self {
            status: JobStatus::Pending,
            total: 0,
            remaining: 0,
            completed: 0,
            failed: 0,
            warning: 0,
        }
    }
}

impl RetrieveProgress {
    fn apply(&mut self, counts: SubOperationCounts) {
        self.total = self.total.max(counts.total());
        self.remaining = u32::from(counts.remaining);
        self.completed = u32::from(counts.completed);
        self.failed = u32::from(counts.failed);
        self.warning = u32::from(counts.warning);
    }

    /// Status once the peer sent its final response
    fn settled(&self) -> JobStatus {
        if self.failed > 0 && self.completed < self.total {
            JobStatus::Partial
        } else {
            JobStatus::Completed
        }
    }
}

/// A C-MOVE or C-GET against a peer.
///
/// Counters change while the exchange runs; [`RetrieveJob::subscribe`] follows them.
/// The job is terminal once the association is closed.
#[derive(Debug)]
pub struct RetrieveJob {
    pub id: Uuid,
    pub peer: String,
    pub mode: RetrieveMode,
    pub target: RetrieveTarget,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    progress: watch::Sender<RetrieveProgress>,
}

impl RetrieveJob {
    pub fn new(peer: impl Into<String>, target: RetrieveTarget, mode: RetrieveMode) -> Self {
        let (progress, _) = watch::channel(RetrieveProgress::default());
        Self {
            id: Uuid::new_v4(),
            peer: peer.into(),
            mode,
            target,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            progress,
        }
    }

    pub fn level(&self) -> QueryLevel {
        self.target.level()
    }

    pub fn subscribe(&self) -> watch::Receiver<RetrieveProgress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> RetrieveProgress {
        *self.progress.borrow()
    }

    pub fn status(&self) -> JobStatus {
        self.progress.borrow().status
    }

    pub(crate) fn begin(&self) {
        self.progress.send_modify(|p| p.status = JobStatus::InProgress);
    }

    pub(crate) fn record(&self, counts: SubOperationCounts) {
        self.progress.send_modify(|p| p.apply(counts));
    }

    /// Close the job with the peer's final counters
    pub(crate) fn settle(&mut self, counts: SubOperationCounts, total: u32, error: Option<String>) {
        self.progress.send_modify(|p| {
            p.apply(counts);
            p.total = p.total.max(total);
            p.remaining = 0;
            p.status = if error.is_some() && p.completed == 0 && p.failed == 0 && p.warning == 0 {
                JobStatus::Failed
            } else {
                p.settled()
            };
        });
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    /// Close the job after the exchange itself failed
    pub(crate) fn fail(&mut self, error: impl Into<String>) {
        self.progress.send_modify(|p| p.status = JobStatus::Failed);
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }
}
