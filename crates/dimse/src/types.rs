//! Common types for DIMSE operations

use serde::{Deserialize, Serialize};

use crate::error::DimseError;
use crate::uids;

/// The five interaction types this node serves.
///
/// Dispatch over this enum is exhaustive; there is no string keyed handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interaction {
    /// C-ECHO
    Echo,
    /// C-STORE
    Store,
    /// C-FIND
    Find,
    /// C-MOVE (push-retrieve)
    Move,
    /// C-GET (pull-retrieve)
    Get,
}

impl Interaction {
    pub const ALL: [Interaction; 5] = [
        Interaction::Echo,
        Interaction::Store,
        Interaction::Find,
        Interaction::Move,
        Interaction::Get,
    ];

    /// Map a request command field to its interaction
    pub fn from_request_field(field: u16) -> Option<Self> {
        match field {
            0x0030 => Some(Interaction::Echo),
            0x0001 => Some(Interaction::Store),
            0x0020 => Some(Interaction::Find),
            0x0021 => Some(Interaction::Move),
            0x0010 => Some(Interaction::Get),
            _ => None,
        }
    }

    pub fn request_field(self) -> u16 {
        match self {
            Interaction::Echo => 0x0030,
            Interaction::Store => 0x0001,
            Interaction::Find => 0x0020,
            Interaction::Move => 0x0021,
            Interaction::Get => 0x0010,
        }
    }

    pub fn response_field(self) -> u16 {
        self.request_field() | 0x8000
    }

    pub fn label(self) -> &'static str {
        match self {
            Interaction::Echo => "C-ECHO",
            Interaction::Store => "C-STORE",
            Interaction::Find => "C-FIND",
            Interaction::Move => "C-MOVE",
            Interaction::Get => "C-GET",
        }
    }
}

impl std::fmt::Display for Interaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Which interactions the SCP offers during negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSet {
    #[serde(default = "default_true")]
    pub echo: bool,
    #[serde(default = "default_true")]
    pub store: bool,
    #[serde(default = "default_true")]
    pub find: bool,
    #[serde(default = "default_true", rename = "move")]
    pub move_: bool,
    #[serde(default = "default_true")]
    pub get: bool,
}

impl Default for ServiceSet {
    fn default() -> Self {
        Self {
            echo: true,
            store: true,
            find: true,
            move_: true,
            get: true,
        }
    }
}

impl ServiceSet {
    pub fn allows(&self, interaction: Interaction) -> bool {
        match interaction {
            Interaction::Echo => self.echo,
            Interaction::Store => self.store,
            Interaction::Find => self.find,
            Interaction::Move => self.move_,
            Interaction::Get => self.get,
        }
    }
}

fn default_true() -> bool {
    true
}

/// DICOM query/retrieve levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QueryLevel {
    /// Patient level
    Patient,
    /// Study level
    Study,
    /// Series level
    Series,
    /// Image level
    Image,
}

impl QueryLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryLevel::Patient => "PATIENT",
            QueryLevel::Study => "STUDY",
            QueryLevel::Series => "SERIES",
            QueryLevel::Image => "IMAGE",
        }
    }
}

impl std::fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueryLevel {
    type Err = DimseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PATIENT" => Ok(QueryLevel::Patient),
            "STUDY" => Ok(QueryLevel::Study),
            "SERIES" => Ok(QueryLevel::Series),
            "IMAGE" => Ok(QueryLevel::Image),
            _ => Err(DimseError::config(format!("Invalid query level: {}", s))),
        }
    }
}

/// Query/Retrieve information model used for FIND, MOVE and GET
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryRetrieveModel {
    PatientRoot,
    #[default]
    StudyRoot,
    PatientStudyOnly,
}

impl QueryRetrieveModel {
    pub const ALL: [QueryRetrieveModel; 3] = [
        QueryRetrieveModel::PatientRoot,
        QueryRetrieveModel::StudyRoot,
        QueryRetrieveModel::PatientStudyOnly,
    ];

    /// SOP class UID for the given Q/R interaction, `None` for echo/store
    pub fn sop_class(self, interaction: Interaction) -> Option<&'static str> {
        let uid = match (self, interaction) {
            (QueryRetrieveModel::PatientRoot, Interaction::Find) => uids::PATIENT_ROOT_FIND,
            (QueryRetrieveModel::PatientRoot, Interaction::Move) => uids::PATIENT_ROOT_MOVE,
            (QueryRetrieveModel::PatientRoot, Interaction::Get) => uids::PATIENT_ROOT_GET,
            (QueryRetrieveModel::StudyRoot, Interaction::Find) => uids::STUDY_ROOT_FIND,
            (QueryRetrieveModel::StudyRoot, Interaction::Move) => uids::STUDY_ROOT_MOVE,
            (QueryRetrieveModel::StudyRoot, Interaction::Get) => uids::STUDY_ROOT_GET,
            (QueryRetrieveModel::PatientStudyOnly, Interaction::Find) => {
                uids::PATIENT_STUDY_ONLY_FIND
            }
            (QueryRetrieveModel::PatientStudyOnly, Interaction::Move) => {
                uids::PATIENT_STUDY_ONLY_MOVE
            }
            (QueryRetrieveModel::PatientStudyOnly, Interaction::Get) => {
                uids::PATIENT_STUDY_ONLY_GET
            }
            (_, Interaction::Echo) | (_, Interaction::Store) => return None,
        };
        Some(uid)
    }

    /// Identify the model and interaction behind a Q/R SOP class UID
    pub fn from_sop_class(uid: &str) -> Option<(Self, Interaction)> {
        let uid = uids::trim_uid(uid);
        for model in Self::ALL {
            for interaction in [Interaction::Find, Interaction::Move, Interaction::Get] {
                if model.sop_class(interaction) == Some(uid) {
                    return Some((model, interaction));
                }
            }
        }
        None
    }
}

/// Priority of a DIMSE request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Priority {
    /// Low priority
    Low,
    /// Medium priority (default)
    #[default]
    Medium,
    /// High priority
    High,
}

impl Priority {
    pub fn code(self) -> u16 {
        match self {
            Priority::Medium => 0x0000,
            Priority::High => 0x0001,
            Priority::Low => 0x0002,
        }
    }
}

/// DIMSE operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimseStatus {
    /// Operation completed successfully
    Success,
    /// Operation is pending (more responses to follow)
    Pending,
    /// Operation cancelled by user
    Cancel,
    /// Operation failed with error
    Failure(u16),
    /// Warning occurred during operation
    Warning(u16),
}

impl DimseStatus {
    pub const SUCCESS: u16 = 0x0000;
    pub const PENDING: u16 = 0xFF00;
    pub const PENDING_WARNING: u16 = 0xFF01;
    pub const CANCEL: u16 = 0xFE00;
    /// Refused: out of resources
    pub const OUT_OF_RESOURCES: u16 = 0xA700;
    /// Refused: out of resources, unable to perform sub-operations
    pub const OUT_OF_RESOURCES_SUBOPS: u16 = 0xA702;
    /// Refused: move destination unknown
    pub const MOVE_DESTINATION_UNKNOWN: u16 = 0xA801;
    /// Error: data set does not match SOP class
    pub const IDENTIFIER_MISMATCH: u16 = 0xA900;
    /// Error: cannot understand
    pub const CANNOT_UNDERSTAND: u16 = 0xC000;
    /// Warning: sub-operations complete, one or more failures
    pub const SUBOPS_WITH_FAILURES: u16 = 0xB000;
    pub const PROCESSING_FAILURE: u16 = 0x0110;
    pub const NO_SUCH_SOP_CLASS: u16 = 0x0118;
    pub const SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;
    pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;

    pub fn from_code(code: u16) -> Self {
        match code {
            0x0000 => DimseStatus::Success,
            0xFF00 | 0xFF01 => DimseStatus::Pending,
            0xFE00 => DimseStatus::Cancel,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => DimseStatus::Warning(code),
            _ => DimseStatus::Failure(code),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            DimseStatus::Success => Self::SUCCESS,
            DimseStatus::Pending => Self::PENDING,
            DimseStatus::Cancel => Self::CANCEL,
            DimseStatus::Failure(code) | DimseStatus::Warning(code) => code,
        }
    }

    pub fn is_pending(self) -> bool {
        matches!(self, DimseStatus::Pending)
    }

    pub fn is_success(self) -> bool {
        matches!(self, DimseStatus::Success)
    }
}

impl std::fmt::Display for DimseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}", self.code())
    }
}

/// Sub-operation counters carried by C-MOVE and C-GET responses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubOperationCounts {
    pub remaining: u16,
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
}

impl SubOperationCounts {
    pub fn new(total: u16) -> Self {
        Self {
            remaining: total,
            ..Default::default()
        }
    }

    pub fn total(&self) -> u32 {
        self.remaining as u32 + self.completed as u32 + self.failed as u32 + self.warning as u32
    }

    /// Account for one finished sub-operation
    pub fn record(&mut self, status: DimseStatus) {
        self.remaining = self.remaining.saturating_sub(1);
        match status {
            DimseStatus::Success => self.completed = self.completed.saturating_add(1),
            DimseStatus::Warning(_) => self.warning = self.warning.saturating_add(1),
            _ => self.failed = self.failed.saturating_add(1),
        }
    }

    /// Final status of a retrieve once all sub-operations ran
    pub fn final_status(&self) -> u16 {
        if self.failed == 0 && self.warning == 0 {
            DimseStatus::SUCCESS
        } else {
            DimseStatus::SUBOPS_WITH_FAILURES
        }
    }
}
