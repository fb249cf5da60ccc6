//! Series index backed by redb.
//!
//! The index is produced by an external indexing job; this crate only reads it to
//! answer C-FIND and to locate objects for C-MOVE / C-GET. The filesystem is never
//! scanned to answer a query.

pub mod identifier;
pub mod matching;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dimse::QueryLevel;
use redb::{
    Database, MultimapTableDefinition, ReadTransaction, ReadableTable, ReadableTableMetadata,
    TableDefinition,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::database_manager::{DatabaseError, DatabaseManager, DatabaseOperation};
pub use matching::{Attribute, Filter, Pattern};

const SERIES: TableDefinition<&str, &str> = TableDefinition::new("series");
const BY_STUDY: MultimapTableDefinition<&str, &str> = MultimapTableDefinition::new("by_study");
const BY_PATIENT: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("by_patient");
const BY_DATE: MultimapTableDefinition<&str, &str> = MultimapTableDefinition::new("by_date");

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Malformed index record: {0}")]
    Record(#[from] serde_json::Error),

    #[error("Query level {0} is not supported for C-FIND")]
    UnsupportedLevel(QueryLevel),
}

impl From<redb::TableError> for IndexError {
    fn from(e: redb::TableError) -> Self {
        IndexError::Database(e.into())
    }
}

impl From<redb::StorageError> for IndexError {
    fn from(e: redb::StorageError) -> Self {
        IndexError::Database(e.into())
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// One indexed series and the directory holding its files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub patient_id: String,
    #[serde(default)]
    pub patient_name: String,
    pub study_uid: String,
    #[serde(default)]
    pub study_date: String,
    #[serde(default)]
    pub study_description: String,
    pub series_uid: String,
    #[serde(default)]
    pub series_description: String,
    #[serde(default)]
    pub modality: String,
    #[serde(default)]
    pub series_number: Option<i32>,
    #[serde(default)]
    pub instance_count: u32,
    pub root_path: PathBuf,
}

/// A query result grouped to the requested level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryMatch {
    pub level: QueryLevel,
    /// Representative record: the first series of the group in key order
    pub record: SeriesRecord,
    pub study_count: u32,
    pub series_count: u32,
    pub instance_count: u32,
    pub modalities: BTreeSet<String>,
}

#[derive(Clone)]
pub struct SeriesIndex {
    db: Arc<Database>,
}

impl std::fmt::Debug for SeriesIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeriesIndex").finish_non_exhaustive()
    }
}

impl SeriesIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let db = DatabaseManager::global().get_or_create_database(path)?;
        DatabaseOperation::write::<_, _, IndexError>(&db, |txn| {
            txn.open_table(SERIES)?;
            txn.open_multimap_table(BY_STUDY)?;
            txn.open_multimap_table(BY_PATIENT)?;
            txn.open_multimap_table(BY_DATE)?;
            Ok(())
        })?;
        Ok(Self { db })
    }

    /// Insert or replace a series; used by the indexing job
    pub fn upsert(&self, record: &SeriesRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        DatabaseOperation::write(&self.db, |txn| {
            let mut series = txn.open_table(SERIES)?;
            let previous = match series.get(record.series_uid.as_str())? {
                Some(value) => Some(serde_json::from_str::<SeriesRecord>(value.value())?),
                None => None,
            };
            series.insert(record.series_uid.as_str(), json.as_str())?;
            drop(series);

            if let Some(previous) = previous {
                Self::unlink(txn, &previous)?;
            }
            let uid = record.series_uid.as_str();
            txn.open_multimap_table(BY_STUDY)?
                .insert(record.study_uid.as_str(), uid)?;
            txn.open_multimap_table(BY_PATIENT)?
                .insert(record.patient_id.as_str(), uid)?;
            txn.open_multimap_table(BY_DATE)?
                .insert(record.study_date.as_str(), uid)?;
            Ok(())
        })
    }

    pub fn remove(&self, series_uid: &str) -> Result<bool> {
        DatabaseOperation::write(&self.db, |txn| {
            let removed = match txn.open_table(SERIES)?.remove(series_uid)? {
                Some(value) => Some(serde_json::from_str::<SeriesRecord>(value.value())?),
                None => None,
            };
            match removed {
                Some(record) => {
                    Self::unlink(txn, &record)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn unlink(txn: &redb::WriteTransaction, record: &SeriesRecord) -> Result<()> {
        let uid = record.series_uid.as_str();
        txn.open_multimap_table(BY_STUDY)?
            .remove(record.study_uid.as_str(), uid)?;
        txn.open_multimap_table(BY_PATIENT)?
            .remove(record.patient_id.as_str(), uid)?;
        txn.open_multimap_table(BY_DATE)?
            .remove(record.study_date.as_str(), uid)?;
        Ok(())
    }

    pub fn get(&self, series_uid: &str) -> Result<Option<SeriesRecord>> {
        DatabaseOperation::read(&self.db, |txn| {
            let table = txn.open_table(SERIES)?;
            let record = match table.get(series_uid)? {
                Some(value) => Some(serde_json::from_str(value.value())?),
                None => None,
            };
            Ok(record)
        })
    }

    pub fn len(&self) -> Result<u64> {
        DatabaseOperation::read(&self.db, |txn| Ok(txn.open_table(SERIES)?.len()?))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Series records matching every filter, ordered by series UID
    pub fn matching_series(&self, filters: &[Filter]) -> Result<Vec<SeriesRecord>> {
        let filters: Vec<&Filter> = filters.iter().filter(|f| !f.is_universal()).collect();
        DatabaseOperation::read(&self.db, |txn| {
            let candidates = Self::candidates(txn, &filters)?;
            let mut records = Vec::new();
            for record in candidates {
                if filters.iter().all(|f| f.matches(&record)) {
                    records.push(record);
                }
            }
            records.sort_by(|a, b| a.series_uid.cmp(&b.series_uid));
            Ok(records)
        })
    }

    /// Answer a C-FIND at PATIENT, STUDY or SERIES level
    pub fn query(&self, level: QueryLevel, filters: &[Filter]) -> Result<Vec<QueryMatch>> {
        if level == QueryLevel::Image {
            return Err(IndexError::UnsupportedLevel(level));
        }
        let records = self.matching_series(filters)?;
        Ok(group(level, records))
    }

    /// Candidate records from the most selective index the filters allow
    fn candidates(txn: &ReadTransaction, filters: &[&Filter]) -> Result<Vec<SeriesRecord>> {
        let series = txn.open_table(SERIES)?;
        let find = |attribute: Attribute| {
            filters
                .iter()
                .find(|f| f.attribute == attribute)
                .map(|f| &f.pattern)
        };

        let uids: Vec<String> = if let Some(pattern) = find(Attribute::SeriesUid)
            .filter(|p| matches!(p, Pattern::Exact(_) | Pattern::List(_)))
        {
            match pattern {
                Pattern::Exact(uid) => vec![uid.clone()],
                Pattern::List(uids) => uids.clone(),
                _ => Vec::new(),
            }
        } else if let Some(Pattern::Exact(study)) = find(Attribute::StudyUid) {
            Self::lookup(txn, BY_STUDY, study)?
        } else if let Some(Pattern::List(studies)) = find(Attribute::StudyUid) {
            let mut uids = Vec::new();
            for study in studies {
                uids.extend(Self::lookup(txn, BY_STUDY, study)?);
            }
            uids
        } else if let Some(Pattern::Exact(patient)) = find(Attribute::PatientId) {
            Self::lookup(txn, BY_PATIENT, patient)?
        } else if let Some(pattern) = find(Attribute::StudyDate)
            .filter(|p| matches!(p, Pattern::Exact(_) | Pattern::Range { .. }))
        {
            Self::date_scan(txn, pattern)?
        } else if let Some(prefix) = find(Attribute::PatientId)
            .and_then(Pattern::literal_prefix)
            .filter(|prefix| !prefix.chars().any(char::is_alphabetic))
        {
            Self::prefix_scan(txn, BY_PATIENT, prefix)?
        } else {
            let mut records = Vec::new();
            for entry in series.iter()? {
                let (_, value) = entry?;
                records.push(serde_json::from_str(value.value())?);
            }
            return Ok(records);
        };

        let mut records = Vec::with_capacity(uids.len());
        let unique: BTreeSet<String> = uids.into_iter().collect();
        for uid in unique {
            if let Some(value) = series.get(uid.as_str())? {
                records.push(serde_json::from_str(value.value())?);
            }
        }
        Ok(records)
    }

    fn lookup(
        txn: &ReadTransaction,
        table: MultimapTableDefinition<'static, &'static str, &'static str>,
        key: &str,
    ) -> Result<Vec<String>> {
        let table = txn.open_multimap_table(table)?;
        let mut uids = Vec::new();
        for value in table.get(key)? {
            uids.push(value?.value().to_string());
        }
        Ok(uids)
    }

    fn date_scan(txn: &ReadTransaction, pattern: &Pattern) -> Result<Vec<String>> {
        let table = txn.open_multimap_table(BY_DATE)?;
        let (from, to) = match pattern {
            Pattern::Exact(date) => (Some(date.as_str()), Some(date.as_str())),
            Pattern::Range { from, to } => (from.as_deref(), to.as_deref()),
            _ => (None, None),
        };
        let mut uids = Vec::new();
        // undated records sort first and never satisfy a date filter
        for entry in table.range(from.unwrap_or("0")..)? {
            let (date, values) = entry?;
            if to.is_some_and(|to| date.value() > to) {
                break;
            }
            for value in values {
                uids.push(value?.value().to_string());
            }
        }
        Ok(uids)
    }

    fn prefix_scan(
        txn: &ReadTransaction,
        table: MultimapTableDefinition<'static, &'static str, &'static str>,
        prefix: &str,
    ) -> Result<Vec<String>> {
        let table = txn.open_multimap_table(table)?;
        let mut uids = Vec::new();
        for entry in table.range(prefix..)? {
            let (key, values) = entry?;
            if !key.value().starts_with(prefix) {
                break;
            }
            for value in values {
                uids.push(value?.value().to_string());
            }
        }
        Ok(uids)
    }
}

/// Collapse series records to one match per key of the requested level
fn group(level: QueryLevel, records: Vec<SeriesRecord>) -> Vec<QueryMatch> {
    let key = |record: &SeriesRecord| match level {
        QueryLevel::Patient => record.patient_id.clone(),
        QueryLevel::Study => record.study_uid.clone(),
        QueryLevel::Series | QueryLevel::Image => record.series_uid.clone(),
    };

    let mut groups: BTreeMap<String, Vec<SeriesRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(key(&record)).or_default().push(record);
    }

    groups
        .into_values()
        .filter_map(|members| {
            let studies: BTreeSet<&str> = members.iter().map(|r| r.study_uid.as_str()).collect();
            let modalities: BTreeSet<String> = members
                .iter()
                .map(|r| r.modality.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect();
            let study_count = studies.len() as u32;
            let series_count = members.len() as u32;
            let instance_count = members.iter().map(|r| r.instance_count).sum();
            let record = members.into_iter().next()?;
            Some(QueryMatch {
                level,
                record,
                study_count,
                series_count,
                instance_count,
                modalities,
            })
        })
        .collect()
}
