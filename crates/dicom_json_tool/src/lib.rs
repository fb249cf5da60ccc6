use std::collections::BTreeMap;

use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemDicomObject;
use serde_json::Value;
use thiserror::Error;

pub mod model {
    use serde::{Deserialize, Serialize};
    use serde_json::Value;
    use std::collections::BTreeMap;

    /// An attribute usable as a query key
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueryKey {
        pub keyword: &'static str,
        pub tag: dicom_core::Tag,
        pub vr: dicom_core::VR,
    }

    /// One C-FIND match, both flattened for display and as DICOM JSON
    #[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
    pub struct ResultRow {
        pub level: String,
        /// Keyword to text value, for attributes with a known keyword
        pub attributes: BTreeMap<String, String>,
        /// Full identifier per Part 18
        pub dataset: Value,
    }

    impl ResultRow {
        pub fn get(&self, keyword: &str) -> Option<&str> {
            self.attributes.get(keyword).map(String::as_str)
        }
    }
}

use model::{QueryKey, ResultRow};

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("DICOM JSON conversion error: {0}")]
    Json(String),

    #[error("Unknown attribute keyword: {0}")]
    UnknownKeyword(String),

    #[error("Invalid filter '{0}', expected Keyword=Value")]
    InvalidFilter(String),
}

pub type Result<T> = std::result::Result<T, ConvertError>;

macro_rules! key {
    ($keyword:literal, $tag:expr, $vr:ident) => {
        QueryKey {
            keyword: $keyword,
            tag: $tag,
            vr: VR::$vr,
        }
    };
}

/// Attributes understood as filters or return keys
pub const KEYS: &[QueryKey] = &[
    key!("QueryRetrieveLevel", tags::QUERY_RETRIEVE_LEVEL, CS),
    key!("RetrieveAETitle", tags::RETRIEVE_AE_TITLE, AE),
    key!("PatientID", tags::PATIENT_ID, LO),
    key!("PatientName", tags::PATIENT_NAME, PN),
    key!("PatientBirthDate", tags::PATIENT_BIRTH_DATE, DA),
    key!("PatientSex", tags::PATIENT_SEX, CS),
    key!("StudyInstanceUID", tags::STUDY_INSTANCE_UID, UI),
    key!("StudyDate", tags::STUDY_DATE, DA),
    key!("StudyTime", tags::STUDY_TIME, TM),
    key!("StudyDescription", tags::STUDY_DESCRIPTION, LO),
    key!("StudyID", tags::STUDY_ID, SH),
    key!("AccessionNumber", tags::ACCESSION_NUMBER, SH),
    key!("ModalitiesInStudy", tags::MODALITIES_IN_STUDY, CS),
    key!("SeriesInstanceUID", tags::SERIES_INSTANCE_UID, UI),
    key!("SeriesDescription", tags::SERIES_DESCRIPTION, LO),
    key!("SeriesNumber", tags::SERIES_NUMBER, IS),
    key!("Modality", tags::MODALITY, CS),
    key!("SOPInstanceUID", tags::SOP_INSTANCE_UID, UI),
    key!("SOPClassUID", tags::SOP_CLASS_UID, UI),
    key!("InstanceNumber", tags::INSTANCE_NUMBER, IS),
    key!("NumberOfPatientRelatedStudies", tags::NUMBER_OF_PATIENT_RELATED_STUDIES, IS),
    key!("NumberOfPatientRelatedSeries", tags::NUMBER_OF_PATIENT_RELATED_SERIES, IS),
    key!("NumberOfPatientRelatedInstances", tags::NUMBER_OF_PATIENT_RELATED_INSTANCES, IS),
    key!("NumberOfStudyRelatedSeries", tags::NUMBER_OF_STUDY_RELATED_SERIES, IS),
    key!("NumberOfStudyRelatedInstances", tags::NUMBER_OF_STUDY_RELATED_INSTANCES, IS),
    key!("NumberOfSeriesRelatedInstances", tags::NUMBER_OF_SERIES_RELATED_INSTANCES, IS),
];

/// Look up a query key by keyword, ignoring case
pub fn key_by_keyword(keyword: &str) -> Option<&'static QueryKey> {
    KEYS.iter()
        .find(|k| k.keyword.eq_ignore_ascii_case(keyword.trim()))
}

pub fn key_by_tag(tag: Tag) -> Option<&'static QueryKey> {
    KEYS.iter().find(|k| k.tag == tag)
}

pub fn identifier_to_json_value(obj: &InMemDicomObject) -> Result<Value> {
    // Use dicom-json to encode dataset to standard DICOM JSON
    let v = dicom_json::to_value(obj).map_err(|e| ConvertError::Json(format!("{}", e)))?;
    Ok(v)
}

pub fn json_value_to_identifier(v: &Value) -> Result<InMemDicomObject> {
    let obj =
        dicom_json::from_value(v.clone()).map_err(|e| ConvertError::Json(format!("{}", e)))?;
    Ok(obj)
}

/// Split a `Keyword=Value` filter argument
pub fn parse_filter(arg: &str) -> Result<(String, String)> {
    let (keyword, value) = arg
        .split_once('=')
        .ok_or_else(|| ConvertError::InvalidFilter(arg.to_string()))?;
    let key = key_by_keyword(keyword).ok_or_else(|| ConvertError::UnknownKeyword(keyword.to_string()))?;
    Ok((key.keyword.to_string(), value.trim().to_string()))
}

/// Build a query identifier from keyword filters and return keys.
///
/// Return keys are added as empty attributes; a filter for the same keyword wins.
pub fn build_identifier(
    level: &str,
    filters: &[(String, String)],
    return_keys: &[String],
) -> Result<InMemDicomObject> {
    let mut obj = InMemDicomObject::new_empty();
    put(&mut obj, tags::QUERY_RETRIEVE_LEVEL, VR::CS, level);

    for keyword in return_keys {
        let key = key_by_keyword(keyword).ok_or_else(|| ConvertError::UnknownKeyword(keyword.clone()))?;
        put(&mut obj, key.tag, key.vr, "");
    }
    for (keyword, value) in filters {
        let key = key_by_keyword(keyword).ok_or_else(|| ConvertError::UnknownKeyword(keyword.clone()))?;
        put(&mut obj, key.tag, key.vr, value);
    }
    Ok(obj)
}

/// Flatten a C-FIND match into a result row
pub fn to_row(level: &str, obj: &InMemDicomObject) -> Result<ResultRow> {
    let mut attributes = BTreeMap::new();
    for key in KEYS {
        if let Ok(element) = obj.element(key.tag) {
            if let Ok(text) = element.to_str() {
                let text = text.trim_end_matches(['\0', ' ']).to_string();
                if !text.is_empty() {
                    attributes.insert(key.keyword.to_string(), text);
                }
            }
        }
    }
    Ok(ResultRow {
        level: level.to_string(),
        attributes,
        dataset: identifier_to_json_value(obj)?,
    })
}

fn put(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: &str) {
    let mut value = value.to_string();
    if value.len() % 2 == 1 {
        value.push(if vr == VR::UI { '\0' } else { ' ' });
    }
    let primitive = if value.is_empty() {
        PrimitiveValue::Empty
    } else {
        PrimitiveValue::from(value)
    };
    obj.put(DataElement::new(tag, vr, primitive));
}
