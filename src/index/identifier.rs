//! Translation between DIMSE identifiers and index filters / matches

use dicom_core::VR;
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dimse::message;
use dimse::QueryLevel;

use crate::index::{Attribute, Filter, QueryMatch};

/// Filters carried by a request identifier.
///
/// Attributes the index does not hold are ignored as filters; they are still echoed
/// back (empty) as return keys.
pub fn filters_from(identifier: &InMemDicomObject) -> Vec<Filter> {
    let mut filters = Vec::new();
    for element in identifier.iter() {
        let tag = element.header().tag;
        let Some(attribute) = Attribute::from_tag(tag) else {
            continue;
        };
        if let Some(value) = message::get_string(identifier, tag) {
            let filter = Filter::new(attribute, &value);
            if !filter.is_universal() {
                filters.push(filter);
            }
        }
    }
    filters
}

/// Response identifier for one match: every requested key, the unique keys of the
/// level and the retrieve AE title
pub fn response_identifier(
    request: &InMemDicomObject,
    found: &QueryMatch,
    retrieve_ae: &str,
) -> InMemDicomObject {
    let mut response = InMemDicomObject::new_empty();
    for element in request.iter() {
        let header = element.header();
        if header.vr == VR::SQ {
            continue;
        }
        let value = value_for(header.tag, found).unwrap_or_default();
        message::put_str(&mut response, header.tag, header.vr, &value);
    }

    message::put_str(
        &mut response,
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        found.level.as_str(),
    );
    let record = &found.record;
    message::put_str(&mut response, tags::PATIENT_ID, VR::LO, &record.patient_id);
    if found.level >= QueryLevel::Study {
        message::put_str(&mut response, tags::STUDY_INSTANCE_UID, VR::UI, &record.study_uid);
    }
    if found.level >= QueryLevel::Series {
        message::put_str(&mut response, tags::SERIES_INSTANCE_UID, VR::UI, &record.series_uid);
    }
    message::put_str(&mut response, tags::RETRIEVE_AE_TITLE, VR::AE, retrieve_ae);
    response
}

fn value_for(tag: dicom_core::Tag, found: &QueryMatch) -> Option<String> {
    let record = &found.record;
    let value = match tag {
        tags::MODALITIES_IN_STUDY => found
            .modalities
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\\"),
        tags::NUMBER_OF_PATIENT_RELATED_STUDIES if found.level == QueryLevel::Patient => {
            found.study_count.to_string()
        }
        tags::NUMBER_OF_PATIENT_RELATED_SERIES if found.level == QueryLevel::Patient => {
            found.series_count.to_string()
        }
        tags::NUMBER_OF_PATIENT_RELATED_INSTANCES if found.level == QueryLevel::Patient => {
            found.instance_count.to_string()
        }
        tags::NUMBER_OF_STUDY_RELATED_SERIES if found.level == QueryLevel::Study => {
            found.series_count.to_string()
        }
        tags::NUMBER_OF_STUDY_RELATED_INSTANCES if found.level == QueryLevel::Study => {
            found.instance_count.to_string()
        }
        tags::NUMBER_OF_SERIES_RELATED_INSTANCES if found.level == QueryLevel::Series => {
            found.instance_count.to_string()
        }
        _ => {
            let attribute = Attribute::from_tag(tag)?;
            // series level values have no single answer above the series level
            let series_only = matches!(
                attribute,
                Attribute::SeriesUid
                    | Attribute::SeriesDescription
                    | Attribute::SeriesNumber
                    | Attribute::Modality
            );
            if series_only && found.level < QueryLevel::Series {
                return None;
            }
            let study_only = matches!(
                attribute,
                Attribute::StudyUid | Attribute::StudyDate | Attribute::StudyDescription
            );
            if study_only && found.level < QueryLevel::Study {
                return None;
            }
            attribute.value(record)
        }
    };
    Some(value)
}
