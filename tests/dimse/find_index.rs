#[path = "../common/mod.rs"]
mod common;

use std::path::Path;

use common::{node_config, scu, wait_for_records, TestNode, SCU_AE};
use dicom_core::VR;
use dicom_dictionary_std::tags;
use dicom_node::index::{SeriesIndex, SeriesRecord};
use dicom_node::txlog::{TransactionStatus, TransactionType};
use dicom_object::InMemDicomObject;
use dimse::{message, DimseStatus, QueryLevel, QueryRetrieveModel};

#[allow(clippy::too_many_arguments)]
fn record(
    patient_id: &str,
    patient_name: &str,
    study: &str,
    date: &str,
    series: &str,
    modality: &str,
    instances: u32,
    root: &Path,
) -> SeriesRecord {
    SeriesRecord {
        patient_id: patient_id.into(),
        patient_name: patient_name.into(),
        study_uid: study.into(),
        study_date: date.into(),
        study_description: format!("study {}", study),
        series_uid: series.into(),
        series_description: format!("{} series", modality),
        modality: modality.into(),
        series_number: Some(1),
        instance_count: instances,
        root_path: root.join(series),
    }
}

/// Two patients, three studies, four series
fn seed(index: &SeriesIndex, root: &Path) {
    for r in [
        record("P1", "DOE^JANE", "1.1", "20260110", "1.1.1", "CT", 10, root),
        record("P1", "DOE^JANE", "1.1", "20260110", "1.1.2", "MR", 5, root),
        record("P1", "DOE^JANE", "1.2", "20260201", "1.2.1", "CT", 3, root),
        record("P2", "SMITH^JOHN", "2.1", "20251231", "2.1.1", "US", 7, root),
    ] {
        index.upsert(&r).unwrap();
    }
}

fn request(level: QueryLevel, keys: &[(dicom_core::Tag, VR, &str)]) -> InMemDicomObject {
    let mut identifier = message::identifier(level);
    for (tag, vr, value) in keys {
        message::put_str(&mut identifier, *tag, *vr, value);
    }
    identifier
}

fn values(matches: &[InMemDicomObject], tag: dicom_core::Tag) -> Vec<String> {
    matches
        .iter()
        .map(|m| message::get_string(m, tag).unwrap_or_default())
        .collect()
}

async fn seeded_node(dir: &Path) -> TestNode {
    let node = TestNode::start(node_config(dir)).await;
    let index = SeriesIndex::open(&dir.join("index.redb")).unwrap();
    seed(&index, &dir.join("store"));
    node
}

#[tokio::test]
async fn study_level_wildcard_with_counts() {
    let dir = tempfile::tempdir().unwrap();
    let node = seeded_node(dir.path()).await;

    let identifier = request(
        QueryLevel::Study,
        &[
            (tags::PATIENT_NAME, VR::PN, "doe*"),
            (tags::STUDY_INSTANCE_UID, VR::UI, ""),
            (tags::STUDY_DATE, VR::DA, ""),
            (tags::MODALITIES_IN_STUDY, VR::CS, ""),
            (tags::NUMBER_OF_STUDY_RELATED_SERIES, VR::IS, ""),
            (tags::NUMBER_OF_STUDY_RELATED_INSTANCES, VR::IS, ""),
            (tags::ACCESSION_NUMBER, VR::SH, ""),
        ],
    );
    let found = scu(SCU_AE)
        .find(&node.remote(), QueryRetrieveModel::StudyRoot, QueryLevel::Study, &identifier)
        .await
        .unwrap();

    assert_eq!(found.status, DimseStatus::Success);
    assert_eq!(values(&found.matches, tags::STUDY_INSTANCE_UID), ["1.1", "1.2"]);
    assert_eq!(values(&found.matches, tags::STUDY_DATE), ["20260110", "20260201"]);
    assert_eq!(values(&found.matches, tags::MODALITIES_IN_STUDY), ["CT\\MR", "CT"]);
    assert_eq!(values(&found.matches, tags::NUMBER_OF_STUDY_RELATED_SERIES), ["2", "1"]);
    assert_eq!(
        values(&found.matches, tags::NUMBER_OF_STUDY_RELATED_INSTANCES),
        ["15", "3"]
    );
    // keys the index does not hold come back empty
    assert_eq!(values(&found.matches, tags::ACCESSION_NUMBER), ["", ""]);
    assert_eq!(values(&found.matches, tags::RETRIEVE_AE_TITLE), ["NODE", "NODE"]);

    let txlog = node.txlog().await;
    let records = wait_for_records(&txlog, |r| {
        r.iter().any(|t| t.transaction_type == TransactionType::Find)
    })
    .await;
    let find = records
        .iter()
        .find(|t| t.transaction_type == TransactionType::Find)
        .unwrap();
    assert_eq!(find.status, TransactionStatus::Success);
    assert_eq!(find.object_count, Some(2));

    node.stop().await;
}

#[tokio::test]
async fn study_date_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let node = seeded_node(dir.path()).await;
    let client = scu(SCU_AE);

    let mut studies = Vec::new();
    for range in ["20260101-", "-20251231", "20260101-20260131", "20260201"] {
        let identifier = request(
            QueryLevel::Study,
            &[
                (tags::STUDY_DATE, VR::DA, range),
                (tags::STUDY_INSTANCE_UID, VR::UI, ""),
            ],
        );
        let found = client
            .find(&node.remote(), QueryRetrieveModel::StudyRoot, QueryLevel::Study, &identifier)
            .await
            .unwrap();
        assert_eq!(found.status, DimseStatus::Success);
        studies.push(values(&found.matches, tags::STUDY_INSTANCE_UID));
    }
    assert_eq!(studies[0], ["1.1", "1.2"]);
    assert_eq!(studies[1], ["2.1"]);
    assert_eq!(studies[2], ["1.1"]);
    assert_eq!(studies[3], ["1.2"]);

    node.stop().await;
}

#[tokio::test]
async fn series_level_within_a_study() {
    let dir = tempfile::tempdir().unwrap();
    let node = seeded_node(dir.path()).await;

    let identifier = request(
        QueryLevel::Series,
        &[
            (tags::STUDY_INSTANCE_UID, VR::UI, "1.1"),
            (tags::SERIES_INSTANCE_UID, VR::UI, ""),
            (tags::MODALITY, VR::CS, ""),
            (tags::NUMBER_OF_SERIES_RELATED_INSTANCES, VR::IS, ""),
        ],
    );
    let found = scu(SCU_AE)
        .find(&node.remote(), QueryRetrieveModel::StudyRoot, QueryLevel::Series, &identifier)
        .await
        .unwrap();

    assert_eq!(found.status, DimseStatus::Success);
    assert_eq!(values(&found.matches, tags::SERIES_INSTANCE_UID), ["1.1.1", "1.1.2"]);
    assert_eq!(values(&found.matches, tags::MODALITY), ["CT", "MR"]);
    assert_eq!(
        values(&found.matches, tags::NUMBER_OF_SERIES_RELATED_INSTANCES),
        ["10", "5"]
    );
    assert_eq!(
        values(&found.matches, tags::QUERY_RETRIEVE_LEVEL),
        ["SERIES", "SERIES"]
    );

    node.stop().await;
}

#[tokio::test]
async fn patient_level_counts_studies() {
    let dir = tempfile::tempdir().unwrap();
    let node = seeded_node(dir.path()).await;

    let identifier = request(
        QueryLevel::Patient,
        &[
            (tags::PATIENT_ID, VR::LO, ""),
            (tags::PATIENT_NAME, VR::PN, ""),
            (tags::NUMBER_OF_PATIENT_RELATED_STUDIES, VR::IS, ""),
        ],
    );
    let found = scu(SCU_AE)
        .find(&node.remote(), QueryRetrieveModel::PatientRoot, QueryLevel::Patient, &identifier)
        .await
        .unwrap();

    assert_eq!(found.status, DimseStatus::Success);
    assert_eq!(values(&found.matches, tags::PATIENT_ID), ["P1", "P2"]);
    assert_eq!(values(&found.matches, tags::PATIENT_NAME), ["DOE^JANE", "SMITH^JOHN"]);
    assert_eq!(
        values(&found.matches, tags::NUMBER_OF_PATIENT_RELATED_STUDIES),
        ["2", "1"]
    );

    node.stop().await;
}

#[tokio::test]
async fn identical_queries_give_identical_answers() {
    let dir = tempfile::tempdir().unwrap();
    let node = seeded_node(dir.path()).await;
    let client = scu(SCU_AE);
    let identifier = request(
        QueryLevel::Series,
        &[
            (tags::PATIENT_ID, VR::LO, "P1"),
            (tags::SERIES_INSTANCE_UID, VR::UI, ""),
            (tags::SERIES_DESCRIPTION, VR::LO, ""),
        ],
    );

    let first = client
        .find(&node.remote(), QueryRetrieveModel::StudyRoot, QueryLevel::Series, &identifier)
        .await
        .unwrap();
    let second = client
        .find(&node.remote(), QueryRetrieveModel::StudyRoot, QueryLevel::Series, &identifier)
        .await
        .unwrap();

    assert_eq!(first.matches.len(), 3);
    assert_eq!(
        values(&first.matches, tags::SERIES_INSTANCE_UID),
        values(&second.matches, tags::SERIES_INSTANCE_UID)
    );
    assert_eq!(
        values(&first.matches, tags::SERIES_DESCRIPTION),
        values(&second.matches, tags::SERIES_DESCRIPTION)
    );

    node.stop().await;
}

#[tokio::test]
async fn index_changes_show_up_on_the_next_query() {
    let dir = tempfile::tempdir().unwrap();
    let node = seeded_node(dir.path()).await;
    let client = scu(SCU_AE);
    let identifier = request(
        QueryLevel::Study,
        &[
            (tags::PATIENT_ID, VR::LO, "P2"),
            (tags::STUDY_INSTANCE_UID, VR::UI, ""),
        ],
    );

    let before = client
        .find(&node.remote(), QueryRetrieveModel::StudyRoot, QueryLevel::Study, &identifier)
        .await
        .unwrap();
    assert_eq!(before.matches.len(), 1);

    let index = SeriesIndex::open(&dir.path().join("index.redb")).unwrap();
    index
        .upsert(&record(
            "P2",
            "SMITH^JOHN",
            "2.2",
            "20260301",
            "2.2.1",
            "CT",
            1,
            dir.path(),
        ))
        .unwrap();

    let after = client
        .find(&node.remote(), QueryRetrieveModel::StudyRoot, QueryLevel::Study, &identifier)
        .await
        .unwrap();
    assert_eq!(values(&after.matches, tags::STUDY_INSTANCE_UID), ["2.1", "2.2"]);

    node.stop().await;
}

#[tokio::test]
async fn image_level_find_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let node = seeded_node(dir.path()).await;

    let identifier = request(
        QueryLevel::Image,
        &[
            (tags::STUDY_INSTANCE_UID, VR::UI, "1.1"),
            (tags::SERIES_INSTANCE_UID, VR::UI, "1.1.1"),
            (tags::SOP_INSTANCE_UID, VR::UI, ""),
        ],
    );
    let found = scu(SCU_AE)
        .find(&node.remote(), QueryRetrieveModel::StudyRoot, QueryLevel::Image, &identifier)
        .await
        .unwrap();

    assert_eq!(
        found.status,
        DimseStatus::Failure(DimseStatus::CANNOT_UNDERSTAND)
    );
    assert!(found.matches.is_empty());

    node.stop().await;
}
