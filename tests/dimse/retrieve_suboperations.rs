#[path = "../common/mod.rs"]
mod common;

use std::path::Path;

use common::{node_config, scu, CollectingSink, Instance, TestNode, NODE_AE, SCU_AE};
use dicom_core::VR;
use dicom_dictionary_std::tags;
use dicom_node::config::Peer;
use dicom_node::index::{SeriesIndex, SeriesRecord};
use dicom_node::qr::{JobStatus, RetrieveMode, RetrieveTarget};
use dimse::{message, DimseStatus, QueryLevel, QueryRetrieveModel, SubOperationCounts};

const STUDY: &str = "1.2.826.0.1.3680043.9.1";
const SERIES: &str = "1.2.826.0.1.3680043.9.1.1";
const SOPS: [&str; 2] = ["1.2.826.0.1.3680043.9.1.1.1", "1.2.826.0.1.3680043.9.1.1.2"];

fn series_record(root_path: &Path, instances: u32) -> SeriesRecord {
    SeriesRecord {
        patient_id: "PAT001".into(),
        patient_name: "DOE^JANE".into(),
        study_uid: STUDY.into(),
        study_date: "20260115".into(),
        series_uid: SERIES.into(),
        modality: "CT".into(),
        instance_count: instances,
        root_path: root_path.to_path_buf(),
        ..Default::default()
    }
}

/// Push two instances into the node and index their series directory
async fn seed_stored_series(node: &TestNode, dir: &Path) {
    let outgoing = dir.join("outgoing");
    let files: Vec<_> = SOPS
        .iter()
        .map(|sop| Instance::new(STUDY, SERIES, sop).write(&outgoing))
        .collect();
    let reports = scu(SCU_AE).store(&node.remote(), &files).await.unwrap();
    assert!(reports.iter().all(|r| r.is_success()));

    let series_dir = dir.join("store").join("PAT001").join(STUDY).join(SERIES);
    let index = SeriesIndex::open(&dir.join("index.redb")).unwrap();
    index.upsert(&series_record(&series_dir, 2)).unwrap();
}

fn identifier(level: QueryLevel, keys: &[(dicom_core::Tag, &str)]) -> dicom_object::InMemDicomObject {
    let mut identifier = message::identifier(level);
    for (tag, value) in keys {
        message::put_str(&mut identifier, *tag, VR::UI, value);
    }
    identifier
}

#[tokio::test]
async fn get_announces_zero_count_when_nothing_matches() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(node_config(dir.path())).await;
    let sink = CollectingSink::default();
    let mut seen = Vec::new();

    let summary = scu(SCU_AE)
        .get(
            &node.remote(),
            QueryRetrieveModel::StudyRoot,
            QueryLevel::Study,
            &identifier(QueryLevel::Study, &[(tags::STUDY_INSTANCE_UID, "9.9.9")]),
            &sink,
            |counts| seen.push(counts),
        )
        .await
        .unwrap();

    assert_eq!(seen, [SubOperationCounts::default()]);
    assert_eq!(summary.status, DimseStatus::Success);
    assert_eq!(summary.total, 0);
    assert!(sink.received.lock().unwrap().is_empty());

    node.stop().await;
}

#[tokio::test]
async fn get_sends_every_file_of_the_series() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(node_config(dir.path())).await;
    seed_stored_series(&node, dir.path()).await;

    let sink = CollectingSink::default();
    let mut seen = Vec::new();
    let summary = scu(SCU_AE)
        .get(
            &node.remote(),
            QueryRetrieveModel::StudyRoot,
            QueryLevel::Series,
            &identifier(
                QueryLevel::Series,
                &[(tags::STUDY_INSTANCE_UID, STUDY), (tags::SERIES_INSTANCE_UID, SERIES)],
            ),
            &sink,
            |counts| seen.push(counts),
        )
        .await
        .unwrap();

    // the count goes out before the first sub-operation
    assert_eq!(seen.first(), Some(&SubOperationCounts::new(2)));
    assert_eq!(summary.status, DimseStatus::Success);
    assert_eq!(summary.total, 2);
    assert_eq!(summary.counts.completed, 2);
    assert_eq!(summary.counts.failed, 0);
    assert_eq!(*sink.received.lock().unwrap(), SOPS);

    node.stop().await;
}

#[tokio::test]
async fn image_level_get_sends_only_the_named_instance() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(node_config(dir.path())).await;
    seed_stored_series(&node, dir.path()).await;

    let sink = CollectingSink::default();
    let summary = scu(SCU_AE)
        .get(
            &node.remote(),
            QueryRetrieveModel::StudyRoot,
            QueryLevel::Image,
            &identifier(
                QueryLevel::Image,
                &[
                    (tags::STUDY_INSTANCE_UID, STUDY),
                    (tags::SERIES_INSTANCE_UID, SERIES),
                    (tags::SOP_INSTANCE_UID, SOPS[1]),
                ],
            ),
            &sink,
            |_| {},
        )
        .await
        .unwrap();

    assert_eq!(summary.status, DimseStatus::Success);
    assert_eq!(summary.total, 1);
    assert_eq!(*sink.received.lock().unwrap(), [SOPS[1]]);

    node.stop().await;
}

#[tokio::test]
async fn missing_series_directory_gives_partial_job() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(node_config(dir.path())).await;
    let port = node.addr.port();
    node.store
        .update(|c| c.peers = vec![Peer::new("self", NODE_AE, "127.0.0.1", port)]);

    let index = SeriesIndex::open(&dir.path().join("index.redb")).unwrap();
    index
        .upsert(&series_record(&dir.path().join("moved-away"), 1))
        .unwrap();

    let client = node.manager.qr_client().await.unwrap();
    let job = client
        .retrieve("self", RetrieveTarget::series(STUDY, SERIES), RetrieveMode::Get)
        .await
        .unwrap();

    let progress = job.progress();
    assert_eq!(job.status(), JobStatus::Partial);
    assert_eq!(progress.total, 1);
    assert_eq!(progress.completed, 0);
    assert_eq!(progress.failed, 1);
    assert!(job.error.is_none());
    assert!(job.finished_at.is_some());

    node.stop().await;
}

#[tokio::test]
async fn unknown_move_destination_is_refused_before_counting() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(node_config(dir.path())).await;
    seed_stored_series(&node, dir.path()).await;

    let mut seen = Vec::new();
    let summary = scu(SCU_AE)
        .move_(
            &node.remote(),
            QueryRetrieveModel::StudyRoot,
            QueryLevel::Study,
            &identifier(QueryLevel::Study, &[(tags::STUDY_INSTANCE_UID, STUDY)]),
            "NOWHERE",
            |counts| seen.push(counts),
        )
        .await
        .unwrap();

    assert!(seen.is_empty());
    assert_eq!(
        summary.status,
        DimseStatus::Failure(DimseStatus::MOVE_DESTINATION_UNKNOWN)
    );

    // the same refusal through a job leaves it failed
    let port = node.addr.port();
    node.store.update(|c| {
        let mut peer = Peer::new("self", NODE_AE, "127.0.0.1", port);
        peer.move_destination_ae = Some("NOWHERE".into());
        c.peers = vec![peer];
    });
    let client = node.manager.qr_client().await.unwrap();
    let job = client
        .retrieve("self", RetrieveTarget::study(STUDY), RetrieveMode::Move)
        .await
        .unwrap();
    assert_eq!(job.status(), JobStatus::Failed);
    assert!(job.error.as_deref().unwrap().contains("0xA801"));

    node.stop().await;
}

#[tokio::test]
async fn move_delivers_to_a_configured_destination() {
    let archive_dir = tempfile::tempdir().unwrap();
    let mut archive_config = node_config(archive_dir.path());
    archive_config.dimse.local_aet = "ARCHIVE".into();
    let archive = TestNode::start(archive_config).await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(dir.path());
    config.peers = vec![Peer::new("archive", "ARCHIVE", "127.0.0.1", archive.addr.port())];
    let node = TestNode::start(config).await;
    seed_stored_series(&node, dir.path()).await;

    let mut seen = Vec::new();
    let summary = scu(SCU_AE)
        .move_(
            &node.remote(),
            QueryRetrieveModel::StudyRoot,
            QueryLevel::Series,
            &identifier(
                QueryLevel::Series,
                &[(tags::STUDY_INSTANCE_UID, STUDY), (tags::SERIES_INSTANCE_UID, SERIES)],
            ),
            "ARCHIVE",
            |counts| seen.push(counts),
        )
        .await
        .unwrap();

    assert_eq!(seen.first(), Some(&SubOperationCounts::new(2)));
    assert_eq!(summary.status, DimseStatus::Success);
    assert_eq!(summary.counts.completed, 2);

    let delivered = archive_dir
        .path()
        .join("store")
        .join("PAT001")
        .join(STUDY)
        .join(SERIES);
    for sop in SOPS {
        assert!(delivered.join(format!("{}.dcm", sop)).is_file());
    }

    node.stop().await;
    archive.stop().await;
}
