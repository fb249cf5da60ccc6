#[path = "../common/mod.rs"]
mod common;

use common::{node_config, scu, wait_for_records, write_file, Instance, TestNode, SCU_AE};
use dicom_dictionary_std::tags;
use dicom_node::config::NamingPolicy;
use dicom_node::txlog::{TransactionStatus, TransactionType};
use dimse::{message, DimseStatus};

const STUDY: &str = "1.2.826.0.1.3680043.2.1";
const SERIES: &str = "1.2.826.0.1.3680043.2.1.1";

fn leftovers(root: &std::path::Path) -> Vec<String> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".part"))
        .collect()
}

#[tokio::test]
async fn series_layout_places_by_uid_and_logs_success() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(node_config(dir.path())).await;

    let sop = "1.2.826.0.1.3680043.2.1.1.7";
    let file = Instance::new(STUDY, SERIES, sop).write(&dir.path().join("outgoing"));
    let reports = scu(SCU_AE).store(&node.remote(), &[file]).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, Some(DimseStatus::Success));

    let expected = dir
        .path()
        .join("store")
        .join("PAT001")
        .join(STUDY)
        .join(SERIES)
        .join(format!("{}.dcm", sop));
    assert!(expected.is_file(), "missing {}", expected.display());

    let stored = dicom_object::open_file(&expected).unwrap();
    assert_eq!(
        message::get_string(&stored, tags::SOP_INSTANCE_UID).as_deref(),
        Some(sop)
    );

    let txlog = node.txlog().await;
    let records = wait_for_records(&txlog, |r| {
        r.iter().any(|t| t.transaction_type == TransactionType::Store)
    })
    .await;
    let store = records
        .iter()
        .find(|t| t.transaction_type == TransactionType::Store)
        .unwrap();
    assert_eq!(store.status, TransactionStatus::Success);
    assert_eq!(store.file_path.as_deref(), Some(expected.to_str().unwrap()));
    assert_eq!(store.sop_instance_uid.as_deref(), Some(sop));
    assert_eq!(store.study_uid.as_deref(), Some(STUDY));
    assert_eq!(store.patient_id.as_deref(), Some("PAT001"));
    assert!(store.file_size.unwrap() > 0);
    assert!(store.error_message.is_none());

    let status = node.manager.status().await;
    assert_eq!(status.stats.files_received, 1);
    assert!(status.stats.bytes_received > 0);

    node.stop().await;
}

#[tokio::test]
async fn lowered_ceiling_applies_without_restart() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(node_config(dir.path())).await;
    let outgoing = dir.path().join("outgoing");

    let first = Instance::new(STUDY, SERIES, "1.2.826.0.1.3680043.2.1.1.1").write(&outgoing);
    let reports = scu(SCU_AE).store(&node.remote(), &[first]).await.unwrap();
    assert_eq!(reports[0].status, Some(DimseStatus::Success));

    // usage is now above the new ceiling and eviction is off
    node.store.update(|c| c.storage.max_storage_bytes = 1);

    let sop = "1.2.826.0.1.3680043.2.1.1.2";
    let second = Instance::new(STUDY, SERIES, sop).write(&outgoing);
    let reports = scu(SCU_AE).store(&node.remote(), &[second]).await.unwrap();
    assert_eq!(
        reports[0].status,
        Some(DimseStatus::Failure(DimseStatus::OUT_OF_RESOURCES))
    );

    let root = dir.path().join("store");
    let target = root
        .join("PAT001")
        .join(STUDY)
        .join(SERIES)
        .join(format!("{}.dcm", sop));
    assert!(!target.exists());
    assert!(leftovers(&root).is_empty());

    let txlog = node.txlog().await;
    let records = wait_for_records(&txlog, |r| {
        r.iter().any(|t| {
            t.transaction_type == TransactionType::Store && t.status == TransactionStatus::Failure
        })
    })
    .await;
    let refused = records
        .iter()
        .find(|t| t.transaction_type == TransactionType::Store && t.status == TransactionStatus::Failure)
        .unwrap();
    assert_eq!(refused.status_code, Some(DimseStatus::OUT_OF_RESOURCES));
    assert!(refused.error_message.as_deref().unwrap().contains("storage full"));

    // raising the ceiling again needs no restart either
    node.store.update(|c| c.storage.max_storage_bytes = 0);
    let third = outgoing.join(format!("{}.dcm", sop));
    let reports = scu(SCU_AE).store(&node.remote(), &[third]).await.unwrap();
    assert_eq!(reports[0].status, Some(DimseStatus::Success));
    assert!(target.is_file());

    node.stop().await;
}

#[tokio::test]
async fn incomplete_objects_follow_validation_policy() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(dir.path());
    config.storage.reject_invalid = true;
    let node = TestNode::start(config).await;
    let outgoing = dir.path().join("outgoing");

    let sop = "1.2.826.0.1.3680043.2.1.9.1";
    let mut dataset = Instance::new(STUDY, SERIES, sop).dataset();
    dataset.remove_element(tags::SERIES_INSTANCE_UID);
    let file = write_file(&outgoing, sop, dataset);

    let reports = scu(SCU_AE)
        .store(&node.remote(), std::slice::from_ref(&file))
        .await
        .unwrap();
    assert_eq!(
        reports[0].status,
        Some(DimseStatus::Failure(DimseStatus::CANNOT_UNDERSTAND))
    );

    // without reject_invalid the object is kept and the entry is a warning
    node.store.update(|c| c.storage.reject_invalid = false);
    let reports = scu(SCU_AE).store(&node.remote(), &[file]).await.unwrap();
    assert_eq!(reports[0].status, Some(DimseStatus::Success));
    let kept = dir
        .path()
        .join("store")
        .join("PAT001")
        .join(STUDY)
        .join("UNKNOWN")
        .join(format!("{}.dcm", sop));
    assert!(kept.is_file());

    let txlog = node.txlog().await;
    let records = wait_for_records(&txlog, |r| {
        r.iter().any(|t| t.status == TransactionStatus::Warning)
    })
    .await;
    let warning = records
        .iter()
        .find(|t| t.status == TransactionStatus::Warning)
        .unwrap();
    assert_eq!(warning.transaction_type, TransactionType::Store);
    assert!(warning
        .error_message
        .as_deref()
        .unwrap()
        .contains("SeriesInstanceUID"));

    node.stop().await;
}

#[tokio::test]
async fn stored_objects_reach_downstream_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(dir.path());
    config.storage.trigger_downstream = true;
    config.storage.naming = NamingPolicy::AutoIncrement;
    let node = TestNode::start(config).await;
    let mut stored = node.manager.subscribe_stored();

    let outgoing = dir.path().join("outgoing");
    let files = vec![
        Instance::new(STUDY, SERIES, "1.2.826.0.1.3680043.2.1.1.21").write(&outgoing),
        Instance::new(STUDY, SERIES, "1.2.826.0.1.3680043.2.1.1.22").write(&outgoing),
    ];
    let reports = scu(SCU_AE).store(&node.remote(), &files).await.unwrap();
    assert!(reports.iter().all(|r| r.is_success()));

    let first = stored.recv().await.unwrap();
    let second = stored.recv().await.unwrap();
    assert_eq!(first.path.file_name().unwrap(), "000001.dcm");
    assert_eq!(second.path.file_name().unwrap(), "000002.dcm");
    assert_eq!(second.attributes.sop_instance_uid, "1.2.826.0.1.3680043.2.1.1.22");

    node.stop().await;
}
