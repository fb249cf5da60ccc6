#[path = "../common/mod.rs"]
mod common;

use common::{node_config, scu, wait_for_records, Instance, TestNode, NODE_AE, SCU_AE};
use dicom_node::config::{AllowedAe, Peer};
use dicom_node::txlog::{TransactionStatus, TransactionType};
use dimse::association::{Association, ProposedContext, RequestOptions};
use dimse::{uids, DimseConfig, DimseError, DimseStatus, RemoteNode};

fn count_files(root: &std::path::Path) -> usize {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count()
}

#[tokio::test]
async fn unknown_calling_ae_is_rejected_before_any_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(dir.path());
    config.access.require_calling_ae_validation = true;
    config.allowed_ae = vec![AllowedAe::new("MODALITY1")];
    let node = TestNode::start(config).await;

    let file = Instance::new("1.2.826.1.1", "1.2.826.1.1.1", "1.2.826.1.1.1.1")
        .write(&dir.path().join("outgoing"));
    let result = scu("STRANGER").store(&node.remote(), &[file]).await;
    assert!(matches!(
        result,
        Err(DimseError::AssociationRejected {
            result: 1,
            source_id: 1,
            reason: 3
        })
    ));

    let txlog = node.txlog().await;
    let records = wait_for_records(&txlog, |r| !r.is_empty()).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].transaction_type, TransactionType::Association);
    assert_eq!(records[0].status, TransactionStatus::Rejected);
    assert_eq!(records[0].calling_ae.as_deref(), Some("STRANGER"));
    assert!(records[0].error_message.is_some());
    assert_eq!(count_files(&dir.path().join("store")), 0);

    node.stop().await;
}

#[tokio::test]
async fn allow_list_admits_listed_titles_and_incoming_peers() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(dir.path());
    config.access.require_calling_ae_validation = true;
    config.allowed_ae = vec![AllowedAe::new("modality1 ")];
    let mut workstation = Peer::new("ws", "WORKSTATION", "127.0.0.1", 4242);
    workstation.allow_incoming = true;
    config.peers = vec![workstation];
    let node = TestNode::start(config).await;

    // titles compare trimmed and case-insensitively
    let status = scu("Modality1").echo(&node.remote()).await.unwrap();
    assert_eq!(status, DimseStatus::Success);
    let status = scu("WORKSTATION").echo(&node.remote()).await.unwrap();
    assert_eq!(status, DimseStatus::Success);

    // the allow-list is read per association, so removing a peer applies at once
    node.store.update(|c| c.peers.clear());
    let refused = scu("WORKSTATION").echo(&node.remote()).await;
    assert!(matches!(
        refused,
        Err(DimseError::AssociationRejected { reason: 3, .. })
    ));

    node.stop().await;
}

#[tokio::test]
async fn expected_ip_mismatch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(dir.path());
    config.access.require_calling_ae_validation = true;
    config.allowed_ae =
        vec![AllowedAe::new("MODALITY1").with_expected_ip("10.9.8.7".parse().unwrap())];
    let node = TestNode::start(config).await;

    let refused = scu("MODALITY1").echo(&node.remote()).await;
    assert!(matches!(
        refused,
        Err(DimseError::AssociationRejected {
            result: 1,
            source_id: 1,
            reason: 1
        })
    ));

    node.stop().await;
}

#[tokio::test]
async fn wrong_called_ae_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(node_config(dir.path())).await;

    let elsewhere = RemoteNode::new("OTHER", "127.0.0.1", node.addr.port());
    let refused = scu(SCU_AE).echo(&elsewhere).await;
    assert!(matches!(
        refused,
        Err(DimseError::AssociationRejected { reason: 7, .. })
    ));

    node.stop().await;
}

#[tokio::test]
async fn echo_is_answered_and_logged() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(node_config(dir.path())).await;

    let status = scu(SCU_AE).echo(&node.remote()).await.unwrap();
    assert_eq!(status, DimseStatus::Success);

    let txlog = node.txlog().await;
    let records = wait_for_records(&txlog, |r| {
        r.iter().any(|t| t.transaction_type == TransactionType::Echo)
    })
    .await;
    let echo = records
        .iter()
        .find(|t| t.transaction_type == TransactionType::Echo)
        .expect("echo recorded");
    assert_eq!(echo.status, TransactionStatus::Success);
    assert_eq!(echo.calling_ae.as_deref(), Some(SCU_AE));
    assert_eq!(echo.called_ae.as_deref(), Some(NODE_AE));
    assert_eq!(echo.status_code, Some(0x0000));
    assert!(echo.error_message.is_none());

    node.stop().await;
}

#[tokio::test]
async fn association_limit_refuses_transiently() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(dir.path());
    config.dimse.max_associations = 1;
    let node = TestNode::start(config).await;

    let client = DimseConfig {
        local_aet: SCU_AE.into(),
        ..Default::default()
    };
    let contexts = vec![ProposedContext::new(
        uids::VERIFICATION,
        &[uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string()],
    )];
    let held = Association::request(&node.remote(), RequestOptions::from_config(&client, contexts))
        .await
        .unwrap();

    let refused = scu(SCU_AE).echo(&node.remote()).await;
    assert!(matches!(
        refused,
        Err(DimseError::AssociationRejected {
            result: 2,
            source_id: 3,
            reason: 2
        })
    ));

    held.release().await.unwrap();
    let mut status = None;
    for _ in 0..50 {
        if let Ok(s) = scu(SCU_AE).echo(&node.remote()).await {
            status = Some(s);
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(status, Some(DimseStatus::Success));

    node.stop().await;
}
