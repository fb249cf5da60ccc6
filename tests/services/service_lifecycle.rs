#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{node_config, scu, TestNode, SCU_AE};
use dicom_node::config::{AllowedAe, InMemoryConfigStore};
use dicom_node::service::ServiceError;
use dicom_node::{ServiceManager, ServiceState};
use dimse::association::{Association, ProposedContext, RequestOptions};
use dimse::{uids, DimseConfig, DimseError, DimseStatus, RemoteNode};

#[tokio::test]
async fn start_stop_and_restart() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(node_config(dir.path())).await;
    assert_eq!(node.manager.state(), ServiceState::Running);
    assert_eq!(
        scu(SCU_AE).echo(&node.remote()).await.unwrap(),
        DimseStatus::Success
    );

    node.manager.stop().await.unwrap();
    assert_eq!(node.manager.state(), ServiceState::Stopped);
    assert!(scu(SCU_AE).echo(&node.remote()).await.is_err());
    // stopping twice is harmless
    node.manager.stop().await.unwrap();

    node.manager.start().await.unwrap();
    let addr = node.manager.local_addr().await.unwrap();
    let remote = RemoteNode::new("NODE", "127.0.0.1", addr.port());
    assert_eq!(scu(SCU_AE).echo(&remote).await.unwrap(), DimseStatus::Success);

    node.manager.restart().await.unwrap();
    assert_eq!(node.manager.state(), ServiceState::Running);
    let status = node.manager.status().await;
    assert!(status.started_at.is_some());
    assert!(status.stopped_at.is_none());
    assert_eq!(status.ae_title.as_deref(), Some("NODE"));

    node.stop().await;
}

#[tokio::test]
async fn cold_settings_need_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(node_config(dir.path())).await;

    node.store.update(|c| c.dimse.local_aet = "RENAMED".into());
    let renamed = RemoteNode::new("RENAMED", "127.0.0.1", node.addr.port());
    assert!(matches!(
        scu(SCU_AE).echo(&renamed).await,
        Err(DimseError::AssociationRejected { reason: 7, .. })
    ));
    assert_eq!(
        node.manager.cold_snapshot().await.unwrap().dimse.local_aet,
        "NODE"
    );

    node.manager.restart().await.unwrap();
    let addr = node.manager.local_addr().await.unwrap();
    let renamed = RemoteNode::new("RENAMED", "127.0.0.1", addr.port());
    assert_eq!(scu(SCU_AE).echo(&renamed).await.unwrap(), DimseStatus::Success);

    node.stop().await;
}

#[tokio::test]
async fn bind_failure_leaves_the_service_failed() {
    let dir = tempfile::tempdir().unwrap();
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = node_config(dir.path());
    config.dimse.port = occupied.local_addr().unwrap().port();

    let manager = ServiceManager::new(Arc::new(InMemoryConfigStore::new(config)));
    let result = manager.start().await;
    assert!(matches!(result, Err(ServiceError::Bind { .. })));
    assert!(matches!(manager.state(), ServiceState::Failed(_)));
    assert!(manager.local_addr().await.is_none());

    manager.stop().await.unwrap();
    assert_eq!(manager.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn invalid_cold_settings_fail_start() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(dir.path());
    config.dimse.local_aet = "THIS_TITLE_IS_FAR_TOO_LONG".into();

    let manager = ServiceManager::new(Arc::new(InMemoryConfigStore::new(config)));
    assert!(manager.start().await.is_err());
    assert!(matches!(manager.state(), ServiceState::Failed(_)));
}

#[tokio::test]
async fn status_counts_connections() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(dir.path());
    config.access.require_calling_ae_validation = true;
    config.allowed_ae = vec![AllowedAe::new(SCU_AE)];
    let node = TestNode::start(config).await;

    scu(SCU_AE).echo(&node.remote()).await.unwrap();
    assert!(scu("STRANGER").echo(&node.remote()).await.is_err());

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

    let mut status = node.manager.status().await;
    for _ in 0..50 {
        // finished associations release their slot just after the last reply
        if status.stats.rejected_connections == 1 && status.stats.active_connections == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        status = node.manager.status().await;
    }
    assert_eq!(status.state, ServiceState::Running);
    assert_eq!(status.stats.total_connections, 2);
    assert_eq!(status.stats.rejected_connections, 1);
    assert_eq!(status.stats.active_connections, 1);
    assert!(status.stats.last_activity.is_some());
    assert_eq!(status.local_addr, Some(node.addr));

    held.release().await.unwrap();
    node.stop().await;
}

#[tokio::test]
async fn stop_aborts_associations_after_the_grace_period() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(node_config(dir.path())).await;

    let client = DimseConfig {
        local_aet: SCU_AE.into(),
        ..Default::default()
    };
    let contexts = vec![ProposedContext::new(
        uids::VERIFICATION,
        &[uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string()],
    )];
    let mut held =
        Association::request(&node.remote(), RequestOptions::from_config(&client, contexts))
            .await
            .unwrap();

    let stopped = tokio::time::timeout(Duration::from_secs(5), node.manager.stop()).await;
    assert!(stopped.is_ok());
    assert_eq!(node.manager.state(), ServiceState::Stopped);

    // the idle association was closed by the node
    let next = held.receive(Duration::from_secs(2)).await;
    assert!(!matches!(next, Ok(dimse::association::Incoming::Message(_))));
}
