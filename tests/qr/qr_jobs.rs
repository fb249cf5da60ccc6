#[path = "../common/mod.rs"]
mod common;

use std::path::Path;
use std::sync::Arc;

use common::{node_config, scu, CollectingSink, Instance, TestNode, NODE_AE, SCU_AE};
use dicom_node::config::{ConfigError, InMemoryConfigStore, NodeConfig, Peer};
use dicom_node::index::{SeriesIndex, SeriesRecord};
use dicom_node::qr::{
    JobStatus, QrClient, QrError, RetrieveJob, RetrieveMode, RetrieveTarget,
};
use dicom_node::txlog::{TransactionLog, TransactionStatus, TransactionType};
use dimse::{DimseConfig, Interaction, QueryLevel};

const CLIENT_AE: &str = "QRCLIENT";
const STUDY: &str = "1.2.826.0.1.3680043.5.1";
const SERIES: &str = "1.2.826.0.1.3680043.5.1.1";
const SOPS: [&str; 2] = ["1.2.826.0.1.3680043.5.1.1.1", "1.2.826.0.1.3680043.5.1.1.2"];

struct Client {
    qr: QrClient,
    config: Arc<InMemoryConfigStore>,
    sink: Arc<CollectingSink>,
    txlog: TransactionLog,
}

/// A client with its own peers and transaction log, pointed at `node`
fn client(dir: &Path, node: &TestNode) -> Client {
    let mut config = NodeConfig::default();
    config.peers = vec![Peer::new("pacs", NODE_AE, "127.0.0.1", node.addr.port())];
    let config = Arc::new(InMemoryConfigStore::new(config));
    let sink = Arc::new(CollectingSink::default());
    let txlog = TransactionLog::open(&dir.join("client-transactions.redb")).unwrap();
    let qr = QrClient::new(
        DimseConfig {
            local_aet: CLIENT_AE.into(),
            ..Default::default()
        },
        config.clone(),
        sink.clone(),
        Some(txlog.clone()),
    );
    Client {
        qr,
        config,
        sink,
        txlog,
    }
}

async fn seed_stored_series(node: &TestNode, dir: &Path) {
    let outgoing = dir.join("outgoing");
    let files: Vec<_> = SOPS
        .iter()
        .map(|sop| Instance::new(STUDY, SERIES, sop).write(&outgoing))
        .collect();
    let reports = scu(SCU_AE).store(&node.remote(), &files).await.unwrap();
    assert!(reports.iter().all(|r| r.is_success()));

    let index = SeriesIndex::open(&dir.join("index.redb")).unwrap();
    index
        .upsert(&SeriesRecord {
            patient_id: "PAT001".into(),
            patient_name: "DOE^JANE".into(),
            study_uid: STUDY.into(),
            study_date: "20260115".into(),
            study_description: "CHEST".into(),
            series_uid: SERIES.into(),
            modality: "CT".into(),
            instance_count: 2,
            root_path: dir.join("store").join("PAT001").join(STUDY).join(SERIES),
            ..Default::default()
        })
        .unwrap();
}

fn of_type(txlog: &TransactionLog, kind: TransactionType) -> Vec<dicom_node::txlog::TransactionRecord> {
    txlog
        .recent(100)
        .unwrap()
        .into_iter()
        .filter(|r| r.transaction_type == kind)
        .collect()
}

#[tokio::test]
async fn echo_reports_success_and_failure() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(node_config(dir.path())).await;
    let client = client(dir.path(), &node);

    let ok = client.qr.echo("pacs").await.unwrap();
    assert!(ok.success);
    assert_eq!(ok.status, Some(0x0000));
    assert!(ok.error.is_none());

    node.stop().await;
    let down = client.qr.echo("pacs").await.unwrap();
    assert!(!down.success);
    assert!(down.status.is_none());
    assert!(down.error.is_some());

    let echoes = of_type(&client.txlog, TransactionType::Echo);
    assert_eq!(echoes.len(), 2);
    // newest first
    assert_eq!(echoes[0].status, TransactionStatus::Failure);
    assert_eq!(echoes[1].status, TransactionStatus::Success);
    assert_eq!(echoes[1].calling_ae.as_deref(), Some(CLIENT_AE));
    assert_eq!(echoes[1].called_ae.as_deref(), Some(NODE_AE));
}

#[tokio::test]
async fn query_job_collects_rows() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(node_config(dir.path())).await;
    seed_stored_series(&node, dir.path()).await;
    let client = client(dir.path(), &node);

    let job = client
        .qr
        .query(
            "pacs",
            QueryLevel::Study,
            vec![("PatientID".to_string(), "PAT001".to_string())],
        )
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.duration.is_some());
    assert_eq!(job.results.len(), 1);
    let row = &job.results[0];
    assert_eq!(row.level, "STUDY");
    assert_eq!(row.get("StudyInstanceUID"), Some(STUDY));
    assert_eq!(row.get("StudyDescription"), Some("CHEST"));
    assert_eq!(row.get("NumberOfStudyRelatedInstances"), Some("2"));

    let finds = of_type(&client.txlog, TransactionType::Find);
    assert_eq!(finds.len(), 1);
    assert_eq!(finds[0].object_count, Some(1));

    // image level is refused by the node and the job fails
    let refused = client
        .qr
        .query("pacs", QueryLevel::Image, Vec::new())
        .await
        .unwrap();
    assert_eq!(refused.status, JobStatus::Failed);
    assert!(refused.results.is_empty());
    assert!(refused.error.as_deref().unwrap().contains("0xC000"));

    node.stop().await;
}

#[tokio::test]
async fn capability_flags_and_peer_state_are_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(node_config(dir.path())).await;
    let client = client(dir.path(), &node);
    client.config.update(|c| {
        c.peers[0].supports_find = false;
        c.peers[0].supports_get = false;
    });

    let find = client.qr.query("pacs", QueryLevel::Study, Vec::new()).await;
    assert!(matches!(
        find,
        Err(QrError::Unsupported {
            interaction: Interaction::Find,
            ..
        })
    ));
    let get = client
        .qr
        .retrieve("pacs", RetrieveTarget::study(STUDY), RetrieveMode::Get)
        .await;
    assert!(matches!(
        get,
        Err(QrError::Unsupported {
            interaction: Interaction::Get,
            ..
        })
    ));

    client.config.update(|c| c.peers[0].is_active = false);
    assert!(matches!(
        client.qr.echo("pacs").await,
        Err(QrError::InactivePeer(_))
    ));
    assert!(matches!(
        client.qr.echo("missing").await,
        Err(QrError::Config(ConfigError::UnknownPeer(_)))
    ));

    client.config.update(|c| {
        c.peers[0].is_active = true;
        c.peers[0].supports_find = true;
    });
    assert!(matches!(
        client
            .qr
            .query(
                "pacs",
                QueryLevel::Study,
                vec![("NotAKeyword".to_string(), "x".to_string())]
            )
            .await,
        Err(QrError::Query(_))
    ));

    // nothing reached the wire, so nothing was logged
    assert!(client.txlog.is_empty().unwrap());

    node.stop().await;
}

#[tokio::test]
async fn get_job_stores_through_the_sink() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(node_config(dir.path())).await;
    seed_stored_series(&node, dir.path()).await;
    let client = client(dir.path(), &node);

    let job = client
        .qr
        .retrieve("pacs", RetrieveTarget::series(STUDY, SERIES), RetrieveMode::Get)
        .await
        .unwrap();

    assert_eq!(job.status(), JobStatus::Completed);
    let progress = job.progress();
    assert_eq!(progress.total, 2);
    assert_eq!(progress.completed, 2);
    assert_eq!(progress.remaining, 0);
    assert_eq!(*client.sink.received.lock().unwrap(), SOPS);

    let stores = of_type(&client.txlog, TransactionType::Store);
    assert_eq!(stores.len(), 2);
    assert!(stores.iter().all(|r| r.status == TransactionStatus::Success));
    let gets = of_type(&client.txlog, TransactionType::Get);
    assert_eq!(gets.len(), 1);
    assert_eq!(gets[0].series_uid.as_deref(), Some(SERIES));
    assert_eq!(gets[0].object_count, Some(2));

    node.stop().await;
}

#[tokio::test]
async fn move_job_reports_progress_to_subscribers() {
    let archive_dir = tempfile::tempdir().unwrap();
    let mut archive_config = node_config(archive_dir.path());
    archive_config.dimse.local_aet = "ARCHIVE".into();
    let archive = TestNode::start(archive_config).await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(dir.path());
    config.peers = vec![Peer::new("archive", "ARCHIVE", "127.0.0.1", archive.addr.port())];
    let node = TestNode::start(config).await;
    seed_stored_series(&node, dir.path()).await;

    let client = client(dir.path(), &node);
    client
        .config
        .update(|c| c.peers[0].move_destination_ae = Some("ARCHIVE".into()));

    let mut job = RetrieveJob::new("pacs", RetrieveTarget::study(STUDY), RetrieveMode::Move);
    let mut progress = job.subscribe();
    let watcher = tokio::spawn(async move {
        let mut statuses = Vec::new();
        while progress.changed().await.is_ok() {
            statuses.push(progress.borrow_and_update().status);
        }
        statuses
    });

    client.qr.run_retrieve(&mut job).await.unwrap();
    assert_eq!(job.status(), JobStatus::Completed);
    assert_eq!(job.progress().completed, 2);
    drop(job);

    let statuses = watcher.await.unwrap();
    assert!(statuses.contains(&JobStatus::InProgress));
    assert_eq!(statuses.last(), Some(&JobStatus::Completed));

    for sop in SOPS {
        let delivered = archive_dir
            .path()
            .join("store")
            .join("PAT001")
            .join(STUDY)
            .join(SERIES)
            .join(format!("{}.dcm", sop));
        assert!(delivered.is_file());
    }

    node.stop().await;
    archive.stop().await;
}

#[tokio::test]
async fn push_reports_each_file() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(node_config(dir.path())).await;
    let client = client(dir.path(), &node);

    let outgoing = dir.path().join("outgoing");
    let mut files: Vec<_> = SOPS
        .iter()
        .map(|sop| Instance::new(STUDY, SERIES, sop).write(&outgoing))
        .collect();
    files.push(outgoing.join("does-not-exist.dcm"));

    let summary = client.qr.push("pacs", &files).await.unwrap();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.reports.len(), 3);
    assert!(summary.reports[2].error.is_some());

    let stored = dir.path().join("store").join("PAT001").join(STUDY).join(SERIES);
    for sop in SOPS {
        assert!(stored.join(format!("{}.dcm", sop)).is_file());
    }

    let stores = of_type(&client.txlog, TransactionType::Store);
    assert_eq!(stores.len(), 3);
    assert_eq!(
        stores
            .iter()
            .filter(|r| r.status == TransactionStatus::Failure)
            .count(),
        1
    );

    node.stop().await;
}
