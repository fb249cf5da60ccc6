#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dicom_core::VR;
use dicom_dictionary_std::tags;
use dicom_node::config::{InMemoryConfigStore, NodeConfig};
use dicom_node::txlog::{TransactionLog, TransactionRecord};
use dicom_node::ServiceManager;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use dimse::{
    message, uids, AssociationPeer, DimseConfig, DimseScu, ReceivedObject, RemoteNode,
    StoreOutcome, StoreSink,
};

pub const NODE_AE: &str = "NODE";
pub const SCU_AE: &str = "TESTSCU";

/// Node bound to an ephemeral loopback port with everything under `dir`
pub fn node_config(dir: &Path) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.dimse.local_aet = NODE_AE.into();
    config.dimse.bind_addr = "127.0.0.1".parse().unwrap();
    config.dimse.port = 0;
    config.dimse.shutdown_grace_ms = 200;
    config.paths.index_db = dir.join("index.redb");
    config.paths.txlog_db = dir.join("transactions.redb");
    config.storage.root = dir.join("store");
    config
}

pub struct TestNode {
    pub manager: ServiceManager,
    pub store: Arc<InMemoryConfigStore>,
    pub addr: SocketAddr,
}

impl TestNode {
    pub async fn start(config: NodeConfig) -> Self {
        let store = Arc::new(InMemoryConfigStore::new(config));
        let manager = ServiceManager::new(store.clone());
        manager.start().await.expect("node starts");
        let addr = manager.local_addr().await.expect("listening");
        Self {
            manager,
            store,
            addr,
        }
    }

    /// How an SCU reaches this node
    pub fn remote(&self) -> RemoteNode {
        RemoteNode::new(NODE_AE, "127.0.0.1", self.addr.port())
    }

    pub async fn txlog(&self) -> TransactionLog {
        self.manager.transaction_log().await.expect("running")
    }

    pub async fn stop(self) {
        self.manager.stop().await.expect("node stops");
    }
}

pub fn scu(local_ae: &str) -> DimseScu {
    DimseScu::new(DimseConfig {
        local_aet: local_ae.into(),
        ..Default::default()
    })
}

pub struct Instance<'a> {
    pub patient_id: &'a str,
    pub patient_name: &'a str,
    pub study_uid: &'a str,
    pub series_uid: &'a str,
    pub sop_uid: &'a str,
}

impl<'a> Instance<'a> {
    pub fn new(study_uid: &'a str, series_uid: &'a str, sop_uid: &'a str) -> Self {
        Self {
            patient_id: "PAT001",
            patient_name: "DOE^JANE",
            study_uid,
            series_uid,
            sop_uid,
        }
    }

    pub fn dataset(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        message::put_str(&mut obj, tags::SOP_CLASS_UID, VR::UI, uids::CT_IMAGE_STORAGE);
        message::put_str(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, self.sop_uid);
        message::put_str(&mut obj, tags::PATIENT_ID, VR::LO, self.patient_id);
        message::put_str(&mut obj, tags::PATIENT_NAME, VR::PN, self.patient_name);
        message::put_str(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, self.study_uid);
        message::put_str(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, self.series_uid);
        message::put_str(&mut obj, tags::STUDY_DATE, VR::DA, "20260115");
        message::put_str(&mut obj, tags::MODALITY, VR::CS, "CT");
        obj
    }

    /// Write a Part 10 file and return its path
    pub fn write(&self, dir: &Path) -> PathBuf {
        write_file(dir, self.sop_uid, self.dataset())
    }
}

pub fn write_file(dir: &Path, sop_uid: &str, dataset: InMemDicomObject) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(format!("{}.dcm", sop_uid));
    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
        .media_storage_sop_instance_uid(sop_uid)
        .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
        .implementation_class_uid(uids::IMPLEMENTATION_CLASS_UID)
        .build()
        .unwrap();
    dataset.with_exact_meta(meta).write_to_file(&path).unwrap();
    path
}

/// Audit entries are written after the response goes out; poll until `ready` holds
pub async fn wait_for_records(
    txlog: &TransactionLog,
    ready: impl Fn(&[TransactionRecord]) -> bool,
) -> Vec<TransactionRecord> {
    for _ in 0..100 {
        let records = txlog.recent(1000).unwrap();
        if ready(&records) {
            return records;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    txlog.recent(1000).unwrap()
}

/// Sink that keeps the instance UIDs of what it receives
#[derive(Default)]
pub struct CollectingSink {
    pub received: Mutex<Vec<String>>,
}

#[async_trait]
impl StoreSink for CollectingSink {
    async fn store(&self, _origin: &AssociationPeer, object: ReceivedObject) -> StoreOutcome {
        self.received
            .lock()
            .unwrap()
            .push(object.sop_instance_uid.clone());
        StoreOutcome::success(Default::default())
    }
}
