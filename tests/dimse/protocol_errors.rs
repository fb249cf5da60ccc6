#[path = "../common/mod.rs"]
mod common;

use common::{node_config, wait_for_records, TestNode, NODE_AE, SCU_AE};
use dicom_node::txlog::{TransactionRecord, TransactionStatus, TransactionType};
use dimse::association::{Association, ProposedContext, RequestOptions};
use dimse::message::{self, Command};
use dimse::pdu::{
    AssociationRq, PDataValue, Pdu, PduCodec, PresentationContextProposed, UserInformation,
};
use dimse::{uids, DimseConfig, DimseStatus, Interaction, QueryLevel};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

fn implicit() -> Vec<String> {
    vec![uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string()]
}

async fn verification_association(node: &TestNode) -> Association {
    let client = DimseConfig {
        local_aet: SCU_AE.into(),
        ..Default::default()
    };
    let contexts = vec![ProposedContext::new(uids::VERIFICATION, &implicit())];
    Association::request(&node.remote(), RequestOptions::from_config(&client, contexts))
        .await
        .unwrap()
}

async fn echo_on(association: &mut Association, message_id: u16) -> u16 {
    let pc_id = association.contexts()[0].id;
    let request = Command::request(Interaction::Echo, message_id, uids::VERIFICATION);
    association.send(pc_id, &request, None).await.unwrap();
    let response = association.receive_response().await.unwrap();
    assert_eq!(response.command.message_id_being_responded_to, Some(message_id));
    response.command.status.unwrap()
}

/// Plain upper layer connection, for command sets no well-behaved SCU would send
struct RawPeer {
    framed: Framed<TcpStream, PduCodec>,
}

impl RawPeer {
    async fn associate(node: &TestNode) -> Self {
        let stream = TcpStream::connect(node.addr).await.unwrap();
        let mut framed = Framed::new(stream, PduCodec::new(16384));
        framed
            .send(Pdu::AssociationRq(AssociationRq {
                protocol_version: 1,
                called_ae: NODE_AE.into(),
                calling_ae: SCU_AE.into(),
                application_context: uids::APPLICATION_CONTEXT.into(),
                presentation_contexts: vec![PresentationContextProposed {
                    id: 1,
                    abstract_syntax: uids::VERIFICATION.into(),
                    transfer_syntaxes: implicit(),
                }],
                user: UserInformation {
                    max_pdu_length: 16384,
                    implementation_class_uid: uids::IMPLEMENTATION_CLASS_UID.into(),
                    ..Default::default()
                },
            }))
            .await
            .unwrap();
        match framed.next().await {
            Some(Ok(Pdu::AssociationAc(_))) => {}
            other => panic!("expected A-ASSOCIATE-AC, got {:?}", other),
        }
        Self { framed }
    }

    /// Send one command PDV and decode the command of the reply
    async fn exchange(&mut self, command_set: Vec<u8>) -> Command {
        self.framed
            .send(Pdu::PData {
                values: vec![PDataValue {
                    presentation_context_id: 1,
                    is_command: true,
                    is_last: true,
                    data: command_set,
                }],
            })
            .await
            .unwrap();
        match self.framed.next().await {
            Some(Ok(Pdu::PData { values })) => {
                assert!(values.iter().all(|v| v.is_command));
                let bytes: Vec<u8> = values.into_iter().flat_map(|v| v.data).collect();
                Command::decode(&bytes).unwrap()
            }
            other => panic!("expected a response, got {:?}", other),
        }
    }

    async fn release(mut self) {
        self.framed.send(Pdu::ReleaseRq).await.unwrap();
        assert!(matches!(self.framed.next().await, Some(Ok(Pdu::ReleaseRp))));
    }
}

fn of_type(records: &[TransactionRecord], kind: TransactionType) -> Vec<&TransactionRecord> {
    records.iter().filter(|r| r.transaction_type == kind).collect()
}

#[tokio::test]
async fn unrecognized_command_is_answered_and_logged() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(node_config(dir.path())).await;

    let mut association = verification_association(&node).await;
    let pc_id = association.contexts()[0].id;
    // N-ACTION-RQ is not a service this node offers
    let request = Command {
        command_field: 0x0130,
        message_id: Some(5),
        affected_sop_class_uid: Some(uids::VERIFICATION.into()),
        ..Default::default()
    };
    association.send(pc_id, &request, None).await.unwrap();
    let response = association.receive_response().await.unwrap();
    assert_eq!(response.command.command_field, 0x8130);
    assert_eq!(response.command.status, Some(0x0211));
    assert_eq!(response.command.message_id_being_responded_to, Some(5));

    // the association is still usable
    assert_eq!(echo_on(&mut association, 6).await, 0x0000);
    association.release().await.unwrap();

    let txlog = node.txlog().await;
    let records = wait_for_records(&txlog, |r| {
        !of_type(r, TransactionType::Unrecognized).is_empty()
            && !of_type(r, TransactionType::Echo).is_empty()
    })
    .await;
    let unrecognized = of_type(&records, TransactionType::Unrecognized);
    assert_eq!(unrecognized.len(), 1);
    assert_eq!(unrecognized[0].status, TransactionStatus::Failure);
    assert_eq!(unrecognized[0].status_code, Some(0x0211));
    assert_eq!(unrecognized[0].calling_ae.as_deref(), Some(SCU_AE));
    assert!(unrecognized[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("0x0130"));
    assert_eq!(of_type(&records, TransactionType::Echo)[0].status, TransactionStatus::Success);

    node.stop().await;
}

#[tokio::test]
async fn disabled_service_is_refused_and_logged() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(dir.path());
    config.dimse.services.find = false;
    let node = TestNode::start(config).await;

    // C-FIND sent on the only context the node accepted
    let mut association = verification_association(&node).await;
    let pc_id = association.contexts()[0].id;
    let request = Command::request(Interaction::Find, 11, uids::STUDY_ROOT_FIND);
    let identifier = message::write_dataset(
        &message::identifier(QueryLevel::Study),
        uids::IMPLICIT_VR_LITTLE_ENDIAN,
    )
    .unwrap();
    association
        .send(pc_id, &request, Some(&identifier))
        .await
        .unwrap();
    let response = association.receive_response().await.unwrap();
    assert_eq!(response.command.command_field, 0x8020);
    assert_eq!(response.command.status, Some(DimseStatus::SOP_CLASS_NOT_SUPPORTED));

    assert_eq!(echo_on(&mut association, 12).await, 0x0000);
    association.release().await.unwrap();

    let txlog = node.txlog().await;
    let records = wait_for_records(&txlog, |r| !of_type(r, TransactionType::Find).is_empty()).await;
    let finds = of_type(&records, TransactionType::Find);
    assert_eq!(finds.len(), 1);
    assert_eq!(finds[0].status, TransactionStatus::Failure);
    assert_eq!(finds[0].status_code, Some(0x0122));
    assert_eq!(finds[0].sop_class_uid.as_deref(), Some(uids::STUDY_ROOT_FIND));

    node.stop().await;
}

#[tokio::test]
async fn undecodable_command_set_keeps_the_association() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(node_config(dir.path())).await;
    let mut peer = RawPeer::associate(&node).await;

    // (0000,0100) claiming 2 GiB of value
    let garbage = vec![0x00, 0x00, 0x00, 0x01, 0xFF, 0xFF, 0xFF, 0x7F, 0x01, 0x02];
    let response = peer.exchange(garbage).await;
    assert_eq!(response.status, Some(0x0211));

    // a C-ECHO whose tail is damaged is still answered as a C-ECHO
    let mut damaged = Command::request(Interaction::Echo, 3, uids::VERIFICATION)
        .encode()
        .unwrap();
    damaged.extend_from_slice(&[0x00, 0x00, 0x00, 0x09, 0x10, 0x00, 0x00, 0x00]);
    let response = peer.exchange(damaged).await;
    assert_eq!(response.command_field, 0x8030);
    assert_eq!(response.message_id_being_responded_to, Some(3));
    assert_eq!(response.status, Some(DimseStatus::CANNOT_UNDERSTAND));

    let echo = Command::request(Interaction::Echo, 4, uids::VERIFICATION)
        .encode()
        .unwrap();
    let response = peer.exchange(echo).await;
    assert_eq!(response.command_field, 0x8030);
    assert_eq!(response.status, Some(0x0000));
    peer.release().await;

    let txlog = node.txlog().await;
    let records = wait_for_records(&txlog, |r| of_type(r, TransactionType::Echo).len() == 2).await;
    let unrecognized = of_type(&records, TransactionType::Unrecognized);
    assert_eq!(unrecognized.len(), 1);
    assert_eq!(unrecognized[0].status_code, Some(0x0211));
    assert!(unrecognized[0]
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("malformed command set"));

    let echoes = of_type(&records, TransactionType::Echo);
    assert!(echoes
        .iter()
        .any(|r| r.status == TransactionStatus::Failure && r.status_code == Some(0xC000)));
    assert!(echoes
        .iter()
        .any(|r| r.status == TransactionStatus::Success));
    // the association ended by release, not by abort
    assert!(of_type(&records, TransactionType::Association)
        .iter()
        .all(|r| r.status != TransactionStatus::Aborted));

    node.stop().await;
}
