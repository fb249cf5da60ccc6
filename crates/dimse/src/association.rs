//! Association establishment, message exchange and teardown
//!
//! The acceptor side starts with [`PendingAssociation::read`], which waits for the
//! A-ASSOCIATE-RQ and lets the caller decide between [`PendingAssociation::reject`]
//! and [`PendingAssociation::accept`]. The requestor side uses [`Association::request`].
//! Both end up with an [`Association`] that exchanges whole DIMSE messages.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::{DimseConfig, RemoteNode};
use crate::error::{DimseError, Result};
use crate::message::Command;
use crate::pdu::{
    AssociationAc, AssociationRj, AssociationRq, PDataValue, Pdu, PduCodec,
    PresentationContextProposed, PresentationContextResult, PresentationResult, RoleSelection,
    UserInformation,
};
use crate::types::{Interaction, QueryRetrieveModel};
use crate::uids;

/// Fallback send limit when the peer announces no maximum
const UNLIMITED_PDU: u32 = 1024 * 1024;

/// Who is on the other end of an association
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssociationPeer {
    /// Correlates log lines and audit entries of one association
    pub id: Uuid,
    pub calling_ae: String,
    pub called_ae: String,
    pub remote_addr: SocketAddr,
}

/// An accepted presentation context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
}

/// A presentation context the requestor proposes
#[derive(Debug, Clone)]
pub struct ProposedContext {
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

impl ProposedContext {
    pub fn new(abstract_syntax: impl Into<String>, transfer_syntaxes: &[String]) -> Self {
        Self {
            abstract_syntax: abstract_syntax.into(),
            transfer_syntaxes: transfer_syntaxes.to_vec(),
        }
    }
}

/// What the acceptor is willing to negotiate
#[derive(Debug, Clone)]
pub struct AcceptPolicy {
    pub local_aet: String,
    pub max_pdu: u32,
    pub abstract_syntaxes: Vec<String>,
    /// Transfer syntaxes in order of local preference
    pub transfer_syntaxes: Vec<String>,
}

impl AcceptPolicy {
    /// Abstract syntaxes follow the enabled services
    pub fn from_config(config: &DimseConfig) -> Self {
        let mut abstract_syntaxes = Vec::new();
        if config.services.echo {
            abstract_syntaxes.push(uids::VERIFICATION.to_string());
        }
        if config.services.store {
            abstract_syntaxes.extend(config.storage_sop_classes.iter().cloned());
        }
        for interaction in [Interaction::Find, Interaction::Move, Interaction::Get] {
            if !config.services.allows(interaction) {
                continue;
            }
            for model in QueryRetrieveModel::ALL {
                if let Some(uid) = model.sop_class(interaction) {
                    abstract_syntaxes.push(uid.to_string());
                }
            }
        }
        Self {
            local_aet: config.local_aet.clone(),
            max_pdu: config.max_pdu,
            abstract_syntaxes,
            transfer_syntaxes: config.transfer_syntaxes.clone(),
        }
    }

    fn negotiate(&self, proposed: &PresentationContextProposed) -> PresentationContextResult {
        if !self
            .abstract_syntaxes
            .iter()
            .any(|a| a == &proposed.abstract_syntax)
        {
            return PresentationContextResult {
                id: proposed.id,
                result: PresentationResult::AbstractSyntaxNotSupported,
                transfer_syntax: uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
            };
        }
        match self
            .transfer_syntaxes
            .iter()
            .find(|ts| proposed.transfer_syntaxes.contains(ts))
        {
            Some(ts) => PresentationContextResult {
                id: proposed.id,
                result: PresentationResult::Acceptance,
                transfer_syntax: ts.clone(),
            },
            None => PresentationContextResult {
                id: proposed.id,
                result: PresentationResult::TransferSyntaxesNotSupported,
                transfer_syntax: uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
            },
        }
    }
}

/// Options for opening an outbound association
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub calling_ae: String,
    pub max_pdu: u32,
    pub connect_timeout: Duration,
    pub acse_timeout: Duration,
    pub dimse_timeout: Duration,
    pub contexts: Vec<ProposedContext>,
    pub role_selections: Vec<RoleSelection>,
}

impl RequestOptions {
    pub fn from_config(config: &DimseConfig, contexts: Vec<ProposedContext>) -> Self {
        Self {
            calling_ae: config.local_aet.clone(),
            max_pdu: config.max_pdu,
            connect_timeout: config.connect_timeout(),
            acse_timeout: config.acse_timeout(),
            dimse_timeout: config.dimse_timeout(),
            contexts,
            role_selections: Vec::new(),
        }
    }
}

/// A complete DIMSE message: command set plus optional data set bytes
#[derive(Debug, Clone)]
pub struct DimseMessage {
    pub pc_id: u8,
    pub command: Command,
    pub data: Option<Vec<u8>>,
}

/// What arrived on an established association
#[derive(Debug)]
pub enum Incoming {
    Message(DimseMessage),
    /// The peer requested release and has been answered
    Released,
    Aborted { source: u8, reason: u8 },
    /// A command set that could not be decoded; `partial` holds whatever was recovered
    Malformed {
        pc_id: u8,
        partial: Command,
        reason: String,
    },
}

/// An association that has received its A-ASSOCIATE-RQ but not yet answered it
pub struct PendingAssociation {
    framed: Framed<TcpStream, PduCodec>,
    request: AssociationRq,
    remote_addr: SocketAddr,
    acse_timeout: Duration,
}

impl PendingAssociation {
    /// Wait for the association request on a freshly accepted connection
    pub async fn read(
        stream: TcpStream,
        remote_addr: SocketAddr,
        max_pdu: u32,
        acse_timeout: Duration,
    ) -> Result<Self> {
        let mut framed = Framed::new(stream, PduCodec::new(max_pdu));
        let first = timeout(acse_timeout, framed.next())
            .await
            .map_err(|_| DimseError::Timeout("waiting for A-ASSOCIATE-RQ".into()))?;

        match first {
            Some(Ok(Pdu::AssociationRq(request))) => Ok(Self {
                framed,
                request,
                remote_addr,
                acse_timeout,
            }),
            Some(Ok(other)) => {
                let _ = framed.send(Pdu::Abort { source: 2, reason: 2 }).await;
                Err(DimseError::pdu(format!(
                    "expected A-ASSOCIATE-RQ, got {}",
                    other.name()
                )))
            }
            Some(Err(e)) => {
                let _ = framed.send(Pdu::Abort { source: 2, reason: 0 }).await;
                Err(e)
            }
            None => Err(DimseError::Network(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before association request",
            ))),
        }
    }

    pub fn calling_ae(&self) -> &str {
        &self.request.calling_ae
    }

    pub fn called_ae(&self) -> &str {
        &self.request.called_ae
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn request(&self) -> &AssociationRq {
        &self.request
    }

    /// Send A-ASSOCIATE-RJ and close the connection
    pub async fn reject(mut self, rj: AssociationRj) -> Result<()> {
        debug!(
            "Rejecting association from {} ({}): result {}, source {}, reason {}",
            self.request.calling_ae, self.remote_addr, rj.result, rj.source, rj.reason
        );
        timeout(self.acse_timeout, self.framed.send(Pdu::AssociationRj(rj)))
            .await
            .map_err(|_| DimseError::Timeout("sending A-ASSOCIATE-RJ".into()))??;
        let _ = timeout(self.acse_timeout, self.framed.close()).await;
        Ok(())
    }

    /// Negotiate presentation contexts and answer with A-ASSOCIATE-AC.
    ///
    /// Unsupported contexts are answered individually; the association itself is
    /// only rejected for a foreign application context.
    pub async fn accept(self, policy: &AcceptPolicy, peer_id: Uuid) -> Result<Association> {
        if uids::trim_uid(&self.request.application_context) != uids::APPLICATION_CONTEXT {
            let context = self.request.application_context.clone();
            self.reject(AssociationRj::application_context_not_supported())
                .await?;
            return Err(DimseError::NotSupported(format!(
                "application context {}",
                context
            )));
        }

        let PendingAssociation {
            mut framed,
            request,
            remote_addr,
            acse_timeout,
        } = self;

        let results: Vec<PresentationContextResult> = request
            .presentation_contexts
            .iter()
            .map(|pc| policy.negotiate(pc))
            .collect();

        let contexts: Vec<PresentationContext> = request
            .presentation_contexts
            .iter()
            .zip(&results)
            .filter(|(_, r)| r.result == PresentationResult::Acceptance)
            .map(|(pc, r)| PresentationContext {
                id: pc.id,
                abstract_syntax: pc.abstract_syntax.clone(),
                transfer_syntax: r.transfer_syntax.clone(),
            })
            .collect();

        let ac = AssociationAc {
            protocol_version: 1,
            called_ae: request.called_ae.clone(),
            calling_ae: request.calling_ae.clone(),
            application_context: uids::APPLICATION_CONTEXT.to_string(),
            presentation_contexts: results,
            user: UserInformation {
                max_pdu_length: policy.max_pdu,
                implementation_class_uid: uids::IMPLEMENTATION_CLASS_UID.to_string(),
                implementation_version_name: Some(uids::IMPLEMENTATION_VERSION_NAME.to_string()),
                role_selections: request.user.role_selections.clone(),
            },
        };

        timeout(acse_timeout, framed.send(Pdu::AssociationAc(ac)))
            .await
            .map_err(|_| DimseError::Timeout("sending A-ASSOCIATE-AC".into()))??;

        debug!(
            "Accepted {} of {} presentation contexts from {}",
            contexts.len(),
            request.presentation_contexts.len(),
            request.calling_ae
        );

        Ok(Association {
            framed,
            peer: AssociationPeer {
                id: peer_id,
                calling_ae: request.calling_ae.clone(),
                called_ae: request.called_ae.clone(),
                remote_addr,
            },
            proposed_count: request.presentation_contexts.len(),
            contexts,
            role_selections: request.user.role_selections,
            peer_max_pdu: request.user.max_pdu_length,
            discard_data: false,
            next_message_id: 1,
            acse_timeout,
            dimse_timeout: acse_timeout,
        })
    }
}

/// An established association
pub struct Association {
    framed: Framed<TcpStream, PduCodec>,
    peer: AssociationPeer,
    proposed_count: usize,
    contexts: Vec<PresentationContext>,
    role_selections: Vec<RoleSelection>,
    peer_max_pdu: u32,
    /// Set after an undecodable command until its data fragments have passed
    discard_data: bool,
    next_message_id: u16,
    acse_timeout: Duration,
    dimse_timeout: Duration,
}

impl Association {
    /// Open an association to a remote node
    pub async fn request(node: &RemoteNode, options: RequestOptions) -> Result<Self> {
        let connect_timeout = node
            .connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(options.connect_timeout);
        let max_pdu = node.max_pdu.unwrap_or(options.max_pdu);

        let stream = timeout(connect_timeout, TcpStream::connect(node.address()))
            .await
            .map_err(|_| DimseError::Timeout(format!("connecting to {}", node.address())))??;
        let remote_addr = stream.peer_addr()?;
        let mut framed = Framed::new(stream, PduCodec::new(max_pdu));

        let proposed: Vec<PresentationContextProposed> = options
            .contexts
            .iter()
            .enumerate()
            .map(|(i, pc)| PresentationContextProposed {
                // odd ids 1, 3, 5, ...
                id: (i * 2 + 1) as u8,
                abstract_syntax: pc.abstract_syntax.clone(),
                transfer_syntaxes: pc.transfer_syntaxes.clone(),
            })
            .collect();
        if proposed.is_empty() || proposed.len() > 128 {
            return Err(DimseError::config(format!(
                "cannot propose {} presentation contexts",
                proposed.len()
            )));
        }

        let rq = AssociationRq {
            protocol_version: 1,
            called_ae: node.ae_title.clone(),
            calling_ae: options.calling_ae.clone(),
            application_context: uids::APPLICATION_CONTEXT.to_string(),
            presentation_contexts: proposed.clone(),
            user: UserInformation {
                max_pdu_length: max_pdu,
                implementation_class_uid: uids::IMPLEMENTATION_CLASS_UID.to_string(),
                implementation_version_name: Some(uids::IMPLEMENTATION_VERSION_NAME.to_string()),
                role_selections: options.role_selections.clone(),
            },
        };

        debug!(
            "Requesting association {} -> {} at {} with {} contexts",
            options.calling_ae,
            node.ae_title,
            remote_addr,
            proposed.len()
        );
        framed.send(Pdu::AssociationRq(rq)).await?;

        let reply = timeout(options.acse_timeout, framed.next())
            .await
            .map_err(|_| DimseError::Timeout("waiting for A-ASSOCIATE-AC".into()))?;

        let ac = match reply {
            Some(Ok(Pdu::AssociationAc(ac))) => ac,
            Some(Ok(Pdu::AssociationRj(rj))) => {
                return Err(DimseError::AssociationRejected {
                    result: rj.result,
                    source_id: rj.source,
                    reason: rj.reason,
                })
            }
            Some(Ok(Pdu::Abort { source, reason })) => {
                return Err(DimseError::AssociationAborted {
                    source_id: source,
                    reason,
                })
            }
            Some(Ok(other)) => {
                return Err(DimseError::pdu(format!(
                    "unexpected {} during negotiation",
                    other.name()
                )))
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(DimseError::Network(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed during negotiation",
                )))
            }
        };

        let contexts: Vec<PresentationContext> = ac
            .presentation_contexts
            .iter()
            .filter(|r| r.result == PresentationResult::Acceptance)
            .filter_map(|r| {
                proposed
                    .iter()
                    .find(|p| p.id == r.id)
                    .map(|p| PresentationContext {
                        id: r.id,
                        abstract_syntax: p.abstract_syntax.clone(),
                        transfer_syntax: r.transfer_syntax.clone(),
                    })
            })
            .collect();

        Ok(Self {
            framed,
            peer: AssociationPeer {
                id: Uuid::new_v4(),
                calling_ae: options.calling_ae,
                called_ae: node.ae_title.clone(),
                remote_addr,
            },
            proposed_count: proposed.len(),
            contexts,
            role_selections: ac.user.role_selections,
            peer_max_pdu: ac.user.max_pdu_length,
            discard_data: false,
            next_message_id: 1,
            acse_timeout: options.acse_timeout,
            dimse_timeout: options.dimse_timeout,
        })
    }

    pub fn peer(&self) -> &AssociationPeer {
        &self.peer
    }

    pub fn contexts(&self) -> &[PresentationContext] {
        &self.contexts
    }

    pub fn proposed_count(&self) -> usize {
        self.proposed_count
    }

    pub fn role_selections(&self) -> &[RoleSelection] {
        &self.role_selections
    }

    /// Timeout applied by [`Association::receive_response`]
    pub fn set_dimse_timeout(&mut self, dimse_timeout: Duration) {
        self.dimse_timeout = dimse_timeout;
    }

    /// Allocate a message id for an outgoing request
    pub fn next_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        id
    }

    pub fn context_by_id(&self, id: u8) -> Option<&PresentationContext> {
        self.contexts.iter().find(|pc| pc.id == id)
    }

    /// First accepted context for an abstract syntax
    pub fn context_for(&self, abstract_syntax: &str) -> Option<&PresentationContext> {
        self.contexts
            .iter()
            .find(|pc| pc.abstract_syntax == abstract_syntax)
    }

    /// Context able to carry an object of `abstract_syntax` stored in `transfer_syntax`:
    /// an exact match first, else any native context when the object is native
    pub fn context_for_object(
        &self,
        abstract_syntax: &str,
        transfer_syntax: &str,
    ) -> Option<&PresentationContext> {
        let candidates = || {
            self.contexts
                .iter()
                .filter(move |pc| pc.abstract_syntax == abstract_syntax)
        };
        candidates()
            .find(|pc| pc.transfer_syntax == transfer_syntax)
            .or_else(|| {
                if uids::is_native_transfer_syntax(transfer_syntax) {
                    candidates().find(|pc| uids::is_native_transfer_syntax(&pc.transfer_syntax))
                } else {
                    None
                }
            })
    }

    /// Send a command and optional data set, fragmented to the peer's maximum PDU length
    pub async fn send(&mut self, pc_id: u8, command: &Command, data: Option<&[u8]>) -> Result<()> {
        let max_pdu = if self.peer_max_pdu == 0 {
            UNLIMITED_PDU
        } else {
            self.peer_max_pdu
        };
        // PDV item header: length (4) + context id (1) + control header (1)
        let chunk = (max_pdu as usize).saturating_sub(6).max(1);

        let command_bytes = command.encode()?;
        self.send_fragments(pc_id, true, &command_bytes, chunk).await?;
        if let Some(data) = data {
            self.send_fragments(pc_id, false, data, chunk).await?;
        }
        trace!(
            "Sent command 0x{:04X} on context {} ({} data bytes)",
            command.command_field,
            pc_id,
            data.map(<[u8]>::len).unwrap_or(0)
        );
        Ok(())
    }

    async fn send_fragments(
        &mut self,
        pc_id: u8,
        is_command: bool,
        bytes: &[u8],
        chunk: usize,
    ) -> Result<()> {
        if bytes.is_empty() {
            return self
                .framed
                .send(Pdu::PData {
                    values: vec![PDataValue {
                        presentation_context_id: pc_id,
                        is_command,
                        is_last: true,
                        data: Vec::new(),
                    }],
                })
                .await;
        }
        let total = bytes.len().div_ceil(chunk);
        for (i, fragment) in bytes.chunks(chunk).enumerate() {
            self.framed
                .feed(Pdu::PData {
                    values: vec![PDataValue {
                        presentation_context_id: pc_id,
                        is_command,
                        is_last: i + 1 == total,
                        data: fragment.to_vec(),
                    }],
                })
                .await?;
        }
        self.framed.flush().await
    }

    /// Wait up to `wait` for the next complete message or association event.
    ///
    /// An A-RELEASE-RQ is answered here and reported as [`Incoming::Released`].
    pub async fn receive(&mut self, wait: Duration) -> Result<Incoming> {
        let mut command_bytes: Vec<u8> = Vec::new();
        let mut command: Option<(u8, Command)> = None;
        let mut data: Vec<u8> = Vec::new();

        loop {
            let next = timeout(wait, self.framed.next())
                .await
                .map_err(|_| DimseError::Timeout("waiting for DIMSE message".into()))?;

            let pdu = match next {
                Some(pdu) => pdu?,
                None => {
                    return Err(DimseError::Network(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    )))
                }
            };

            match pdu {
                Pdu::PData { values } => {
                    for pdv in values {
                        if pdv.is_command {
                            command_bytes.extend_from_slice(&pdv.data);
                            if !pdv.is_last {
                                continue;
                            }
                            let decoded = match Command::decode(&command_bytes) {
                                Ok(decoded) => decoded,
                                Err(e) => {
                                    let partial = Command::salvage(&command_bytes);
                                    command_bytes.clear();
                                    self.discard_data = true;
                                    return Ok(Incoming::Malformed {
                                        pc_id: pdv.presentation_context_id,
                                        partial,
                                        reason: e.to_string(),
                                    });
                                }
                            };
                            command_bytes.clear();
                            self.discard_data = false;
                            if !decoded.has_dataset {
                                return Ok(Incoming::Message(DimseMessage {
                                    pc_id: pdv.presentation_context_id,
                                    command: decoded,
                                    data: None,
                                }));
                            }
                            command = Some((pdv.presentation_context_id, decoded));
                        } else {
                            if command.is_none() {
                                if self.discard_data {
                                    trace!("Dropping data fragment of an undecodable command");
                                    self.discard_data = !pdv.is_last;
                                    continue;
                                }
                                return Err(DimseError::pdu("data fragment before command"));
                            }
                            data.extend_from_slice(&pdv.data);
                            if pdv.is_last {
                                if let Some((pc_id, command)) = command.take() {
                                    return Ok(Incoming::Message(DimseMessage {
                                        pc_id,
                                        command,
                                        data: Some(std::mem::take(&mut data)),
                                    }));
                                }
                            }
                        }
                    }
                }
                Pdu::ReleaseRq => {
                    debug!("Peer {} requested release", self.peer.calling_ae);
                    self.framed.send(Pdu::ReleaseRp).await?;
                    let _ = timeout(self.acse_timeout, self.framed.close()).await;
                    return Ok(Incoming::Released);
                }
                Pdu::Abort { source, reason } => {
                    return Ok(Incoming::Aborted { source, reason });
                }
                other => {
                    warn!("Unexpected {} on established association", other.name());
                    let _ = self.abort().await;
                    return Err(DimseError::pdu(format!(
                        "unexpected {} on established association",
                        other.name()
                    )));
                }
            }
        }
    }

    /// Receive a message where the peer must answer, within the DIMSE timeout
    pub async fn receive_response(&mut self) -> Result<DimseMessage> {
        match self.receive(self.dimse_timeout).await? {
            Incoming::Message(message) => Ok(message),
            Incoming::Released => Err(DimseError::AssociationReleased),
            Incoming::Aborted { source, reason } => Err(DimseError::AssociationAborted {
                source_id: source,
                reason,
            }),
            Incoming::Malformed { reason, .. } => Err(DimseError::DicomParsing(reason)),
        }
    }

    /// Orderly release initiated by this side
    pub async fn release(mut self) -> Result<()> {
        self.framed.send(Pdu::ReleaseRq).await?;
        let acse_timeout = self.acse_timeout;
        let wait = async {
            loop {
                match self.framed.next().await {
                    Some(Ok(Pdu::ReleaseRp)) | None => return Ok(()),
                    Some(Ok(Pdu::Abort { source, reason })) => {
                        return Err(DimseError::AssociationAborted {
                            source_id: source,
                            reason,
                        })
                    }
                    // late responses are dropped
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e),
                }
            }
        };
        timeout(acse_timeout, wait)
            .await
            .map_err(|_| DimseError::Timeout("waiting for A-RELEASE-RP".into()))??;
        let _ = self.framed.close().await;
        Ok(())
    }

    /// Send A-ABORT and close the connection
    pub async fn abort(&mut self) -> Result<()> {
        let _ = timeout(
            self.acse_timeout,
            self.framed.send(Pdu::Abort { source: 0, reason: 0 }),
        )
        .await;
        let _ = timeout(self.acse_timeout, self.framed.close()).await;
        Ok(())
    }
}
