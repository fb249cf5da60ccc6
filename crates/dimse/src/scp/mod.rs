//! Service Class Provider (SCP) implementation for inbound DIMSE operations
//!
//! [`DimseScp`] owns the accept loop and the per-association protocol state machine.
//! Everything that depends on the embedding application (who may connect, where
//! objects go, what the index contains, how events are recorded) goes through the
//! [`ServiceProvider`] trait.

mod handlers;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dicom_object::InMemDicomObject;
use futures::stream::BoxStream;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::association::{AcceptPolicy, Association, Incoming, PendingAssociation};
use crate::config::{DimseConfig, RemoteNode};
use crate::error::{DimseError, Result};
use crate::pdu::AssociationRj;
use crate::types::{Interaction, QueryLevel, QueryRetrieveModel, SubOperationCounts};
use crate::AssociationPeer;

/// Decision about an incoming association request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Reject(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Calling AE title is not on the allow-list
    CallingAeNotRecognized,
    /// Called AE title does not name this node
    CalledAeNotRecognized,
    /// Remote address is not permitted
    AddressNotAllowed,
    /// Concurrent association limit reached
    Busy,
}

impl RejectReason {
    pub fn to_rj(self) -> AssociationRj {
        match self {
            RejectReason::CallingAeNotRecognized => AssociationRj::calling_ae_not_recognized(),
            RejectReason::CalledAeNotRecognized => AssociationRj::called_ae_not_recognized(),
            RejectReason::AddressNotAllowed => AssociationRj::no_reason_given(),
            RejectReason::Busy => AssociationRj::busy(),
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            RejectReason::CallingAeNotRecognized => "calling AE title not allowed",
            RejectReason::CalledAeNotRecognized => "called AE title not recognized",
            RejectReason::AddressNotAllowed => "remote address not allowed",
            RejectReason::Busy => "association limit reached",
        }
    }
}

/// A failure reported by the provider, carried to the peer as a DIMSE status
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} (status 0x{status:04X})")]
pub struct ProviderFailure {
    pub status: u16,
    pub message: String,
}

impl ProviderFailure {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// An object received through C-STORE, still encoded in the negotiated transfer syntax
#[derive(Debug, Clone)]
pub struct ReceivedObject {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub transfer_syntax: String,
    pub data: Vec<u8>,
}

/// Result of handing a received object to a [`StoreSink`]
#[derive(Debug, Clone)]
pub struct StoreOutcome {
    pub status: u16,
    pub outcome: AuditOutcome,
    pub detail: AuditDetail,
}

impl StoreOutcome {
    pub fn success(detail: AuditDetail) -> Self {
        Self {
            status: crate::DimseStatus::SUCCESS,
            outcome: AuditOutcome::Success,
            detail,
        }
    }

    pub fn failure(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            outcome: AuditOutcome::Failure,
            detail: AuditDetail {
                message: Some(message.into()),
                ..Default::default()
            },
        }
    }
}

/// One object a retrieve should deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveItem {
    /// Human readable origin, used in logs and audit messages
    pub label: String,
    /// `None` when the index predicted an object that is no longer on disk
    pub path: Option<PathBuf>,
}

/// A decoded C-FIND / C-MOVE / C-GET identifier
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub model: QueryRetrieveModel,
    pub level: QueryLevel,
    pub identifier: InMemDicomObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditKind {
    Association,
    Exchange(Interaction),
    /// A command that maps to no supported interaction, or could not be decoded
    Unrecognized { command_field: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditOutcome {
    Success,
    Warning,
    Failure,
    Rejected,
    Timeout,
    Aborted,
}

/// Optional facts attached to an audit event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditDetail {
    pub status: Option<u16>,
    pub sop_class_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
    pub patient_id: Option<String>,
    pub study_uid: Option<String>,
    pub series_uid: Option<String>,
    pub file_path: Option<String>,
    pub bytes: Option<u64>,
    pub transfer_syntax: Option<String>,
    pub counts: Option<SubOperationCounts>,
    pub matches: Option<u32>,
    pub destination: Option<String>,
    pub message: Option<String>,
}

/// Something that happened on an association, reported once
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub outcome: AuditOutcome,
    pub peer: AssociationPeer,
    pub detail: AuditDetail,
    pub duration: Duration,
}

/// Receiver of C-STORE objects, shared by the SCP and the C-GET client
#[async_trait]
pub trait StoreSink: Send + Sync {
    async fn store(&self, origin: &AssociationPeer, object: ReceivedObject) -> StoreOutcome;
}

/// Application hooks used by [`DimseScp`]
#[async_trait]
pub trait ServiceProvider: StoreSink {
    /// Decide whether an association may be accepted
    async fn admit(&self, peer: &AssociationPeer) -> Admission;

    /// Matches for a C-FIND, in the order they should be returned
    async fn find(
        &self,
        peer: &AssociationPeer,
        request: &QueryRequest,
    ) -> std::result::Result<BoxStream<'static, InMemDicomObject>, ProviderFailure>;

    /// Objects a C-MOVE or C-GET should deliver
    async fn locate(
        &self,
        peer: &AssociationPeer,
        request: &QueryRequest,
    ) -> std::result::Result<Vec<RetrieveItem>, ProviderFailure>;

    /// Network address of a C-MOVE destination
    async fn resolve_destination(&self, ae_title: &str) -> Option<RemoteNode>;

    /// Record an audit event
    async fn audit(&self, event: AuditEvent);
}

struct ScpInner {
    config: Arc<DimseConfig>,
    provider: Arc<dyn ServiceProvider>,
    policy: AcceptPolicy,
    limiter: Arc<Semaphore>,
}

/// DIMSE Service Class Provider
#[derive(Clone)]
pub struct DimseScp {
    inner: Arc<ScpInner>,
}

impl DimseScp {
    /// Create a new SCP with the given configuration and provider
    pub fn new(config: DimseConfig, provider: Arc<dyn ServiceProvider>) -> Result<Self> {
        config.validate()?;
        let policy = AcceptPolicy::from_config(&config);
        let limiter = Arc::new(Semaphore::new(config.max_associations as usize));
        Ok(Self {
            inner: Arc::new(ScpInner {
                config: Arc::new(config),
                provider,
                policy,
                limiter,
            }),
        })
    }

    pub fn config(&self) -> &DimseConfig {
        &self.inner.config
    }

    /// Associations currently holding a slot
    pub fn active_associations(&self) -> usize {
        (self.inner.config.max_associations as usize)
            .saturating_sub(self.inner.limiter.available_permits())
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = SocketAddr::new(self.inner.config.bind_addr, self.inner.config.port);
        let listener = TcpListener::bind(addr).await?;
        info!(
            "DIMSE SCP listening on {} (AET: {})",
            listener.local_addr()?,
            self.inner.config.local_aet
        );
        Ok(listener)
    }

    /// Accept associations until `shutdown` is cancelled.
    ///
    /// After cancellation no new connections are accepted; running associations get
    /// the configured grace period before their tasks are aborted.
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Association task panicked: {}", e);
                        }
                    }
                }
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                            continue;
                        }
                    };
                    debug!("Accepted connection from {}", remote_addr);
                    let permit = self.inner.limiter.clone().try_acquire_owned().ok();
                    let inner = Arc::clone(&self.inner);
                    let token = shutdown.child_token();
                    tasks.spawn(async move {
                        inner.serve_connection(stream, remote_addr, permit, token).await;
                    });
                }
            }
        }

        drop(listener);
        info!(
            "DIMSE SCP stopping, waiting for {} association(s)",
            tasks.len()
        );

        let drained = tokio::time::timeout(self.inner.config.shutdown_grace(), async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "Grace period elapsed, aborting {} association task(s)",
                tasks.len()
            );
            tasks.shutdown().await;
        }

        info!("DIMSE SCP stopped");
        Ok(())
    }
}

impl ScpInner {
    async fn serve_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
        shutdown: CancellationToken,
    ) {
        let started = Instant::now();
        let pending = match PendingAssociation::read(
            stream,
            remote_addr,
            self.config.max_pdu,
            self.config.acse_timeout(),
        )
        .await
        {
            Ok(pending) => pending,
            Err(e) => {
                warn!("No usable association request from {}: {}", remote_addr, e);
                return;
            }
        };

        let peer = AssociationPeer {
            id: Uuid::new_v4(),
            calling_ae: pending.calling_ae().to_string(),
            called_ae: pending.called_ae().to_string(),
            remote_addr,
        };
        let span = info_span!("association", id = %peer.id, calling_ae = %peer.calling_ae);

        async move {
            let admission = if permit.is_none() {
                Admission::Reject(RejectReason::Busy)
            } else {
                self.provider.admit(&peer).await
            };

            if let Admission::Reject(reason) = admission {
                warn!(
                    "Rejecting association from {} at {}: {}",
                    peer.calling_ae,
                    remote_addr,
                    reason.describe()
                );
                if let Err(e) = pending.reject(reason.to_rj()).await {
                    debug!("Failed to send rejection: {}", e);
                }
                self.audit_association(&peer, AuditOutcome::Rejected, reason.describe(), started)
                    .await;
                return;
            }

            let mut association = match pending.accept(&self.policy, peer.id).await {
                Ok(association) => association,
                Err(DimseError::NotSupported(what)) => {
                    warn!("Rejecting association from {}: {} not supported", peer.calling_ae, what);
                    self.audit_association(
                        &peer,
                        AuditOutcome::Rejected,
                        &format!("{} not supported", what),
                        started,
                    )
                    .await;
                    return;
                }
                Err(e) => {
                    error!("Failed to accept association: {}", e);
                    self.audit_association(&peer, AuditOutcome::Failure, &e.to_string(), started)
                        .await;
                    return;
                }
            };
            association.set_dimse_timeout(self.config.dimse_timeout());

            let summary = format!(
                "accepted {} of {} presentation contexts",
                association.contexts().len(),
                association.proposed_count()
            );
            info!(
                "Association established with {} at {}: {}",
                peer.calling_ae, remote_addr, summary
            );
            self.audit_association(&peer, AuditOutcome::Success, &summary, started)
                .await;

            self.run_association(&mut association, &peer, shutdown).await;
            drop(permit);
        }
        .instrument(span)
        .await
    }

    /// Message loop of an accepted association
    async fn run_association(
        &self,
        association: &mut Association,
        peer: &AssociationPeer,
        shutdown: CancellationToken,
    ) {
        let started = Instant::now();
        loop {
            let incoming = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Aborting idle association, service stopping");
                    let _ = association.abort().await;
                    self.audit_association(peer, AuditOutcome::Aborted, "service stopping", started)
                        .await;
                    return;
                }
                incoming = association.receive(self.config.idle_timeout()) => incoming,
            };

            let handled = match incoming {
                Ok(Incoming::Message(message)) => self.dispatch(association, peer, message).await,
                Ok(Incoming::Malformed {
                    pc_id,
                    partial,
                    reason,
                }) => {
                    self.answer_malformed(association, peer, pc_id, partial, reason)
                        .await
                }
                Ok(Incoming::Released) => {
                    info!("Association with {} released", peer.calling_ae);
                    return;
                }
                Ok(Incoming::Aborted { source, reason }) => {
                    info!(
                        "Association aborted by {} (source {}, reason {})",
                        peer.calling_ae, source, reason
                    );
                    self.audit_association(peer, AuditOutcome::Aborted, "aborted by peer", started)
                        .await;
                    return;
                }
                Err(DimseError::Timeout(_)) => {
                    warn!(
                        "Association with {} idle for {:?}, aborting",
                        peer.calling_ae,
                        self.config.idle_timeout()
                    );
                    let _ = association.abort().await;
                    self.audit_association(peer, AuditOutcome::Timeout, "idle timeout", started)
                        .await;
                    return;
                }
                Err(e) => {
                    warn!("Association with {} failed: {}", peer.calling_ae, e);
                    let _ = association.abort().await;
                    self.audit_association(peer, AuditOutcome::Aborted, &e.to_string(), started)
                        .await;
                    return;
                }
            };

            if let Err(e) = handled {
                if e.is_transport() {
                    warn!("Association with {} lost: {}", peer.calling_ae, e);
                    let _ = association.abort().await;
                    self.audit_association(peer, AuditOutcome::Aborted, &e.to_string(), started)
                        .await;
                    return;
                }
                warn!("Request from {} failed: {}", peer.calling_ae, e);
            }
        }
    }

    async fn audit_association(
        &self,
        peer: &AssociationPeer,
        outcome: AuditOutcome,
        message: &str,
        started: Instant,
    ) {
        self.provider
            .audit(AuditEvent {
                kind: AuditKind::Association,
                outcome,
                peer: peer.clone(),
                detail: AuditDetail {
                    message: Some(message.to_string()),
                    ..Default::default()
                },
                duration: started.elapsed(),
            })
            .await;
    }
}
