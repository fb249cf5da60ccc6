//! Service Class User (SCU) implementation for outbound DIMSE operations

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dicom_dictionary_std::tags;
use dicom_core::VR;
use dicom_object::InMemDicomObject;
use tracing::{debug, info, warn};

use crate::association::{Association, DimseMessage, ProposedContext, RequestOptions};
use crate::config::{DimseConfig, RemoteNode};
use crate::files::{self, FileIdentity};
use crate::message::{self, Command};
use crate::pdu::RoleSelection;
use crate::scp::{ReceivedObject, StoreSink};
use crate::types::{
    DimseStatus, Interaction, QueryLevel, QueryRetrieveModel, SubOperationCounts,
};
use crate::{uids, DimseError, Result};

/// Limit on presentation contexts in one association request
const MAX_PROPOSED_CONTEXTS: usize = 128;

/// Result of a C-FIND exchange
#[derive(Debug, Clone)]
pub struct FindOutcome {
    /// Final status reported by the peer
    pub status: DimseStatus,
    pub matches: Vec<InMemDicomObject>,
}

/// Result of a C-MOVE or C-GET exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrieveSummary {
    pub status: DimseStatus,
    pub counts: SubOperationCounts,
    /// Number of sub-operations the peer announced
    pub total: u32,
}

/// Outcome of pushing one file with C-STORE
#[derive(Debug, Clone)]
pub struct StoreReport {
    pub path: PathBuf,
    pub status: Option<DimseStatus>,
    pub error: Option<String>,
}

impl StoreReport {
    pub fn is_success(&self) -> bool {
        matches!(self.status, Some(DimseStatus::Success) | Some(DimseStatus::Warning(_)))
    }
}

/// DIMSE Service Class User
#[derive(Debug, Clone)]
pub struct DimseScu {
    config: DimseConfig,
}

impl DimseScu {
    /// Create a new SCU with the given configuration
    pub fn new(config: DimseConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DimseConfig {
        &self.config
    }

    /// Native transfer syntaxes from the configuration, for command-only services
    fn native_syntaxes(&self) -> Vec<String> {
        let configured: Vec<String> = self
            .config
            .transfer_syntaxes
            .iter()
            .filter(|ts| uids::is_native_transfer_syntax(ts))
            .cloned()
            .collect();
        if configured.is_empty() {
            uids::NATIVE_TRANSFER_SYNTAXES
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            configured
        }
    }

    async fn open(
        &self,
        node: &RemoteNode,
        contexts: Vec<ProposedContext>,
        role_selections: Vec<RoleSelection>,
    ) -> Result<Association> {
        node.validate()?;
        let mut options = RequestOptions::from_config(&self.config, contexts);
        options.role_selections = role_selections;
        Association::request(node, options).await
    }

    /// Send a C-ECHO request to a remote node
    pub async fn echo(&self, node: &RemoteNode) -> Result<DimseStatus> {
        info!(
            "Sending C-ECHO to {}@{}:{}",
            node.ae_title, node.host, node.port
        );
        let contexts = vec![ProposedContext::new(
            uids::VERIFICATION,
            &self.native_syntaxes(),
        )];
        let mut assoc = self.open(node, contexts, Vec::new()).await?;
        let pc = assoc
            .context_for(uids::VERIFICATION)
            .map(|pc| pc.id)
            .ok_or_else(|| DimseError::NoPresentationContext("Verification".into()))?;

        let id = assoc.next_message_id();
        let request = Command::request(Interaction::Echo, id, uids::VERIFICATION);
        assoc.send(pc, &request, None).await?;
        let response = assoc.receive_response().await?;
        let status = response.command.status();
        let _ = assoc.release().await;

        info!("C-ECHO to {} completed with status {}", node.ae_title, status);
        Ok(status)
    }

    /// Send a C-FIND request and collect every match
    pub async fn find(
        &self,
        node: &RemoteNode,
        model: QueryRetrieveModel,
        level: QueryLevel,
        identifier: &InMemDicomObject,
    ) -> Result<FindOutcome> {
        let sop_class = model
            .sop_class(Interaction::Find)
            .ok_or_else(|| DimseError::internal("model without FIND class"))?;
        info!("Sending C-FIND ({}) to {}", level, node.ae_title);

        let contexts = vec![ProposedContext::new(sop_class, &self.native_syntaxes())];
        let mut assoc = self.open(node, contexts, Vec::new()).await?;
        let pc = assoc
            .context_for(sop_class)
            .cloned()
            .ok_or_else(|| DimseError::NoPresentationContext(sop_class.to_string()))?;

        let data = message::write_dataset(&with_level(identifier, level), &pc.transfer_syntax)?;
        let id = assoc.next_message_id();
        let request = Command::request(Interaction::Find, id, sop_class);
        assoc.send(pc.id, &request, Some(&data)).await?;

        let mut matches = Vec::new();
        let status = loop {
            let response = assoc.receive_response().await?;
            if response.command.message_id_being_responded_to != Some(id) {
                debug!("Ignoring response to another message");
                continue;
            }
            let status = response.command.status();
            if !status.is_pending() {
                break status;
            }
            if let Some(bytes) = response.data.as_deref() {
                matches.push(message::read_dataset(bytes, &pc.transfer_syntax)?);
            }
        };
        let _ = assoc.release().await;

        info!(
            "C-FIND to {} returned {} match(es), status {}",
            node.ae_title,
            matches.len(),
            status
        );
        Ok(FindOutcome { status, matches })
    }

    /// Ask `node` to send the matching objects to `destination` with C-MOVE
    pub async fn move_(
        &self,
        node: &RemoteNode,
        model: QueryRetrieveModel,
        level: QueryLevel,
        identifier: &InMemDicomObject,
        destination: &str,
        mut progress: impl FnMut(SubOperationCounts) + Send,
    ) -> Result<RetrieveSummary> {
        let sop_class = model
            .sop_class(Interaction::Move)
            .ok_or_else(|| DimseError::internal("model without MOVE class"))?;
        info!(
            "Sending C-MOVE ({}) to {} with destination {}",
            level, node.ae_title, destination
        );

        let contexts = vec![ProposedContext::new(sop_class, &self.native_syntaxes())];
        let mut assoc = self.open(node, contexts, Vec::new()).await?;
        let pc = assoc
            .context_for(sop_class)
            .cloned()
            .ok_or_else(|| DimseError::NoPresentationContext(sop_class.to_string()))?;

        let data = message::write_dataset(&with_level(identifier, level), &pc.transfer_syntax)?;
        let id = assoc.next_message_id();
        let mut request = Command::request(Interaction::Move, id, sop_class);
        request.move_destination = Some(destination.to_string());
        assoc.send(pc.id, &request, Some(&data)).await?;

        let mut tracker = RetrieveTracker::default();
        let summary = loop {
            let response = assoc.receive_response().await?;
            if response.command.message_id_being_responded_to != Some(id) {
                continue;
            }
            if let Some(summary) = tracker.observe(&response.command, &mut progress) {
                break summary;
            }
        };
        let _ = assoc.release().await;
        Ok(summary)
    }

    /// Retrieve the matching objects over this association with C-GET.
    ///
    /// Incoming C-STORE sub-operations are handed to `sink`.
    pub async fn get(
        &self,
        node: &RemoteNode,
        model: QueryRetrieveModel,
        level: QueryLevel,
        identifier: &InMemDicomObject,
        sink: &dyn StoreSink,
        mut progress: impl FnMut(SubOperationCounts) + Send,
    ) -> Result<RetrieveSummary> {
        let sop_class = model
            .sop_class(Interaction::Get)
            .ok_or_else(|| DimseError::internal("model without GET class"))?;
        info!("Sending C-GET ({}) to {}", level, node.ae_title);

        let mut contexts = vec![ProposedContext::new(sop_class, &self.native_syntaxes())];
        let mut roles = Vec::new();
        for storage in self
            .config
            .storage_sop_classes
            .iter()
            .take(MAX_PROPOSED_CONTEXTS - 1)
        {
            contexts.push(ProposedContext::new(
                storage.clone(),
                &self.config.transfer_syntaxes,
            ));
            roles.push(RoleSelection {
                sop_class_uid: storage.clone(),
                scu_role: false,
                scp_role: true,
            });
        }

        let mut assoc = self.open(node, contexts, roles).await?;
        let pc = assoc
            .context_for(sop_class)
            .cloned()
            .ok_or_else(|| DimseError::NoPresentationContext(sop_class.to_string()))?;

        let data = message::write_dataset(&with_level(identifier, level), &pc.transfer_syntax)?;
        let id = assoc.next_message_id();
        let request = Command::request(Interaction::Get, id, sop_class);
        assoc.send(pc.id, &request, Some(&data)).await?;

        let mut tracker = RetrieveTracker::default();
        let summary = loop {
            let incoming = assoc.receive_response().await?;
            if incoming.command.command_field == Interaction::Store.request_field() {
                answer_store(&mut assoc, sink, incoming).await?;
                continue;
            }
            if incoming.command.message_id_being_responded_to != Some(id) {
                continue;
            }
            if let Some(summary) = tracker.observe(&incoming.command, &mut progress) {
                break summary;
            }
        };
        let _ = assoc.release().await;
        Ok(summary)
    }

    /// Push local files to a remote node with C-STORE
    pub async fn store(&self, node: &RemoteNode, paths: &[PathBuf]) -> Result<Vec<StoreReport>> {
        let mut planned = Vec::with_capacity(paths.len());
        for path in paths {
            planned.push((path.clone(), read_identity(path.clone()).await));
        }

        let contexts = contexts_for(planned.iter().filter_map(|(_, id)| id.as_ref().ok()));
        if contexts.is_empty() {
            return Err(DimseError::operation_failed("no readable DICOM files to send"));
        }
        let mut assoc = self.open(node, contexts, Vec::new()).await?;

        let mut reports = Vec::with_capacity(planned.len());
        for (path, identity) in planned {
            let report = match identity {
                Ok(identity) => match store_file(&mut assoc, &path, &identity, None).await {
                    Ok(status) => StoreReport {
                        path,
                        status: Some(status),
                        error: None,
                    },
                    Err(e) if e.is_transport() => return Err(e),
                    Err(e) => StoreReport {
                        path,
                        status: None,
                        error: Some(e.to_string()),
                    },
                },
                Err(e) => StoreReport {
                    path,
                    status: None,
                    error: Some(e),
                },
            };
            reports.push(report);
        }
        let _ = assoc.release().await;
        Ok(reports)
    }
}

/// Follows the pending responses of a C-MOVE / C-GET
#[derive(Debug, Default)]
struct RetrieveTracker {
    counts: SubOperationCounts,
    total: u32,
}

impl RetrieveTracker {
    /// Returns the summary once the final response arrived
    fn observe(
        &mut self,
        command: &Command,
        progress: &mut (impl FnMut(SubOperationCounts) + Send),
    ) -> Option<RetrieveSummary> {
        if let Some(counts) = command.counts {
            self.total = self.total.max(counts.total());
            self.counts = counts;
        }
        let status = command.status();
        if status.is_pending() {
            progress(self.counts);
            return None;
        }
        // final responses may omit the remaining count
        self.counts.remaining = 0;
        Some(RetrieveSummary {
            status,
            counts: self.counts,
            total: self.total,
        })
    }
}

/// Answer a C-STORE-RQ received during C-GET
async fn answer_store(
    assoc: &mut Association,
    sink: &dyn StoreSink,
    incoming: DimseMessage,
) -> Result<()> {
    let DimseMessage {
        pc_id,
        command,
        data,
    } = incoming;
    let context = assoc.context_by_id(pc_id).cloned();
    let status = match (context, data, command.affected_sop_instance_uid.clone()) {
        (Some(pc), Some(data), Some(instance_uid)) => {
            let object = ReceivedObject {
                sop_class_uid: pc.abstract_syntax,
                sop_instance_uid: instance_uid,
                transfer_syntax: pc.transfer_syntax,
                data,
            };
            let origin = assoc.peer().clone();
            sink.store(&origin, object).await.status
        }
        _ => DimseStatus::CANNOT_UNDERSTAND,
    };
    let response = Command::response_to(&command, Interaction::Store, status);
    assoc.send(pc_id, &response, None).await
}

/// Send one stored file as a C-STORE sub-operation and wait for its response
pub(crate) async fn store_file(
    assoc: &mut Association,
    path: &Path,
    identity: &FileIdentity,
    originator: Option<(&str, u16)>,
) -> Result<DimseStatus> {
    let pc = assoc
        .context_for_object(&identity.sop_class_uid, &identity.transfer_syntax)
        .cloned()
        .ok_or_else(|| {
            DimseError::NoPresentationContext(format!(
                "{} in {}",
                identity.sop_class_uid, identity.transfer_syntax
            ))
        })?;

    let owned = path.to_path_buf();
    let target = pc.transfer_syntax.clone();
    let (_, data) = tokio::task::spawn_blocking(move || files::load_dataset(&owned, &target))
        .await
        .map_err(|e| DimseError::internal(format!("file load task failed: {}", e)))??;

    let id = assoc.next_message_id();
    let mut request = Command::request(Interaction::Store, id, &identity.sop_class_uid);
    request.affected_sop_instance_uid = Some(identity.sop_instance_uid.clone());
    if let Some((ae, message_id)) = originator {
        request.move_originator_ae = Some(ae.to_string());
        request.move_originator_message_id = Some(message_id);
    }
    assoc.send(pc.id, &request, Some(&data)).await?;

    loop {
        let response = assoc.receive_response().await?;
        let command = &response.command;
        if command.command_field == Interaction::Store.response_field()
            && command.message_id_being_responded_to == Some(id)
        {
            let status = command.status();
            if !status.is_success() {
                warn!(
                    "C-STORE of {} answered with {}",
                    identity.sop_instance_uid, status
                );
            }
            return Ok(status);
        }
        debug!(
            "Ignoring command 0x{:04X} while waiting for C-STORE response",
            command.command_field
        );
    }
}

async fn read_identity(path: PathBuf) -> std::result::Result<FileIdentity, String> {
    tokio::task::spawn_blocking(move || files::read_identity(&path))
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())
}

/// Presentation contexts able to carry a set of stored files.
///
/// Native objects of one SOP class share a context offering every native syntax;
/// encapsulated objects get one context per (class, syntax).
pub(crate) fn contexts_for<'a>(
    identities: impl Iterator<Item = &'a FileIdentity>,
) -> Vec<ProposedContext> {
    let mut wanted: BTreeMap<(String, Option<String>), ()> = BTreeMap::new();
    for identity in identities {
        let key = if uids::is_native_transfer_syntax(&identity.transfer_syntax) {
            (identity.sop_class_uid.clone(), None)
        } else {
            (
                identity.sop_class_uid.clone(),
                Some(identity.transfer_syntax.clone()),
            )
        };
        wanted.insert(key, ());
    }

    let natives: Vec<String> = uids::NATIVE_TRANSFER_SYNTAXES
        .iter()
        .map(|s| s.to_string())
        .collect();
    wanted
        .into_keys()
        .take(MAX_PROPOSED_CONTEXTS)
        .map(|(sop_class, ts)| match ts {
            Some(ts) => ProposedContext::new(sop_class, &[ts]),
            None => ProposedContext::new(sop_class, &natives),
        })
        .collect()
}

fn with_level(identifier: &InMemDicomObject, level: QueryLevel) -> InMemDicomObject {
    let mut identifier = identifier.clone();
    message::put_str(
        &mut identifier,
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        level.as_str(),
    );
    identifier
}
