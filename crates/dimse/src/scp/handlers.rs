//! Per-interaction request handlers
//!
//! Each handler answers its request completely and emits exactly one audit event.
//! Errors returned from here are transport failures; protocol level problems are
//! answered with a DIMSE status and the association continues.

use std::path::PathBuf;
use std::time::Instant;

use dicom_dictionary_std::tags;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{
    AuditDetail, AuditEvent, AuditKind, AuditOutcome, QueryRequest, ReceivedObject, RetrieveItem,
    ScpInner,
};
use crate::association::{Association, DimseMessage, PresentationContext, RequestOptions};
use crate::error::{DimseError, Result};
use crate::files::{self, FileIdentity};
use crate::message::{self, Command, C_CANCEL_RQ};
use crate::scu;
use crate::types::{DimseStatus, Interaction, QueryLevel, QueryRetrieveModel, SubOperationCounts};
use crate::{uids, AssociationPeer};

impl ScpInner {
    pub(super) async fn dispatch(
        &self,
        association: &mut Association,
        peer: &AssociationPeer,
        message: DimseMessage,
    ) -> Result<()> {
        let command = &message.command;
        if command.command_field == C_CANCEL_RQ {
            debug!(
                "Ignoring C-CANCEL for message {:?}",
                command.message_id_being_responded_to
            );
            return Ok(());
        }

        let interaction = match command.interaction() {
            Some(interaction) if !command.is_response() => interaction,
            _ => {
                warn!(
                    "Unrecognized command 0x{:04X} from {}",
                    command.command_field, peer.calling_ae
                );
                let response = Command::unrecognized_response(command);
                association.send(message.pc_id, &response, None).await?;
                self.audit_unrecognized(
                    peer,
                    command,
                    format!("unrecognized command 0x{:04X}", command.command_field),
                    Instant::now(),
                )
                .await;
                return Ok(());
            }
        };

        let context = association.context_by_id(message.pc_id).cloned();
        let context = match context {
            Some(pc)
                if self.config.services.allows(interaction)
                    && context_serves(&pc, interaction, command.sop_class()) =>
            {
                pc
            }
            _ => {
                warn!(
                    "{} on presentation context {} is not supported",
                    interaction, message.pc_id
                );
                let response = Command::response_to(
                    command,
                    interaction,
                    DimseStatus::SOP_CLASS_NOT_SUPPORTED,
                );
                association.send(message.pc_id, &response, None).await?;
                self.audit_exchange(
                    peer,
                    interaction,
                    AuditOutcome::Failure,
                    AuditDetail {
                        status: Some(DimseStatus::SOP_CLASS_NOT_SUPPORTED),
                        sop_class_uid: command.affected_sop_class_uid.clone(),
                        message: Some("service or presentation context not supported".into()),
                        ..Default::default()
                    },
                    Instant::now(),
                )
                .await;
                return Ok(());
            }
        };

        match interaction {
            Interaction::Echo => self.handle_echo(association, peer, message).await,
            Interaction::Store => self.handle_store(association, peer, message, &context).await,
            Interaction::Find => self.handle_find(association, peer, message, &context).await,
            Interaction::Move => self.handle_move(association, peer, message, &context).await,
            Interaction::Get => self.handle_get(association, peer, message, &context).await,
        }
    }

    async fn handle_echo(
        &self,
        association: &mut Association,
        peer: &AssociationPeer,
        message: DimseMessage,
    ) -> Result<()> {
        let started = Instant::now();
        debug!("C-ECHO from {}", peer.calling_ae);
        let response =
            Command::response_to(&message.command, Interaction::Echo, DimseStatus::SUCCESS);
        association.send(message.pc_id, &response, None).await?;
        self.audit_exchange(
            peer,
            Interaction::Echo,
            AuditOutcome::Success,
            AuditDetail {
                status: Some(DimseStatus::SUCCESS),
                ..Default::default()
            },
            started,
        )
        .await;
        Ok(())
    }

    async fn handle_store(
        &self,
        association: &mut Association,
        peer: &AssociationPeer,
        message: DimseMessage,
        context: &PresentationContext,
    ) -> Result<()> {
        let started = Instant::now();
        let DimseMessage { pc_id, command, data } = message;

        let (Some(data), Some(instance_uid)) = (data, command.affected_sop_instance_uid.clone())
        else {
            let response = Command::response_to(
                &command,
                Interaction::Store,
                DimseStatus::CANNOT_UNDERSTAND,
            );
            association.send(pc_id, &response, None).await?;
            self.audit_exchange(
                peer,
                Interaction::Store,
                AuditOutcome::Failure,
                AuditDetail {
                    status: Some(DimseStatus::CANNOT_UNDERSTAND),
                    message: Some("C-STORE without data set or instance UID".into()),
                    ..Default::default()
                },
                started,
            )
            .await;
            return Ok(());
        };

        let bytes = data.len() as u64;
        let object = ReceivedObject {
            sop_class_uid: context.abstract_syntax.clone(),
            sop_instance_uid: instance_uid.clone(),
            transfer_syntax: context.transfer_syntax.clone(),
            data,
        };
        let outcome = self.provider.store(peer, object).await;
        let response = Command::response_to(&command, Interaction::Store, outcome.status);
        association.send(pc_id, &response, None).await?;

        info!(
            "C-STORE {} from {}: status 0x{:04X}",
            instance_uid, peer.calling_ae, outcome.status
        );
        let mut detail = outcome.detail;
        detail.status = Some(outcome.status);
        detail.sop_class_uid.get_or_insert_with(|| context.abstract_syntax.clone());
        detail.sop_instance_uid.get_or_insert(instance_uid);
        detail.transfer_syntax.get_or_insert_with(|| context.transfer_syntax.clone());
        detail.bytes.get_or_insert(bytes);
        self.audit_exchange(peer, Interaction::Store, outcome.outcome, detail, started)
            .await;
        Ok(())
    }

    async fn handle_find(
        &self,
        association: &mut Association,
        peer: &AssociationPeer,
        message: DimseMessage,
        context: &PresentationContext,
    ) -> Result<()> {
        let started = Instant::now();
        let request = match self.parse_query(&message, context, Interaction::Find) {
            Ok(request) => request,
            Err(reason) => {
                return self
                    .refuse(
                        association,
                        peer,
                        &message,
                        Interaction::Find,
                        DimseStatus::CANNOT_UNDERSTAND,
                        reason,
                        started,
                    )
                    .await
            }
        };

        let mut matches = match self.provider.find(peer, &request).await {
            Ok(stream) => stream,
            Err(failure) => {
                return self
                    .refuse(
                        association,
                        peer,
                        &message,
                        Interaction::Find,
                        failure.status,
                        failure.message,
                        started,
                    )
                    .await
            }
        };

        let mut sent: u32 = 0;
        let mut final_status = DimseStatus::SUCCESS;
        while let Some(identifier) = matches.next().await {
            let bytes = match message::write_dataset(&identifier, &context.transfer_syntax) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to encode C-FIND match: {}", e);
                    final_status = DimseStatus::PROCESSING_FAILURE;
                    break;
                }
            };
            let pending = Command::response_to(&message.command, Interaction::Find, DimseStatus::PENDING)
                .with_dataset(true);
            association.send(message.pc_id, &pending, Some(&bytes)).await?;
            sent += 1;
        }

        let done = Command::response_to(&message.command, Interaction::Find, final_status);
        association.send(message.pc_id, &done, None).await?;

        info!(
            "C-FIND at {} level from {}: {} match(es)",
            request.level, peer.calling_ae, sent
        );
        let outcome = if final_status == DimseStatus::SUCCESS {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        self.audit_exchange(
            peer,
            Interaction::Find,
            outcome,
            AuditDetail {
                status: Some(final_status),
                matches: Some(sent),
                patient_id: message::get_string(&request.identifier, tags::PATIENT_ID)
                    .filter(|s| !s.is_empty()),
                message: Some(format!("{} level", request.level)),
                ..Default::default()
            },
            started,
        )
        .await;
        Ok(())
    }

    async fn handle_move(
        &self,
        association: &mut Association,
        peer: &AssociationPeer,
        message: DimseMessage,
        context: &PresentationContext,
    ) -> Result<()> {
        let started = Instant::now();
        let request = match self.parse_query(&message, context, Interaction::Move) {
            Ok(request) => request,
            Err(reason) => {
                return self
                    .refuse(
                        association,
                        peer,
                        &message,
                        Interaction::Move,
                        DimseStatus::CANNOT_UNDERSTAND,
                        reason,
                        started,
                    )
                    .await
            }
        };

        let destination_ae = message.command.move_destination.clone().unwrap_or_default();
        let Some(destination) = self.provider.resolve_destination(&destination_ae).await else {
            warn!("C-MOVE destination {} is unknown", destination_ae);
            return self
                .refuse(
                    association,
                    peer,
                    &message,
                    Interaction::Move,
                    DimseStatus::MOVE_DESTINATION_UNKNOWN,
                    format!("unknown move destination {}", destination_ae),
                    started,
                )
                .await;
        };

        let items = match self.provider.locate(peer, &request).await {
            Ok(items) => items,
            Err(failure) => {
                return self
                    .refuse(
                        association,
                        peer,
                        &message,
                        Interaction::Move,
                        failure.status,
                        failure.message,
                        started,
                    )
                    .await
            }
        };

        let mut counts = SubOperationCounts::new(clamp_count(items.len()));
        self.send_progress(association, &message, Interaction::Move, counts)
            .await?;

        // Plan the destination association from the file meta of every object
        let mut planned: Vec<(RetrieveItem, Option<FileIdentity>)> = Vec::with_capacity(items.len());
        for item in items {
            let identity = match &item.path {
                Some(path) => read_identity(path.clone()).await,
                None => None,
            };
            planned.push((item, identity));
        }

        let contexts = scu::contexts_for(planned.iter().filter_map(|(_, id)| id.as_ref()));
        let mut outbound = if contexts.is_empty() {
            None
        } else {
            let options = RequestOptions::from_config(&self.config, contexts);
            match Association::request(&destination, options).await {
                Ok(outbound) => Some(outbound),
                Err(e) => {
                    warn!(
                        "Cannot open association to move destination {}: {}",
                        destination.ae_title, e
                    );
                    None
                }
            }
        };

        let originator_id = message.command.message_id.unwrap_or(0);
        for (item, identity) in planned {
            let mut transport_lost = false;
            let status = match (outbound.as_mut(), item.path.as_deref(), identity) {
                (Some(dest), Some(path), Some(identity)) => {
                    let originator = Some((peer.calling_ae.as_str(), originator_id));
                    match scu::store_file(dest, path, &identity, originator).await {
                        Ok(status) => status,
                        Err(e) => {
                            warn!("Sub-operation for {} failed: {}", item.label, e);
                            transport_lost = e.is_transport();
                            DimseStatus::Failure(DimseStatus::PROCESSING_FAILURE)
                        }
                    }
                }
                _ => {
                    debug!("Sub-operation for {} cannot run", item.label);
                    DimseStatus::Failure(DimseStatus::PROCESSING_FAILURE)
                }
            };
            if transport_lost {
                outbound = None;
            }
            counts.record(status);
            self.send_progress(association, &message, Interaction::Move, counts)
                .await?;
        }

        if let Some(dest) = outbound {
            if let Err(e) = dest.release().await {
                debug!("Release of move destination association failed: {}", e);
            }
        }

        self.finish_retrieve(
            association,
            peer,
            &message,
            Interaction::Move,
            counts,
            Some(destination_ae),
            started,
        )
        .await
    }

    async fn handle_get(
        &self,
        association: &mut Association,
        peer: &AssociationPeer,
        message: DimseMessage,
        context: &PresentationContext,
    ) -> Result<()> {
        let started = Instant::now();
        let request = match self.parse_query(&message, context, Interaction::Get) {
            Ok(request) => request,
            Err(reason) => {
                return self
                    .refuse(
                        association,
                        peer,
                        &message,
                        Interaction::Get,
                        DimseStatus::CANNOT_UNDERSTAND,
                        reason,
                        started,
                    )
                    .await
            }
        };

        let items = match self.provider.locate(peer, &request).await {
            Ok(items) => items,
            Err(failure) => {
                return self
                    .refuse(
                        association,
                        peer,
                        &message,
                        Interaction::Get,
                        failure.status,
                        failure.message,
                        started,
                    )
                    .await
            }
        };

        let mut counts = SubOperationCounts::new(clamp_count(items.len()));
        self.send_progress(association, &message, Interaction::Get, counts)
            .await?;

        for item in items {
            let identity = match &item.path {
                Some(path) => read_identity(path.clone()).await,
                None => None,
            };
            let status = match (item.path.as_deref(), identity) {
                (Some(path), Some(identity)) => {
                    match scu::store_file(association, path, &identity, None).await {
                        Ok(status) => status,
                        Err(e) if e.is_transport() => return Err(e),
                        Err(e) => {
                            warn!("C-GET sub-operation for {} failed: {}", item.label, e);
                            DimseStatus::Failure(DimseStatus::PROCESSING_FAILURE)
                        }
                    }
                }
                _ => {
                    debug!("C-GET sub-operation for {} has no file", item.label);
                    DimseStatus::Failure(DimseStatus::PROCESSING_FAILURE)
                }
            };
            counts.record(status);
            self.send_progress(association, &message, Interaction::Get, counts)
                .await?;
        }

        self.finish_retrieve(
            association,
            peer,
            &message,
            Interaction::Get,
            counts,
            None,
            started,
        )
        .await
    }

    fn parse_query(
        &self,
        message: &DimseMessage,
        context: &PresentationContext,
        interaction: Interaction,
    ) -> std::result::Result<QueryRequest, String> {
        let data = message
            .data
            .as_deref()
            .ok_or_else(|| format!("{} without identifier", interaction))?;
        let identifier = message::read_dataset(data, &context.transfer_syntax)
            .map_err(|e| format!("malformed identifier: {}", e))?;
        let level: QueryLevel = message::get_string(&identifier, tags::QUERY_RETRIEVE_LEVEL)
            .ok_or_else(|| "identifier without QueryRetrieveLevel".to_string())?
            .parse()
            .map_err(|e: DimseError| e.to_string())?;
        let model = QueryRetrieveModel::from_sop_class(&context.abstract_syntax)
            .map(|(model, _)| model)
            .unwrap_or_default();
        Ok(QueryRequest {
            model,
            level,
            identifier,
        })
    }

    /// Answer a request with a single failure status
    #[allow(clippy::too_many_arguments)]
    async fn refuse(
        &self,
        association: &mut Association,
        peer: &AssociationPeer,
        message: &DimseMessage,
        interaction: Interaction,
        status: u16,
        reason: String,
        started: Instant,
    ) -> Result<()> {
        warn!("{} from {} refused: {}", interaction, peer.calling_ae, reason);
        let response = Command::response_to(&message.command, interaction, status)
            .with_error_comment(reason.clone());
        association.send(message.pc_id, &response, None).await?;
        self.audit_exchange(
            peer,
            interaction,
            AuditOutcome::Failure,
            AuditDetail {
                status: Some(status),
                destination: message.command.move_destination.clone(),
                message: Some(reason),
                ..Default::default()
            },
            started,
        )
        .await;
        Ok(())
    }

    async fn send_progress(
        &self,
        association: &mut Association,
        message: &DimseMessage,
        interaction: Interaction,
        counts: SubOperationCounts,
    ) -> Result<()> {
        let pending = Command::response_to(&message.command, interaction, DimseStatus::PENDING)
            .with_counts(counts);
        association.send(message.pc_id, &pending, None).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_retrieve(
        &self,
        association: &mut Association,
        peer: &AssociationPeer,
        message: &DimseMessage,
        interaction: Interaction,
        counts: SubOperationCounts,
        destination: Option<String>,
        started: Instant,
    ) -> Result<()> {
        let status = counts.final_status();
        let mut done = Command::response_to(&message.command, interaction, status).with_counts(counts);
        if counts.failed > 0 {
            done = done.with_error_comment(format!("{} sub-operation(s) failed", counts.failed));
        }
        association.send(message.pc_id, &done, None).await?;

        info!(
            "{} for {} finished: {} completed, {} failed, {} warning",
            interaction, peer.calling_ae, counts.completed, counts.failed, counts.warning
        );
        let outcome = if status == DimseStatus::SUCCESS {
            AuditOutcome::Success
        } else {
            AuditOutcome::Warning
        };
        self.audit_exchange(
            peer,
            interaction,
            outcome,
            AuditDetail {
                status: Some(status),
                counts: Some(counts),
                matches: Some(counts.total()),
                destination,
                ..Default::default()
            },
            started,
        )
        .await;
        Ok(())
    }

    /// Answer a command set that could not be decoded.
    ///
    /// A recovered request field gets 0xC000 under its own interaction; anything
    /// else is answered as an unrecognized operation.
    pub(super) async fn answer_malformed(
        &self,
        association: &mut Association,
        peer: &AssociationPeer,
        pc_id: u8,
        partial: Command,
        reason: String,
    ) -> Result<()> {
        let started = Instant::now();
        warn!("Undecodable command set from {}: {}", peer.calling_ae, reason);
        let message = format!("malformed command set: {}", reason);

        match partial.interaction() {
            Some(interaction) if !partial.is_response() => {
                let response =
                    Command::response_to(&partial, interaction, DimseStatus::CANNOT_UNDERSTAND)
                        .with_error_comment("command set could not be decoded");
                association.send(pc_id, &response, None).await?;
                self.audit_exchange(
                    peer,
                    interaction,
                    AuditOutcome::Failure,
                    AuditDetail {
                        status: Some(DimseStatus::CANNOT_UNDERSTAND),
                        sop_class_uid: partial.affected_sop_class_uid.clone(),
                        message: Some(message),
                        ..Default::default()
                    },
                    started,
                )
                .await;
            }
            _ => {
                let response = Command::unrecognized_response(&partial);
                association.send(pc_id, &response, None).await?;
                self.audit_unrecognized(peer, &partial, message, started).await;
            }
        }
        Ok(())
    }

    async fn audit_unrecognized(
        &self,
        peer: &AssociationPeer,
        command: &Command,
        message: String,
        started: Instant,
    ) {
        self.provider
            .audit(AuditEvent {
                kind: AuditKind::Unrecognized {
                    command_field: command.command_field,
                },
                outcome: AuditOutcome::Failure,
                peer: peer.clone(),
                detail: AuditDetail {
                    status: Some(DimseStatus::UNRECOGNIZED_OPERATION),
                    sop_class_uid: command.affected_sop_class_uid.clone(),
                    message: Some(message),
                    ..Default::default()
                },
                duration: started.elapsed(),
            })
            .await;
    }

    async fn audit_exchange(
        &self,
        peer: &AssociationPeer,
        interaction: Interaction,
        outcome: AuditOutcome,
        detail: AuditDetail,
        started: Instant,
    ) {
        self.provider
            .audit(AuditEvent {
                kind: AuditKind::Exchange(interaction),
                outcome,
                peer: peer.clone(),
                detail,
                duration: started.elapsed(),
            })
            .await;
    }
}

/// Whether a presentation context may carry the given request
fn context_serves(pc: &PresentationContext, interaction: Interaction, sop_class: &str) -> bool {
    match interaction {
        Interaction::Echo => pc.abstract_syntax == uids::VERIFICATION,
        Interaction::Store => sop_class.is_empty() || uids::trim_uid(sop_class) == pc.abstract_syntax,
        Interaction::Find | Interaction::Move | Interaction::Get => {
            QueryRetrieveModel::from_sop_class(&pc.abstract_syntax)
                .map(|(_, served)| served == interaction)
                .unwrap_or(false)
        }
    }
}

/// Sub-operation counters are US on the wire. Retrievals of more than 65535
/// objects still send every object but report saturated counts.
fn clamp_count(n: usize) -> u16 {
    u16::try_from(n).unwrap_or_else(|_| {
        warn!(
            "{} sub-operations exceed the {} the response counters can carry",
            n,
            u16::MAX
        );
        u16::MAX
    })
}

async fn read_identity(path: PathBuf) -> Option<FileIdentity> {
    let label = path.display().to_string();
    match tokio::task::spawn_blocking(move || files::read_identity(&path)).await {
        Ok(Ok(identity)) => Some(identity),
        Ok(Err(e)) => {
            warn!("Cannot read {}: {}", label, e);
            None
        }
        Err(e) => {
            warn!("Reading {} did not complete: {}", label, e);
            None
        }
    }
}
