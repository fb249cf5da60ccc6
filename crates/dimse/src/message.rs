//! DIMSE command sets and data set encoding helpers

use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::{TransferSyntax, TransferSyntaxIndex};
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;

use crate::error::{DimseError, Result};
use crate::types::{DimseStatus, Interaction, SubOperationCounts};
use crate::uids;

// Command group (0000,xxxx) tags
const AFFECTED_SOP_CLASS_UID: Tag = Tag(0x0000, 0x0002);
const COMMAND_FIELD: Tag = Tag(0x0000, 0x0100);
const MESSAGE_ID: Tag = Tag(0x0000, 0x0110);
const MESSAGE_ID_BEING_RESPONDED_TO: Tag = Tag(0x0000, 0x0120);
const MOVE_DESTINATION: Tag = Tag(0x0000, 0x0600);
const PRIORITY: Tag = Tag(0x0000, 0x0700);
const COMMAND_DATA_SET_TYPE: Tag = Tag(0x0000, 0x0800);
const STATUS: Tag = Tag(0x0000, 0x0900);
const ERROR_COMMENT: Tag = Tag(0x0000, 0x0902);
const AFFECTED_SOP_INSTANCE_UID: Tag = Tag(0x0000, 0x1000);
const REMAINING_SUB_OPERATIONS: Tag = Tag(0x0000, 0x1020);
const COMPLETED_SUB_OPERATIONS: Tag = Tag(0x0000, 0x1021);
const FAILED_SUB_OPERATIONS: Tag = Tag(0x0000, 0x1022);
const WARNING_SUB_OPERATIONS: Tag = Tag(0x0000, 0x1023);
const MOVE_ORIGINATOR_AE: Tag = Tag(0x0000, 0x1030);
const MOVE_ORIGINATOR_MESSAGE_ID: Tag = Tag(0x0000, 0x1031);

const NO_DATA_SET: u16 = 0x0101;
const DATA_SET_PRESENT: u16 = 0x0000;

/// Command field of C-CANCEL-RQ
pub const C_CANCEL_RQ: u16 = 0x0FFF;

/// A DIMSE command set.
///
/// Always encoded in implicit VR little endian, whatever the presentation context says.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub command_field: u16,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub message_id: Option<u16>,
    pub message_id_being_responded_to: Option<u16>,
    pub priority: Option<u16>,
    pub has_dataset: bool,
    pub status: Option<u16>,
    pub error_comment: Option<String>,
    pub move_destination: Option<String>,
    pub move_originator_ae: Option<String>,
    pub move_originator_message_id: Option<u16>,
    pub counts: Option<SubOperationCounts>,
}

impl Command {
    /// Build a request for the given interaction
    pub fn request(interaction: Interaction, message_id: u16, sop_class_uid: &str) -> Self {
        let priority = match interaction {
            Interaction::Echo => None,
            _ => Some(crate::types::Priority::default().code()),
        };
        Self {
            command_field: interaction.request_field(),
            affected_sop_class_uid: Some(sop_class_uid.to_string()),
            message_id: Some(message_id),
            priority,
            has_dataset: !matches!(interaction, Interaction::Echo),
            ..Default::default()
        }
    }

    /// Build the response to `request` with the given status code
    pub fn response_to(request: &Command, interaction: Interaction, status: u16) -> Self {
        Self {
            command_field: interaction.response_field(),
            affected_sop_class_uid: request.affected_sop_class_uid.clone(),
            affected_sop_instance_uid: match interaction {
                Interaction::Store => request.affected_sop_instance_uid.clone(),
                _ => None,
            },
            message_id_being_responded_to: request.message_id,
            status: Some(status),
            ..Default::default()
        }
    }

    /// Response to a command this node cannot map to an interaction
    pub fn unrecognized_response(request: &Command) -> Self {
        Self {
            command_field: request.command_field | 0x8000,
            affected_sop_class_uid: request.affected_sop_class_uid.clone(),
            message_id_being_responded_to: request.message_id,
            status: Some(DimseStatus::UNRECOGNIZED_OPERATION),
            ..Default::default()
        }
    }

    pub fn with_dataset(mut self, present: bool) -> Self {
        self.has_dataset = present;
        self
    }

    pub fn with_counts(mut self, counts: SubOperationCounts) -> Self {
        self.counts = Some(counts);
        self
    }

    pub fn with_error_comment(mut self, comment: impl Into<String>) -> Self {
        let mut comment: String = comment.into();
        // LO is limited to 64 characters
        comment.truncate(64);
        self.error_comment = Some(comment);
        self
    }

    pub fn interaction(&self) -> Option<Interaction> {
        Interaction::from_request_field(self.command_field & 0x7FFF)
    }

    pub fn is_response(&self) -> bool {
        self.command_field & 0x8000 != 0
    }

    pub fn status(&self) -> DimseStatus {
        DimseStatus::from_code(self.status.unwrap_or(DimseStatus::SUCCESS))
    }

    pub fn sop_class(&self) -> &str {
        self.affected_sop_class_uid.as_deref().unwrap_or_default()
    }

    /// Encode into implicit VR little endian bytes with a correct group length
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut elements = Vec::with_capacity(16);
        if let Some(uid) = &self.affected_sop_class_uid {
            elements.push(uid_element(AFFECTED_SOP_CLASS_UID, uid));
        }
        elements.push(us_element(COMMAND_FIELD, self.command_field));
        if let Some(id) = self.message_id {
            elements.push(us_element(MESSAGE_ID, id));
        }
        if let Some(id) = self.message_id_being_responded_to {
            elements.push(us_element(MESSAGE_ID_BEING_RESPONDED_TO, id));
        }
        if let Some(dest) = &self.move_destination {
            elements.push(text_element(MOVE_DESTINATION, VR::AE, dest));
        }
        if let Some(priority) = self.priority {
            elements.push(us_element(PRIORITY, priority));
        }
        elements.push(us_element(
            COMMAND_DATA_SET_TYPE,
            if self.has_dataset { DATA_SET_PRESENT } else { NO_DATA_SET },
        ));
        if let Some(status) = self.status {
            elements.push(us_element(STATUS, status));
        }
        if let Some(comment) = &self.error_comment {
            elements.push(text_element(ERROR_COMMENT, VR::LO, comment));
        }
        if let Some(uid) = &self.affected_sop_instance_uid {
            elements.push(uid_element(AFFECTED_SOP_INSTANCE_UID, uid));
        }
        if let Some(counts) = self.counts {
            elements.push(us_element(REMAINING_SUB_OPERATIONS, counts.remaining));
            elements.push(us_element(COMPLETED_SUB_OPERATIONS, counts.completed));
            elements.push(us_element(FAILED_SUB_OPERATIONS, counts.failed));
            elements.push(us_element(WARNING_SUB_OPERATIONS, counts.warning));
        }
        if let Some(ae) = &self.move_originator_ae {
            elements.push(text_element(MOVE_ORIGINATOR_AE, VR::AE, ae));
        }
        if let Some(id) = self.move_originator_message_id {
            elements.push(us_element(MOVE_ORIGINATOR_MESSAGE_ID, id));
        }

        let object = InMemDicomObject::command_from_element_iter(elements);
        let mut out = Vec::with_capacity(256);
        object
            .write_dataset_with_ts(&mut out, transfer_syntax(uids::IMPLICIT_VR_LITTLE_ENDIAN)?)
            .map_err(|e| DimseError::DicomObject(e.to_string()))?;
        Ok(out)
    }

    /// Decode an implicit VR little endian command set
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        // the parser allocates declared lengths up front
        if !walk_command_elements(bytes, |_, _| {}) {
            return Err(DimseError::DicomParsing(
                "command set element overruns its buffer".into(),
            ));
        }
        let object = InMemDicomObject::read_dataset_with_ts(
            bytes,
            transfer_syntax(uids::IMPLICIT_VR_LITTLE_ENDIAN)?,
        )
        .map_err(|e| DimseError::DicomParsing(e.to_string()))?;

        let command_field = get_u16(&object, COMMAND_FIELD)
            .ok_or_else(|| DimseError::DicomParsing("command set without command field".into()))?;

        let counts = get_u16(&object, REMAINING_SUB_OPERATIONS).map(|remaining| {
            SubOperationCounts {
                remaining,
                completed: get_u16(&object, COMPLETED_SUB_OPERATIONS).unwrap_or(0),
                failed: get_u16(&object, FAILED_SUB_OPERATIONS).unwrap_or(0),
                warning: get_u16(&object, WARNING_SUB_OPERATIONS).unwrap_or(0),
            }
        });

        Ok(Self {
            command_field,
            affected_sop_class_uid: get_string(&object, AFFECTED_SOP_CLASS_UID),
            affected_sop_instance_uid: get_string(&object, AFFECTED_SOP_INSTANCE_UID),
            message_id: get_u16(&object, MESSAGE_ID),
            message_id_being_responded_to: get_u16(&object, MESSAGE_ID_BEING_RESPONDED_TO),
            priority: get_u16(&object, PRIORITY),
            has_dataset: get_u16(&object, COMMAND_DATA_SET_TYPE)
                .map(|v| v != NO_DATA_SET)
                .unwrap_or(false),
            status: get_u16(&object, STATUS),
            error_comment: get_string(&object, ERROR_COMMENT),
            move_destination: get_string(&object, MOVE_DESTINATION),
            move_originator_ae: get_string(&object, MOVE_ORIGINATOR_AE),
            move_originator_message_id: get_u16(&object, MOVE_ORIGINATOR_MESSAGE_ID),
            counts,
        })
    }

    /// Recover the command field, message ID and SOP class from a command set that
    /// failed to decode. A zero command field means it could not be found.
    pub fn salvage(bytes: &[u8]) -> Self {
        let mut salvaged = Command::default();
        walk_command_elements(bytes, |tag, value| {
            let word = (value.len() == 2).then(|| u16::from_le_bytes([value[0], value[1]]));
            match tag {
                COMMAND_FIELD => salvaged.command_field = word.unwrap_or_default(),
                MESSAGE_ID => salvaged.message_id = word,
                AFFECTED_SOP_CLASS_UID => {
                    salvaged.affected_sop_class_uid = Some(
                        String::from_utf8_lossy(value)
                            .trim_end_matches(['\0', ' '])
                            .to_string(),
                    )
                }
                _ => {}
            }
        });
        salvaged
    }
}

/// Visit implicit VR little endian elements of a command set in order.
///
/// Stops at the first element outside group 0000 or whose length overruns the
/// buffer. Returns true when every byte was accounted for.
fn walk_command_elements(bytes: &[u8], mut visit: impl FnMut(Tag, &[u8])) -> bool {
    let mut pos = 0usize;
    while pos < bytes.len() {
        let Some(header) = bytes.get(pos..pos + 8) else {
            return false;
        };
        let group = u16::from_le_bytes([header[0], header[1]]);
        let element = u16::from_le_bytes([header[2], header[3]]);
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let Some(value) = bytes.get(pos + 8..).and_then(|rest| rest.get(..len)) else {
            return false;
        };
        if group != 0x0000 {
            return false;
        }
        visit(Tag(group, element), value);
        pos += 8 + len;
    }
    true
}

/// Look up a transfer syntax in the registry
pub fn transfer_syntax(uid: &str) -> Result<&'static TransferSyntax> {
    TransferSyntaxRegistry
        .get(uids::trim_uid(uid))
        .ok_or_else(|| DimseError::NotSupported(format!("transfer syntax {}", uid)))
}

/// Parse a data set received on a presentation context
pub fn read_dataset(bytes: &[u8], ts_uid: &str) -> Result<InMemDicomObject> {
    InMemDicomObject::read_dataset_with_ts(bytes, transfer_syntax(ts_uid)?)
        .map_err(|e| DimseError::DicomParsing(e.to_string()))
}

/// Encode a data set for a presentation context
pub fn write_dataset(object: &InMemDicomObject, ts_uid: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    object
        .write_dataset_with_ts(&mut out, transfer_syntax(ts_uid)?)
        .map_err(|e| DimseError::DicomObject(e.to_string()))?;
    Ok(out)
}

/// Re-encode a data set between two native transfer syntaxes
pub fn transcode(bytes: &[u8], from_ts: &str, to_ts: &str) -> Result<Vec<u8>> {
    let from_ts = uids::trim_uid(from_ts);
    let to_ts = uids::trim_uid(to_ts);
    if from_ts == to_ts {
        return Ok(bytes.to_vec());
    }
    if !uids::is_native_transfer_syntax(from_ts) || !uids::is_native_transfer_syntax(to_ts) {
        return Err(DimseError::NotSupported(format!(
            "re-encoding {} as {}",
            from_ts, to_ts
        )));
    }
    write_dataset(&read_dataset(bytes, from_ts)?, to_ts)
}

/// Read a text attribute, trimmed of padding
pub fn get_string(object: &InMemDicomObject, tag: Tag) -> Option<String> {
    object
        .element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).trim_start().to_string())
}

pub fn get_u16(object: &InMemDicomObject, tag: Tag) -> Option<u16> {
    object.element(tag).ok().and_then(|e| e.to_int::<u16>().ok())
}

/// Pad a value to even length as the standard requires
pub fn pad(value: &str, vr: VR) -> String {
    let mut value = value.to_string();
    if value.len() % 2 == 1 {
        value.push(if vr == VR::UI { '\0' } else { ' ' });
    }
    value
}

fn us_element(tag: Tag, value: u16) -> DataElement<InMemDicomObject> {
    DataElement::new(tag, VR::US, PrimitiveValue::from(value))
}

fn uid_element(tag: Tag, uid: &str) -> DataElement<InMemDicomObject> {
    text_element(tag, VR::UI, uid)
}

fn text_element(tag: Tag, vr: VR, value: &str) -> DataElement<InMemDicomObject> {
    DataElement::new(tag, vr, PrimitiveValue::from(pad(value, vr)))
}

/// Put a text attribute into a data set, padded for the VR
pub fn put_str(object: &mut InMemDicomObject, tag: Tag, vr: VR, value: &str) {
    object.put(text_element(tag, vr, value));
}

/// Build a C-FIND identifier carrying the query level
pub fn identifier(level: crate::types::QueryLevel) -> InMemDicomObject {
    let mut object = InMemDicomObject::new_empty();
    put_str(&mut object, tags::QUERY_RETRIEVE_LEVEL, VR::CS, level.as_str());
    object
}
