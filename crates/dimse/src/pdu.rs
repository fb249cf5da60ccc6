//! Upper layer protocol data units and their wire codec
//!
//! The byte layout is handled by `dicom_ul::pdu`; this module keeps the small
//! set of PDU shapes the association code works with and converts between
//! the two. [`PduCodec`] plugs into [`tokio_util::codec::Framed`] so
//! associations read and write whole PDUs.

use std::io::Cursor;

use bytes::{Buf, BytesMut};
use dicom_ul::pdu::{
    self as ul, AbortRQServiceProviderReason, AbortRQSource, AssociationRJResult,
    AssociationRJServiceProviderASCEReason, AssociationRJServiceProviderPresentationReason,
    AssociationRJServiceUserReason, AssociationRJSource, PDataValueType,
    PresentationContextResultReason, UserVariableItem,
};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{DimseError, Result};

const PDU_HEADER_LEN: usize = 6;
/// Lower bound for the receive guard so a small configured PDU size never rejects association PDUs
const MIN_FRAME_GUARD: u32 = 1024 * 1024;
/// SCP/SCU role selection user information sub-item
const ROLE_SELECTION_ITEM: u8 = 0x54;

/// A decoded upper layer PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    AssociationRq(AssociationRq),
    AssociationAc(AssociationAc),
    AssociationRj(AssociationRj),
    PData { values: Vec<PDataValue> },
    ReleaseRq,
    ReleaseRp,
    Abort { source: u8, reason: u8 },
}

impl Pdu {
    pub fn name(&self) -> &'static str {
        match self {
            Pdu::AssociationRq(_) => "A-ASSOCIATE-RQ",
            Pdu::AssociationAc(_) => "A-ASSOCIATE-AC",
            Pdu::AssociationRj(_) => "A-ASSOCIATE-RJ",
            Pdu::PData { .. } => "P-DATA-TF",
            Pdu::ReleaseRq => "A-RELEASE-RQ",
            Pdu::ReleaseRp => "A-RELEASE-RP",
            Pdu::Abort { .. } => "A-ABORT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationRq {
    pub protocol_version: u16,
    pub called_ae: String,
    pub calling_ae: String,
    pub application_context: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user: UserInformation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationAc {
    pub protocol_version: u16,
    pub called_ae: String,
    pub calling_ae: String,
    pub application_context: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user: UserInformation,
}

/// Rejection fields of an A-ASSOCIATE-RJ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociationRj {
    /// 1 = rejected-permanent, 2 = rejected-transient
    pub result: u8,
    /// 1 = service user, 2 = service provider (ACSE), 3 = service provider (presentation)
    pub source: u8,
    pub reason: u8,
}

impl AssociationRj {
    /// Called AE title not recognized
    pub const fn called_ae_not_recognized() -> Self {
        Self { result: 1, source: 1, reason: 7 }
    }

    /// Calling AE title not recognized
    pub const fn calling_ae_not_recognized() -> Self {
        Self { result: 1, source: 1, reason: 3 }
    }

    pub const fn application_context_not_supported() -> Self {
        Self { result: 1, source: 1, reason: 2 }
    }

    pub const fn no_reason_given() -> Self {
        Self { result: 1, source: 1, reason: 1 }
    }

    /// Local limit exceeded; the caller may retry later
    pub const fn busy() -> Self {
        Self { result: 2, source: 3, reason: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextProposed {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

/// Result codes of a presentation context in the A-ASSOCIATE-AC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationResult {
    Acceptance,
    UserRejection,
    NoReason,
    AbstractSyntaxNotSupported,
    TransferSyntaxesNotSupported,
}

impl PresentationResult {
    pub fn code(self) -> u8 {
        match self {
            PresentationResult::Acceptance => 0,
            PresentationResult::UserRejection => 1,
            PresentationResult::NoReason => 2,
            PresentationResult::AbstractSyntaxNotSupported => 3,
            PresentationResult::TransferSyntaxesNotSupported => 4,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => PresentationResult::Acceptance,
            1 => PresentationResult::UserRejection,
            3 => PresentationResult::AbstractSyntaxNotSupported,
            4 => PresentationResult::TransferSyntaxesNotSupported,
            _ => PresentationResult::NoReason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextResult {
    pub id: u8,
    pub result: PresentationResult,
    pub transfer_syntax: String,
}

/// SCU/SCP role selection sub-item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSelection {
    pub sop_class_uid: String,
    pub scu_role: bool,
    pub scp_role: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInformation {
    /// 0 means no limit
    pub max_pdu_length: u32,
    pub implementation_class_uid: String,
    pub implementation_version_name: Option<String>,
    pub role_selections: Vec<RoleSelection>,
}

/// One presentation data value inside a P-DATA-TF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub is_command: bool,
    pub is_last: bool,
    pub data: Vec<u8>,
}

/// Frames upper layer PDUs on a byte stream
#[derive(Debug, Clone)]
pub struct PduCodec {
    max_frame: u32,
}

impl PduCodec {
    /// `max_pdu` is the largest PDU body we negotiated to receive
    pub fn new(max_pdu: u32) -> Self {
        Self {
            max_frame: max_pdu.max(MIN_FRAME_GUARD),
        }
    }
}

impl Decoder for PduCodec {
    type Item = Pdu;
    type Error = DimseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Pdu>> {
        if src.len() < PDU_HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[2], src[3], src[4], src[5]]);
        if length > self.max_frame {
            return Err(DimseError::pdu(format!(
                "PDU length {} exceeds limit {}",
                length, self.max_frame
            )));
        }
        let frame_len = PDU_HEADER_LEN + length as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let (wire, consumed) = {
            let mut cursor = Cursor::new(&src[..frame_len]);
            match ul::read_pdu(&mut cursor, self.max_frame, false)
                .map_err(|e| DimseError::pdu(e.to_string()))?
            {
                Some(pdu) => (pdu, cursor.position() as usize),
                None => return Ok(None),
            }
        };
        src.advance(consumed);
        Pdu::try_from(wire).map(Some)
    }
}

impl Encoder<Pdu> for PduCodec {
    type Error = DimseError;

    fn encode(&mut self, pdu: Pdu, dst: &mut BytesMut) -> Result<()> {
        let mut out = Vec::new();
        ul::write_pdu(&mut out, &pdu.into_wire())
            .map_err(|e| DimseError::pdu(e.to_string()))?;
        dst.extend_from_slice(&out);
        Ok(())
    }
}

impl Pdu {
    fn into_wire(self) -> ul::Pdu {
        match self {
            Pdu::AssociationRq(rq) => ul::Pdu::AssociationRQ(ul::AssociationRQ {
                protocol_version: rq.protocol_version,
                calling_ae_title: rq.calling_ae,
                called_ae_title: rq.called_ae,
                application_context_name: rq.application_context,
                presentation_contexts: rq
                    .presentation_contexts
                    .into_iter()
                    .map(|pc| ul::PresentationContextProposed {
                        id: pc.id,
                        abstract_syntax: pc.abstract_syntax,
                        transfer_syntaxes: pc.transfer_syntaxes,
                    })
                    .collect(),
                user_variables: rq.user.into_items(),
            }),
            Pdu::AssociationAc(ac) => ul::Pdu::AssociationAC(ul::AssociationAC {
                protocol_version: ac.protocol_version,
                calling_ae_title: ac.calling_ae,
                called_ae_title: ac.called_ae,
                application_context_name: ac.application_context,
                presentation_contexts: ac
                    .presentation_contexts
                    .into_iter()
                    .map(|pc| ul::PresentationContextResult {
                        id: pc.id,
                        reason: pc.result.into(),
                        transfer_syntax: pc.transfer_syntax,
                    })
                    .collect(),
                user_variables: ac.user.into_items(),
            }),
            Pdu::AssociationRj(rj) => ul::Pdu::AssociationRJ(rj.into()),
            Pdu::PData { values } => ul::Pdu::PData {
                data: values
                    .into_iter()
                    .map(|pdv| ul::PDataValue {
                        presentation_context_id: pdv.presentation_context_id,
                        value_type: if pdv.is_command {
                            PDataValueType::Command
                        } else {
                            PDataValueType::Data
                        },
                        is_last: pdv.is_last,
                        data: pdv.data,
                    })
                    .collect(),
            },
            Pdu::ReleaseRq => ul::Pdu::ReleaseRQ,
            Pdu::ReleaseRp => ul::Pdu::ReleaseRP,
            Pdu::Abort { source, reason } => ul::Pdu::AbortRQ {
                source: abort_source(source, reason),
            },
        }
    }
}

impl TryFrom<ul::Pdu> for Pdu {
    type Error = DimseError;

    fn try_from(wire: ul::Pdu) -> Result<Self> {
        let pdu = match wire {
            ul::Pdu::AssociationRQ(rq) => Pdu::AssociationRq(AssociationRq {
                protocol_version: rq.protocol_version,
                called_ae: rq.called_ae_title.trim().to_string(),
                calling_ae: rq.calling_ae_title.trim().to_string(),
                application_context: uid_text(&rq.application_context_name),
                presentation_contexts: rq
                    .presentation_contexts
                    .into_iter()
                    .map(|pc| PresentationContextProposed {
                        id: pc.id,
                        abstract_syntax: uid_text(&pc.abstract_syntax),
                        transfer_syntaxes: pc
                            .transfer_syntaxes
                            .iter()
                            .map(|ts| uid_text(ts))
                            .collect(),
                    })
                    .collect(),
                user: UserInformation::from_items(rq.user_variables),
            }),
            ul::Pdu::AssociationAC(ac) => Pdu::AssociationAc(AssociationAc {
                protocol_version: ac.protocol_version,
                called_ae: ac.called_ae_title.trim().to_string(),
                calling_ae: ac.calling_ae_title.trim().to_string(),
                application_context: uid_text(&ac.application_context_name),
                presentation_contexts: ac
                    .presentation_contexts
                    .into_iter()
                    .map(|pc| PresentationContextResult {
                        id: pc.id,
                        result: pc.reason.into(),
                        transfer_syntax: uid_text(&pc.transfer_syntax),
                    })
                    .collect(),
                user: UserInformation::from_items(ac.user_variables),
            }),
            ul::Pdu::AssociationRJ(rj) => Pdu::AssociationRj(rj.into()),
            ul::Pdu::PData { data } => Pdu::PData {
                values: data
                    .into_iter()
                    .map(|pdv| PDataValue {
                        presentation_context_id: pdv.presentation_context_id,
                        is_command: matches!(pdv.value_type, PDataValueType::Command),
                        is_last: pdv.is_last,
                        data: pdv.data,
                    })
                    .collect(),
            },
            ul::Pdu::ReleaseRQ => Pdu::ReleaseRq,
            ul::Pdu::ReleaseRP => Pdu::ReleaseRp,
            ul::Pdu::AbortRQ { source } => {
                let (source, reason) = abort_codes(&source);
                Pdu::Abort { source, reason }
            }
            ul::Pdu::Unknown { pdu_type, .. } => {
                return Err(DimseError::pdu(format!("unknown PDU type 0x{:02X}", pdu_type)))
            }
        };
        Ok(pdu)
    }
}

impl UserInformation {
    fn into_items(self) -> Vec<UserVariableItem> {
        let mut items = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUID(self.implementation_class_uid),
        ];
        for role in self.role_selections {
            items.push(UserVariableItem::Unknown(ROLE_SELECTION_ITEM, role.to_bytes()));
        }
        if let Some(name) = self.implementation_version_name {
            items.push(UserVariableItem::ImplementationVersionName(name));
        }
        items
    }

    fn from_items(items: Vec<UserVariableItem>) -> Self {
        let mut user = UserInformation::default();
        for item in items {
            match item {
                UserVariableItem::MaxLength(len) => user.max_pdu_length = len,
                UserVariableItem::ImplementationClassUID(uid) => {
                    user.implementation_class_uid = uid_text(&uid)
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    user.implementation_version_name = Some(name.trim().to_string())
                }
                UserVariableItem::Unknown(ROLE_SELECTION_ITEM, bytes) => {
                    if let Some(role) = RoleSelection::from_bytes(&bytes) {
                        user.role_selections.push(role);
                    }
                }
                _ => {}
            }
        }
        user
    }
}

impl RoleSelection {
    fn to_bytes(&self) -> Vec<u8> {
        let uid = self.sop_class_uid.as_bytes();
        let mut out = Vec::with_capacity(uid.len() + 4);
        out.extend_from_slice(&(uid.len() as u16).to_be_bytes());
        out.extend_from_slice(uid);
        out.push(u8::from(self.scu_role));
        out.push(u8::from(self.scp_role));
        out
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let uid_len = u16::from_be_bytes([*bytes.first()?, *bytes.get(1)?]) as usize;
        let uid = bytes.get(2..2 + uid_len)?;
        let roles = bytes.get(2 + uid_len..4 + uid_len)?;
        Some(Self {
            sop_class_uid: uid_text(&String::from_utf8_lossy(uid)),
            scu_role: roles[0] != 0,
            scp_role: roles[1] != 0,
        })
    }
}

impl From<PresentationResult> for PresentationContextResultReason {
    fn from(result: PresentationResult) -> Self {
        match result {
            PresentationResult::Acceptance => Self::Acceptance,
            PresentationResult::UserRejection => Self::UserRejection,
            PresentationResult::NoReason => Self::NoReason,
            PresentationResult::AbstractSyntaxNotSupported => Self::AbstractSyntaxNotSupported,
            PresentationResult::TransferSyntaxesNotSupported => Self::TransferSyntaxesNotSupported,
        }
    }
}

impl From<PresentationContextResultReason> for PresentationResult {
    fn from(reason: PresentationContextResultReason) -> Self {
        match reason {
            PresentationContextResultReason::Acceptance => Self::Acceptance,
            PresentationContextResultReason::UserRejection => Self::UserRejection,
            PresentationContextResultReason::AbstractSyntaxNotSupported => {
                Self::AbstractSyntaxNotSupported
            }
            PresentationContextResultReason::TransferSyntaxesNotSupported => {
                Self::TransferSyntaxesNotSupported
            }
            _ => Self::NoReason,
        }
    }
}

impl From<AssociationRj> for ul::AssociationRJ {
    fn from(rj: AssociationRj) -> Self {
        let result = if rj.result == 2 {
            AssociationRJResult::Transient
        } else {
            AssociationRJResult::Permanent
        };
        let source = match (rj.source, rj.reason) {
            (2, 2) => AssociationRJSource::ServiceProviderASCE(
                AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported,
            ),
            (2, _) => AssociationRJSource::ServiceProviderASCE(
                AssociationRJServiceProviderASCEReason::NoReasonGiven,
            ),
            (3, 1) => AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
            ),
            (3, 2) => AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            ),
            (3, other) => AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::Reserved(other),
            ),
            (_, 1) => AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::NoReasonGiven),
            (_, 2) => AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            ),
            (_, 3) => AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized,
            ),
            (_, 7) => AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            ),
            (_, other) => {
                AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::Reserved(other))
            }
        };
        Self { result, source }
    }
}

impl From<ul::AssociationRJ> for AssociationRj {
    fn from(rj: ul::AssociationRJ) -> Self {
        let result = match rj.result {
            AssociationRJResult::Transient => 2,
            _ => 1,
        };
        let (source, reason) = match rj.source {
            AssociationRJSource::ServiceUser(reason) => (
                1,
                match reason {
                    AssociationRJServiceUserReason::NoReasonGiven => 1,
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported => 2,
                    AssociationRJServiceUserReason::CallingAETitleNotRecognized => 3,
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized => 7,
                    AssociationRJServiceUserReason::Reserved(code) => code,
                },
            ),
            AssociationRJSource::ServiceProviderASCE(reason) => (
                2,
                match reason {
                    AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported => 2,
                    _ => 1,
                },
            ),
            AssociationRJSource::ServiceProviderPresentation(reason) => (
                3,
                match reason {
                    AssociationRJServiceProviderPresentationReason::TemporaryCongestion => 1,
                    AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 2,
                    AssociationRJServiceProviderPresentationReason::Reserved(code) => code,
                },
            ),
        };
        Self { result, source, reason }
    }
}

/// UIDs may arrive padded to even length
fn uid_text(value: &str) -> String {
    value.trim_end_matches(['\0', ' ']).to_string()
}

fn abort_source(source: u8, reason: u8) -> AbortRQSource {
    match source {
        0 => AbortRQSource::ServiceUser,
        2 => AbortRQSource::ServiceProvider(match reason {
            1 => AbortRQServiceProviderReason::UnrecognizedPdu,
            2 => AbortRQServiceProviderReason::UnexpectedPdu,
            4 => AbortRQServiceProviderReason::UnrecognizedPduParameter,
            5 => AbortRQServiceProviderReason::UnexpectedPduParameter,
            6 => AbortRQServiceProviderReason::InvalidPduParameter,
            _ => AbortRQServiceProviderReason::ReasonNotSpecified,
        }),
        _ => AbortRQSource::Reserved,
    }
}

fn abort_codes(source: &AbortRQSource) -> (u8, u8) {
    match source {
        AbortRQSource::ServiceUser => (0, 0),
        AbortRQSource::ServiceProvider(reason) => (
            2,
            match reason {
                AbortRQServiceProviderReason::UnrecognizedPdu => 1,
                AbortRQServiceProviderReason::UnexpectedPdu => 2,
                AbortRQServiceProviderReason::UnrecognizedPduParameter => 4,
                AbortRQServiceProviderReason::UnexpectedPduParameter => 5,
                AbortRQServiceProviderReason::InvalidPduParameter => 6,
                _ => 0,
            },
        ),
        _ => (1, 0),
    }
}
