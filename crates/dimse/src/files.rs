//! Reading stored Part 10 files for outbound C-STORE sub-operations

use std::io::Read;
use std::path::Path;

use dicom_object::meta::FileMetaTable;
use dicom_object::FileMetaTableBuilder;

use crate::error::{DimseError, Result};
use crate::{message, uids};

const PREAMBLE_LEN: usize = 128;
/// Size of the (0002,0000) element in explicit VR little endian
const GROUP_LENGTH_ELEMENT_LEN: usize = 12;

/// Identity of a stored file taken from its meta group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentity {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub transfer_syntax: String,
}

impl From<&FileMetaTable> for FileIdentity {
    fn from(meta: &FileMetaTable) -> Self {
        Self {
            sop_class_uid: meta.media_storage_sop_class_uid().to_string(),
            sop_instance_uid: meta.media_storage_sop_instance_uid().to_string(),
            transfer_syntax: meta.transfer_syntax().to_string(),
        }
    }
}

/// Read only the file meta group of a Part 10 file
pub fn read_identity(path: &Path) -> Result<FileIdentity> {
    let mut file = std::fs::File::open(path)?;
    let mut preamble = [0u8; PREAMBLE_LEN];
    file.read_exact(&mut preamble)?;
    let meta = FileMetaTable::from_reader(std::io::BufReader::new(file))
        .map_err(|e| DimseError::DicomParsing(format!("{}: {}", path.display(), e)))?;
    Ok(FileIdentity::from(&meta))
}

/// Load a file and return its data set encoded in `target_ts`.
///
/// The stored bytes are passed through when the transfer syntax already matches;
/// otherwise only native syntaxes are re-encoded.
pub fn load_dataset(path: &Path, target_ts: &str) -> Result<(FileIdentity, Vec<u8>)> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < PREAMBLE_LEN + 4 {
        return Err(DimseError::DicomParsing(format!(
            "{}: too short for a DICOM file",
            path.display()
        )));
    }
    let meta = FileMetaTable::from_reader(&bytes[PREAMBLE_LEN..])
        .map_err(|e| DimseError::DicomParsing(format!("{}: {}", path.display(), e)))?;
    let identity = FileIdentity::from(&meta);

    let offset =
        PREAMBLE_LEN + 4 + GROUP_LENGTH_ELEMENT_LEN + meta.information_group_length as usize;
    let dataset = bytes.get(offset..).ok_or_else(|| {
        DimseError::DicomParsing(format!("{}: meta group overruns file", path.display()))
    })?;

    let encoded = message::transcode(dataset, &identity.transfer_syntax, target_ts)?;
    Ok((identity, encoded))
}

/// Wrap a received data set into Part 10 file bytes without re-encoding it
pub fn encode_part10(identity: &FileIdentity, dataset: &[u8]) -> Result<Vec<u8>> {
    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(identity.sop_class_uid.as_str())
        .media_storage_sop_instance_uid(identity.sop_instance_uid.as_str())
        .transfer_syntax(identity.transfer_syntax.as_str())
        .implementation_class_uid(uids::IMPLEMENTATION_CLASS_UID)
        .implementation_version_name(uids::IMPLEMENTATION_VERSION_NAME)
        .build()
        .map_err(|e| DimseError::DicomObject(format!("file meta: {}", e)))?;

    let mut bytes = vec![0u8; PREAMBLE_LEN];
    bytes.extend_from_slice(b"DICM");
    meta.write(&mut bytes)
        .map_err(|e| DimseError::DicomObject(format!("file meta: {}", e)))?;
    bytes.extend_from_slice(dataset);
    Ok(bytes)
}
