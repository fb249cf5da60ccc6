//! Where a received object lands under the storage root

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::config::{NamingPolicy, StorageLayout, StorageSettings};

/// Identifying attributes of a received object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAttributes {
    pub patient_id: String,
    pub study_uid: String,
    pub series_uid: String,
    pub sop_instance_uid: String,
    pub sop_class_uid: String,
    pub instance_number: Option<u32>,
}

/// Make a value safe as one path segment.
///
/// Characters outside `[A-Za-z0-9_.-]` become `_`, runs of `_` collapse and edge
/// underscores are trimmed. Dots survive so UIDs stay readable, but a segment made
/// only of dots is replaced.
pub fn sanitize_segment(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.trim().chars() {
        let c = if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
            c
        } else {
            '_'
        };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    let out = out.trim_matches('_');
    if out.is_empty() || out.chars().all(|c| c == '.') {
        "UNKNOWN".to_string()
    } else {
        out.to_string()
    }
}

/// Directory for an object under `root` according to the layout policy
pub fn target_directory(
    root: &Path,
    layout: StorageLayout,
    attrs: &ObjectAttributes,
    received: DateTime<Local>,
) -> PathBuf {
    match layout {
        StorageLayout::Flat => root.to_path_buf(),
        StorageLayout::ByPatient => root.join(sanitize_segment(&attrs.patient_id)),
        StorageLayout::ByStudy => root.join(sanitize_segment(&attrs.study_uid)),
        StorageLayout::BySeries => series_directory(root, attrs),
        StorageLayout::ByDate => root
            .join(received.format("%Y").to_string())
            .join(received.format("%m").to_string())
            .join(received.format("%d").to_string()),
    }
}

/// `root/<patient>/<study>/<series>`
pub fn series_directory(root: &Path, attrs: &ObjectAttributes) -> PathBuf {
    root.join(sanitize_segment(&attrs.patient_id))
        .join(sanitize_segment(&attrs.study_uid))
        .join(sanitize_segment(&attrs.series_uid))
}

/// File name inside `directory` according to the naming policy.
///
/// `auto_increment` looks at the directory to find the next free number.
pub fn file_name(
    directory: &Path,
    naming: NamingPolicy,
    attrs: &ObjectAttributes,
    received: DateTime<Local>,
) -> std::io::Result<String> {
    let sop_uid_name = || format!("{}.dcm", sanitize_segment(&attrs.sop_instance_uid));
    let name = match naming {
        NamingPolicy::SopUid => sop_uid_name(),
        NamingPolicy::InstanceNumber => match attrs.instance_number {
            Some(n) => format!("{:04}.dcm", n),
            None => sop_uid_name(),
        },
        NamingPolicy::Timestamp => format!("{}.dcm", received.format("%Y%m%d_%H%M%S_%6f")),
        NamingPolicy::AutoIncrement => format!("{:06}.dcm", next_free_number(directory)?),
    };
    Ok(name)
}

fn next_free_number(directory: &Path) -> std::io::Result<u64> {
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(1),
        Err(e) => return Err(e),
    };
    let mut highest = 0;
    for entry in entries {
        let name = entry?.file_name();
        let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".dcm")) else {
            continue;
        };
        if let Ok(n) = stem.parse::<u64>() {
            highest = highest.max(n);
        }
    }
    Ok(highest + 1)
}

/// Full target path for an object
pub fn place(
    attrs: &ObjectAttributes,
    settings: &StorageSettings,
    received: DateTime<Local>,
) -> std::io::Result<PathBuf> {
    let directory = target_directory(&settings.root, settings.layout, attrs, received);
    let name = file_name(&directory, settings.naming, attrs, received)?;
    Ok(directory.join(name))
}
