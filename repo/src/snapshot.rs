//! Snapshots: the top-level, immutable record of one
//! backup run. Stored as an unpacked object under the `snapshot` kind,
//! named by a fresh random id chosen by the repository (not by content
//! hash, since two backups of identical content taken seconds apart
//! must still produce two distinct snapshots).

use backup_castore::id::Id;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// What was excluded from a backup run, recorded for provenance rather
/// than enforced again on restore.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Excludes {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub time: DateTime<Local>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Id>,
    pub tree: Id,
    pub paths: Vec<String>,
    pub hostname: String,
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excludes: Option<Excludes>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Snapshot {
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("snapshot serializes infallibly")
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
