//! Protocol descriptor exchanged between peers.
//!
//! Each side fingerprints its compiled service definitions with an md5 and
//! a last-modified timestamp. The descriptor rides the first exchange in
//! each direction; a mismatch is not fatal but explains body-decode
//! failures ("proto desync").

use serde::{Deserialize, Serialize};

/// Fingerprint of one side's service definitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtoInfo {
    /// md5 of the compiled service definitions.
    pub md5: String,
    /// When the definitions were last modified (epoch milliseconds).
    pub last_modified: u64,
    /// Version of the runtime that produced this descriptor.
    pub version: String,
    /// Optional host runtime description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
}

impl ProtoInfo {
    /// Explain a fingerprint mismatch between this (local) descriptor and
    /// the remote one, naming which side is newer.
    ///
    /// Returns `None` when the fingerprints agree.
    pub fn desync_explanation(&self, remote: &ProtoInfo) -> Option<String> {
        if self.md5 == remote.md5 {
            return None;
        }
        let newer = if remote.last_modified > self.last_modified {
            "the remote side is newer"
        } else if remote.last_modified < self.last_modified {
            "the local side is newer"
        } else {
            "both sides report the same last-modified time"
        };
        Some(format!(
            "proto desync: local md5 {} (lastModified {}), remote md5 {} (lastModified {}); {}",
            self.md5, self.last_modified, remote.md5, remote.last_modified, newer
        ))
    }
}
