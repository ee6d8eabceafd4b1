// SPDX-License-Identifier: Apache-2.0

//! On-disk layout of the registry.
//!
//! ```json
//! {
//!   "version": 1,
//!   "files": {
//!     "2049:131077": {
//!       "dev": 2049, "ino": 131077,
//!       "path": "/p4/1/logs/log",
//!       "offset": 48213, "generation": 0,
//!       "fingerprint": { "len": 1024, "blake3": "…" },
//!       "last_seen": "2024-05-01T10:00:00Z",
//!       "finished": false
//!     }
//!   }
//! }
//! ```
//!
//! Unknown fields are ignored on read so an older binary can load a registry
//! written by a newer one with the same `version`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::input::{FileId, Fingerprint};

pub const REGISTRY_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct RegistryDocument {
    pub version: u8,
    #[serde(default)]
    pub files: BTreeMap<String, FileState>,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            files: BTreeMap::new(),
        }
    }
}

/// Durable progress for one file identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileState {
    pub dev: u64,
    pub ino: u64,
    /// Last path the file was read under
    pub path: PathBuf,
    /// Bytes acknowledged downstream
    pub offset: u64,
    #[serde(default)]
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub finished: bool,
}

impl FileState {
    pub fn id(&self) -> FileId {
        FileId::new(self.dev, self.ino)
    }

    pub fn key(&self) -> String {
        self.id().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_fields_ignored() {
        let raw = r#"{
            "version": 1,
            "host": "p4-edge-1",
            "files": {
                "1:100": {
                    "dev": 1, "ino": 100,
                    "path": "/p4/1/logs/log",
                    "offset": 500,
                    "last_seen": "2024-05-01T10:00:00Z",
                    "inode_generation_hint": 9
                }
            }
        }"#;

        let doc: RegistryDocument = serde_json::from_str(raw).unwrap();
        let state = &doc.files["1:100"];
        assert_eq!(state.id(), FileId::new(1, 100));
        assert_eq!(state.offset, 500);
        assert_eq!(state.generation, 0);
        assert!(state.fingerprint.is_none());
        assert!(!state.finished);
    }

    #[test]
    fn test_default_document() {
        let doc = RegistryDocument::default();
        assert_eq!(doc.version, REGISTRY_VERSION);
        assert!(doc.files.is_empty());
        assert_eq!(
            serde_json::to_string(&doc).unwrap(),
            r#"{"version":1,"files":{}}"#
        );
    }
}
