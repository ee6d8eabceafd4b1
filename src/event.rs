// SPDX-License-Identifier: Apache-2.0

//! Records and events as they move from harvesters to the sink.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::collections::btree_map;
use std::path::PathBuf;
use std::sync::Arc;

use crate::input::{FileId, Fingerprint};

/// Where an event came from. Shared by every event a harvester emits until
/// the path, generation or fingerprint changes.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub id: FileId,
    pub path: PathBuf,
    /// Bumped each time the file is truncated underneath the harvester.
    pub generation: u64,
    pub fingerprint: Option<Fingerprint>,
}

pub type SourceRef = Arc<Source>;

/// One delimited line, before multi-line assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub id: FileId,
    /// Offset of the first byte of the line
    pub start: u64,
    /// Offset just past the delimiter
    pub end: u64,
    /// 1-based line number, when the reader knows it
    pub line: Option<u64>,
    pub bytes: Vec<u8>,
}

impl RawRecord {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub source: SourceRef,
    pub start: u64,
    pub end: u64,
    /// Offset the registry may advance to once this event is acknowledged.
    /// Behind `end` while earlier records are still held back.
    pub commit: u64,
    /// Line number of the first line of the record
    pub line: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub fields: Map<String, Value>,
    pub message: String,
    /// Set when the record could not be structured
    pub degraded: bool,
}

impl Event {
    /// Stable across re-delivery of the same bytes, so downstream can drop duplicates.
    pub fn event_id(&self) -> String {
        format!(
            "{}-{}-{}",
            self.source.id, self.source.generation, self.start
        )
    }

    pub fn to_json(&self) -> Value {
        let mut doc = Map::with_capacity(self.fields.len() + 6);
        doc.insert(
            "@timestamp".into(),
            Value::String(self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        doc.insert("type".into(), Value::String("p4dbeat".into()));
        doc.insert("event_id".into(), Value::String(self.event_id()));
        doc.insert(
            "log".into(),
            json!({
                "file": {
                    "path": self.source.path.to_string_lossy(),
                    "id": self.source.id.to_string(),
                },
                "offset": self.start,
                "generation": self.source.generation,
            }),
        );
        doc.insert("message".into(), Value::String(self.message.clone()));
        if self.degraded {
            doc.insert("degraded".into(), Value::Bool(true));
        }
        for (k, v) in &self.fields {
            doc.insert(k.clone(), v.clone());
        }
        Value::Object(doc)
    }
}

/// A resumable position in one file.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub path: PathBuf,
    pub generation: u64,
    pub offset: u64,
    pub fingerprint: Option<Fingerprint>,
}

impl Checkpoint {
    pub fn for_source(source: &Source, offset: u64) -> Self {
        Self {
            path: source.path.clone(),
            generation: source.generation,
            offset,
            fingerprint: source.fingerprint.clone(),
        }
    }

    /// Positions order by generation first; a truncated file's offset 0 is
    /// ahead of any offset from before the truncation.
    pub fn is_at_or_after(&self, generation: u64, offset: u64) -> bool {
        (self.generation, self.offset) >= (generation, offset)
    }
}

/// What harvesters and the prospector feed into the spooler.
#[derive(Debug)]
pub enum Spool {
    Event(Event),
    /// Bytes were consumed without producing an event.
    Checkpoint(FileId, Checkpoint),
    /// The file was retired; mark it finished once everything before this is delivered.
    Finished(FileId),
}

/// Furthest position per identity represented in a batch.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CommitSet {
    entries: BTreeMap<FileId, Checkpoint>,
}

impl CommitSet {
    pub fn record(&mut self, id: FileId, checkpoint: Checkpoint) {
        match self.entries.get_mut(&id) {
            Some(current) => {
                if checkpoint.is_at_or_after(current.generation, current.offset) {
                    *current = checkpoint;
                }
            }
            None => {
                self.entries.insert(id, checkpoint);
            }
        }
    }

    pub fn record_event(&mut self, event: &Event) {
        self.record(
            event.source.id,
            Checkpoint::for_source(&event.source, event.commit),
        );
    }

    pub fn get(&self, id: &FileId) -> Option<&Checkpoint> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, FileId, Checkpoint> {
        self.entries.iter()
    }
}

impl IntoIterator for CommitSet {
    type Item = (FileId, Checkpoint);
    type IntoIter = btree_map::IntoIter<FileId, Checkpoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// The unit of delivery and acknowledgement.
#[derive(Debug, Default)]
pub struct Batch {
    pub seq: u64,
    pub events: Vec<Event>,
    pub commits: CommitSet,
    pub finished: Vec<FileId>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.commits.is_empty() && self.finished.is_empty()
    }
}
