// SPDX-License-Identifier: Apache-2.0

//! Destinations for delivered batches.
//!
//! A sink acknowledges a batch by returning `Ok` from [`Sink::send`]; only
//! then does the publisher advance the registry. Sinks must tolerate seeing a
//! batch again after a restart.

mod console;
mod discard;
mod file;
mod memory;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::error::{Error, Result};
use crate::event::Batch;

pub use console::ConsoleSink;
pub use discard::DiscardSink;
pub use file::FileSink;
pub use memory::MemorySink;

#[derive(Debug, Error)]
#[error("{message}")]
pub struct SinkError {
    pub message: String,
    /// Whether sending the same batch again may succeed
    pub retryable: bool,
}

impl SinkError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        SinkError::retryable(e.to_string())
    }
}

pub trait Sink: Send {
    fn name(&self) -> &'static str;

    fn send(&mut self, batch: &Batch) -> impl Future<Output = std::result::Result<(), SinkError>> + Send;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    #[default]
    File,
    Console,
    Discard,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkKind::File => write!(f, "file"),
            SinkKind::Console => write!(f, "console"),
            SinkKind::Discard => write!(f, "discard"),
        }
    }
}

impl FromStr for SinkKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(SinkKind::File),
            "console" | "stdout" => Ok(SinkKind::Console),
            "discard" | "blackhole" => Ok(SinkKind::Discard),
            other => Err(Error::Config(format!("unknown sink {:?}", other))),
        }
    }
}

pub enum AnySink {
    File(FileSink),
    Console(ConsoleSink),
    Discard(DiscardSink),
}

impl AnySink {
    pub async fn open(kind: SinkKind, path: &Path) -> Result<Self> {
        Ok(match kind {
            SinkKind::File => AnySink::File(FileSink::open(path).await?),
            SinkKind::Console => AnySink::Console(ConsoleSink::new()),
            SinkKind::Discard => AnySink::Discard(DiscardSink),
        })
    }
}

impl Sink for AnySink {
    fn name(&self) -> &'static str {
        match self {
            AnySink::File(s) => s.name(),
            AnySink::Console(s) => s.name(),
            AnySink::Discard(s) => s.name(),
        }
    }

    async fn send(&mut self, batch: &Batch) -> std::result::Result<(), SinkError> {
        match self {
            AnySink::File(s) => s.send(batch).await,
            AnySink::Console(s) => s.send(batch).await,
            AnySink::Discard(s) => s.send(batch).await,
        }
    }
}

/// One NDJSON line per event.
pub(crate) fn encode_batch(batch: &Batch) -> std::result::Result<Vec<u8>, SinkError> {
    let mut buf = Vec::with_capacity(batch.events.len() * 256);
    for event in &batch.events {
        serde_json::to_writer(&mut buf, &event.to_json())
            .map_err(|e| SinkError::fatal(format!("failed to encode event: {}", e)))?;
        buf.push(b'\n');
    }
    Ok(buf)
}
