// SPDX-License-Identifier: Apache-2.0

//! Turning raw lines into events.
//!
//! Lines are first grouped into logical records by a [`MultilineAssembler`],
//! then a [`RecordParser`] extracts fields from each record. A record that
//! cannot be structured is still delivered, flagged `degraded`, with only its
//! raw text. For p4d logs a [`CommandTracker`] then folds the records of each
//! command into one event.
//!
//! # Available Parsers
//!
//! - [`P4dParser`] - Perforce server text logs (the default)
//! - [`JsonParser`] - Perforce structured (JSON) logs
//! - none - every line shipped as-is

mod command;
mod json;
mod multiline;
mod p4d;
mod traits;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::{Event, SourceRef};

pub use command::{CommandLimits, CommandTracker};
pub use json::JsonParser;
pub use multiline::{DEFAULT_MAX_LINES, LogicalRecord, MultilineAssembler, MultilineRule};
pub use p4d::{P4D_RECORD_START, P4dParser};
pub use traits::{ParseError, Parsed, RecordParser};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    #[default]
    P4d,
    Json,
    None,
}

impl fmt::Display for ParserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParserKind::P4d => write!(f, "p4d"),
            ParserKind::Json => write!(f, "json"),
            ParserKind::None => write!(f, "none"),
        }
    }
}

impl FromStr for ParserKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "p4d" => Ok(ParserKind::P4d),
            "json" => Ok(ParserKind::Json),
            "none" | "raw" => Ok(ParserKind::None),
            other => Err(Error::Config(format!("unknown parser {:?}", other))),
        }
    }
}

/// How records are delimited and structured. Shared by all harvesters;
/// each harvester gets its own assembler.
#[derive(Clone)]
pub struct RecordFormat {
    parser: Option<Arc<dyn RecordParser>>,
    rule: MultilineRule,
    max_lines: usize,
    /// Set for formats whose records are joined into commands
    commands: Option<CommandLimits>,
}

impl fmt::Debug for RecordFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordFormat")
            .field("structured", &self.parser.is_some())
            .field("rule", &self.rule)
            .field("max_lines", &self.max_lines)
            .field("commands", &self.commands)
            .finish()
    }
}

impl RecordFormat {
    /// `multiline_pattern` overrides the parser's own record start marker.
    pub fn new(kind: ParserKind, multiline_pattern: Option<&str>) -> Result<Self> {
        let custom = multiline_pattern
            .map(|p| {
                Regex::new(p)
                    .map(MultilineRule::StartPattern)
                    .map_err(|e| Error::Regex(format!("invalid multiline pattern: {}", e)))
            })
            .transpose()?;

        let (parser, default_rule): (Option<Arc<dyn RecordParser>>, MultilineRule) = match kind {
            ParserKind::P4d => {
                let parser = P4dParser::new()?;
                let rule = MultilineRule::StartPattern(parser.record_start().clone());
                (Some(Arc::new(parser)), rule)
            }
            ParserKind::Json => (Some(Arc::new(JsonParser::new())), MultilineRule::SingleLine),
            ParserKind::None => (None, MultilineRule::SingleLine),
        };

        Ok(Self {
            parser,
            rule: custom.unwrap_or(default_rule),
            max_lines: DEFAULT_MAX_LINES,
            commands: (kind == ParserKind::P4d).then(CommandLimits::default),
        })
    }

    pub fn with_max_lines(mut self, max_lines: usize) -> Self {
        self.max_lines = max_lines;
        self
    }

    /// Only affects formats that track commands.
    pub fn with_command_limits(mut self, limits: CommandLimits) -> Self {
        if self.commands.is_some() {
            self.commands = Some(limits);
        }
        self
    }

    pub fn assembler(&self) -> MultilineAssembler {
        MultilineAssembler::with_max_lines(self.rule.clone(), self.max_lines)
    }

    pub fn tracker(&self) -> Option<CommandTracker> {
        self.commands.map(CommandTracker::new)
    }

    pub fn to_event(&self, source: &SourceRef, record: LogicalRecord) -> Event {
        let message = record.text();
        let mut event = Event {
            source: source.clone(),
            start: record.start,
            end: record.end,
            commit: record.end,
            line: record.line,
            timestamp: Utc::now(),
            fields: Default::default(),
            message,
            degraded: false,
        };

        let Some(parser) = &self.parser else {
            return event;
        };

        if record.orphan {
            event.degraded = true;
            return event;
        }

        match parser.parse(&event.message) {
            Ok(parsed) => {
                event.fields = parsed.fields;
                if let Some(ts) = parsed.timestamp {
                    event.timestamp = ts;
                }
            }
            Err(e) => {
                debug!(file_id = %source.id, offset = record.start, error = %e, "Record left unstructured");
                event.degraded = true;
            }
        }
        event
    }
}
