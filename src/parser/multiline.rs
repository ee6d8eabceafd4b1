// SPDX-License-Identifier: Apache-2.0

//! Groups physical lines into logical records.
//!
//! With a start pattern the assembler is a two-state machine:
//!
//! ```text
//!            start line                      start line (emit previous)
//!   Idle ───────────────▶ Open ◀──────────────┐
//!    ▲  ╲                  │ ╲________________┘
//!    │   ╲ other line      │ other line: append
//!    │    ▼                │
//!    │  orphan record      │ flush / line limit (emit)
//!    └─────────────────────┘
//! ```
//!
//! Blank lines never open a record; while one is open they are kept and
//! trailing blanks are trimmed from the text.

use regex::Regex;

use crate::event::RawRecord;

/// Upper bound on lines folded into one record; a runaway record is cut here.
pub const DEFAULT_MAX_LINES: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct LogicalRecord {
    pub start: u64,
    pub end: u64,
    /// Line number of the first line, when known
    pub line: Option<u64>,
    pub lines: Vec<String>,
    /// A continuation line that arrived with no record open
    pub orphan: bool,
}

impl LogicalRecord {
    fn new(line: &RawRecord, orphan: bool) -> Self {
        Self {
            start: line.start,
            end: line.end,
            line: line.line,
            lines: vec![line.text()],
            orphan,
        }
    }

    pub fn text(&self) -> String {
        let keep = self
            .lines
            .iter()
            .rposition(|l| !l.trim().is_empty())
            .map_or(0, |i| i + 1);
        self.lines[..keep].join("\n")
    }
}

#[derive(Debug, Clone)]
pub enum MultilineRule {
    /// Every non-blank line is its own record
    SingleLine,
    /// A line matching the pattern starts a record; anything else continues it
    StartPattern(Regex),
}

#[derive(Debug)]
enum State {
    Idle,
    Open(LogicalRecord),
}

#[derive(Debug)]
pub struct MultilineAssembler {
    rule: MultilineRule,
    max_lines: usize,
    state: State,
}

impl MultilineAssembler {
    pub fn new(rule: MultilineRule) -> Self {
        Self::with_max_lines(rule, DEFAULT_MAX_LINES)
    }

    pub fn with_max_lines(rule: MultilineRule, max_lines: usize) -> Self {
        Self {
            rule,
            max_lines: max_lines.max(1),
            state: State::Idle,
        }
    }

    /// Offset where the open record began. Nothing at or past it may be
    /// committed until the record is emitted.
    pub fn pending_start(&self) -> Option<u64> {
        match &self.state {
            State::Idle => None,
            State::Open(rec) => Some(rec.start),
        }
    }

    pub fn push(&mut self, line: RawRecord, out: &mut Vec<LogicalRecord>) {
        let blank = line.bytes.iter().all(|b| b.is_ascii_whitespace());

        let starts = match &self.rule {
            MultilineRule::SingleLine => {
                if !blank {
                    out.push(LogicalRecord::new(&line, false));
                }
                return;
            }
            MultilineRule::StartPattern(re) => !blank && re.is_match(&line.text()),
        };

        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => {
                if starts {
                    self.state = State::Open(LogicalRecord::new(&line, false));
                } else if !blank {
                    out.push(LogicalRecord::new(&line, true));
                }
            }
            State::Open(mut rec) => {
                if starts {
                    out.push(rec);
                    self.state = State::Open(LogicalRecord::new(&line, false));
                } else {
                    rec.lines.push(line.text());
                    rec.end = line.end;
                    if rec.lines.len() >= self.max_lines {
                        out.push(rec);
                    } else {
                        self.state = State::Open(rec);
                    }
                }
            }
        }
    }

    /// Emit the open record, if any.
    pub fn flush(&mut self) -> Option<LogicalRecord> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => None,
            State::Open(rec) => Some(rec),
        }
    }

    /// Discard the open record, e.g. after the file was truncated under it.
    pub fn reset(&mut self) {
        self.state = State::Idle;
    }
}
