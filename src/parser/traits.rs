// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

/// Why a record could not be structured. Never fatal: the record is still
/// shipped with its raw text.
#[derive(Debug, Error, PartialEq)]
#[error("{0}")]
pub struct ParseError(pub String);

/// Structured fields extracted from one logical record.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Parsed {
    pub fields: Map<String, Value>,
    /// Time the record itself claims, if any
    pub timestamp: Option<DateTime<Utc>>,
}

impl Parsed {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Counters that are zero carry no information and are left out.
    pub fn insert_nonzero(&mut self, key: impl Into<String>, value: u64) {
        if value > 0 {
            self.fields.insert(key.into(), Value::from(value));
        }
    }

    pub fn insert_nonzero_f64(&mut self, key: impl Into<String>, value: f64) {
        if value > 0.0 {
            self.fields.insert(key.into(), Value::from(value));
        }
    }
}

/// Turns the text of one logical record into fields.
pub trait RecordParser: Send + Sync {
    fn parse(&self, text: &str) -> Result<Parsed, ParseError>;
}
