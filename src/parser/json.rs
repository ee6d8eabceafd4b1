// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use super::traits::{ParseError, Parsed, RecordParser};

/// Keys written by p4d's structured (JSON) log, renamed to the field names
/// used for text logs so both formats land in the same schema.
const RENAMES: &[(&str, &str)] = &[
    ("cmd", "p4.cmd"),
    ("user", "p4.user"),
    ("workspace", "p4.workspace"),
    ("ip", "p4.ip"),
    ("args", "p4.args"),
    ("app", "p4.app"),
    ("pid", "p4.pid"),
    ("startTime", "p4.start_time"),
    ("endTime", "p4.end_time"),
    ("computeLapse", "p4.compute_sec"),
    ("completedLapse", "p4.completed_sec"),
];

/// Parses each record as one JSON object.
#[derive(Debug, Clone, Default)]
pub struct JsonParser;

impl JsonParser {
    pub fn new() -> Self {
        Self
    }
}

impl RecordParser for JsonParser {
    fn parse(&self, text: &str) -> Result<Parsed, ParseError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ParseError(format!("invalid JSON: {}", e)))?;

        let Value::Object(map) = value else {
            return Err(ParseError(
                "JSON must be an object at the top level".to_string(),
            ));
        };

        let mut parsed = Parsed::default();
        for (key, value) in map {
            if value.is_null() {
                continue;
            }
            let name = RENAMES
                .iter()
                .find(|(from, _)| *from == key)
                .map_or_else(|| format!("p4.{}", key), |(_, to)| to.to_string());
            parsed.fields.insert(name, value);
        }

        parsed.timestamp = parsed
            .fields
            .get("p4.start_time")
            .and_then(Value::as_str)
            .and_then(parse_time);

        Ok(parsed)
    }
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    ["%Y/%m/%d %H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|t| t.and_utc())
}
