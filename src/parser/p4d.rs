// SPDX-License-Identifier: Apache-2.0

//! Perforce server (p4d) log records.
//!
//! Each record opens with `Perforce server info:` or `Perforce server error:`
//! followed by tab-indented body lines, optionally with `---` tracking lines:
//!
//! ```text
//! Perforce server info:
//!     2024/03/01 14:05:10 pid 2211 fred@fred-ws 10.1.2.3/10.9.8.7 [p4v/2023.2] 'user-sync //depot/...'
//! --- lapse .875s
//! --- usage 10+11us 0+8io 0+0net 4580k 0pf
//! --- rpc msgs/size in+out 2+3/0mb+0mb himarks 523588/523588 snd/rcv .000s/.002s
//! --- db.rev
//! ---   pages in+out+cached 6+3+2
//! ---   locks read/write 1/0 rows get+pos+scan put+del 2+0+40 0+0
//! ```
//!
//! Each record parses on its own; `p4.record_type` says which kind it was and
//! `p4.pid` is what the command tracker joins records of one command on.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::{Captures, Regex};

use super::traits::{ParseError, Parsed, RecordParser};
use crate::error::{Error, Result};

/// Start-of-record marker for p4d logs.
pub const P4D_RECORD_START: &str = r"^Perforce server (info|error):";

const TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";
const DISK_BLOCK_BYTES: u64 = 512;

pub struct P4dParser {
    header: Regex,
    stamp: Regex,
    command: Regex,
    compute_end: Regex,
    completed: Regex,
    usage: Regex,
    lapse: Regex,
    rpc: Regex,
    table: Regex,
    pages: Regex,
    splits: Regex,
    rows: Regex,
    peek: Regex,
    lock_totals: Regex,
    lock_max: Regex,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Regex(e.to_string()))
}

impl P4dParser {
    pub fn new() -> Result<Self> {
        const TIME: &str = r"(?P<time>\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2})";
        Ok(Self {
            header: compile(P4D_RECORD_START)?,
            stamp: compile(&format!(r"^{TIME} pid (?P<pid>\d+)\b"))?,
            command: compile(&format!(
                r"^{TIME} pid (?P<pid>\d+) (?P<user>[^@\s]+)@(?P<workspace>\S+) (?P<ip>\S+) \[(?P<app>[^\]]*)\] '(?P<cmd>[^'\s]+)(?: (?P<args>[^']*))?'"
            ))?,
            compute_end: compile(&format!(
                r"^{TIME} pid (?P<pid>\d+) compute end (?P<lapse>[\d.]+)s(?P<rest>.*)$"
            ))?,
            completed: compile(&format!(
                r"^{TIME} pid (?P<pid>\d+) completed (?P<lapse>[\d.]+)s(?P<rest>.*)$"
            ))?,
            usage: compile(
                r"(?P<ucpu>\d+)\+(?P<scpu>\d+)us (?P<din>\d+)\+(?P<dout>\d+)io (?P<nin>\d+)\+(?P<nout>\d+)net (?P<rss>\d+)k (?P<pf>\d+)pf",
            )?,
            lapse: compile(r"^--- lapse (?P<lapse>[\d.]+)s")?,
            rpc: compile(
                r"^--- rpc msgs/size in\+out (?P<min>\d+)\+(?P<mout>\d+)/(?P<sin>\d+)mb\+(?P<sout>\d+)mb himarks (?P<fwd>\d+)/(?P<rev>\d+)(?: snd/rcv (?P<snd>[\d.]+)s/(?P<rcv>[\d.]+)s)?",
            )?,
            table: compile(r"^--- db\.(?P<table>\w+)\s*$")?,
            pages: compile(r"^---\s+pages in\+out\+cached (?P<pin>\d+)\+(?P<pout>\d+)\+(?P<pcached>\d+)")?,
            splits: compile(r"^---\s+pages split internal\+leaf (?P<internal>\d+)\+(?P<leaf>\d+)")?,
            peek: compile(
                r"^---\s+peek count (?P<count>\d+) wait\+held total/max (?P<tw>\d+)ms\+(?P<th>\d+)ms/(?P<mw>\d+)ms\+(?P<mh>\d+)ms",
            )?,
            rows: compile(
                r"^---\s+locks read/write (?P<lr>\d+)/(?P<lw>\d+) rows get\+pos\+scan put\+del (?P<get>\d+)\+(?P<pos>\d+)\+(?P<scan>\d+) (?P<put>\d+)\+(?P<del>\d+)",
            )?,
            lock_totals: compile(
                r"^---\s+total lock wait\+held read/write (?P<rw>\d+)ms\+(?P<rh>\d+)ms/(?P<ww>\d+)ms\+(?P<wh>\d+)ms",
            )?,
            lock_max: compile(
                r"^---\s+max lock wait\+held read/write (?P<rw>\d+)ms\+(?P<rh>\d+)ms/(?P<ww>\d+)ms\+(?P<wh>\d+)ms",
            )?,
        })
    }

    /// Pattern that recognises the first line of a record.
    pub fn record_start(&self) -> &Regex {
        &self.header
    }

    fn parse_usage(&self, text: &str, parsed: &mut Parsed) {
        let Some(c) = self.usage.captures(text) else {
            return;
        };
        parsed.insert("p4.cpu.user", num(&c, "ucpu"));
        parsed.insert("p4.cpu.system", num(&c, "scpu"));
        parsed.insert("p4.disk.read_bytes", num(&c, "din").saturating_mul(DISK_BLOCK_BYTES));
        parsed.insert("p4.disk.write_bytes", num(&c, "dout").saturating_mul(DISK_BLOCK_BYTES));
        parsed.insert_nonzero("p4.ipc.in", num(&c, "nin"));
        parsed.insert_nonzero("p4.ipc.out", num(&c, "nout"));
        parsed.insert("p4.max_rss", num(&c, "rss"));
        parsed.insert("p4.page_faults", num(&c, "pf"));
    }

    fn parse_tracking(&self, lines: &[&str], parsed: &mut Parsed) {
        let mut table: Option<String> = None;

        for line in lines {
            if let Some(c) = self.lapse.captures(line) {
                parsed.insert("p4.completed_sec", float(&c, "lapse"));
            } else if line.starts_with("--- usage") {
                self.parse_usage(line, parsed);
            } else if let Some(c) = self.rpc.captures(line) {
                parsed.insert_nonzero("p4.rpc.msgs.in", num(&c, "min"));
                parsed.insert_nonzero("p4.rpc.msgs.out", num(&c, "mout"));
                parsed.insert_nonzero("p4.rpc.size.in", num(&c, "sin"));
                parsed.insert_nonzero("p4.rpc.size.out", num(&c, "sout"));
                parsed.insert_nonzero("p4.rpc.himark.fwd", num(&c, "fwd"));
                parsed.insert_nonzero("p4.rpc.himark.rev", num(&c, "rev"));
                parsed.insert_nonzero_f64("p4.rpc.snd_sec", float(&c, "snd"));
                parsed.insert_nonzero_f64("p4.rpc.rcv_sec", float(&c, "rcv"));
            } else if let Some(c) = self.table.captures(line) {
                table = Some(c["table"].to_lowercase());
            } else if let Some(t) = table.as_deref() {
                self.parse_table_line(t, line, parsed);
            }
        }
    }

    fn parse_table_line(&self, table: &str, line: &str, parsed: &mut Parsed) {
        let key = |name: &str| format!("p4.tbl.{table}.{name}");

        if let Some(c) = self.pages.captures(line) {
            parsed.insert_nonzero(key("pages.in"), num(&c, "pin"));
            parsed.insert_nonzero(key("pages.out"), num(&c, "pout"));
            parsed.insert_nonzero(key("pages.cached"), num(&c, "pcached"));
        } else if let Some(c) = self.splits.captures(line) {
            parsed.insert_nonzero(key("pages.split_internal"), num(&c, "internal"));
            parsed.insert_nonzero(key("pages.split_leaf"), num(&c, "leaf"));
        } else if let Some(c) = self.peek.captures(line) {
            parsed.insert_nonzero(key("peek.count"), num(&c, "count"));
            parsed.insert_nonzero_f64(key("peek.wait.total_sec"), ms(&c, "tw"));
            parsed.insert_nonzero_f64(key("peek.held.total_sec"), ms(&c, "th"));
            parsed.insert_nonzero_f64(key("peek.wait.max_sec"), ms(&c, "mw"));
            parsed.insert_nonzero_f64(key("peek.held.max_sec"), ms(&c, "mh"));
        } else if let Some(c) = self.rows.captures(line) {
            parsed.insert_nonzero(key("locks.read"), num(&c, "lr"));
            parsed.insert_nonzero(key("locks.write"), num(&c, "lw"));
            parsed.insert_nonzero(key("rows.get"), num(&c, "get"));
            parsed.insert_nonzero(key("rows.pos"), num(&c, "pos"));
            parsed.insert_nonzero(key("rows.scan"), num(&c, "scan"));
            parsed.insert_nonzero(key("rows.put"), num(&c, "put"));
            parsed.insert_nonzero(key("rows.del"), num(&c, "del"));
        } else if let Some(c) = self.lock_totals.captures(line) {
            parsed.insert_nonzero_f64(key("locks.read.wait.total_sec"), ms(&c, "rw"));
            parsed.insert_nonzero_f64(key("locks.read.held.total_sec"), ms(&c, "rh"));
            parsed.insert_nonzero_f64(key("locks.write.wait.total_sec"), ms(&c, "ww"));
            parsed.insert_nonzero_f64(key("locks.write.held.total_sec"), ms(&c, "wh"));
        } else if let Some(c) = self.lock_max.captures(line) {
            parsed.insert_nonzero_f64(key("locks.read.wait.max_sec"), ms(&c, "rw"));
            parsed.insert_nonzero_f64(key("locks.read.held.max_sec"), ms(&c, "rh"));
            parsed.insert_nonzero_f64(key("locks.write.wait.max_sec"), ms(&c, "ww"));
            parsed.insert_nonzero_f64(key("locks.write.held.max_sec"), ms(&c, "wh"));
        }
    }
}

impl RecordParser for P4dParser {
    fn parse(&self, text: &str) -> std::result::Result<Parsed, ParseError> {
        let mut lines = text.lines();
        let header = lines.next().unwrap_or_default();
        let kind = self
            .header
            .captures(header)
            .map(|c| c[1].to_string())
            .ok_or_else(|| ParseError("record does not start with a Perforce server header".into()))?;

        let body: Vec<&str> = lines.map(str::trim).filter(|l| !l.is_empty()).collect();
        let first = *body
            .first()
            .ok_or_else(|| ParseError("record has no body".into()))?;

        let mut parsed = Parsed::default();

        if kind == "error" {
            parsed.insert("p4.record_type", "error");
            parsed.insert("p4.server_error", body.join("\n"));
            if let Some(c) = self.stamp.captures(first) {
                parsed.timestamp = time(&c);
                parsed.insert("p4.pid", num(&c, "pid"));
            }
            return Ok(parsed);
        }

        if let Some(c) = self.command.captures(first) {
            parsed.insert("p4.record_type", "command");
            parsed.timestamp = time(&c);
            parsed.insert("p4.start_time", c["time"].to_string());
            parsed.insert("p4.pid", num(&c, "pid"));
            parsed.insert("p4.user", c["user"].to_string());
            parsed.insert("p4.workspace", c["workspace"].to_string());
            parsed.insert("p4.app", c["app"].to_string());
            parsed.insert("p4.cmd", c["cmd"].to_string());
            parsed.insert(
                "p4.args",
                c.name("args").map_or("", |m| m.as_str()).to_string(),
            );
            split_ip(&c["ip"], &mut parsed);
        } else if let Some(c) = self.compute_end.captures(first) {
            parsed.insert("p4.record_type", "compute");
            parsed.timestamp = time(&c);
            parsed.insert("p4.pid", num(&c, "pid"));
            parsed.insert("p4.compute_sec", float(&c, "lapse"));
            self.parse_usage(&c["rest"], &mut parsed);
        } else if let Some(c) = self.completed.captures(first) {
            parsed.insert("p4.record_type", "completed");
            parsed.timestamp = time(&c);
            parsed.insert("p4.end_time", c["time"].to_string());
            parsed.insert("p4.pid", num(&c, "pid"));
            parsed.insert("p4.completed_sec", float(&c, "lapse"));
            self.parse_usage(&c["rest"], &mut parsed);
        } else if let Some(c) = self.stamp.captures(first) {
            parsed.insert("p4.record_type", "info");
            parsed.timestamp = time(&c);
            parsed.insert("p4.pid", num(&c, "pid"));
        } else {
            return Err(ParseError(format!(
                "unrecognised p4d record body: {:?}",
                first.chars().take(100).collect::<String>()
            )));
        }

        self.parse_tracking(&body[1..], &mut parsed);
        Ok(parsed)
    }
}

/// `proxy/client` when the command came through a proxy or broker.
/// `background` marks server-internal work and is not an address.
fn split_ip(raw: &str, parsed: &mut Parsed) {
    match raw.split_once('/') {
        Some((proxy, client)) => {
            if !proxy.is_empty() {
                parsed.insert("p4.proxy_ip", proxy.to_string());
            }
            if !client.is_empty() {
                parsed.insert("p4.ip", client.to_string());
            }
        }
        None => {
            if !raw.is_empty() && raw != "background" {
                parsed.insert("p4.ip", raw.to_string());
            }
        }
    }
}

fn num(c: &Captures, name: &str) -> u64 {
    c.name(name)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

fn float(c: &Captures, name: &str) -> f64 {
    c.name(name)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0.0)
}

fn ms(c: &Captures, name: &str) -> f64 {
    num(c, name) as f64 / 1000.0
}

/// p4d writes server-local time without a zone; it is taken as UTC.
fn time(c: &Captures) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(c.name("time")?.as_str(), TIME_FORMAT)
        .ok()
        .map(|t| t.and_utc())
}
