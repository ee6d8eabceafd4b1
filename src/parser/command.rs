// SPDX-License-Identifier: Apache-2.0

//! Folds the records of one p4d command into a single event.
//!
//! p4d writes a command as several records that share its pid: the start
//! line, an optional `compute end`, the `completed` line and, for commands
//! over the tracking thresholds, a block that repeats the command line with
//! `---` performance lines. Records of other commands interleave freely.
//!
//! The tracker holds a command from its start record until it can no longer
//! grow: its tracking block arrived, its pid started something else, enough
//! records went by since it completed, the file went quiet, or it has been
//! open longer than the command timeout. Held commands pin the harvester's
//! commit offset at their start so a restart reads them again.

use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

use crate::event::Event;

/// Records accepted after a command completes before it is emitted without
/// waiting any longer for its tracking block.
const COMPLETED_GRACE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandLimits {
    /// Emit a command that has been open this long, finished or not
    pub timeout: Duration,
    /// Most commands held at once; the oldest is emitted beyond this
    pub max_open: usize,
}

impl Default for CommandLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            max_open: 10_000,
        }
    }
}

#[derive(Debug)]
struct OpenCommand {
    pid: u64,
    event: Event,
    completed: bool,
    /// Records seen since the command completed
    since_completed: usize,
    opened: Instant,
}

#[derive(Debug)]
pub struct CommandTracker {
    limits: CommandLimits,
    /// In order of their start records
    open: Vec<OpenCommand>,
}

impl CommandTracker {
    pub fn new(limits: CommandLimits) -> Self {
        Self {
            limits: CommandLimits {
                max_open: limits.max_open.max(1),
                ..limits
            },
            open: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Offset of the oldest record still held.
    pub fn earliest_start(&self) -> Option<u64> {
        self.open.iter().map(|c| c.event.start).min()
    }

    /// Accept one parsed record. Events ready for delivery are appended to `out`.
    pub fn push(&mut self, event: Event, now: Instant, out: &mut Vec<Event>) {
        for command in self.open.iter_mut().filter(|c| c.completed) {
            command.since_completed += 1;
        }

        let pid = event.fields.get("p4.pid").and_then(Value::as_u64);
        let kind = event
            .fields
            .get("p4.record_type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match (pid, kind.as_str()) {
            (Some(pid), "command") => self.on_command(pid, event, now, out),
            (Some(pid), "compute") => match self.find(pid) {
                Some(idx) => merge(&mut self.open[idx].event, event),
                None => out.push(event),
            },
            (Some(pid), "completed") => match self.find(pid) {
                Some(idx) => {
                    let command = &mut self.open[idx];
                    merge(&mut command.event, event);
                    command.completed = true;
                    command.since_completed = 0;
                }
                None => out.push(event),
            },
            (Some(pid), "error") => match self.find(pid) {
                Some(idx) => {
                    let command = &mut self.open[idx].event;
                    command.fields.insert("p4.cmd_error".into(), Value::Bool(true));
                    merge(command, event);
                }
                None => out.push(event),
            },
            _ => out.push(event),
        }

        self.emit_where(out, |c| c.completed && c.since_completed >= COMPLETED_GRACE);
        while self.open.len() > self.limits.max_open {
            out.push(self.open.remove(0).event);
        }
        self.expire(now, out);
    }

    /// Emit commands open for longer than the command timeout.
    pub fn expire(&mut self, now: Instant, out: &mut Vec<Event>) {
        let timeout = self.limits.timeout;
        self.emit_where(out, |c| now.saturating_duration_since(c.opened) >= timeout);
    }

    /// Emit completed commands still waiting for a tracking block. Used once
    /// the file has gone quiet.
    pub fn flush_completed(&mut self, out: &mut Vec<Event>) {
        self.emit_where(out, |c| c.completed);
    }

    /// Emit everything held, oldest first.
    pub fn drain(&mut self, out: &mut Vec<Event>) {
        out.extend(self.open.drain(..).map(|c| c.event));
    }

    /// Forget held commands, e.g. after the file was truncated under them.
    pub fn reset(&mut self) {
        self.open.clear();
    }

    fn find(&self, pid: u64) -> Option<usize> {
        self.open.iter().rposition(|c| c.pid == pid)
    }

    fn emit_where(&mut self, out: &mut Vec<Event>, ready: impl Fn(&OpenCommand) -> bool) {
        let mut i = 0;
        while i < self.open.len() {
            if ready(&self.open[i]) {
                out.push(self.open.remove(i).event);
            } else {
                i += 1;
            }
        }
    }

    fn on_command(&mut self, pid: u64, mut event: Event, now: Instant, out: &mut Vec<Event>) {
        let tracked = event.fields.contains_key("p4.completed_sec");

        if let Some(idx) = self.find(pid) {
            if tracked && same_command(&self.open[idx].event, &event) {
                let mut command = self.open.remove(idx);
                merge(&mut command.event, event);
                out.push(command.event);
                return;
            }
            // the pid moved on to its next command
            out.push(self.open.remove(idx).event);
        }

        let running = self.open.iter().filter(|c| !c.completed).count() + 1;
        event.fields.insert("p4.running".into(), Value::from(running as u64));
        if let Some(line) = event.line {
            event.fields.insert("p4.line_no".into(), Value::from(line));
        }
        event
            .fields
            .insert("p4.process_key".into(), Value::String(process_key(pid, &event)));
        event.fields.insert("p4.cmd_error".into(), Value::Bool(false));

        // a tracking block with no start in view carries the whole command
        if tracked {
            out.push(event);
            return;
        }
        self.open.push(OpenCommand {
            pid,
            event,
            completed: false,
            since_completed: 0,
            opened: now,
        });
    }
}

fn field<'a>(event: &'a Event, key: &str) -> &'a str {
    event.fields.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn same_command(a: &Event, b: &Event) -> bool {
    ["p4.cmd", "p4.args", "p4.start_time"]
        .iter()
        .all(|k| field(a, k) == field(b, k))
}

/// Stable identity of one command execution.
fn process_key(pid: u64, event: &Event) -> String {
    let position = event.line.unwrap_or(event.start);
    let key = format!(
        "{}|{}|{}|{}|{}",
        pid,
        field(event, "p4.start_time"),
        field(event, "p4.cmd"),
        field(event, "p4.args"),
        position
    );
    let mut hex = blake3::hash(key.as_bytes()).to_hex().to_string();
    hex.truncate(32);
    hex
}

/// Fold a later record of the same command into the held event. The record
/// type and identity of the command stay those of its start record.
fn merge(into: &mut Event, from: Event) {
    for (key, value) in from.fields {
        match key.as_str() {
            "p4.record_type" | "p4.running" | "p4.line_no" | "p4.process_key" | "p4.cmd_error" => {}
            _ => {
                into.fields.insert(key, value);
            }
        }
    }
    into.message.push('\n');
    into.message.push_str(&from.message);
    into.end = into.end.max(from.end);
    into.commit = into.commit.max(from.commit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RawRecord;
    use crate::event::test_support::source;
    use crate::parser::{ParserKind, RecordFormat};

    /// Parse `text` into one event per record, numbering lines from 1.
    fn events(text: &str) -> Vec<Event> {
        let format = RecordFormat::new(ParserKind::P4d, None).unwrap();
        let src = source(1, 5, 0);
        let mut asm = format.assembler();
        let mut records = Vec::new();
        let mut offset = 0;
        for (i, line) in text.split_inclusive('\n').enumerate() {
            let start = offset;
            offset += line.len() as u64;
            asm.push(
                RawRecord {
                    id: src.id,
                    start,
                    end: offset,
                    line: Some(i as u64 + 1),
                    bytes: line.trim_end_matches('\n').as_bytes().to_vec(),
                },
                &mut records,
            );
        }
        records.extend(asm.flush());
        records
            .into_iter()
            .map(|r| format.to_event(&src, r))
            .collect()
    }

    fn track(tracker: &mut CommandTracker, text: &str) -> Vec<Event> {
        let now = Instant::now();
        let mut out = Vec::new();
        for event in events(text) {
            tracker.push(event, now, &mut out);
        }
        out
    }

    const SYNC: &str = concat!(
        "Perforce server info:\n",
        "\t2024/03/01 14:05:10 pid 2211 fred@ws 10.1.2.3 [p4v/2023.2] 'user-sync //depot/...'\n",
        "\n",
        "Perforce server info:\n",
        "\t2024/03/01 14:05:10 pid 2211 compute end .020s 1+0us 0+0io 0+0net 3000k 0pf\n",
        "\n",
        "Perforce server info:\n",
        "\t2024/03/01 14:05:11 pid 2211 completed 1.25s 7+4us 8+16io 0+0net 4580k 0pf\n",
        "\n",
        "Perforce server info:\n",
        "\t2024/03/01 14:05:10 pid 2211 fred@ws 10.1.2.3 [p4v/2023.2] 'user-sync //depot/...'\n",
        "--- lapse 1.25s\n",
        "--- rpc msgs/size in+out 2+3/0mb+0mb himarks 523588/523588 snd/rcv .000s/.002s\n",
        "--- db.rev\n",
        "---   pages in+out+cached 6+3+2\n",
        "---   peek count 4 wait+held total/max 0ms+12ms/0ms+8ms\n",
    );

    #[test]
    fn test_records_of_one_command_become_one_event() {
        let mut tracker = CommandTracker::new(CommandLimits::default());
        let out = track(&mut tracker, SYNC);

        assert_eq!(out.len(), 1);
        assert!(tracker.is_empty());
        let e = &out[0];
        assert_eq!(e.fields["p4.record_type"], "command");
        assert_eq!(e.fields["p4.cmd"], "user-sync");
        assert_eq!(e.fields["p4.start_time"], "2024/03/01 14:05:10");
        assert_eq!(e.fields["p4.end_time"], "2024/03/01 14:05:11");
        assert_eq!(e.fields["p4.compute_sec"], 0.02);
        assert_eq!(e.fields["p4.completed_sec"], 1.25);
        assert_eq!(e.fields["p4.disk.write_bytes"], 16 * 512);
        assert_eq!(e.fields["p4.rpc.msgs.out"], 3);
        assert_eq!(e.fields["p4.tbl.rev.pages.in"], 6);
        assert_eq!(e.fields["p4.tbl.rev.peek.count"], 4);
        assert_eq!(e.fields["p4.tbl.rev.peek.held.total_sec"], 0.012);
        assert_eq!(e.fields["p4.running"], 1);
        assert_eq!(e.fields["p4.line_no"], 1);
        assert_eq!(e.fields["p4.cmd_error"], false);
        assert_eq!(e.fields["p4.process_key"].as_str().unwrap().len(), 32);
        assert_eq!(e.start, 0);
        assert_eq!(e.end, SYNC.len() as u64);
        assert!(e.message.contains("compute end"));
    }

    #[test]
    fn test_interleaved_commands_hold_back_commit_offset() {
        let mut tracker = CommandTracker::new(CommandLimits::default());
        let out = track(
            &mut tracker,
            concat!(
                "Perforce server info:\n",
                "\t2024/03/01 14:05:10 pid 10 fred@ws 10.1.2.3 [p4v] 'user-sync //...'\n",
                "Perforce server info:\n",
                "\t2024/03/01 14:05:10 pid 20 anne@ws 10.1.2.4 [p4] 'user-info'\n",
                "Perforce server info:\n",
                "\t2024/03/01 14:05:10 pid 20 completed .001s\n",
                "Perforce server info:\n",
                "\t2024/03/01 14:05:11 pid 20 anne@ws 10.1.2.4 [p4] 'user-changes -m1'\n",
            ),
        );

        // pid 20 moved on, so its first command is done
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].fields["p4.cmd"], "user-info");
        assert_eq!(out[0].fields["p4.running"], 2);
        assert_eq!(out[0].fields["p4.completed_sec"], 0.001);

        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.earliest_start(), Some(0));

        let mut rest = Vec::new();
        tracker.drain(&mut rest);
        let cmds: Vec<_> = rest.iter().map(|e| e.fields["p4.cmd"].clone()).collect();
        assert_eq!(cmds, vec!["user-sync", "user-changes"]);
        assert_eq!(tracker.earliest_start(), None);
    }

    #[test]
    fn test_completed_command_emitted_after_grace() {
        let mut tracker = CommandTracker::new(CommandLimits::default());
        let mut text = String::from(concat!(
            "Perforce server info:\n",
            "\t2024/03/01 14:05:10 pid 1 fred@ws 10.1.2.3 [p4] 'user-info'\n",
            "Perforce server info:\n",
            "\t2024/03/01 14:05:10 pid 1 completed .01s\n",
        ));
        for i in 0..COMPLETED_GRACE {
            text.push_str(&format!(
                "Perforce server info:\n\t2024/03/01 14:05:11 pid {} server notice\n",
                100 + i
            ));
        }
        let out = track(&mut tracker, &text);

        let commands: Vec<_> = out
            .iter()
            .filter(|e| e.fields["p4.record_type"] == "command")
            .collect();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].fields["p4.cmd"], "user-info");
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_quiet_file_releases_completed_only() {
        let mut tracker = CommandTracker::new(CommandLimits::default());
        let out = track(
            &mut tracker,
            concat!(
                "Perforce server info:\n",
                "\t2024/03/01 14:05:10 pid 1 fred@ws 10.1.2.3 [p4] 'user-info'\n",
                "Perforce server info:\n",
                "\t2024/03/01 14:05:10 pid 1 completed .01s\n",
                "Perforce server info:\n",
                "\t2024/03/01 14:05:10 pid 2 fred@ws 10.1.2.3 [p4] 'user-sync'\n",
            ),
        );
        assert!(out.is_empty());

        let mut out = Vec::new();
        tracker.flush_completed(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].fields["p4.pid"], 1);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_server_error_marks_command() {
        let mut tracker = CommandTracker::new(CommandLimits::default());
        track(
            &mut tracker,
            concat!(
                "Perforce server info:\n",
                "\t2024/03/01 14:05:10 pid 77 bob@ws 10.0.0.1 [p4] 'user-edit x'\n",
                "Perforce server error:\n",
                "\t2024/03/01 14:05:10 pid 77 bob@ws 10.0.0.1 [p4] 'user-edit x'\n",
                "\tFile(s) not on client.\n",
            ),
        );

        let mut out = Vec::new();
        tracker.drain(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].fields["p4.cmd_error"], true);
        assert_eq!(out[0].fields["p4.record_type"], "command");
        assert!(
            out[0].fields["p4.server_error"]
                .as_str()
                .unwrap()
                .ends_with("File(s) not on client.")
        );
    }

    #[test]
    fn test_unrelated_records_pass_through() {
        let mut tracker = CommandTracker::new(CommandLimits::default());
        let out = track(
            &mut tracker,
            concat!(
                "\tcut off by rotation\n",
                "Perforce server info:\n",
                "\t2024/03/01 14:05:10 pid 5 completed .5s\n",
                "Perforce server info:\n",
                "\t2024/03/01 14:05:10 pid 6 server notice\n",
            ),
        );
        assert_eq!(out.len(), 3);
        assert!(out[0].degraded);
        assert_eq!(out[1].fields["p4.record_type"], "completed");
        assert_eq!(out[2].fields["p4.record_type"], "info");
    }

    #[test]
    fn test_limits() {
        let text = concat!(
            "Perforce server info:\n",
            "\t2024/03/01 14:05:10 pid 1 fred@ws 10.1.2.3 [p4] 'user-sync'\n",
            "Perforce server info:\n",
            "\t2024/03/01 14:05:10 pid 2 fred@ws 10.1.2.3 [p4] 'user-sync'\n",
        );

        let mut capped = CommandTracker::new(CommandLimits {
            max_open: 1,
            ..Default::default()
        });
        let out = track(&mut capped, text);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].fields["p4.pid"], 1);

        let mut tracker = CommandTracker::new(CommandLimits {
            timeout: Duration::from_secs(60),
            ..Default::default()
        });
        assert!(track(&mut tracker, text).is_empty());
        let mut out = Vec::new();
        tracker.expire(Instant::now() + Duration::from_secs(61), &mut out);
        assert_eq!(out.len(), 2);
    }
}
