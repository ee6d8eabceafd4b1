// SPDX-License-Identifier: Apache-2.0

//! Splits a byte stream into newline-delimited records while tracking the
//! file offset of every record.

use crate::event::RawRecord;
use crate::input::FileId;

/// Accumulates bytes read from a file and hands out complete lines.
///
/// A trailing partial line stays buffered until its delimiter arrives. Lines
/// longer than `max_line_bytes` keep only their first `max_line_bytes` bytes,
/// but the full length still counts toward offsets.
#[derive(Debug)]
pub struct LineSplitter {
    id: FileId,
    max_line_bytes: usize,
    /// Offset of the first byte of the buffered partial line
    line_start: u64,
    /// Bytes of the partial line seen so far, including any dropped overflow
    line_len: u64,
    /// Number of the buffered line, unknown when starting mid-file
    line_no: Option<u64>,
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn new(id: FileId, offset: u64, max_line_bytes: usize) -> Self {
        Self {
            id,
            max_line_bytes,
            line_start: offset,
            line_len: 0,
            line_no: first_line(offset),
            buf: Vec::new(),
        }
    }

    /// Number the line starting at the current offset.
    pub fn set_line(&mut self, line_no: u64) {
        self.line_no = Some(line_no);
    }

    /// Offset just past the last complete line handed out.
    pub fn consumed(&self) -> u64 {
        self.line_start
    }

    /// Offset of the next byte expected from the file.
    pub fn position(&self) -> u64 {
        self.line_start + self.line_len
    }

    pub fn has_partial(&self) -> bool {
        self.line_len > 0
    }

    /// Drop any partial line and continue from `offset`.
    pub fn reset(&mut self, offset: u64) {
        self.line_start = offset;
        self.line_len = 0;
        self.line_no = first_line(offset);
        self.buf.clear();
    }

    pub fn push(&mut self, mut chunk: &[u8], out: &mut Vec<RawRecord>) {
        while !chunk.is_empty() {
            match chunk.iter().position(|&b| b == b'\n') {
                Some(idx) => {
                    self.append(&chunk[..idx]);
                    self.line_len += 1;

                    let mut bytes = std::mem::take(&mut self.buf);
                    if bytes.last() == Some(&b'\r') {
                        bytes.pop();
                    }
                    let end = self.line_start + self.line_len;
                    out.push(RawRecord {
                        id: self.id,
                        start: self.line_start,
                        end,
                        line: self.line_no,
                        bytes,
                    });

                    self.line_no = self.line_no.map(|n| n + 1);
                    self.line_start = end;
                    self.line_len = 0;
                    chunk = &chunk[idx + 1..];
                }
                None => {
                    self.append(chunk);
                    chunk = &[];
                }
            }
        }
    }

    fn append(&mut self, bytes: &[u8]) {
        let room = self.max_line_bytes.saturating_sub(self.buf.len());
        self.buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
        self.line_len += bytes.len() as u64;
    }
}

fn first_line(offset: u64) -> Option<u64> {
    (offset == 0).then_some(1)
}
