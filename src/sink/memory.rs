// SPDX-License-Identifier: Apache-2.0

use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::{Sink, SinkError};
use crate::event::Batch;

/// Keeps delivered events in memory. Clones share storage, so a test can
/// hand one to the publisher and inspect the other.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<Value>>>,
    failures: Arc<AtomicU32>,
    fatal: Arc<AtomicU32>,
    attempts: Arc<AtomicU32>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` sends with a retryable error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Reject the next `n` sends with a non-retryable error.
    pub fn reject_next(&self, n: u32) {
        self.fatal.store(n, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Value> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| e["message"].as_str().map(str::to_string))
            .collect()
    }

    /// Number of send calls, including rejected ones.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl Sink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn send(&mut self, batch: &Batch) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.fatal) {
            return Err(SinkError::fatal("rejected"));
        }
        if take_one(&self.failures) {
            return Err(SinkError::retryable("unavailable"));
        }

        let mut events = self
            .events
            .lock()
            .map_err(|_| SinkError::fatal("memory sink poisoned"))?;
        events.extend(batch.events.iter().map(|e| e.to_json()));
        Ok(())
    }
}
