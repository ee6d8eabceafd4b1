// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use tokio::select;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::bounded_channel::{BoundedReceiver, BoundedSender};
use crate::error::BoxError;
use crate::event::{Batch, Spool};

#[derive(Debug, Clone)]
pub struct SpoolerConfig {
    /// Flush once this many events are buffered
    pub max_events: usize,
    /// Flush once the oldest buffered item is this old
    pub flush_interval: Duration,
}

impl Default for SpoolerConfig {
    fn default() -> Self {
        Self {
            max_events: 2048,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Collects events and checkpoints from every harvester into batches.
///
/// Runs until all senders are gone, then flushes whatever is left and drops
/// its output, which tells the publisher the stream has ended.
pub struct Spooler {
    config: SpoolerConfig,
    rx: BoundedReceiver<Spool>,
    out: BoundedSender<Batch>,
    next_seq: u64,
}

impl Spooler {
    pub fn new(config: SpoolerConfig, rx: BoundedReceiver<Spool>, out: BoundedSender<Batch>) -> Self {
        Self {
            config,
            rx,
            out,
            next_seq: 1,
        }
    }

    pub async fn run(mut self) -> Result<(), BoxError> {
        let mut batch = Batch::default();
        let mut deadline: Option<Instant> = None;

        loop {
            let item = match deadline {
                Some(at) => select! {
                    item = self.rx.next() => item,
                    _ = sleep_until(at) => {
                        self.flush(&mut batch).await?;
                        deadline = None;
                        continue;
                    }
                },
                None => self.rx.next().await,
            };

            let Some(item) = item else {
                self.flush(&mut batch).await?;
                debug!("Spooler input closed, exiting");
                return Ok(());
            };

            match item {
                Spool::Event(event) => {
                    batch.commits.record_event(&event);
                    batch.events.push(event);
                }
                Spool::Checkpoint(id, checkpoint) => batch.commits.record(id, checkpoint),
                Spool::Finished(id) => batch.finished.push(id),
            }
            if deadline.is_none() {
                deadline = Some(Instant::now() + self.config.flush_interval);
            }

            if batch.events.len() >= self.config.max_events {
                self.flush(&mut batch).await?;
                deadline = None;
            }
        }
    }

    async fn flush(&mut self, batch: &mut Batch) -> Result<(), BoxError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut ready = std::mem::take(batch);
        ready.seq = self.next_seq;
        self.next_seq += 1;

        debug!(
            seq = ready.seq,
            events = ready.events.len(),
            files = ready.commits.len(),
            "Flushing batch"
        );
        self.out
            .send(ready)
            .await
            .map_err(|e| format!("publisher is gone: {}", e).into())
    }
}
