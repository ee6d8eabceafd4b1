// SPDX-License-Identifier: Apache-2.0

//! Delivers batches to the sink and advances the registry.
//!
//! Batches are handled strictly one at a time, in the order the spooler
//! produced them. A batch is retried until the sink acknowledges it or the
//! publisher is aborted; only after the acknowledgement are its positions
//! written to the registry.

mod backoff;

pub use backoff::Backoff;

use std::time::Duration;
use tokio::select;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::BoundedReceiver;
use crate::error::{Error, Result};
use crate::event::Batch;
use crate::registry::Registry;
use crate::sink::Sink;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Continuous failure after which the publisher reports itself stuck
    pub stuck_after: Duration,
    /// How long registry writes may keep failing before it is fatal
    pub registry_max_failure: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            stuck_after: Duration::from_secs(300),
            registry_max_failure: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherStatus {
    Healthy,
    Retrying,
    Stuck,
    Stopped,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
    pub batches: u64,
    pub events: u64,
    pub failed_attempts: u64,
}

pub struct PublisherReport {
    pub stats: DeliveryStats,
    pub registry: Registry,
}

pub struct Publisher<S> {
    config: PublisherConfig,
    sink: S,
    registry: Registry,
    rx: BoundedReceiver<Batch>,
    abort: CancellationToken,
    status: watch::Sender<PublisherStatus>,
    stats: DeliveryStats,
    persist_failing_since: Option<Instant>,
}

impl<S: Sink> Publisher<S> {
    pub fn new(
        config: PublisherConfig,
        sink: S,
        registry: Registry,
        rx: BoundedReceiver<Batch>,
        abort: CancellationToken,
    ) -> Self {
        let (status, _) = watch::channel(PublisherStatus::Healthy);
        Self {
            config,
            sink,
            registry,
            rx,
            abort,
            status,
            stats: DeliveryStats::default(),
            persist_failing_since: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PublisherStatus> {
        self.status.subscribe()
    }

    /// Runs until the spooler closes its side and every batch is delivered.
    pub async fn run(mut self) -> Result<PublisherReport> {
        debug!(sink = self.sink.name(), "Starting publisher");
        let abort = self.abort.clone();

        loop {
            let batch = select! {
                biased;
                _ = abort.cancelled() => return Err(self.aborted(None)),
                batch = self.rx.next() => batch,
            };
            let Some(batch) = batch else {
                break;
            };

            self.deliver(&batch).await?;
            self.stats.batches += 1;
            self.stats.events += batch.events.len() as u64;
            self.commit(&batch)?;
        }

        if let Err(e) = self.registry.persist() {
            error!(error = %e, "Final registry write failed");
            self.status.send_replace(PublisherStatus::Stopped);
            return Err(e);
        }
        self.status.send_replace(PublisherStatus::Stopped);
        debug!(
            batches = self.stats.batches,
            events = self.stats.events,
            "Publisher finished"
        );
        Ok(PublisherReport {
            stats: self.stats,
            registry: self.registry,
        })
    }

    async fn deliver(&mut self, batch: &Batch) -> Result<()> {
        let abort = self.abort.clone();
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        let started = Instant::now();
        let mut stuck = false;

        loop {
            let res = select! {
                biased;
                _ = abort.cancelled() => return Err(self.aborted(Some(batch))),
                res = self.sink.send(batch) => res,
            };

            let e = match res {
                Ok(()) => {
                    if backoff.attempts() > 0 {
                        info!(
                            seq = batch.seq,
                            attempts = backoff.attempts() + 1,
                            "Delivery recovered"
                        );
                        self.status.send_replace(PublisherStatus::Healthy);
                    }
                    return Ok(());
                }
                Err(e) => e,
            };

            self.stats.failed_attempts += 1;
            let delay = backoff.next_delay();
            if e.retryable {
                warn!(
                    seq = batch.seq,
                    attempt = backoff.attempts(),
                    delay = ?delay,
                    error = %e,
                    "Delivery failed, will retry after delay"
                );
            } else {
                error!(
                    seq = batch.seq,
                    attempt = backoff.attempts(),
                    delay = ?delay,
                    error = %e,
                    "Sink rejected batch, will retry after delay"
                );
            }

            if !stuck && started.elapsed() >= self.config.stuck_after {
                stuck = true;
                error!(
                    seq = batch.seq,
                    failing_for = ?started.elapsed(),
                    "Publisher is stuck; events are held until the sink accepts them"
                );
                self.status.send_replace(PublisherStatus::Stuck);
            } else if !stuck {
                self.status.send_replace(PublisherStatus::Retrying);
            }

            select! {
                biased;
                _ = abort.cancelled() => return Err(self.aborted(Some(batch))),
                _ = sleep(delay) => {}
            }
        }
    }

    fn commit(&mut self, batch: &Batch) -> Result<()> {
        match self
            .registry
            .commit_batch(&batch.commits, &batch.finished)
        {
            Ok(advanced) => {
                if self.persist_failing_since.take().is_some() {
                    info!("Registry writes recovered");
                }
                debug!(seq = batch.seq, advanced, "Committed batch");
                Ok(())
            }
            Err(e) => {
                let since = *self.persist_failing_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.config.registry_max_failure {
                    error!(error = %e, failing_for = ?since.elapsed(), "Registry cannot be written");
                    return Err(e);
                }
                warn!(error = %e, "Registry write failed, will retry on next batch");
                Ok(())
            }
        }
    }

    fn aborted(&mut self, in_flight: Option<&Batch>) -> Error {
        let mut pending = in_flight.map_or(0, |b| b.events.len());
        while let Some(queued) = self.rx.try_recv() {
            pending += queued.events.len();
        }
        self.status.send_replace(PublisherStatus::Stopped);
        Error::DeliveryAborted { pending }
    }
}
