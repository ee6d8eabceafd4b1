// SPDX-License-Identifier: Apache-2.0

//! Wires the pipeline together and drains it on shutdown.
//!
//! ```text
//! Prospector ─▶ Harvester* ─▶ Spooler ─▶ Publisher ─▶ Sink
//!                                            │
//!                                            ▼
//!                                         Registry
//! ```
//!
//! Shutdown runs front to back. The prospector stops its harvesters and drops
//! its sender, the spooler flushes what it holds and drops its own, and the
//! publisher finishes once the last batch is acknowledged. If that takes
//! longer than the grace period the publisher is aborted and whatever it had
//! not delivered is re-read on the next start.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bounded_channel::bounded;
use crate::error::{BoxError, Error};
use crate::harvester::HarvesterConfig;
use crate::init::wait::{self, TaskSet};
use crate::input::FileFinder;
use crate::parser::{CommandLimits, ParserKind, RecordFormat};
use crate::prospector::{Prospector, ProspectorConfig};
use crate::publisher::{DeliveryStats, Publisher, PublisherConfig, PublisherReport, PublisherStatus};
use crate::registry::{Registry, RegistryOptions};
use crate::sink::{AnySink, Sink, SinkKind};
use crate::spooler::{Spooler, SpoolerConfig};

pub const READY_MESSAGE: &str = "p4dbeat is running! Hit CTRL-C to stop it.";

/// Batches buffered between the spooler and the publisher.
const BATCH_QUEUE_SIZE: usize = 4;

#[derive(Debug, Clone)]
pub struct BeatConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub prospector: ProspectorConfig,
    pub harvester: HarvesterConfig,
    pub parser: ParserKind,
    pub multiline_pattern: Option<String>,
    pub multiline_max_lines: usize,
    pub commands: CommandLimits,
    pub spooler: SpoolerConfig,
    pub publisher: PublisherConfig,
    pub registry_path: PathBuf,
    pub registry: RegistryOptions,
    pub sink: SinkKind,
    pub sink_path: PathBuf,
    pub queue_size: usize,
    pub shutdown_timeout: Duration,
}

pub struct BeatReport {
    pub stats: DeliveryStats,
    pub registry: Registry,
}

pub struct Beater {
    config: BeatConfig,
    ready: Option<oneshot::Sender<usize>>,
}

impl Beater {
    pub fn new(config: BeatConfig) -> Self {
        Self {
            config,
            ready: None,
        }
    }

    /// Notified with the number of running harvesters once the beat is up.
    pub fn on_ready(mut self, tx: oneshot::Sender<usize>) -> Self {
        self.ready = Some(tx);
        self
    }

    /// Run with the sink named in the config.
    pub async fn run(self, shutdown: CancellationToken) -> Result<BeatReport, BoxError> {
        let sink = AnySink::open(self.config.sink, &self.config.sink_path).await?;
        self.run_with_sink(sink, shutdown).await
    }

    pub async fn run_with_sink<S: Sink + 'static>(
        mut self,
        sink: S,
        shutdown: CancellationToken,
    ) -> Result<BeatReport, BoxError> {
        let config = &self.config;

        let registry = Registry::open(&config.registry_path, &config.registry)?;
        info!(
            path = ?config.registry_path,
            files = registry.len(),
            "Loaded registry"
        );

        let format = RecordFormat::new(config.parser, config.multiline_pattern.as_deref())?
            .with_max_lines(config.multiline_max_lines)
            .with_command_limits(config.commands);
        let finder = FileFinder::new(config.include.clone(), config.exclude.clone())?;
        let known = registry.snapshot();

        let (spool_tx, spool_rx) = bounded(config.queue_size);
        let (batch_tx, batch_rx) = bounded(BATCH_QUEUE_SIZE);

        let prospector_cancel = CancellationToken::new();
        let abort = CancellationToken::new();

        let publisher = Publisher::new(
            config.publisher.clone(),
            sink,
            registry,
            batch_rx,
            abort.clone(),
        );
        let mut status = publisher.subscribe();
        let mut publisher_handle: JoinHandle<crate::error::Result<PublisherReport>> =
            tokio::spawn(publisher.run());

        let mut tasks = TaskSet::new();
        let spooler = Spooler::new(config.spooler.clone(), spool_rx, batch_tx);
        tasks.spawn(spooler.run());

        let (ready_tx, ready_rx) = oneshot::channel();
        let prospector = Prospector::new(
            config.prospector.clone(),
            Arc::new(config.harvester.clone()),
            format,
            finder,
            known,
            spool_tx,
        );
        tasks.spawn(prospector.run(prospector_cancel.clone(), ready_tx));

        let mut result: Result<(), BoxError> = Ok(());
        select! {
            res = ready_rx => match res {
                Ok(harvesters) => {
                    info!(harvesters, "{}", READY_MESSAGE);
                    if let Some(tx) = self.ready.take() {
                        let _ = tx.send(harvesters);
                    }
                }
                Err(_) => result = Err("prospector exited before its first scan".into()),
            },
            _ = shutdown.cancelled() => {}
        }

        if result.is_ok() && !shutdown.is_cancelled() {
            let mut watching = true;
            loop {
                select! {
                    _ = shutdown.cancelled() => break,
                    changed = status.changed(), if watching => {
                        if changed.is_err() {
                            watching = false;
                            continue;
                        }
                        let current = *status.borrow_and_update();
                        match current {
                            PublisherStatus::Stuck => warn!("Delivery is stuck, events are accumulating upstream"),
                            PublisherStatus::Healthy => info!("Delivery healthy"),
                            _ => {}
                        }
                    }
                    res = wait::wait_for_any_task(&mut tasks) => {
                        result = match res {
                            Ok(()) => Err("pipeline task exited unexpectedly".into()),
                            Err(e) => Err(e),
                        };
                        break;
                    }
                    res = &mut publisher_handle => {
                        return Err(match res {
                            Ok(Err(e)) => e.into(),
                            Ok(Ok(_)) => "publisher exited unexpectedly".into(),
                            Err(e) => e.into(),
                        });
                    }
                }
            }
        }

        self.drain(tasks, prospector_cancel, abort, publisher_handle, result)
            .await
    }

    async fn drain(
        &self,
        mut tasks: TaskSet,
        prospector_cancel: CancellationToken,
        abort: CancellationToken,
        mut publisher_handle: JoinHandle<crate::error::Result<PublisherReport>>,
        mut result: Result<(), BoxError>,
    ) -> Result<BeatReport, BoxError> {
        info!("Stopping, delivering in-flight events");
        let deadline = Instant::now() + self.config.shutdown_timeout;
        prospector_cancel.cancel();

        if let Err(e) = wait::wait_for_tasks_with_deadline(&mut tasks, deadline).await {
            if result.is_ok() {
                result = Err(e);
            }
        }

        let report = match timeout_at(deadline, &mut publisher_handle).await {
            Ok(joined) => joined?,
            Err(_) => {
                abort.cancel();
                let joined = publisher_handle.await?;
                tasks.abort_all();
                joined
            }
        };

        match report {
            Ok(report) => {
                info!(
                    batches = report.stats.batches,
                    delivered = report.stats.events,
                    failed_attempts = report.stats.failed_attempts,
                    pending = 0,
                    "p4dbeat stopped"
                );
                result.map(|_| BeatReport {
                    stats: report.stats,
                    registry: report.registry,
                })
            }
            Err(e @ Error::DeliveryAborted { pending }) => {
                error!(pending, "p4dbeat stopped before all events were delivered");
                Err(e.into())
            }
            Err(e) => {
                error!(error = %e, "p4dbeat stopped after a delivery failure");
                Err(e.into())
            }
        }
    }
}
