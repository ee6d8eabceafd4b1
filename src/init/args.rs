// SPDX-License-Identifier: Apache-2.0

use clap::Args;
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;

use crate::beater::BeatConfig;
use crate::error::{Error, Result};
use crate::harvester::HarvesterConfig;
use crate::input::FileFinder;
use crate::parser::{CommandLimits, DEFAULT_MAX_LINES, ParserKind, RecordFormat};
use crate::prospector::{ProspectorConfig, StartAt};
use crate::publisher::PublisherConfig;
use crate::registry::RegistryOptions;
use crate::sink::SinkKind;
use crate::spooler::SpoolerConfig;

#[derive(Debug, Args, Clone, Deserialize)]
#[serde(default)]
pub struct BeatArgs {
    /// Comma-separated glob patterns of log files to ship
    #[arg(
        long = "paths",
        env = "P4DBEAT_PATHS",
        value_delimiter = ',',
        default_value = "/p4/1/logs/log"
    )]
    #[serde(alias = "path", deserialize_with = "string_or_seq")]
    pub paths: Vec<String>,

    /// Comma-separated glob patterns of files to skip
    #[arg(long, env = "P4DBEAT_EXCLUDE", value_delimiter = ',')]
    #[serde(deserialize_with = "string_or_seq")]
    pub exclude: Vec<String>,

    /// Interval in milliseconds between scans for new, renamed or removed files
    #[arg(long, env = "P4DBEAT_SCAN_INTERVAL_MS", default_value = "1000")]
    #[serde(alias = "period")]
    pub scan_interval_ms: u64,

    /// Interval in milliseconds between reads of a drained file
    #[arg(long, env = "P4DBEAT_POLL_INTERVAL_MS", default_value = "250")]
    pub poll_interval_ms: u64,

    /// Close a file that no longer matches after this many milliseconds without growth
    #[arg(long, env = "P4DBEAT_CLOSE_INACTIVE_MS", default_value = "300000")]
    pub close_inactive_ms: u64,

    /// Consecutive read failures tolerated before a file is given up
    #[arg(long, env = "P4DBEAT_MAX_READ_RETRIES", default_value = "5")]
    pub max_read_retries: u32,

    /// Bytes at the start of a file used to recognise it across inode reuse
    #[arg(long, env = "P4DBEAT_FINGERPRINT_SIZE", default_value = "1024")]
    pub fingerprint_size: usize,

    /// Longest line kept in full; longer lines are truncated
    #[arg(long, env = "P4DBEAT_MAX_LINE_BYTES", default_value = "1048576")]
    pub max_line_bytes: usize,

    /// Maximum number of files harvested concurrently
    #[arg(long, env = "P4DBEAT_MAX_HARVESTERS", default_value = "64")]
    pub max_harvesters: usize,

    /// Record parser: p4d, json or none
    #[arg(long, env = "P4DBEAT_PARSER", default_value = "p4d")]
    pub parser: ParserKind,

    /// Regex marking the first line of a record, overriding the parser's own
    #[arg(long, env = "P4DBEAT_MULTILINE_PATTERN")]
    pub multiline_pattern: Option<String>,

    /// Emit a pending multi-line record after its file has been quiet this long
    #[arg(long, env = "P4DBEAT_MULTILINE_TIMEOUT_MS", default_value = "2000")]
    pub multiline_timeout_ms: u64,

    /// Most lines folded into one record
    #[arg(long, env = "P4DBEAT_MULTILINE_MAX_LINES", default_value = "500")]
    pub multiline_max_lines: usize,

    /// Ship a p4d command still waiting for more records after this many milliseconds
    #[arg(long, env = "P4DBEAT_COMMAND_TIMEOUT_MS", default_value = "300000")]
    pub command_timeout_ms: u64,

    /// Most p4d commands held per file while waiting for their remaining records
    #[arg(long, env = "P4DBEAT_MAX_OPEN_COMMANDS", default_value = "10000")]
    pub max_open_commands: usize,

    /// Maximum events per batch
    #[arg(long, env = "P4DBEAT_BATCH_MAX_EVENTS", default_value = "2048")]
    pub batch_max_events: usize,

    /// Flush a batch once its oldest item is this many milliseconds old
    #[arg(long, env = "P4DBEAT_BATCH_TIMEOUT_MS", default_value = "1000")]
    pub batch_timeout_ms: u64,

    /// Capacity of the queue between harvesters and the spooler
    #[arg(long, env = "P4DBEAT_QUEUE_SIZE", default_value = "4096")]
    pub queue_size: usize,

    /// First delay in milliseconds before retrying a failed delivery
    #[arg(long, env = "P4DBEAT_RETRY_INITIAL_BACKOFF_MS", default_value = "1000")]
    pub retry_initial_backoff_ms: u64,

    /// Longest delay in milliseconds between delivery retries
    #[arg(long, env = "P4DBEAT_RETRY_MAX_BACKOFF_MS", default_value = "60000")]
    pub retry_max_backoff_ms: u64,

    /// Report the publisher stuck after failing for this many milliseconds
    #[arg(long, env = "P4DBEAT_RETRY_STUCK_AFTER_MS", default_value = "300000")]
    pub retry_stuck_after_ms: u64,

    /// Path of the registry holding per-file progress
    #[arg(long, env = "P4DBEAT_REGISTRY_PATH", default_value = "data/registry.json")]
    #[serde(alias = "statefile")]
    pub registry_path: PathBuf,

    /// Move an unreadable registry aside and start empty instead of failing
    #[arg(long, env = "P4DBEAT_REGISTRY_START_FRESH", default_value = "false")]
    pub registry_start_fresh: bool,

    /// Drop finished registry entries older than this many milliseconds; 0 keeps them forever
    #[arg(long, env = "P4DBEAT_REGISTRY_CLEAN_FINISHED_MS", default_value = "86400000")]
    pub registry_clean_finished_ms: u64,

    /// Maximum duration in milliseconds of consecutive registry write failures before exiting
    #[arg(long, env = "P4DBEAT_REGISTRY_MAX_FAILURE_MS", default_value = "60000")]
    pub registry_max_failure_ms: u64,

    /// Where events go: file, console or discard
    #[arg(long, env = "P4DBEAT_SINK", default_value = "file")]
    pub sink: SinkKind,

    /// Output file for the file sink
    #[arg(long, env = "P4DBEAT_SINK_PATH", default_value = "data/events.ndjson")]
    pub sink_path: PathBuf,

    /// Where to start files that have no saved progress: beginning or end.
    /// Only applies to files present at startup.
    #[arg(long, env = "P4DBEAT_START_AT", default_value = "beginning")]
    pub start_at: StartAt,

    /// Maximum time in milliseconds to deliver in-flight events during shutdown
    #[arg(long, env = "P4DBEAT_SHUTDOWN_TIMEOUT_MS", default_value = "10000")]
    pub shutdown_timeout_ms: u64,
}

impl Default for BeatArgs {
    fn default() -> Self {
        Self {
            paths: vec!["/p4/1/logs/log".to_string()],
            exclude: Vec::new(),
            scan_interval_ms: 1000,
            poll_interval_ms: 250,
            close_inactive_ms: 300_000,
            max_read_retries: 5,
            fingerprint_size: 1024,
            max_line_bytes: 1024 * 1024,
            max_harvesters: 64,
            parser: ParserKind::P4d,
            multiline_pattern: None,
            multiline_timeout_ms: 2000,
            multiline_max_lines: DEFAULT_MAX_LINES,
            command_timeout_ms: 300_000,
            max_open_commands: 10_000,
            batch_max_events: 2048,
            batch_timeout_ms: 1000,
            queue_size: 4096,
            retry_initial_backoff_ms: 1000,
            retry_max_backoff_ms: 60_000,
            retry_stuck_after_ms: 300_000,
            registry_path: PathBuf::from("data/registry.json"),
            registry_start_fresh: false,
            registry_clean_finished_ms: 86_400_000,
            registry_max_failure_ms: 60_000,
            sink: SinkKind::File,
            sink_path: PathBuf::from("data/events.ndjson"),
            start_at: StartAt::Beginning,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl BeatArgs {
    /// Validate the arguments and build the beat config.
    pub fn build_config(&self) -> Result<BeatConfig> {
        let include: Vec<String> = self
            .paths
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if include.is_empty() {
            return Err(Error::Config("at least one path is required".to_string()));
        }
        // validates every pattern
        FileFinder::new(include.clone(), self.exclude.clone())?;
        RecordFormat::new(self.parser, self.multiline_pattern.as_deref())?;

        if self.batch_max_events == 0 {
            return Err(Error::Config("batch_max_events must be at least 1".to_string()));
        }
        if self.queue_size == 0 {
            return Err(Error::Config("queue_size must be at least 1".to_string()));
        }
        if self.max_open_commands == 0 {
            return Err(Error::Config("max_open_commands must be at least 1".to_string()));
        }
        if self.max_harvesters == 0 {
            return Err(Error::Config("max_harvesters must be at least 1".to_string()));
        }
        if self.retry_initial_backoff_ms > self.retry_max_backoff_ms {
            return Err(Error::Config(format!(
                "retry_initial_backoff_ms ({}) exceeds retry_max_backoff_ms ({})",
                self.retry_initial_backoff_ms, self.retry_max_backoff_ms
            )));
        }

        Ok(BeatConfig {
            include,
            exclude: self.exclude.clone(),
            prospector: ProspectorConfig {
                scan_interval: Duration::from_millis(self.scan_interval_ms.max(1)),
                max_harvesters: self.max_harvesters,
                fingerprint_size: self.fingerprint_size,
                start_at: self.start_at,
            },
            harvester: HarvesterConfig {
                poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
                close_inactive: Duration::from_millis(self.close_inactive_ms),
                multiline_timeout: Duration::from_millis(self.multiline_timeout_ms),
                max_read_retries: self.max_read_retries,
                max_line_bytes: self.max_line_bytes,
                fingerprint_size: self.fingerprint_size,
                ..Default::default()
            },
            parser: self.parser,
            multiline_pattern: self.multiline_pattern.clone(),
            multiline_max_lines: self.multiline_max_lines,
            commands: CommandLimits {
                timeout: Duration::from_millis(self.command_timeout_ms),
                max_open: self.max_open_commands,
            },
            spooler: SpoolerConfig {
                max_events: self.batch_max_events,
                flush_interval: Duration::from_millis(self.batch_timeout_ms),
            },
            publisher: PublisherConfig {
                initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
                max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
                stuck_after: Duration::from_millis(self.retry_stuck_after_ms),
                registry_max_failure: Duration::from_millis(self.registry_max_failure_ms),
            },
            registry_path: self.registry_path.clone(),
            registry: RegistryOptions {
                start_fresh_on_corruption: self.registry_start_fresh,
                clean_finished_after: (self.registry_clean_finished_ms > 0)
                    .then(|| Duration::from_millis(self.registry_clean_finished_ms)),
            },
            sink: self.sink,
            sink_path: self.sink_path.clone(),
            queue_size: self.queue_size,
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
        })
    }
}

/// Accepts `path: /a/*.log`, `path: "/a/*.log,/b/*.log"` or a YAML list.
fn string_or_seq<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => s
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        OneOrMany::Many(v) => v,
    })
}
