// SPDX-License-Identifier: Apache-2.0

use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::select;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::reader::LineSplitter;
use crate::bounded_channel::{BoundedSender, SendError};
use crate::event::{Checkpoint, Event, RawRecord, Source, SourceRef, Spool};
use crate::input::{FileId, Fingerprint, get_path_from_file};
use crate::parser::{CommandTracker, LogicalRecord, MultilineAssembler, RecordFormat};

/// Most bytes read in one pass before checking for cancellation and renames.
const MAX_BYTES_PER_PASS: usize = 1024 * 1024;

/// Resuming further into a file than this leaves line numbers unknown
/// rather than counting every line before the resume point.
const MAX_LINE_COUNT_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct HarvesterConfig {
    /// Sleep between reads once the file is drained
    pub poll_interval: Duration,
    /// Idle time after which a file the prospector no longer matches is closed
    pub close_inactive: Duration,
    /// Idle time after which an open multi-line record is emitted as-is
    pub multiline_timeout: Duration,
    /// Consecutive read failures tolerated before giving up on the file
    pub max_read_retries: u32,
    pub read_buffer_size: usize,
    pub max_line_bytes: usize,
    pub fingerprint_size: usize,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            close_inactive: Duration::from_secs(300),
            multiline_timeout: Duration::from_secs(2),
            max_read_retries: 5,
            read_buffer_size: 64 * 1024,
            max_line_bytes: 1024 * 1024,
            fingerprint_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvesterState {
    Opening,
    Reading,
    Waiting,
    Truncated,
    Renamed,
    Closing,
    Closed,
}

/// Latest view the prospector has of a harvested file.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub path: PathBuf,
    /// Whether the file still matches the configured patterns
    pub matched: bool,
}

/// Where a harvester starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Seed {
    pub offset: u64,
    pub generation: u64,
    /// Emit a checkpoint for the seed itself. Used when the starting position
    /// did not come from the registry, so the registry learns it.
    pub announce: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    /// Closed after the file stopped matching and went quiet
    Finished,
    /// Could not be read; excluded until restart
    Failed(String),
    /// The path no longer leads to this identity
    Replaced,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarvesterExit {
    pub id: FileId,
    pub reason: ExitReason,
    /// Where a later harvester for this identity may resume
    pub offset: u64,
    pub generation: u64,
}

enum Progress {
    Data,
    Idle,
}

enum Stop {
    Cancelled,
    Io(io::Error),
}

impl From<io::Error> for Stop {
    fn from(e: io::Error) -> Self {
        Stop::Io(e)
    }
}

impl From<SendError> for Stop {
    fn from(_: SendError) -> Self {
        Stop::Cancelled
    }
}

/// Tails one file identity.
pub struct Harvester {
    config: Arc<HarvesterConfig>,
    format: RecordFormat,
    source: SourceRef,
    seed: Seed,
    placement: watch::Receiver<Placement>,
    out: BoundedSender<Spool>,
    cancel: CancellationToken,
    state: HarvesterState,
    splitter: LineSplitter,
    assembler: MultilineAssembler,
    tracker: Option<CommandTracker>,
    /// Furthest offset handed downstream, by event or checkpoint
    reported: u64,
    removed: bool,
    last_growth: Instant,
    failures: u32,
    buf: Vec<u8>,
}

impl Harvester {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: FileId,
        path: PathBuf,
        seed: Seed,
        config: Arc<HarvesterConfig>,
        format: RecordFormat,
        placement: watch::Receiver<Placement>,
        out: BoundedSender<Spool>,
        cancel: CancellationToken,
    ) -> Self {
        let splitter = LineSplitter::new(id, seed.offset, config.max_line_bytes);
        let assembler = format.assembler();
        let tracker = format.tracker();
        let buf = vec![0u8; config.read_buffer_size.max(1)];

        Self {
            source: Arc::new(Source {
                id,
                path,
                generation: seed.generation,
                fingerprint: None,
            }),
            reported: seed.offset,
            seed,
            config,
            format,
            placement,
            out,
            cancel,
            state: HarvesterState::Opening,
            splitter,
            assembler,
            tracker,
            removed: false,
            last_growth: Instant::now(),
            failures: 0,
            buf,
        }
    }

    fn set_state(&mut self, state: HarvesterState) {
        if self.state != state {
            debug!(file_id = %self.source.id, from = ?self.state, to = ?state, "Harvester state change");
            self.state = state;
        }
    }

    fn exit(&mut self, reason: ExitReason) -> HarvesterExit {
        self.set_state(HarvesterState::Closed);
        HarvesterExit {
            id: self.source.id,
            reason,
            offset: self.safe_offset(),
            generation: self.source.generation,
        }
    }

    pub async fn run(mut self) -> HarvesterExit {
        let mut file = match self.open().await {
            Ok(file) => file,
            Err(reason) => return self.exit(reason),
        };

        info!(
            file_id = %self.source.id,
            path = ?self.source.path,
            offset = self.seed.offset,
            generation = self.seed.generation,
            "Started harvester"
        );

        if self.seed.announce {
            let checkpoint = Checkpoint::for_source(&self.source, self.seed.offset);
            if self
                .out
                .send_or_cancel(Spool::Checkpoint(self.source.id, checkpoint), &self.cancel)
                .await
                .is_err()
            {
                return self.exit(ExitReason::Cancelled);
            }
        }

        self.set_state(HarvesterState::Reading);
        loop {
            if self.cancel.is_cancelled() {
                return self.exit(ExitReason::Cancelled);
            }
            self.check_placement();

            match self.poll_once(&mut file).await {
                Ok(Progress::Data) => {
                    self.failures = 0;
                    self.set_state(HarvesterState::Reading);
                }
                Ok(Progress::Idle) => {
                    self.failures = 0;
                    if let Err(Stop::Cancelled) = self.flush_idle().await {
                        return self.exit(ExitReason::Cancelled);
                    }
                    if self.removed && self.last_growth.elapsed() >= self.config.close_inactive {
                        self.set_state(HarvesterState::Closing);
                        if let Err(Stop::Cancelled) = self.drain_commands().await {
                            return self.exit(ExitReason::Cancelled);
                        }
                        let file = file.into_std().await;
                        match get_path_from_file(&file) {
                            Ok(current) => info!(
                                file_id = %self.source.id,
                                path = ?current,
                                "Closing inactive harvester"
                            ),
                            Err(_) => info!(
                                file_id = %self.source.id,
                                last_path = ?self.source.path,
                                "Closing inactive harvester for deleted file"
                            ),
                        }
                        return self.exit(ExitReason::Finished);
                    }
                    self.set_state(HarvesterState::Waiting);
                    if !self.pause().await {
                        return self.exit(ExitReason::Cancelled);
                    }
                }
                Err(Stop::Cancelled) => return self.exit(ExitReason::Cancelled),
                Err(Stop::Io(e)) => {
                    self.failures += 1;
                    if e.kind() == io::ErrorKind::PermissionDenied
                        || self.failures > self.config.max_read_retries
                    {
                        self.set_state(HarvesterState::Closing);
                        warn!(
                            file_id = %self.source.id,
                            path = ?self.source.path,
                            attempts = self.failures,
                            error = %e,
                            "Giving up on unreadable file"
                        );
                        return self.exit(ExitReason::Failed(e.to_string()));
                    }
                    debug!(file_id = %self.source.id, attempt = self.failures, error = %e, "Read failed, will retry");
                    if !self.pause().await {
                        return self.exit(ExitReason::Cancelled);
                    }
                }
            }
        }
    }

    async fn open(&mut self) -> Result<File, ExitReason> {
        let mut attempts = 0;
        loop {
            match self.try_open().await {
                Ok(file) => return Ok(file),
                Err(Stop::Cancelled) => return Err(ExitReason::Cancelled),
                Err(Stop::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = ?self.source.path, "File vanished before it could be opened");
                    return Err(ExitReason::Replaced);
                }
                Err(Stop::Io(e)) if e.kind() == io::ErrorKind::PermissionDenied => {
                    warn!(path = ?self.source.path, error = %e, "Permission denied opening file");
                    return Err(ExitReason::Failed(e.to_string()));
                }
                Err(Stop::Io(e)) => {
                    attempts += 1;
                    if attempts > self.config.max_read_retries {
                        warn!(path = ?self.source.path, error = %e, "Giving up opening file");
                        return Err(ExitReason::Failed(e.to_string()));
                    }
                    if !self.pause().await {
                        return Err(ExitReason::Cancelled);
                    }
                }
            }
        }
    }

    async fn try_open(&mut self) -> Result<File, Stop> {
        let mut file = File::open(&self.source.path).await?;
        let id = FileId::from_metadata(&file.metadata().await?)?;
        if id != self.source.id {
            debug!(path = ?self.source.path, expected = %self.source.id, found = %id, "Path now holds a different file");
            return Err(Stop::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "path no longer refers to this file",
            )));
        }

        let fingerprint = self.read_fingerprint(&mut file).await?;
        self.update_source(|s| s.fingerprint = Some(fingerprint));
        if self.seed.offset > 0 && self.seed.offset <= MAX_LINE_COUNT_BYTES {
            let before = count_lines(&mut file, self.seed.offset, &mut self.buf).await?;
            self.splitter.set_line(before + 1);
        }
        file.seek(SeekFrom::Start(self.seed.offset)).await?;
        Ok(file)
    }

    /// Reads the file prefix and restores the cursor to the current position.
    async fn read_fingerprint(&self, file: &mut File) -> io::Result<Fingerprint> {
        let mut prefix = Vec::with_capacity(self.config.fingerprint_size);
        file.seek(SeekFrom::Start(0)).await?;
        (&mut *file)
            .take(self.config.fingerprint_size as u64)
            .read_to_end(&mut prefix)
            .await?;
        file.seek(SeekFrom::Start(self.splitter.position())).await?;
        Ok(Fingerprint::from_bytes(&prefix))
    }

    fn update_source(&mut self, f: impl FnOnce(&mut Source)) {
        let mut next = (*self.source).clone();
        f(&mut next);
        self.source = Arc::new(next);
    }

    fn check_placement(&mut self) {
        if !self.placement.has_changed().unwrap_or(false) {
            return;
        }
        let placement = self.placement.borrow_and_update().clone();

        if placement.path != self.source.path {
            self.set_state(HarvesterState::Renamed);
            info!(
                file_id = %self.source.id,
                from = ?self.source.path,
                to = ?placement.path,
                "File renamed, continuing at same offset"
            );
            self.update_source(|s| s.path = placement.path.clone());
        }
        if self.removed != !placement.matched {
            self.removed = !placement.matched;
            debug!(file_id = %self.source.id, removed = self.removed, "Match status changed");
        }
    }

    async fn poll_once(&mut self, file: &mut File) -> Result<Progress, Stop> {
        let len = file.metadata().await?.len();
        let position = self.splitter.position();

        if len < position {
            self.handle_truncation(file, len).await?;
            return Ok(Progress::Data);
        }
        if len == position {
            return Ok(Progress::Idle);
        }

        self.last_growth = Instant::now();
        let mut lines = Vec::new();
        let mut read = 0;
        while read < MAX_BYTES_PER_PASS {
            let n = file.read(&mut self.buf).await?;
            if n == 0 {
                break;
            }
            read += n;
            self.splitter.push(&self.buf[..n], &mut lines);
        }

        if self
            .source
            .fingerprint
            .as_ref()
            .is_some_and(|fp| fp.can_grow(self.config.fingerprint_size, len))
        {
            let fingerprint = self.read_fingerprint(file).await?;
            self.update_source(|s| s.fingerprint = Some(fingerprint));
        }

        self.emit_lines(lines).await?;
        Ok(Progress::Data)
    }

    async fn handle_truncation(&mut self, file: &mut File, len: u64) -> Result<(), Stop> {
        self.set_state(HarvesterState::Truncated);
        warn!(
            file_id = %self.source.id,
            path = ?self.source.path,
            size = len,
            offset = self.splitter.position(),
            "File truncated, restarting from the beginning"
        );

        self.splitter.reset(0);
        self.assembler.reset();
        if let Some(tracker) = &mut self.tracker {
            tracker.reset();
        }
        self.reported = 0;
        file.seek(SeekFrom::Start(0)).await?;
        let fingerprint = self.read_fingerprint(file).await?;
        self.update_source(|s| {
            s.generation += 1;
            s.fingerprint = Some(fingerprint);
        });

        let checkpoint = Checkpoint::for_source(&self.source, 0);
        self.send(Spool::Checkpoint(self.source.id, checkpoint))
            .await?;
        Ok(())
    }

    async fn emit_lines(&mut self, lines: Vec<RawRecord>) -> Result<(), Stop> {
        let mut records = Vec::new();
        for line in lines {
            self.assembler.push(line, &mut records);
        }
        let now = Instant::now();
        let mut events = Vec::with_capacity(records.len());
        for record in records {
            self.track(record, now, &mut events);
        }
        if let Some(tracker) = &mut self.tracker {
            tracker.expire(now, &mut events);
        }
        self.deliver(events).await?;
        self.checkpoint_progress().await
    }

    fn track(&mut self, record: LogicalRecord, now: Instant, out: &mut Vec<Event>) {
        let event = self.format.to_event(&self.source, record);
        match &mut self.tracker {
            Some(tracker) => tracker.push(event, now, out),
            None => out.push(event),
        }
    }

    /// Nothing before this offset is still held back by the assembler or
    /// the command tracker.
    fn safe_offset(&self) -> u64 {
        let read = self
            .assembler
            .pending_start()
            .unwrap_or_else(|| self.splitter.consumed());
        self.tracker
            .as_ref()
            .and_then(CommandTracker::earliest_start)
            .map_or(read, |held| held.min(read))
    }

    /// Send events in order. An event may only commit up to the start of
    /// anything sent after it or still held.
    async fn deliver(&mut self, mut events: Vec<Event>) -> Result<(), Stop> {
        let mut limit = self.safe_offset();
        for event in events.iter_mut().rev() {
            event.commit = event.end.min(limit);
            limit = limit.min(event.start);
        }
        for event in events {
            let commit = event.commit;
            self.send(Spool::Event(event)).await?;
            self.reported = self.reported.max(commit);
        }
        Ok(())
    }

    /// Report consumed bytes that produced no event of their own.
    async fn checkpoint_progress(&mut self) -> Result<(), Stop> {
        let safe = self.safe_offset();
        if safe > self.reported {
            let checkpoint = Checkpoint::for_source(&self.source, safe);
            self.send(Spool::Checkpoint(self.source.id, checkpoint))
                .await?;
            self.reported = safe;
        }
        Ok(())
    }

    /// Once the file has been quiet for the multi-line timeout, emit the
    /// open record and any command only waiting for a tracking block. The
    /// file is quiet, so they are as complete as they get.
    async fn flush_idle(&mut self) -> Result<(), Stop> {
        if self.last_growth.elapsed() < self.config.multiline_timeout {
            return Ok(());
        }
        let now = Instant::now();
        let mut events = Vec::new();
        if let Some(record) = self.assembler.flush() {
            self.track(record, now, &mut events);
        }
        if let Some(tracker) = &mut self.tracker {
            tracker.flush_completed(&mut events);
            tracker.expire(now, &mut events);
        }
        if events.is_empty() {
            return Ok(());
        }
        self.deliver(events).await?;
        self.checkpoint_progress().await
    }

    /// Emit commands that will never see another record.
    async fn drain_commands(&mut self) -> Result<(), Stop> {
        let mut events = Vec::new();
        if let Some(tracker) = &mut self.tracker {
            tracker.drain(&mut events);
        }
        if events.is_empty() {
            return Ok(());
        }
        self.deliver(events).await?;
        self.checkpoint_progress().await
    }

    async fn send(&self, item: Spool) -> Result<(), Stop> {
        self.out.send_or_cancel(item, &self.cancel).await?;
        Ok(())
    }

    /// Sleep one poll interval. Returns false if cancelled.
    async fn pause(&self) -> bool {
        select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(self.config.poll_interval) => true,
        }
    }
}

/// Number of newlines in the first `offset` bytes of `file`.
async fn count_lines(file: &mut File, offset: u64, buf: &mut [u8]) -> io::Result<u64> {
    file.seek(SeekFrom::Start(0)).await?;
    let mut prefix = (&mut *file).take(offset);
    let mut lines = 0;
    loop {
        let n = prefix.read(buf).await?;
        if n == 0 {
            return Ok(lines);
        }
        lines += buf[..n].iter().filter(|&&b| b == b'\n').count() as u64;
    }
}
