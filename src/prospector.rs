// SPDX-License-Identifier: Apache-2.0

//! Periodic discovery of log files and ownership of their harvesters.
//!
//! Every scan expands the configured patterns, groups the results by file
//! identity and reconciles them with the running harvesters:
//!
//! - a new identity gets a harvester, seeded from the registry when known
//! - a running identity found under another name is told about the rename
//! - a running identity no longer found is told it is unmatched and closes
//!   itself once idle
//!
//! Harvesters that retire are reported downstream as finished so the registry
//! can mark them once their last events are delivered. What the prospector
//! remembers about a retired or failed identity is dropped once no scan has
//! found it for a few rounds.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::{oneshot, watch};
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::BoundedSender;
use crate::error::{BoxError, Error};
use crate::event::Spool;
use crate::harvester::{ExitReason, Harvester, HarvesterConfig, HarvesterExit, Placement, Seed};
use crate::input::{FileFinder, FileId, read_prefix};
use crate::parser::RecordFormat;
use crate::registry::FileState;

/// Scans a retired identity may go unfound before it is forgotten.
const FORGET_AFTER_SCANS: u32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartAt {
    #[default]
    Beginning,
    End,
}

impl fmt::Display for StartAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartAt::Beginning => write!(f, "beginning"),
            StartAt::End => write!(f, "end"),
        }
    }
}

impl FromStr for StartAt {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "beginning" => Ok(StartAt::Beginning),
            "end" => Ok(StartAt::End),
            other => Err(Error::Config(format!("unknown start_at {:?}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProspectorConfig {
    pub scan_interval: Duration,
    pub max_harvesters: usize,
    pub fingerprint_size: usize,
    /// Where files without registry state start, on the first scan only
    pub start_at: StartAt,
}

impl Default for ProspectorConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(1),
            max_harvesters: 64,
            fingerprint_size: 1024,
            start_at: StartAt::Beginning,
        }
    }
}

struct Active {
    path: PathBuf,
    placement: watch::Sender<Placement>,
}

pub struct Prospector {
    config: ProspectorConfig,
    harvester_config: Arc<HarvesterConfig>,
    format: RecordFormat,
    finder: FileFinder,
    /// Registry state from startup, consumed as files are first seen
    known: HashMap<FileId, FileState>,
    /// Positions of harvesters that retired during this run
    resume: HashMap<FileId, Seed>,
    active: HashMap<FileId, Active>,
    failed: HashSet<FileId>,
    /// Consecutive scans that did not find a retired or failed identity
    unseen: HashMap<FileId, u32>,
    harvesters: JoinSet<HarvesterExit>,
    task_ids: HashMap<task::Id, FileId>,
    spool: BoundedSender<Spool>,
    first_scan_done: bool,
}

impl Prospector {
    pub fn new(
        config: ProspectorConfig,
        harvester_config: Arc<HarvesterConfig>,
        format: RecordFormat,
        finder: FileFinder,
        known: HashMap<FileId, FileState>,
        spool: BoundedSender<Spool>,
    ) -> Self {
        Self {
            config,
            harvester_config,
            format,
            finder,
            known,
            resume: HashMap::new(),
            active: HashMap::new(),
            failed: HashSet::new(),
            unseen: HashMap::new(),
            harvesters: JoinSet::new(),
            task_ids: HashMap::new(),
            spool,
            first_scan_done: false,
        }
    }

    /// Scan until cancelled, then stop every harvester and wait for them.
    ///
    /// `ready` receives the number of harvesters running after the first scan.
    /// Dropping the prospector's channel sender on return lets the spooler
    /// drain and exit.
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        ready: oneshot::Sender<usize>,
    ) -> Result<(), BoxError> {
        let harvester_cancel = cancel.child_token();
        let mut ready = Some(ready);
        let mut ticker = interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(res) = self.harvesters.join_next_with_id(), if !self.harvesters.is_empty() => {
                    self.on_harvester_exit(res, &cancel).await;
                }
                _ = ticker.tick() => {
                    self.scan(&harvester_cancel);
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(self.active.len());
                    }
                }
            }
        }

        debug!(harvesters = self.active.len(), "Stopping harvesters");
        harvester_cancel.cancel();
        while let Some(res) = self.harvesters.join_next_with_id().await {
            match res {
                Ok((_, exit)) => {
                    debug!(file_id = %exit.id, reason = ?exit.reason, offset = exit.offset, "Harvester stopped")
                }
                Err(e) => error!(error = %e, "Harvester task failed during shutdown"),
            }
        }
        Ok(())
    }

    fn scan(&mut self, harvester_cancel: &CancellationToken) {
        let paths = match self.finder.find_files() {
            Ok(paths) => paths,
            Err(e) => {
                warn!(error = %e, "File scan failed");
                return;
            }
        };

        // First name found wins when several paths lead to the same file
        let mut found: BTreeMap<FileId, PathBuf> = BTreeMap::new();
        for path in paths {
            match FileId::from_path(&path) {
                Ok(id) => {
                    found.entry(id).or_insert(path);
                }
                Err(e) => debug!(path = ?path, error = %e, "Skipping file that could not be inspected"),
            }
        }

        for (id, active) in self.active.iter_mut() {
            let placement = match found.get(id) {
                Some(path) => {
                    active.path = path.clone();
                    Placement {
                        path: path.clone(),
                        matched: true,
                    }
                }
                None => Placement {
                    path: active.path.clone(),
                    matched: false,
                },
            };
            active.placement.send_if_modified(|current| {
                if *current == placement {
                    return false;
                }
                *current = placement;
                true
            });
        }

        self.forget_unseen(&found);

        let mut deferred = 0;
        for (id, path) in found {
            if self.active.contains_key(&id) || self.failed.contains(&id) {
                continue;
            }
            if self.active.len() >= self.config.max_harvesters {
                deferred += 1;
                continue;
            }
            let seed = self.seed_for(id, &path);
            self.spawn(id, path, seed, harvester_cancel);
        }
        if deferred > 0 {
            warn!(
                deferred,
                limit = self.config.max_harvesters,
                "Harvester limit reached, remaining files wait for a later scan"
            );
        }
        self.first_scan_done = true;
    }

    fn forget_unseen(&mut self, found: &BTreeMap<FileId, PathBuf>) {
        let retired: Vec<FileId> = self.resume.keys().chain(&self.failed).copied().collect();
        for id in retired {
            if found.contains_key(&id) {
                self.unseen.remove(&id);
                continue;
            }
            let scans = self.unseen.entry(id).or_insert(0);
            *scans += 1;
            if *scans > FORGET_AFTER_SCANS {
                debug!(file_id = %id, "Forgetting file that is no longer found");
                self.unseen.remove(&id);
                self.resume.remove(&id);
                self.failed.remove(&id);
            }
        }
    }

    fn seed_for(&mut self, id: FileId, path: &Path) -> Seed {
        if let Some(seed) = self.resume.remove(&id) {
            self.unseen.remove(&id);
            return seed;
        }

        if let Some(state) = self.known.remove(&id) {
            let Some(fingerprint) = &state.fingerprint else {
                return Seed {
                    offset: state.offset,
                    generation: state.generation,
                    announce: false,
                };
            };
            let prefix =
                File::open(path).and_then(|mut f| read_prefix(&mut f, self.config.fingerprint_size));
            return match prefix {
                Ok(prefix) if !fingerprint.matches(&prefix) => {
                    info!(
                        file_id = %id,
                        path = ?path,
                        "Stored state belongs to an earlier file with the same inode, reading from the start"
                    );
                    Seed {
                        offset: 0,
                        generation: state.generation + 1,
                        announce: true,
                    }
                }
                // unreadable files are left for the harvester to report
                _ => Seed {
                    offset: state.offset,
                    generation: state.generation,
                    announce: false,
                },
            };
        }

        if !self.first_scan_done && self.config.start_at == StartAt::End {
            let len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            return Seed {
                offset: len,
                generation: 0,
                announce: true,
            };
        }

        Seed {
            offset: 0,
            generation: 0,
            announce: false,
        }
    }

    fn spawn(&mut self, id: FileId, path: PathBuf, seed: Seed, cancel: &CancellationToken) {
        debug!(file_id = %id, path = ?path, offset = seed.offset, "Starting harvester");
        let (placement, placement_rx) = watch::channel(Placement {
            path: path.clone(),
            matched: true,
        });
        let harvester = Harvester::new(
            id,
            path.clone(),
            seed,
            self.harvester_config.clone(),
            self.format.clone(),
            placement_rx,
            self.spool.clone(),
            cancel.clone(),
        );
        let handle = self.harvesters.spawn(harvester.run());
        self.task_ids.insert(handle.id(), id);
        self.active.insert(id, Active { path, placement });
    }

    async fn on_harvester_exit(
        &mut self,
        res: Result<(task::Id, HarvesterExit), JoinError>,
        cancel: &CancellationToken,
    ) {
        let exit = match res {
            Ok((task_id, exit)) => {
                self.task_ids.remove(&task_id);
                exit
            }
            Err(e) => {
                if let Some(id) = self.task_ids.remove(&e.id()) {
                    error!(file_id = %id, error = %e, "Harvester task failed, excluding file");
                    self.active.remove(&id);
                    self.failed.insert(id);
                }
                return;
            }
        };
        self.retire(exit, cancel).await;
    }

    async fn retire(&mut self, exit: HarvesterExit, cancel: &CancellationToken) {
        self.active.remove(&exit.id);

        let resume_at = Seed {
            offset: exit.offset,
            generation: exit.generation,
            announce: false,
        };
        match exit.reason {
            ExitReason::Finished => {
                self.resume.insert(exit.id, resume_at);
                if self
                    .spool
                    .send_or_cancel(Spool::Finished(exit.id), cancel)
                    .await
                    .is_err()
                {
                    debug!(file_id = %exit.id, "Shutdown before finish could be recorded");
                }
            }
            ExitReason::Replaced => {
                self.resume.insert(exit.id, resume_at);
            }
            ExitReason::Failed(reason) => {
                warn!(file_id = %exit.id, reason, "Harvester failed, file excluded while it stays in place");
                self.failed.insert(exit.id);
            }
            ExitReason::Cancelled => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::{BoundedReceiver, bounded};
    use crate::event::Event;
    use crate::input::Fingerprint;
    use crate::parser::ParserKind;
    use chrono::Utc;
    use std::fs;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    fn prospector(dir: &Path, tx: BoundedSender<Spool>) -> Prospector {
        let finder = FileFinder::new(
            vec![dir.join("*.log").to_string_lossy().into_owned()],
            vec![],
        )
        .unwrap();
        let harvester_config = Arc::new(HarvesterConfig {
            poll_interval: Duration::from_millis(10),
            close_inactive: Duration::from_millis(50),
            fingerprint_size: 8,
            ..Default::default()
        });
        Prospector::new(
            fast(StartAt::Beginning),
            harvester_config,
            RecordFormat::new(ParserKind::None, None).unwrap(),
            finder,
            HashMap::new(),
            tx,
        )
    }

    struct Running {
        rx: BoundedReceiver<Spool>,
        cancel: CancellationToken,
        ready: oneshot::Receiver<usize>,
        handle: JoinHandle<Result<(), BoxError>>,
    }

    fn start(dir: &Path, config: ProspectorConfig, known: HashMap<FileId, FileState>) -> Running {
        let (tx, rx) = bounded(64);
        let prospector = Prospector {
            config,
            known,
            ..prospector(dir, tx)
        };
        let cancel = CancellationToken::new();
        let (ready_tx, ready) = oneshot::channel();
        let handle = tokio::spawn(prospector.run(cancel.clone(), ready_tx));
        Running {
            rx,
            cancel,
            ready,
            handle,
        }
    }

    fn fast(start_at: StartAt) -> ProspectorConfig {
        ProspectorConfig {
            scan_interval: Duration::from_millis(20),
            max_harvesters: 8,
            fingerprint_size: 8,
            start_at,
        }
    }

    async fn next(rx: &mut BoundedReceiver<Spool>) -> Spool {
        timeout(Duration::from_secs(5), rx.next())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    async fn next_event(rx: &mut BoundedReceiver<Spool>) -> Event {
        loop {
            if let Spool::Event(e) = next(rx).await {
                return e;
            }
        }
    }

    async fn stop(r: Running) -> BoundedReceiver<Spool> {
        r.cancel.cancel();
        timeout(Duration::from_secs(5), r.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        r.rx
    }

    #[tokio::test]
    async fn test_discovers_files_and_signals_ready() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.log"), "a1\n").unwrap();
        fs::write(dir.path().join("b.log"), "b1\n").unwrap();
        fs::write(dir.path().join("ignored.txt"), "x\n").unwrap();

        let mut r = start(dir.path(), fast(StartAt::Beginning), HashMap::new());
        let started = timeout(Duration::from_secs(5), &mut r.ready).await.unwrap().unwrap();
        assert_eq!(started, 2);

        let mut messages = vec![
            next_event(&mut r.rx).await.message,
            next_event(&mut r.rx).await.message,
        ];
        messages.sort();
        assert_eq!(messages, vec!["a1", "b1"]);

        let mut rx = stop(r).await;
        // the sender is dropped once the prospector returns
        while rx.next().await.is_some() {}
    }

    #[tokio::test]
    async fn test_empty_directory_is_ready() {
        let dir = TempDir::new().unwrap();
        let mut r = start(dir.path(), fast(StartAt::Beginning), HashMap::new());
        let started = timeout(Duration::from_secs(5), &mut r.ready).await.unwrap().unwrap();
        assert_eq!(started, 0);

        fs::write(dir.path().join("late.log"), "hello\n").unwrap();
        assert_eq!(next_event(&mut r.rx).await.message, "hello");
        stop(r).await;
    }

    #[tokio::test]
    async fn test_start_at_end_only_on_first_scan() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("old.log"), "history\n").unwrap();

        let mut r = start(dir.path(), fast(StartAt::End), HashMap::new());
        timeout(Duration::from_secs(5), &mut r.ready).await.unwrap().unwrap();
        match next(&mut r.rx).await {
            Spool::Checkpoint(_, cp) => assert_eq!(cp.offset, 8),
            other => panic!("expected checkpoint, got {:?}", other),
        }

        fs::write(dir.path().join("new.log"), "fresh\n").unwrap();
        let e = next_event(&mut r.rx).await;
        assert_eq!(e.message, "fresh");
        assert_eq!(e.start, 0);
        stop(r).await;
    }

    fn state_for(path: &Path, offset: u64, fingerprint: Option<Fingerprint>) -> (FileId, FileState) {
        let id = FileId::from_path(path).unwrap();
        (
            id,
            FileState {
                dev: id.dev(),
                ino: id.ino(),
                path: path.to_path_buf(),
                offset,
                generation: 2,
                fingerprint,
                last_seen: Utc::now(),
                finished: false,
            },
        )
    }

    #[tokio::test]
    async fn test_resumes_from_registry_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p4d.log");
        fs::write(&path, "seen\nunseen\n").unwrap();
        let known: HashMap<_, _> = [state_for(
            &path,
            5,
            Some(Fingerprint::from_bytes(b"seen\nuns")),
        )]
        .into_iter()
        .collect();

        let mut r = start(dir.path(), fast(StartAt::Beginning), known);
        let e = next_event(&mut r.rx).await;
        assert_eq!(e.message, "unseen");
        assert_eq!(e.source.generation, 2);
        stop(r).await;
    }

    #[tokio::test]
    async fn test_reused_inode_is_read_from_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p4d.log");
        fs::write(&path, "brand new content\n").unwrap();
        let known: HashMap<_, _> = [state_for(
            &path,
            12,
            Some(Fingerprint::from_bytes(b"previous")),
        )]
        .into_iter()
        .collect();

        let mut r = start(dir.path(), fast(StartAt::Beginning), known);
        match next(&mut r.rx).await {
            Spool::Checkpoint(_, cp) => {
                assert_eq!((cp.generation, cp.offset), (3, 0));
            }
            other => panic!("expected checkpoint, got {:?}", other),
        }
        let e = next_event(&mut r.rx).await;
        assert_eq!(e.message, "brand new content");
        assert_eq!(e.source.generation, 3);
        stop(r).await;
    }

    #[tokio::test]
    async fn test_removed_file_is_finished() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p4d.log");
        fs::write(&path, "last words\n").unwrap();
        let id = FileId::from_path(&path).unwrap();

        let mut r = start(dir.path(), fast(StartAt::Beginning), HashMap::new());
        next_event(&mut r.rx).await;
        fs::rename(&path, dir.path().join("p4d.log.1")).unwrap();

        loop {
            if let Spool::Finished(finished) = next(&mut r.rx).await {
                assert_eq!(finished, id);
                break;
            }
        }
        stop(r).await;
    }

    #[tokio::test]
    async fn test_hardlinks_share_one_harvester() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("a.log");
        fs::write(&first, "once\n").unwrap();
        fs::hard_link(&first, dir.path().join("b.log")).unwrap();

        let mut r = start(dir.path(), fast(StartAt::Beginning), HashMap::new());
        let started = timeout(Duration::from_secs(5), &mut r.ready).await.unwrap().unwrap();
        assert_eq!(started, 1);

        let e = next_event(&mut r.rx).await;
        assert_eq!(e.message, "once");
        // the lexically first name wins
        assert_eq!(e.source.path, first);

        // a few more scans go by without a second copy
        tokio::time::sleep(Duration::from_millis(150)).await;
        let mut rx = stop(r).await;
        while let Some(item) = rx.next().await {
            assert!(!matches!(item, Spool::Event(_)), "duplicate event {:?}", item);
        }
    }

    #[tokio::test]
    async fn test_failed_file_is_not_restarted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p4d.log");
        fs::write(&path, "unreadable\n").unwrap();
        let id = FileId::from_path(&path).unwrap();
        let (tx, _rx) = bounded(8);
        let cancel = CancellationToken::new();
        let mut p = prospector(dir.path(), tx);

        p.retire(
            HarvesterExit {
                id,
                reason: ExitReason::Failed("Permission denied".into()),
                offset: 0,
                generation: 0,
            },
            &cancel,
        )
        .await;

        for _ in 0..FORGET_AFTER_SCANS + 2 {
            p.scan(&cancel);
        }
        assert!(p.active.is_empty());
        assert!(p.harvesters.is_empty());
        assert!(p.failed.contains(&id));

        // once it is gone for long enough it is forgotten
        fs::remove_file(&path).unwrap();
        for _ in 0..=FORGET_AFTER_SCANS {
            p.scan(&cancel);
        }
        assert!(p.failed.is_empty());
        assert!(p.unseen.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_resume_positions_forgotten_when_file_is_gone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rotated.log.1");
        fs::write(&path, "old\n").unwrap();
        let id = FileId::from_path(&path).unwrap();
        let (tx, _rx) = bounded(8);
        let cancel = CancellationToken::new();
        let mut p = prospector(dir.path(), tx);

        p.retire(
            HarvesterExit {
                id,
                reason: ExitReason::Replaced,
                offset: 4,
                generation: 1,
            },
            &cancel,
        )
        .await;
        assert_eq!(p.resume.len(), 1);

        for _ in 0..FORGET_AFTER_SCANS {
            p.scan(&cancel);
        }
        assert_eq!(p.resume.len(), 1);
        p.scan(&cancel);
        assert!(p.resume.is_empty());
        assert!(p.unseen.is_empty());
    }

    #[tokio::test]
    async fn test_harvester_limit_defers_files() {
        let dir = TempDir::new().unwrap();
        for name in ["a.log", "b.log", "c.log"] {
            fs::write(dir.path().join(name), "x\n").unwrap();
        }
        let config = ProspectorConfig {
            max_harvesters: 2,
            ..fast(StartAt::Beginning)
        };
        let mut r = start(dir.path(), config, HashMap::new());
        let started = timeout(Duration::from_secs(5), &mut r.ready).await.unwrap().unwrap();
        assert_eq!(started, 2);
        stop(r).await;
    }
}
