// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests of the in-process pipeline against a memory sink.

use p4dbeat::beater::{BeatConfig, BeatReport, Beater};
use p4dbeat::error::BoxError;
use p4dbeat::init::args::BeatArgs;
use p4dbeat::parser::ParserKind;
use p4dbeat::sink::MemorySink;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct RunningBeat {
    shutdown: CancellationToken,
    handle: JoinHandle<Result<BeatReport, BoxError>>,
    harvesters: usize,
}

impl RunningBeat {
    async fn start(config: BeatConfig, sink: &MemorySink) -> Self {
        let shutdown = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(
            Beater::new(config)
                .on_ready(ready_tx)
                .run_with_sink(sink.clone(), shutdown.clone()),
        );
        let harvesters = timeout(TEST_TIMEOUT, ready_rx)
            .await
            .expect("beat did not become ready")
            .expect("beat exited before ready");
        Self {
            shutdown,
            handle,
            harvesters,
        }
    }

    async fn stop(self) -> BeatReport {
        self.shutdown.cancel();
        timeout(TEST_TIMEOUT, self.handle)
            .await
            .expect("beat did not stop")
            .expect("beat task panicked")
            .expect("beat failed")
    }
}

fn config(dir: &Path, pattern: &str, parser: ParserKind) -> BeatConfig {
    BeatArgs {
        paths: vec![dir.join(pattern).to_string_lossy().into_owned()],
        parser,
        registry_path: dir.join("state").join("registry.json"),
        scan_interval_ms: 20,
        poll_interval_ms: 10,
        close_inactive_ms: 200,
        multiline_timeout_ms: 50,
        batch_timeout_ms: 10,
        batch_max_events: 64,
        retry_initial_backoff_ms: 5,
        retry_max_backoff_ms: 50,
        shutdown_timeout_ms: 5000,
        ..Default::default()
    }
    .build_config()
    .unwrap()
}

fn append(path: &Path, text: &str) {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    f.write_all(text.as_bytes()).unwrap();
}

fn lines(prefix: &str, range: std::ops::Range<usize>) -> String {
    range.map(|i| format!("{} {:04}\n", prefix, i)).collect()
}

async fn wait_for_events(sink: &MemorySink, n: usize) {
    timeout(TEST_TIMEOUT, async {
        while sink.events().len() < n {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {} events, got {}", n, sink.events().len()));
}

#[tokio::test]
async fn test_lines_delivered_in_order_and_committed() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("app.log");
    let text = lines("line", 0..500);
    fs::write(&log, &text).unwrap();

    let sink = MemorySink::new();
    let beat = RunningBeat::start(config(dir.path(), "*.log", ParserKind::None), &sink).await;
    assert_eq!(beat.harvesters, 1);
    wait_for_events(&sink, 500).await;

    let report = beat.stop().await;
    let expected: Vec<String> = (0..500).map(|i| format!("line {:04}", i)).collect();
    assert_eq!(sink.messages(), expected);
    assert_eq!(report.stats.events, 500);

    let registry = report.registry.snapshot();
    let state = registry.values().next().unwrap();
    assert_eq!(state.offset, text.len() as u64);
    assert_eq!(state.path, log);
}

#[tokio::test]
async fn test_empty_directory_still_ready() {
    let dir = TempDir::new().unwrap();
    let sink = MemorySink::new();
    let beat = RunningBeat::start(config(dir.path(), "*.log", ParserKind::None), &sink).await;
    assert_eq!(beat.harvesters, 0);

    append(&dir.path().join("late.log"), "arrived later\n");
    wait_for_events(&sink, 1).await;
    beat.stop().await;
    assert_eq!(sink.messages(), vec!["arrived later"]);
}

#[tokio::test]
async fn test_rotation_by_rename_has_no_gap_or_duplicate() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("log");
    fs::write(&log, lines("event", 0..50)).unwrap();

    let sink = MemorySink::new();
    let beat = RunningBeat::start(config(dir.path(), "log*", ParserKind::None), &sink).await;
    wait_for_events(&sink, 20).await;

    // rotate while the writer keeps going
    fs::rename(&log, dir.path().join("log.1")).unwrap();
    append(&dir.path().join("log.1"), &lines("event", 50..60));
    append(&log, &lines("event", 60..100));

    wait_for_events(&sink, 100).await;
    sleep(Duration::from_millis(100)).await;
    beat.stop().await;

    let messages = sink.messages();
    assert_eq!(messages.len(), 100, "duplicates delivered");
    let unique: HashSet<_> = messages.iter().collect();
    assert_eq!(unique.len(), 100);
    for i in 0..100 {
        assert!(unique.contains(&format!("event {:04}", i)), "missing event {}", i);
    }
}

#[tokio::test]
async fn test_truncation_restarts_file() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("app.log");
    fs::write(&log, lines("before", 0..10)).unwrap();

    let sink = MemorySink::new();
    let beat = RunningBeat::start(config(dir.path(), "*.log", ParserKind::None), &sink).await;
    wait_for_events(&sink, 10).await;

    fs::write(&log, "").unwrap();
    sleep(Duration::from_millis(50)).await;
    append(&log, &lines("after", 0..3));
    wait_for_events(&sink, 13).await;

    let report = beat.stop().await;
    let messages = sink.messages();
    assert_eq!(&messages[10..], &["after 0000", "after 0001", "after 0002"]);

    let events = sink.events();
    assert_eq!(events[10]["log"]["offset"], 0);
    assert_eq!(events[10]["log"]["generation"], 1);

    let state = report.registry.snapshot().into_values().next().unwrap();
    assert_eq!(state.generation, 1);
    assert_eq!(state.offset, lines("after", 0..3).len() as u64);
}

#[tokio::test]
async fn test_restart_resumes_without_reemitting() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("app.log");
    fs::write(&log, lines("first", 0..20)).unwrap();

    let sink = MemorySink::new();
    let beat = RunningBeat::start(config(dir.path(), "*.log", ParserKind::None), &sink).await;
    wait_for_events(&sink, 20).await;
    beat.stop().await;

    append(&log, &lines("second", 0..5));

    let sink2 = MemorySink::new();
    let beat = RunningBeat::start(config(dir.path(), "*.log", ParserKind::None), &sink2).await;
    wait_for_events(&sink2, 5).await;
    sleep(Duration::from_millis(100)).await;
    beat.stop().await;

    let expected: Vec<String> = (0..5).map(|i| format!("second {:04}", i)).collect();
    assert_eq!(sink2.messages(), expected);
}

#[tokio::test]
async fn test_undelivered_events_are_redelivered_after_restart() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("app.log");
    fs::write(&log, lines("held", 0..3)).unwrap();

    let mut cfg = config(dir.path(), "*.log", ParserKind::None);
    cfg.shutdown_timeout = Duration::from_millis(100);

    let sink = MemorySink::new();
    sink.fail_next(u32::MAX);
    let shutdown = CancellationToken::new();
    let (ready_tx, ready_rx) = oneshot::channel();
    let handle = tokio::spawn(
        Beater::new(cfg)
            .on_ready(ready_tx)
            .run_with_sink(sink.clone(), shutdown.clone()),
    );
    ready_rx.await.unwrap();
    timeout(TEST_TIMEOUT, async {
        while sink.attempts() == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    shutdown.cancel();
    assert!(handle.await.unwrap().is_err());

    let sink2 = MemorySink::new();
    let beat = RunningBeat::start(config(dir.path(), "*.log", ParserKind::None), &sink2).await;
    wait_for_events(&sink2, 3).await;
    beat.stop().await;
    assert_eq!(sink2.messages(), vec!["held 0000", "held 0001", "held 0002"]);
}

#[tokio::test]
async fn test_p4d_command_records_joined() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("log");
    fs::write(
        &log,
        concat!(
            "Perforce server info:\n",
            "\t2024/03/01 14:05:10 pid 2211 fred@fred_ws 10.1.2.3 [p4v/2023.4] 'user-sync //depot/...'\n",
            "\n",
            "Perforce server info:\n",
            "\t2024/03/01 14:05:12 pid 2211 completed 1.25s\n",
        ),
    )
    .unwrap();

    let sink = MemorySink::new();
    let beat = RunningBeat::start(config(dir.path(), "log", ParserKind::P4d), &sink).await;
    wait_for_events(&sink, 1).await;
    // nothing else trails the command
    sleep(Duration::from_millis(200)).await;
    let report = beat.stop().await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    let e = &events[0];
    assert_eq!(e["p4.record_type"], "command");
    assert_eq!(e["p4.cmd"], "user-sync");
    assert_eq!(e["p4.user"], "fred");
    assert_eq!(e["@timestamp"], "2024-03-01T14:05:10.000Z");
    assert_eq!(e["p4.completed_sec"], 1.25);
    assert_eq!(e["p4.end_time"], "2024/03/01 14:05:12");
    assert_eq!(e["p4.running"], 1);
    assert_eq!(e["p4.line_no"], 1);
    assert_eq!(e["p4.cmd_error"], false);
    assert!(e.get("degraded").is_none());

    let len = fs::metadata(&log).unwrap().len();
    let state = report.registry.snapshot().into_values().next().unwrap();
    assert_eq!(state.offset, len);
}

#[tokio::test]
async fn test_open_command_is_read_again_after_restart() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("log");
    fs::write(
        &log,
        concat!(
            "Perforce server info:\n",
            "\t2024/03/01 14:05:10 pid 10 fred@ws 10.1.2.3 [p4v] 'user-sync //...'\n",
            "Perforce server info:\n",
            "\t2024/03/01 14:05:11 pid 20 server notice\n",
        ),
    )
    .unwrap();

    let sink = MemorySink::new();
    let beat = RunningBeat::start(config(dir.path(), "log", ParserKind::P4d), &sink).await;
    wait_for_events(&sink, 1).await;
    let report = beat.stop().await;
    assert_eq!(sink.events()[0]["p4.record_type"], "info");
    // the unfinished command keeps the registry at its start
    let state = report.registry.snapshot().into_values().next().unwrap();
    assert_eq!(state.offset, 0);
    drop(report);

    append(
        &log,
        "Perforce server info:\n\t2024/03/01 14:05:15 pid 10 completed 5s\n",
    );
    let sink2 = MemorySink::new();
    let beat = RunningBeat::start(config(dir.path(), "log", ParserKind::P4d), &sink2).await;
    wait_for_events(&sink2, 2).await;
    beat.stop().await;

    let events = sink2.events();
    let command = events
        .iter()
        .find(|e| e["p4.record_type"] == "command")
        .expect("command event");
    assert_eq!(command["p4.cmd"], "user-sync");
    assert_eq!(command["p4.completed_sec"], 5.0);
    assert_eq!(command["p4.line_no"], 1);
}
