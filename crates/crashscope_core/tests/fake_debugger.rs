//! End-to-end sessions against the scripted debugger in `fixtures/fake_gdb.sh`.
#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crashscope_core::controller::Controller;
use crashscope_core::events::EventKind;
use crashscope_core::observation::BacktraceView;
use crashscope_core::policy::{parse_action, Allowlist, ScriptedPolicy};
use crashscope_core::state::Lifecycle;
use crashscope_core::{Outcome, ScopeError, SessionConfig, SessionDriver, Transport};
use futures_util::StreamExt;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures")
}

fn fake_gdb() -> String {
    fixtures().join("fake_gdb.sh").display().to_string()
}

fn config(mode: &str, dir: &TempDir) -> SessionConfig {
    let target = dir.path().join("overflow");
    std::fs::write(&target, b"\x7fELF").expect("write fake target");

    let mut config = SessionConfig::new(target);
    config.debugger = Some(PathBuf::from("sh"));
    config.debugger_args = vec![fake_gdb(), mode.to_string()];
    config.source_root = Some(fixtures());
    config.command_timeout = Duration::from_millis(500);
    config.run_timeout = Duration::from_secs(2);
    config.retry.backoff = Duration::from_millis(20);
    config
}

fn controller(mode: &str) -> Controller {
    let transport = Transport::start("sh", &[fake_gdb(), mode.to_string()])
        .expect("sh should spawn")
        .with_grace(Duration::from_millis(500), Duration::from_millis(200));
    Controller::new(transport, &SessionConfig::default(), CancellationToken::new())
}

#[tokio::test]
async fn crash_session_observes_segfault_and_concludes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let policy = ScriptedPolicy::new([
        "-exec-run",
        "```\n-data-evaluate-expression local.buffer\n```",
        "DONE: strcpy overflows local.buffer in cause_crash (overflow.c:11)",
    ]);
    let seen = policy.observations();
    let (driver, events) = SessionDriver::new(config("crash", &dir), policy);

    let report = driver.run().await;
    assert_eq!(
        report.outcome,
        Outcome::Concluded {
            summary: "strcpy overflows local.buffer in cause_crash (overflow.c:11)".into()
        }
    );
    assert_eq!(report.steps, 3);
    assert_eq!(report.lifecycle, Lifecycle::Stopped);
    assert!(report
        .last_stop
        .as_deref()
        .is_some_and(|stop| stop.contains("SIGSEGV")));
    assert_eq!(report.history.len(), 2);
    assert_eq!(report.history[0].command, "-exec-run");
    assert!(report.history[0].ok);

    let seen = seen.lock().expect("observations lock");
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0].lifecycle(), Lifecycle::NotStarted);

    let crash = &seen[1];
    assert_eq!(
        crash.stop(),
        Some("signal SIGSEGV (Segmentation fault) in cause_crash at overflow.c:12")
    );
    match crash.backtrace() {
        BacktraceView::Frames { frames } => {
            assert_eq!(frames[0], "0: cause_crash (overflow.c:12)");
            assert_eq!(frames[1], "1: main (overflow.c:18)");
        }
        other => panic!("expected frames, got {other:?}"),
    }
    assert_eq!(crash.output(), Some("Starting program...\n"));
    let source = crash.source().expect("source excerpt from the source root");
    assert_eq!(source.line, 12);
    assert!(source.text.contains("*local.tail = '\\0';"));

    let inspected = &seen[2];
    assert!(inspected
        .variables()
        .iter()
        .any(|(name, value)| name == "local.buffer" && value.contains("ABCDEFGHIJKLMNOPQR")));

    let events: Vec<_> = events.collect().await;
    let last = events.last().expect("at least one event");
    assert_eq!(last.kind, EventKind::Answer);
    assert_eq!(
        events.iter().filter(|e| e.kind == EventKind::Answer).count(),
        1
    );
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::Cot && e.content == "-exec-run"));
}

#[tokio::test]
async fn step_limit_is_reported_distinctly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = config("crash", &dir);
    config.max_steps = 4;
    let policy = ScriptedPolicy::new(Vec::<String>::new()).repeating("-stack-list-frames");
    let (driver, events) = SessionDriver::new(config, policy);

    let report = driver.run().await;
    assert_eq!(report.outcome, Outcome::MaxStepsReached { steps: 4 });
    assert_eq!(report.history.len(), 4);

    let events: Vec<_> = events.collect().await;
    let answer = events.last().expect("answer event");
    assert_eq!(answer.kind, EventKind::Answer);
    assert!(answer.content.starts_with("Reached the step limit (4)"));
    assert!(answer.content.contains("Last steps:"));
}

#[tokio::test]
async fn disallowed_actions_never_reach_the_debugger() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transcripts = tempfile::tempdir().expect("tempdir");
    let mut config = config("crash", &dir);
    config.transcript_dir = Some(transcripts.path().to_path_buf());
    let policy = ScriptedPolicy::new(Vec::<String>::new()).repeating("rm -rf /");
    let seen = policy.observations();
    let (driver, _events) = SessionDriver::new(config, policy);

    let report = driver.run().await;
    match &report.outcome {
        Outcome::Failed { reason } => assert!(reason.contains("3 invalid actions"), "{reason}"),
        other => panic!("unexpected outcome: {other}"),
    }
    assert!(report.history.iter().all(|entry| !entry.ok));

    // Rejections are fed back to the policy.
    let seen = seen.lock().expect("observations lock");
    assert!(seen[1]
        .notes()
        .iter()
        .any(|note| note.contains("'rm' is not an allowed command")));

    let transcript = report.transcript.expect("transcript written");
    let content = std::fs::read_to_string(transcript).expect("read transcript");
    let outbound: Vec<String> = content
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).expect("json line"))
        .filter(|line| line["direction"] == "outbound")
        .map(|line| line["line"].as_str().unwrap_or_default().to_string())
        .collect();
    assert!(outbound.iter().all(|line| !line.contains("rm -rf")), "{outbound:?}");
    assert!(outbound[0].contains("-file-exec-and-symbols"));
}

#[tokio::test]
async fn disallowed_command_writes_nothing_to_stdin() {
    let mut controller = controller("crash");
    let err = parse_action("rm -rf /")
        .and_then(|action| Allowlist::default().validate(&action))
        .expect_err("shell commands are not MI commands");
    let err: ScopeError = err.into();
    assert!(matches!(err, ScopeError::Disallowed(_)));
    assert_eq!(controller.transport().lines_written(), 0);

    controller
        .send("stack-list-frames", "", Duration::from_secs(2))
        .await
        .expect("debugger still usable");
    assert_eq!(controller.transport().lines_written(), 1);
    controller.close().await.expect("close");
}

#[tokio::test]
async fn stalled_command_times_out_and_late_reply_is_discarded() {
    let mut controller = controller("crash");

    let started = Instant::now();
    let err = controller
        .send("data-evaluate-expression", "slow", Duration::from_secs(1))
        .await
        .expect_err("stalled command must time out");
    let elapsed = started.elapsed();
    assert!(matches!(err, ScopeError::Timeout { token: 1, .. }), "{err}");
    assert!(
        elapsed >= Duration::from_secs(1) && elapsed <= Duration::from_millis(1200),
        "timeout took {elapsed:?}"
    );

    // The late reply lands at ~2s; the next command must get its own result.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let result = controller
        .send("data-evaluate-expression", "local.buffer", Duration::from_secs(2))
        .await
        .expect("fresh command resolves");
    assert_eq!(result.token, Some(2));
    assert_eq!(result.payload.get_str("value"), Some("\"ABCDEFGHIJKLMNOPQR\""));
    assert_eq!(controller.discarded_results(), 1);
    controller.close().await.expect("close");
}

#[tokio::test]
async fn repeated_timeouts_fail_the_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let policy = ScriptedPolicy::new(["-exec-run"]).repeating("-data-evaluate-expression local.buffer");
    let (driver, _events) = SessionDriver::new(config("hang", &dir), policy);

    let report = driver.run().await;
    match &report.outcome {
        Outcome::Failed { reason } => {
            assert!(reason.contains("timed out"), "{reason}");
            assert!(reason.contains("2 consecutive timeouts"), "{reason}");
        }
        other => panic!("unexpected outcome: {other}"),
    }
    assert_eq!(report.steps, 2);
    assert_eq!(report.lifecycle, Lifecycle::Errored);
}

#[tokio::test]
async fn debugger_death_is_a_broken_pipe_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (driver, events) = SessionDriver::new(config("die", &dir), ScriptedPolicy::new(["-exec-run"]));

    let report = driver.run().await;
    match &report.outcome {
        Outcome::Failed { reason } => assert!(reason.contains("Debugger pipe closed"), "{reason}"),
        other => panic!("unexpected outcome: {other}"),
    }
    let events: Vec<_> = events.collect().await;
    let answer = events.last().expect("answer event");
    assert!(answer.content.starts_with("Session failed: Debugger pipe closed"));
    assert!(answer.content.contains("-exec-run"));
}

#[tokio::test]
async fn cancellation_stops_a_waiting_session_promptly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = config("hang", &dir);
    config.command_timeout = Duration::from_secs(30);
    let policy = ScriptedPolicy::new(["-data-evaluate-expression local.buffer"]);
    let (driver, _events) = SessionDriver::new(config, policy);

    let cancel = driver.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let report = driver.run().await;
    assert_eq!(
        report.outcome,
        Outcome::Failed {
            reason: "cancelled".into()
        }
    );
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn command_errors_are_recoverable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let allowlist = Allowlist::default().allow("gdb-show");
    let policy = ScriptedPolicy::new(["-gdb-show version", "DONE: nothing to see"]);
    let seen = policy.observations();
    let (driver, _events) = SessionDriver::new(config("crash", &dir), policy);
    let report = driver.with_allowlist(allowlist).run().await;

    assert!(report.is_success());
    assert!(!report.history[0].ok);
    let seen = seen.lock().expect("observations lock");
    assert!(seen[1]
        .notes()
        .iter()
        .any(|note| note.contains("Undefined MI command: gdb-show")));
}
