//! Single consumer of the debugger's stdout.
//!
//! Every command gets a fresh token, and the caller waits until the result
//! carrying that token arrives or the deadline passes. Everything else read
//! while waiting (stream text, exec/status/notify records) goes to the async
//! side channel in arrival order. The wait loop polls at a fixed interval so
//! cancellation is noticed promptly even when the debugger is silent.

use std::process::ExitStatus;
use std::time::Duration;

use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::correlator::{Correlator, Disposition, PendingCommand};
use crate::mi::{parse_line, quote_arg, MiCommand, MiResult, MiValue, Record, ResultClass};
use crate::transcript::{Direction, Transcript};
use crate::transport::Transport;
use crate::{Result, ScopeError};

enum Pulled {
    Line(String),
    Idle,
    Closed,
}

pub struct Controller {
    transport: Transport,
    correlator: Correlator,
    next_token: u64,
    poll_interval: Duration,
    cancel: CancellationToken,
    transcript: Option<Transcript>,
    stop_seq: u64,
    last_stop: Option<MiValue>,
    parse_errors: u64,
}

impl Controller {
    pub fn new(transport: Transport, config: &SessionConfig, cancel: CancellationToken) -> Self {
        Self {
            transport,
            correlator: Correlator::new(config.backlog_capacity),
            next_token: 1,
            poll_interval: config.poll_interval,
            cancel,
            transcript: None,
            stop_seq: 0,
            last_stop: None,
            parse_errors: 0,
        }
    }

    /// Checks the target, spawns the configured debugger and wraps it.
    pub fn launch(config: &SessionConfig, cancel: CancellationToken) -> Result<Self> {
        config.check_target()?;
        let debugger = config.resolve_debugger()?;
        let mut transport = Transport::start(&debugger, config.debugger_args.as_slice())?;
        transport.probe_startup()?;
        Ok(Self::new(transport, config, cancel))
    }

    /// Loads the target's symbols, its arguments and the source directory.
    pub async fn load_target(&mut self, config: &SessionConfig) -> Result<()> {
        let timeout = config.command_timeout;
        let target = config.target.display().to_string();

        self.send("file-exec-and-symbols", &quote_arg(&target), timeout)
            .await
            .map_err(|e| match e {
                ScopeError::Command { message, .. } => {
                    ScopeError::spawn(&target, format!("debugger could not load target: {message}"))
                }
                other => other,
            })?;

        if !config.target_args.is_empty() {
            let args = config
                .target_args
                .iter()
                .map(|arg| quote_arg(arg))
                .collect::<Vec<_>>()
                .join(" ");
            self.send("exec-arguments", &args, timeout).await?;
        }
        if let Some(root) = &config.source_root {
            self.send("environment-directory", &quote_arg(&root.display().to_string()), timeout)
                .await?;
        }
        Ok(())
    }

    pub fn with_transcript(mut self, transcript: Transcript) -> Self {
        self.transcript = Some(transcript);
        self
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    pub fn transcript_path(&self) -> Option<&std::path::Path> {
        self.transcript.as_ref().map(Transcript::path)
    }

    /// Results that matched no pending command (late, unknown or untagged).
    pub fn discarded_results(&self) -> u64 {
        self.correlator.discarded()
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors
    }

    /// Number of `*stopped` records seen so far.
    pub fn stop_seq(&self) -> u64 {
        self.stop_seq
    }

    pub fn last_stop(&self) -> Option<&MiValue> {
        self.last_stop.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn send(&mut self, verb: &str, args: &str, timeout: Duration) -> Result<MiResult> {
        self.send_command(&MiCommand::new(verb, args), timeout).await
    }

    /// Writes `command` and waits for its result record.
    ///
    /// `^error` becomes [`ScopeError::Command`]. On timeout the token is
    /// evicted, so a reply arriving later is discarded instead of being
    /// mistaken for the answer to a newer command.
    pub async fn send_command(&mut self, command: &MiCommand, timeout: Duration) -> Result<MiResult> {
        if self.cancel.is_cancelled() {
            return Err(ScopeError::Cancelled);
        }

        let token = self.next_token;
        self.next_token += 1;
        let issued_at = Instant::now();
        let deadline = issued_at + timeout;
        self.correlator.register(PendingCommand {
            token,
            command: command.clone(),
            issued_at,
            deadline,
        });

        let line = command.encode(token);
        if let Err(e) = self.transport.write_line(&line).await {
            self.correlator.cancel(token);
            return Err(e);
        }
        self.log_transcript(Direction::Outbound, line.trim_end()).await;
        debug!(token, command = %command, "command sent");

        loop {
            if self.cancel.is_cancelled() {
                self.correlator.evict(token);
                return Err(ScopeError::Cancelled);
            }
            if Instant::now() >= deadline {
                self.correlator.evict(token);
                warn!(token, command = %command, after = ?timeout, "command timed out");
                return Err(ScopeError::Timeout {
                    verb: command.verb.clone(),
                    token,
                    after: timeout,
                });
            }

            match self.pull(deadline).await {
                Pulled::Line(line) => {
                    if let Some((pending, result)) = self.ingest(&line).await {
                        debug!(
                            token = pending.token,
                            class = result.class.as_str(),
                            elapsed_ms = pending.issued_at.elapsed().as_millis() as u64,
                            "command resolved"
                        );
                        if result.class == ResultClass::Error {
                            let message = result.error_message().unwrap_or("unknown error");
                            return Err(ScopeError::command(&pending.command.verb, message));
                        }
                        return Ok(result);
                    }
                }
                Pulled::Idle => {}
                Pulled::Closed => {
                    self.correlator.evict(token);
                    return Err(self.closed_error(&format!("waiting for '{command}'")));
                }
            }
        }
    }

    /// Waits for the next `*stopped` record.
    pub async fn wait_for_stop(&mut self, wait: Duration) -> Result<Option<MiValue>> {
        self.wait_for_stop_after(self.stop_seq, wait).await
    }

    /// Waits until a `*stopped` record newer than `after_seq` has been seen.
    ///
    /// Returns `Ok(None)` when the target is still running at the deadline.
    pub async fn wait_for_stop_after(
        &mut self,
        after_seq: u64,
        wait: Duration,
    ) -> Result<Option<MiValue>> {
        let deadline = Instant::now() + wait;
        loop {
            if self.stop_seq > after_seq {
                return Ok(self.last_stop.clone());
            }
            if self.cancel.is_cancelled() {
                return Err(ScopeError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            match self.pull(deadline).await {
                Pulled::Line(line) => {
                    self.ingest(&line).await;
                }
                Pulled::Idle => {}
                Pulled::Closed => {
                    // A stop may have been queued right before EOF.
                    if self.stop_seq > after_seq {
                        return Ok(self.last_stop.clone());
                    }
                    return Err(self.closed_error("waiting for the target to stop"));
                }
            }
        }
    }

    /// Reads whatever the debugger emits during `wait` into the side channel.
    ///
    /// Returns the number of lines consumed.
    pub async fn pump(&mut self, wait: Duration) -> Result<usize> {
        let mut consumed = 0;
        while let Some(line) = self.transport.try_read_line() {
            self.ingest(&line).await;
            consumed += 1;
        }

        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            if self.cancel.is_cancelled() {
                return Err(ScopeError::Cancelled);
            }
            match self.pull(deadline).await {
                Pulled::Line(line) => {
                    self.ingest(&line).await;
                    consumed += 1;
                }
                Pulled::Idle => {}
                Pulled::Closed => break,
            }
        }
        Ok(consumed)
    }

    /// Async records accumulated since the previous drain, oldest first.
    pub fn drain_async(&mut self) -> Vec<Record> {
        self.correlator.drain_async()
    }

    pub fn drain_stderr(&mut self) -> Vec<String> {
        self.transport.drain_stderr()
    }

    pub async fn close(mut self) -> Result<ExitStatus> {
        self.log_transcript(Direction::Internal, "close").await;
        self.transport.close().await
    }

    async fn pull(&mut self, deadline: Instant) -> Pulled {
        let now = Instant::now();
        if now >= deadline {
            return Pulled::Idle;
        }
        let wait = (deadline - now).min(self.poll_interval);
        match timeout(wait, self.transport.read_line()).await {
            Ok(Some(line)) => Pulled::Line(line),
            Ok(None) => Pulled::Closed,
            Err(_) => Pulled::Idle,
        }
    }

    /// Parses one stdout line and routes it through the correlator.
    async fn ingest(&mut self, line: &str) -> Option<(PendingCommand, MiResult)> {
        self.log_transcript(Direction::Inbound, line).await;

        let record = match parse_line(line) {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                self.parse_errors += 1;
                warn!(error = %e, "discarding unparseable debugger output");
                return None;
            }
        };

        if let Some(stop) = record.as_stop() {
            self.stop_seq += 1;
            self.last_stop = Some(stop.clone());
        }

        match self.correlator.accept(record) {
            Disposition::Resolved(pending, result) => Some((pending, result)),
            Disposition::Discarded { .. } | Disposition::Queued => None,
        }
    }

    fn closed_error(&mut self, context: &str) -> ScopeError {
        let stderr = self.transport.drain_stderr();
        let detail = stderr.last().map(|l| format!(": {l}")).unwrap_or_default();
        ScopeError::BrokenPipe(format!("debugger closed stdout while {context}{detail}"))
    }

    async fn log_transcript(&mut self, direction: Direction, line: &str) {
        if let Some(transcript) = self.transcript.as_mut() {
            if let Err(e) = transcript.log(direction, line).await {
                warn!(error = %e, "failed to write transcript line");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn controller(script: &str) -> Controller {
        let transport = Transport::start("sh", &["-c", script])
            .expect("sh should spawn")
            .with_grace(Duration::from_millis(200), Duration::from_millis(200));
        Controller::new(transport, &SessionConfig::default(), CancellationToken::new())
    }

    /// Replies to each command line with the given suffix using its token.
    fn responder(reply: &str) -> String {
        format!(
            r#"while IFS= read -r line; do t=${{line%%-*}}; printf '%s\n' "$t"'{reply}'; done"#
        )
    }

    #[tokio::test]
    async fn send_resolves_the_reply_carrying_its_token() {
        let mut controller = controller(&responder(r#"^done,value="42""#));
        let result = controller
            .send("data-evaluate-expression", "x", Duration::from_secs(2))
            .await
            .expect("command should resolve");
        assert_eq!(result.token, Some(1));
        assert_eq!(result.payload.get_str("value"), Some("42"));

        let second = controller
            .send("data-evaluate-expression", "y", Duration::from_secs(2))
            .await
            .expect("second command should resolve");
        assert_eq!(second.token, Some(2));
        controller.close().await.expect("close");
    }

    #[tokio::test]
    async fn error_result_becomes_command_error() {
        let mut controller = controller(&responder(r#"^error,msg="No symbol \"zz\" in current context.""#));
        let err = controller
            .send("data-evaluate-expression", "zz", Duration::from_secs(2))
            .await
            .expect_err("error result must fail");
        match err {
            ScopeError::Command { verb, message } => {
                assert_eq!(verb, "data-evaluate-expression");
                assert_eq!(message, "No symbol \"zz\" in current context.");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn async_records_before_the_result_land_in_the_side_channel() {
        let script = r#"while IFS= read -r line; do t=${line%%-*}; printf '%s\n' '=thread-group-started,id="i1",pid="42"' '~"Starting program\n"' '*stopped,reason="signal-received",signal-name="SIGSEGV"' "$t^running"; done"#;
        let mut controller = controller(script);
        let before = controller.stop_seq();
        let result = controller
            .send("exec-run", "", Duration::from_secs(2))
            .await
            .expect("exec-run should resolve");
        assert_eq!(result.class, ResultClass::Running);

        let stop = controller
            .wait_for_stop_after(before, Duration::from_millis(500))
            .await
            .expect("wait should succeed")
            .expect("stop already seen");
        assert_eq!(stop.get_str("signal-name"), Some("SIGSEGV"));

        let kinds: Vec<_> = controller.drain_async().iter().map(Record::kind).collect();
        assert_eq!(kinds, vec!["notify", "console", "exec"]);
    }

    #[tokio::test]
    async fn timeout_evicts_token_and_late_reply_is_discarded() {
        // First command is answered two seconds late, the second immediately.
        let script = r#"n=0; while IFS= read -r line; do t=${line%%-*}; n=$((n+1)); if [ $n -eq 1 ]; then (sleep 1; printf '%s\n' "$t^done,value=\"late\"") & else printf '%s\n' "$t^done,value=\"fresh\""; fi; done"#;
        let mut controller = controller(script);

        let err = controller
            .send("data-evaluate-expression", "slow", Duration::from_millis(300))
            .await
            .expect_err("first command must time out");
        assert!(err.is_timeout(), "unexpected error: {err}");

        tokio::time::sleep(Duration::from_millis(1200)).await;
        let fresh = controller
            .send("data-evaluate-expression", "fast", Duration::from_secs(2))
            .await
            .expect("second command should resolve");
        assert_eq!(fresh.token, Some(2));
        assert_eq!(fresh.payload.get_str("value"), Some("fresh"));
        assert_eq!(controller.discarded_results(), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_silent_wait() {
        let mut controller = controller("while IFS= read -r line; do :; done");
        let cancel = controller.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        let err = controller
            .send("exec-continue", "", Duration::from_secs(10))
            .await
            .expect_err("cancelled wait must fail");
        assert!(matches!(err, ScopeError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn closed_stdout_is_broken_pipe() {
        let mut controller = controller("IFS= read -r line; exit 0");
        let err = controller
            .send("exec-run", "", Duration::from_secs(2))
            .await
            .expect_err("closed debugger must fail");
        assert!(matches!(err, ScopeError::BrokenPipe(_)), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn garbage_lines_are_counted_and_skipped() {
        let script = r#"while IFS= read -r line; do t=${line%%-*}; printf '%s\n' 'Segmentation fault (core dumped)' '(gdb) ' "$t^done"; done"#;
        let mut controller = controller(script);
        controller
            .send("gdb-version", "", Duration::from_secs(2))
            .await
            .expect("command should resolve despite noise");
        assert_eq!(controller.parse_errors(), 1);
        assert!(controller.drain_async().is_empty());
    }

    #[tokio::test]
    async fn wait_for_stop_returns_none_while_running() {
        let mut controller = controller("while IFS= read -r line; do :; done");
        let stop = controller
            .wait_for_stop(Duration::from_millis(200))
            .await
            .expect("wait should not fail");
        assert!(stop.is_none());
    }

    #[tokio::test]
    async fn pump_collects_unsolicited_records() {
        let script = r#"printf '%s\n' '=library-loaded,id="/lib/libc.so.6"' '*stopped,reason="exited-normally"'; while IFS= read -r line; do :; done"#;
        let mut controller = controller(script);
        let consumed = controller
            .pump(Duration::from_millis(300))
            .await
            .expect("pump should not fail");
        assert_eq!(consumed, 2);
        assert_eq!(controller.stop_seq(), 1);
        assert_eq!(controller.drain_async().len(), 2);
    }
}
