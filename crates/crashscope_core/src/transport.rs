//! Debugger subprocess and its pipes.
//!
//! The transport is the only owner of the child process. One reader task per
//! output stream pushes lines onto an unbounded queue that exists before the
//! process starts producing output, so nothing is lost before a consumer
//! attaches and the readers never wait on downstream processing.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{Result, ScopeError};

const EXIT_GRACE: Duration = Duration::from_secs(2);
const TERM_GRACE: Duration = Duration::from_secs(1);

pub struct Transport {
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout_rx: mpsc::UnboundedReceiver<String>,
    stderr_rx: mpsc::UnboundedReceiver<String>,
    readers: Vec<JoinHandle<()>>,
    lines_written: u64,
    exit_grace: Duration,
    term_grace: Duration,
}

impl Transport {
    /// Spawns `program` with piped stdio. Must be called inside a tokio runtime.
    pub fn start<S: AsRef<OsStr>>(program: impl AsRef<Path>, args: &[S]) -> Result<Self> {
        let program_path = program.as_ref();
        let program = program_path.display().to_string();

        let mut child = Command::new(program_path)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ScopeError::spawn(&program, e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ScopeError::spawn(&program, "missing stdin pipe"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ScopeError::spawn(&program, "missing stdout pipe"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ScopeError::spawn(&program, "missing stderr pipe"))?;

        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let readers = vec![
            spawn_line_reader(stdout, stdout_tx, "stdout"),
            spawn_line_reader(stderr, stderr_tx, "stderr"),
        ];

        info!(program = %program, pid = ?child.id(), "debugger process started");

        Ok(Self {
            program,
            child,
            stdin: Some(stdin),
            stdout_rx,
            stderr_rx,
            readers,
            lines_written: 0,
            exit_grace: EXIT_GRACE,
            term_grace: TERM_GRACE,
        })
    }

    /// Overrides the grace periods used by [`Transport::close`].
    pub fn with_grace(mut self, exit_grace: Duration, term_grace: Duration) -> Self {
        self.exit_grace = exit_grace;
        self.term_grace = term_grace;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Fails with `Spawn` if the process already died during start-up.
    pub fn probe_startup(&mut self) -> Result<()> {
        match self.child.try_wait()? {
            Some(status) => Err(ScopeError::spawn(
                &self.program,
                format!("exited during startup with status: {status}"),
            )),
            None => Ok(()),
        }
    }

    pub async fn write_line(&mut self, text: &str) -> Result<()> {
        if let Some(status) = self.child.try_wait()? {
            return Err(ScopeError::BrokenPipe(format!(
                "{} exited with status {status}",
                self.program
            )));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ScopeError::BrokenPipe("stdin already closed".to_string()))?;

        let mut line = text.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ScopeError::BrokenPipe(format!("failed to write to debugger stdin: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| ScopeError::BrokenPipe(format!("failed to flush debugger stdin: {e}")))?;

        self.lines_written += 1;
        debug!(line = line.trim_end(), "-> debugger");
        Ok(())
    }

    /// Next stdout line; `None` once the process closed stdout.
    pub async fn read_line(&mut self) -> Option<String> {
        self.stdout_rx.recv().await
    }

    pub fn try_read_line(&mut self) -> Option<String> {
        self.stdout_rx.try_recv().ok()
    }

    pub async fn read_stderr_line(&mut self) -> Option<String> {
        self.stderr_rx.recv().await
    }

    pub fn drain_stderr(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = self.stderr_rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    /// `-gdb-exit`, then SIGTERM, then SIGKILL, reaping the process in every case.
    pub async fn close(mut self) -> Result<ExitStatus> {
        if self.child.try_wait()?.is_none() {
            if let Err(e) = self.write_line("-gdb-exit").await {
                debug!(error = %e, "graceful exit command not delivered");
            }
        }
        // Closing stdin gives well-behaved children an EOF as well.
        self.stdin.take();

        let status = match timeout(self.exit_grace, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                self.terminate();
                match timeout(self.term_grace, self.child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => {
                        warn!(program = %self.program, "debugger ignored SIGTERM, killing");
                        self.child.kill().await?;
                        self.child.wait().await?
                    }
                }
            }
        };

        for reader in self.readers.drain(..) {
            reader.abort();
        }
        info!(program = %self.program, %status, "debugger process closed");
        Ok(status)
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(pid, error = %e, "failed to send SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!(error = %e, "failed to terminate debugger");
        }
    }
}

fn spawn_line_reader<R>(
    stream: R,
    tx: mpsc::UnboundedSender<String>,
    name: &'static str,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => {
                    debug!(stream = name, "debugger stream closed");
                    break;
                }
                Ok(_) => {
                    // Inferior output can be arbitrary bytes.
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(stream = name, error = %e, "debugger stream read failed");
                    break;
                }
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> Transport {
        Transport::start("sh", &["-c", script]).expect("sh should spawn")
    }

    #[test]
    fn start_fails_with_spawn_error_for_missing_binary() {
        let runtime = tokio::runtime::Runtime::new().expect("runtime should initialize");
        runtime.block_on(async {
            let err = Transport::start("/definitely/not/a/debugger", &["--version"])
                .err()
                .expect("missing binary must fail");
            assert!(matches!(err, ScopeError::Spawn { .. }), "unexpected error: {err}");
        });
    }

    #[tokio::test]
    async fn lines_written_before_consumer_attaches_are_not_lost() {
        let mut transport = sh("printf 'one\\ntwo\\nthree\\n'");
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(transport.read_line().await.as_deref(), Some("one"));
        assert_eq!(transport.read_line().await.as_deref(), Some("two"));
        assert_eq!(transport.read_line().await.as_deref(), Some("three"));
        assert_eq!(transport.read_line().await, None);
    }

    #[tokio::test]
    async fn write_then_read_echoes_through_cat() {
        let mut transport = Transport::start("cat", &[] as &[&str]).expect("cat should spawn");
        transport.write_line("1-exec-run").await.expect("write should succeed");
        assert_eq!(transport.read_line().await.as_deref(), Some("1-exec-run"));
        assert_eq!(transport.lines_written(), 1);
        assert!(transport.try_read_line().is_none());
        transport.close().await.expect("close should succeed");
    }

    #[tokio::test]
    async fn stderr_lines_go_to_their_own_queue() {
        let mut transport = sh("echo out; echo err 1>&2");
        assert_eq!(transport.read_line().await.as_deref(), Some("out"));
        assert_eq!(transport.read_stderr_line().await.as_deref(), Some("err"));
    }

    #[tokio::test]
    async fn write_after_exit_is_broken_pipe() {
        let mut transport = sh("exit 0");
        while transport.read_line().await.is_some() {}
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = transport
            .write_line("1-exec-run")
            .await
            .expect_err("write to exited process must fail");
        assert!(matches!(err, ScopeError::BrokenPipe(_)), "unexpected error: {err}");
        assert_eq!(transport.lines_written(), 0);
    }

    #[tokio::test]
    async fn probe_startup_detects_early_exit() {
        let mut transport = sh("exit 7");
        tokio::time::sleep(Duration::from_millis(200)).await;
        let err = transport.probe_startup().expect_err("exited process must fail probe");
        assert!(err.to_string().contains("exited during startup"));
    }

    #[tokio::test]
    async fn close_exits_gracefully_on_stdin_eof() {
        let transport = Transport::start("cat", &[] as &[&str]).expect("cat should spawn");
        let started = Instant::now();
        let status = transport.close().await.expect("close should succeed");
        assert!(status.success());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn close_escalates_to_kill_when_term_is_ignored() {
        let transport = sh("trap '' TERM; while true; do sleep 1; done")
            .with_grace(Duration::from_millis(200), Duration::from_millis(200));
        let started = Instant::now();
        let status = transport.close().await.expect("close should reap the child");
        assert!(!status.success());
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "close took too long: {:?}",
            started.elapsed()
        );
    }
}
