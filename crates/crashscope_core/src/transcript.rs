//! JSON-lines transcript of every line exchanged with the debugger.

use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::json;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
    Stderr,
    Internal,
}

#[derive(Debug)]
pub struct Transcript {
    path: PathBuf,
    file: File,
    lines: u64,
    /// Wall-clock milliseconds at `opened`; entries are stamped relative to it
    /// so `ts_ms` never goes backwards.
    epoch_ms: u128,
    opened: Instant,
}

impl Transcript {
    /// Creates `<dir>/session_<id>_<ts>.jsonl`.
    pub async fn create(dir: &Path, session_id: &str) -> Result<Self> {
        fs::create_dir_all(dir).await?;
        let opened = Instant::now();
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let path = dir.join(format!("session_{session_id}_{epoch_ms}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file,
            lines: 0,
            epoch_ms,
            opened,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub async fn log(&mut self, direction: Direction, text: &str) -> Result<()> {
        let envelope = json!({
            "ts_ms": self.epoch_ms + self.opened.elapsed().as_millis(),
            "direction": direction,
            "kind": classify_mi_line(text),
            "line": text,
        });
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');

        self.file.write_all(&line).await?;
        self.file.flush().await?;
        self.lines += 1;
        Ok(())
    }
}

/// Record kind from the first character after the optional token.
pub fn classify_mi_line(line: &str) -> &'static str {
    let rest = line.trim_start_matches(|c: char| c.is_ascii_digit());
    match rest.chars().next() {
        _ if line.trim() == "(gdb)" => "prompt",
        Some('^') => "result",
        Some('*') => "exec",
        Some('+') => "status",
        Some('=') => "notify",
        Some('~') => "console",
        Some('@') => "target",
        Some('&') => "log",
        Some('-') => "command",
        _ => "other",
    }
}
