//! Session state folded from the record stream.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::backtrace::{parse_backtrace, Backtrace};
use crate::mi::{MiCommand, MiResult, MiValue, Record, ResultClass};
use crate::Result;

/// Longest rendered record kept per history entry.
const HISTORY_RECORD_CHARS: usize = 240;
const HISTORY_RECORDS: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    NotStarted,
    Running,
    Stopped,
    Exited,
    Errored,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not started",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Exited => "exited",
            Self::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Decoded `*stopped` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopEvent {
    pub reason: Option<String>,
    pub signal_name: Option<String>,
    pub signal_meaning: Option<String>,
    pub exit_code: Option<String>,
    pub breakpoint: Option<String>,
    pub thread_id: Option<String>,
    pub function: Option<String>,
    pub file: Option<String>,
    pub fullname: Option<String>,
    pub line: Option<u32>,
    pub address: Option<String>,
}

impl StopEvent {
    pub fn from_payload(payload: &MiValue) -> Self {
        let owned = |value: Option<&str>| value.map(str::to_string);
        let frame = payload.get("frame");
        let frame_str = |key: &str| frame.and_then(|f| f.get_str(key)).map(str::to_string);

        Self {
            reason: owned(payload.get_str("reason")),
            signal_name: owned(payload.get_str("signal-name")),
            signal_meaning: owned(payload.get_str("signal-meaning")),
            exit_code: owned(payload.get_str("exit-code")),
            breakpoint: owned(payload.get_str("bkptno")),
            thread_id: owned(payload.get_str("thread-id")),
            function: frame_str("func"),
            file: frame_str("file"),
            fullname: frame_str("fullname"),
            line: frame
                .and_then(|f| f.get_str("line"))
                .and_then(|l| l.parse().ok()),
            address: frame_str("addr"),
        }
    }

    /// The target process is gone (`exited`, `exited-normally`, `exited-signalled`).
    pub fn is_exit(&self) -> bool {
        self.reason
            .as_deref()
            .is_some_and(|reason| reason.starts_with("exited"))
    }

    fn location(&self) -> String {
        let mut out = String::new();
        if let Some(function) = &self.function {
            out.push_str(&format!(" in {function}"));
        }
        match (&self.file, self.line) {
            (Some(file), Some(line)) => out.push_str(&format!(" at {file}:{line}")),
            (Some(file), None) => out.push_str(&format!(" at {file}")),
            _ => {
                if let Some(address) = &self.address {
                    out.push_str(&format!(" at {address}"));
                }
            }
        }
        out
    }

    /// One-line human description, e.g.
    /// `signal SIGSEGV (Segmentation fault) in cause_crash at test_1.c:7`.
    pub fn describe(&self) -> String {
        match self.reason.as_deref() {
            Some("signal-received") | Some("exited-signalled") => {
                let signal = self.signal_name.as_deref().unwrap_or("unknown signal");
                let meaning = self
                    .signal_meaning
                    .as_deref()
                    .map(|m| format!(" ({m})"))
                    .unwrap_or_default();
                let prefix = if self.is_exit() {
                    "program terminated by signal"
                } else {
                    "signal"
                };
                format!("{prefix} {signal}{meaning}{}", self.location())
            }
            Some("exited-normally") => "program exited normally".to_string(),
            Some("exited") => format!(
                "program exited with code {}",
                self.exit_code.as_deref().unwrap_or("?")
            ),
            Some("breakpoint-hit") => format!(
                "breakpoint {} hit{}",
                self.breakpoint.as_deref().unwrap_or("?"),
                self.location()
            ),
            Some("end-stepping-range") => format!("step finished{}", self.location()),
            Some("function-finished") => format!("function finished{}", self.location()),
            Some(reason) => format!("{reason}{}", self.location()),
            None => format!("stopped{}", self.location()),
        }
    }
}

/// One executed (or rejected) policy action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub step: usize,
    pub command: String,
    pub ok: bool,
    pub outcome: String,
    pub records: Vec<String>,
}

impl HistoryEntry {
    pub fn new(step: usize, command: impl Into<String>, ok: bool, outcome: impl Into<String>) -> Self {
        Self {
            step,
            command: command.into(),
            ok,
            outcome: outcome.into(),
            records: Vec::new(),
        }
    }

    /// Attaches rendered async records, clipped per line and in count.
    pub fn with_records(mut self, records: &[Record]) -> Self {
        self.records = records
            .iter()
            .rev()
            .take(HISTORY_RECORDS)
            .rev()
            .map(|record| clip(&record.to_string(), HISTORY_RECORD_CHARS))
            .collect();
        self
    }

    pub fn render(&self) -> String {
        let mut out = format!("[{}] -> {}\n    <- {}", self.step, self.command, self.outcome);
        for record in &self.records {
            out.push_str("\n       ");
            out.push_str(record);
        }
        out
    }
}

fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(max).collect();
    clipped.push_str("...");
    clipped
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub target: PathBuf,
    pub debugger_pid: Option<u32>,
    pub lifecycle: Lifecycle,
    pub last_stop: Option<StopEvent>,
    pub backtrace: Option<Backtrace>,
    /// Why the last backtrace request produced nothing usable.
    pub backtrace_gap: Option<String>,
    /// Inspected expressions and locals, name -> last-seen value.
    pub variables: BTreeMap<String, String>,
    history: Vec<HistoryEntry>,
}

impl SessionState {
    pub fn new(target: impl AsRef<Path>) -> Self {
        Self {
            target: target.as_ref().to_path_buf(),
            debugger_pid: None,
            lifecycle: Lifecycle::NotStarted,
            last_stop: None,
            backtrace: None,
            backtrace_gap: None,
            variables: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    /// Folds one async or stream record. Returns `true` for a new stop.
    pub fn fold_record(&mut self, record: &Record) -> bool {
        if let Some(payload) = record.as_stop() {
            let stop = StopEvent::from_payload(payload);
            self.lifecycle = if stop.is_exit() {
                Lifecycle::Exited
            } else {
                Lifecycle::Stopped
            };
            debug!(stop = %stop.describe(), "target stopped");
            // The previous backtrace belongs to the old frame. Variables keep
            // their last-seen values until inspected again.
            self.backtrace = None;
            self.backtrace_gap = None;
            self.last_stop = Some(stop);
            return true;
        }

        match record {
            Record::AsyncExec(_) if record.is_running() => {
                self.lifecycle = Lifecycle::Running;
            }
            Record::AsyncNotify(notify) if notify.class == "thread-group-exited" => {
                self.lifecycle = Lifecycle::Exited;
            }
            _ => {}
        }
        false
    }

    pub fn fold_records(&mut self, records: &[Record]) -> bool {
        let mut stopped = false;
        for record in records {
            stopped |= self.fold_record(record);
        }
        stopped
    }

    /// Folds the result of a command. A malformed backtrace is recorded as a
    /// gap and also returned as an error.
    pub fn fold_result(&mut self, command: &MiCommand, result: &MiResult) -> Result<()> {
        match result.class {
            ResultClass::Running => {
                self.lifecycle = Lifecycle::Running;
                return Ok(());
            }
            ResultClass::Exit => {
                self.lifecycle = Lifecycle::Exited;
                return Ok(());
            }
            ResultClass::Error => return Ok(()),
            ResultClass::Done | ResultClass::Connected => {}
        }

        match command.verb.as_str() {
            "stack-list-frames" => match parse_backtrace(&result.payload) {
                Ok(backtrace) => {
                    self.backtrace = Some(backtrace);
                    self.backtrace_gap = None;
                }
                Err(e) => {
                    self.backtrace = None;
                    self.backtrace_gap = Some(e.to_string());
                    return Err(e);
                }
            },
            "data-evaluate-expression" => {
                if let Some(value) = result.payload.get_str("value") {
                    self.variables
                        .insert(expression_from_args(&command.args), value.to_string());
                }
            }
            "stack-list-variables" | "stack-list-locals" | "stack-list-arguments" => {
                let list = result
                    .payload
                    .get("variables")
                    .or_else(|| result.payload.get("locals"))
                    .or_else(|| result.payload.get("args"));
                if let Some(list) = list {
                    self.fold_variable_list(list);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn fold_variable_list(&mut self, list: &MiValue) {
        for item in list.items() {
            let (name, value) = match item {
                MiValue::Const(name) => (name.as_str(), None),
                other => match other.get_str("name") {
                    Some(name) => (name, other.get_str("value")),
                    None => continue,
                },
            };
            let value = value.unwrap_or("<not printed>");
            self.variables.insert(name.to_string(), value.to_string());
        }
    }

    pub fn record_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// The last `n` history entries rendered for humans.
    pub fn history_tail(&self, n: usize) -> String {
        let start = self.history.len().saturating_sub(n);
        self.history[start..]
            .iter()
            .map(HistoryEntry::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The expression part of `-data-evaluate-expression` arguments, without
/// `--thread`/`--frame` options and surrounding quotes.
pub fn expression_from_args(args: &str) -> String {
    let mut rest = args.trim();
    loop {
        let Some(after) = rest
            .strip_prefix("--thread")
            .or_else(|| rest.strip_prefix("--frame"))
        else {
            break;
        };
        let after = after.trim_start();
        rest = after
            .split_once(char::is_whitespace)
            .map(|(_, tail)| tail.trim_start())
            .unwrap_or("");
    }
    let rest = rest.trim();
    if rest.len() >= 2 && rest.starts_with('"') && rest.ends_with('"') {
        rest[1..rest.len() - 1].replace("\\\"", "\"")
    } else {
        rest.to_string()
    }
}
