//! Compact, bounded snapshot of the session handed to the policy.
//!
//! Built from the session state plus the async records that arrived during
//! the last step. Stream text is truncated in the middle so both the start of
//! the output and the most recent lines survive.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::backtrace::Backtrace;
use crate::config::ObservationConfig;
use crate::mi::Record;
use crate::state::{Lifecycle, SessionState};

/// Longest rendering of a single non-stream async record.
const EVENT_CHARS: usize = 300;
const MAX_EVENTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BacktraceView {
    NotCaptured,
    Frames { frames: Vec<String> },
    Unavailable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceExcerpt {
    pub path: PathBuf,
    pub line: u32,
    pub text: String,
}

/// Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Observation {
    step: usize,
    lifecycle: Lifecycle,
    stop: Option<String>,
    backtrace: BacktraceView,
    variables: Vec<(String, String)>,
    output: Option<String>,
    events: Vec<String>,
    last_command: Option<String>,
    source: Option<SourceExcerpt>,
    notes: Vec<String>,
}

impl Observation {
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn stop(&self) -> Option<&str> {
        self.stop.as_deref()
    }

    pub fn backtrace(&self) -> &BacktraceView {
        &self.backtrace
    }

    pub fn variables(&self) -> &[(String, String)] {
        &self.variables
    }

    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    pub fn events(&self) -> &[String] {
        &self.events
    }

    pub fn last_command(&self) -> Option<&str> {
        self.last_command.as_deref()
    }

    pub fn source(&self) -> Option<&SourceExcerpt> {
        self.source.as_ref()
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    /// Plain-text rendering used in prompts and trace events.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "## Step {}", self.step);
        let _ = writeln!(out, "State: {}", self.lifecycle);
        if let Some(stop) = &self.stop {
            let _ = writeln!(out, "Stop: {stop}");
        }
        if let Some(command) = &self.last_command {
            let _ = writeln!(out, "Last command: {command}");
        }

        match &self.backtrace {
            BacktraceView::NotCaptured => {}
            BacktraceView::Frames { frames } => {
                out.push_str("Backtrace:\n");
                for frame in frames {
                    let _ = writeln!(out, "  {frame}");
                }
            }
            BacktraceView::Unavailable { reason } => {
                let _ = writeln!(out, "Backtrace: unavailable ({reason})");
            }
        }

        if !self.variables.is_empty() {
            out.push_str("Variables:\n");
            for (name, value) in &self.variables {
                let _ = writeln!(out, "  {name} = {value}");
            }
        }

        if let Some(source) = &self.source {
            let _ = writeln!(out, "Source ({}):", source.path.display());
            out.push_str(&source.text);
            if !source.text.ends_with('\n') {
                out.push('\n');
            }
        }

        if let Some(output) = &self.output {
            out.push_str("Output:\n");
            out.push_str(output);
            if !output.ends_with('\n') {
                out.push('\n');
            }
        }

        if !self.events.is_empty() {
            out.push_str("Events:\n");
            for event in &self.events {
                let _ = writeln!(out, "  {event}");
            }
        }

        if !self.notes.is_empty() {
            out.push_str("Notes:\n");
            for note in &self.notes {
                let _ = writeln!(out, "- {note}");
            }
        }
        out
    }
}

pub struct ObservationBuilder<'a> {
    state: &'a SessionState,
    config: &'a ObservationConfig,
    step: usize,
    source_root: Option<&'a Path>,
    notes: Vec<String>,
}

impl<'a> ObservationBuilder<'a> {
    pub fn new(state: &'a SessionState, config: &'a ObservationConfig) -> Self {
        Self {
            state,
            config,
            step: 0,
            source_root: None,
            notes: Vec::new(),
        }
    }

    pub fn step(mut self, step: usize) -> Self {
        self.step = step;
        self
    }

    pub fn source_root(mut self, root: Option<&'a Path>) -> Self {
        self.source_root = root;
        self
    }

    pub fn notes(mut self, notes: impl IntoIterator<Item = String>) -> Self {
        self.notes.extend(notes);
        self
    }

    pub fn build(self, new_records: &[Record]) -> Observation {
        let state = self.state;

        let text: String = new_records.iter().filter_map(Record::stream_text).collect();
        let output = (!text.is_empty()).then(|| truncate_middle(&text, self.config.stream_budget));

        let mut events: Vec<String> = new_records
            .iter()
            .filter(|record| record.stream_text().is_none())
            .map(|record| truncate_middle(&record.to_string(), EVENT_CHARS))
            .collect();
        if events.len() > MAX_EVENTS {
            events.drain(..events.len() - MAX_EVENTS);
        }

        let show_stop = matches!(state.lifecycle, Lifecycle::Stopped | Lifecycle::Exited);
        let stop = state
            .last_stop
            .as_ref()
            .filter(|_| show_stop)
            .map(|stop| stop.describe());

        let backtrace = match (&state.backtrace, &state.backtrace_gap) {
            (Some(backtrace), _) => BacktraceView::Frames {
                frames: backtrace.frames().iter().map(ToString::to_string).collect(),
            },
            (None, Some(reason)) => BacktraceView::Unavailable {
                reason: reason.clone(),
            },
            (None, None) => BacktraceView::NotCaptured,
        };

        let source = if state.lifecycle == Lifecycle::Stopped {
            self.source_excerpt()
        } else {
            None
        };

        Observation {
            step: self.step,
            lifecycle: state.lifecycle,
            stop,
            backtrace,
            variables: state
                .variables
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            output,
            events,
            last_command: state
                .history()
                .last()
                .map(|entry| format!("{} -> {}", entry.command, entry.outcome)),
            source,
            notes: self.notes,
        }
    }

    fn source_excerpt(&self) -> Option<SourceExcerpt> {
        let candidates = source_candidates(self.state.backtrace.as_ref(), self.state);
        candidates.into_iter().find_map(|(file, fullname, line)| {
            let path = self.resolve(&file, fullname.as_deref())?;
            let content = std::fs::read_to_string(&path).ok()?;
            let text = excerpt(&content, line, self.config.source_context)?;
            Some(SourceExcerpt { path, line, text })
        })
    }

    fn resolve(&self, file: &str, fullname: Option<&str>) -> Option<PathBuf> {
        if let Some(full) = fullname.map(PathBuf::from).filter(|p| p.is_file()) {
            return Some(full);
        }
        let file = Path::new(file);
        if file.is_absolute() {
            return file.is_file().then(|| file.to_path_buf());
        }
        if let Some(root) = self.source_root {
            let joined = root.join(file);
            if joined.is_file() {
                return Some(joined);
            }
        }
        let beside_target = self.state.target.parent()?.join(file);
        beside_target.is_file().then_some(beside_target)
    }
}

/// Source locations worth showing, innermost first: frames with source info,
/// then the stop location.
fn source_candidates(
    backtrace: Option<&Backtrace>,
    state: &SessionState,
) -> Vec<(String, Option<String>, u32)> {
    let mut candidates = Vec::new();
    if let Some(backtrace) = backtrace {
        for frame in backtrace.frames() {
            if let (Some(file), Some(line)) = (&frame.file, frame.line) {
                candidates.push((file.clone(), frame.fullname.clone(), line));
            }
        }
    }
    if let Some(stop) = &state.last_stop {
        if let (Some(file), Some(line)) = (&stop.file, stop.line) {
            candidates.push((file.clone(), stop.fullname.clone(), line));
        }
    }
    candidates
}

/// Numbered lines `line - context ..= line + context`, the stop line marked `>`.
pub fn excerpt(content: &str, line: u32, context: usize) -> Option<String> {
    let line = line as usize;
    if line == 0 {
        return None;
    }
    let lines: Vec<&str> = content.lines().collect();
    if line > lines.len() {
        return None;
    }
    let start = line.saturating_sub(context).max(1);
    let end = (line + context).min(lines.len());

    let mut out = String::new();
    for number in start..=end {
        let marker = if number == line { '>' } else { ' ' };
        let _ = writeln!(out, "{marker}{number:>5}  {}", lines[number - 1]);
    }
    Some(out)
}

/// Shortens `text` to at most `max_chars` characters by cutting out the
/// middle and inserting an elision marker. Idempotent.
pub fn truncate_middle(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }

    let marker = |elided: usize| format!("\n[... {elided} chars elided ...]\n");
    // The marker for `total` is at least as long as any real marker.
    let marker_len = marker(total).chars().count();
    if max_chars <= marker_len {
        return text.chars().take(max_chars).collect();
    }

    let keep = max_chars - marker_len;
    let head = keep.div_ceil(2);
    let tail = keep - head;
    let elided = total - keep;

    let mut out: String = text.chars().take(head).collect();
    out.push_str(&marker(elided));
    out.extend(text.chars().skip(total - tail));
    out
}

/// Convenience wrapper over [`ObservationBuilder`].
pub fn build_observation(
    state: &SessionState,
    new_records: &[Record],
    config: &ObservationConfig,
) -> Observation {
    ObservationBuilder::new(state, config).build(new_records)
}
