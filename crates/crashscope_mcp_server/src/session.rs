//! One interactive MI session driven by tool calls instead of a policy loop.

use std::process::ExitStatus;
use std::time::Duration;

use crashscope_core::mi::{quote_arg, MiCommand, MiResult, Record, ResultClass};
use crashscope_core::observation::ObservationBuilder;
use crashscope_core::policy::{parse_action, Allowlist};
use crashscope_core::state::{HistoryEntry, Lifecycle, SessionState};
use crashscope_core::transcript::Transcript;
use crashscope_core::{Controller, Result, SessionConfig};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const RECORD_CHARS: usize = 600;

pub struct McpSession {
    controller: Controller,
    state: SessionState,
    config: SessionConfig,
    allowlist: Allowlist,
    /// Async records not yet shown in an observation.
    unseen: Vec<Record>,
    step: usize,
}

impl McpSession {
    pub async fn start(config: SessionConfig, allowlist: Allowlist) -> Result<Self> {
        let mut controller = Controller::launch(&config, CancellationToken::new())?;
        if let Some(dir) = &config.transcript_dir {
            let id = format!("mcp-{}", controller.transport().pid().unwrap_or_default());
            match Transcript::create(dir, &id).await {
                Ok(transcript) => controller = controller.with_transcript(transcript),
                Err(e) => warn!(error = %e, "transcript disabled"),
            }
        }

        let mut state = SessionState::new(&config.target);
        state.debugger_pid = controller.transport().pid();

        if let Err(e) = controller.load_target(&config).await {
            if let Err(close_err) = controller.close().await {
                warn!(error = %close_err, "debugger teardown failed");
            }
            return Err(e);
        }
        let unseen = controller.drain_async();
        state.fold_records(&unseen);
        info!(target = %config.target.display(), pid = ?state.debugger_pid, "MI session started");

        Ok(Self {
            controller,
            state,
            config,
            allowlist,
            unseen,
            step: 0,
        })
    }

    pub fn summary(&self) -> Value {
        json!({
            "target": self.config.target.display().to_string(),
            "debugger_pid": self.state.debugger_pid,
            "lifecycle": self.state.lifecycle,
            "last_stop": self.state.last_stop.as_ref().map(|stop| stop.describe()),
            "transcript": self.controller.transcript_path().map(|p| p.display().to_string()),
        })
    }

    /// Runs one allow-listed command written as the policy would write it.
    pub async fn command(&mut self, text: &str, timeout: Option<Duration>) -> Result<Value> {
        let action = parse_action(text)?;
        let command = self.allowlist.validate(&action)?;
        let timeout = timeout.unwrap_or_else(|| self.config.timeout_for(&command.verb));
        let stops_before = self.controller.stop_seq();

        let (result, records) = self.run(&command, timeout).await?;
        Ok(json!({
            "command": command.to_string(),
            "class": result.class.as_str(),
            "result": result.payload.to_json(),
            "records": render_records(&records),
            "stopped": self.controller.stop_seq() > stops_before,
            "lifecycle": self.state.lifecycle,
        }))
    }

    /// Returns at once unless the target is running; otherwise waits for the
    /// next stop.
    pub async fn wait_stopped(&mut self, wait: Duration) -> Result<Value> {
        let mut stopped = self.state.lifecycle != Lifecycle::Running;
        if !stopped {
            stopped = self.controller.wait_for_stop(wait).await?.is_some();
            let records = self.controller.drain_async();
            self.state.fold_records(&records);
            self.unseen.extend(records);
        }

        Ok(json!({
            "stopped": stopped && self.state.last_stop.is_some(),
            "lifecycle": self.state.lifecycle,
            "stop": self.state.last_stop.as_ref().map(|stop| stop.describe()),
            "exited": self.state.last_stop.as_ref().is_some_and(|stop| stop.is_exit()),
        }))
    }

    pub async fn backtrace(&mut self) -> Result<Value> {
        let command = MiCommand::new("stack-list-frames", "");
        self.run(&command, self.config.command_timeout).await?;
        let frames = self
            .state
            .backtrace
            .as_ref()
            .map(|backtrace| backtrace.frames().to_vec())
            .unwrap_or_default();
        Ok(json!({
            "frames": frames,
            "rendered": frames.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "gap": self.state.backtrace_gap,
        }))
    }

    pub async fn evaluate(&mut self, expression: &str) -> Result<Value> {
        let command = MiCommand::new("data-evaluate-expression", quote_arg(expression.trim()));
        let (result, _) = self.run(&command, self.config.command_timeout).await?;
        Ok(json!({
            "expression": expression,
            "value": result.payload.get_str("value"),
        }))
    }

    pub fn observation(&mut self) -> Value {
        self.step += 1;
        let observation = ObservationBuilder::new(&self.state, &self.config.observation)
            .step(self.step)
            .source_root(self.config.source_root.as_deref())
            .build(&self.unseen);
        self.unseen.clear();
        json!({
            "text": observation.render(),
            "observation": observation,
        })
    }

    pub fn history(&self) -> &[HistoryEntry] {
        self.state.history()
    }

    pub async fn stop(self) -> Result<ExitStatus> {
        info!(target = %self.config.target.display(), "MI session stopping");
        self.controller.close().await
    }

    /// Sends `command`, folds everything it produced and records it in the
    /// history.
    async fn run(&mut self, command: &MiCommand, timeout: Duration) -> Result<(MiResult, Vec<Record>)> {
        let step = self.state.history().len() + 1;
        let sent = self.controller.send_command(command, timeout).await;
        let records = self.controller.drain_async();

        let result = match sent {
            Ok(result) => result,
            Err(e) => {
                self.state.fold_records(&records);
                self.state.record_history(
                    HistoryEntry::new(step, command.to_string(), false, e.to_string()).with_records(&records),
                );
                self.unseen.extend(records);
                return Err(e);
            }
        };

        let folded = if result.class == ResultClass::Running {
            let folded = self.state.fold_result(command, &result);
            self.state.fold_records(&records);
            folded
        } else {
            self.state.fold_records(&records);
            self.state.fold_result(command, &result)
        };
        if let Err(e) = folded {
            warn!(error = %e, command = %command, "could not fold command result");
        }

        self.state.record_history(
            HistoryEntry::new(step, command.to_string(), true, result.class.as_str()).with_records(&records),
        );
        self.unseen.extend(records.iter().cloned());
        Ok((result, records))
    }
}

fn render_records(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .map(|record| {
            let text = record.to_string();
            if text.chars().count() > RECORD_CHARS {
                let clipped: String = text.chars().take(RECORD_CHARS).collect();
                format!("{clipped}...")
            } else {
                text
            }
        })
        .collect()
}
