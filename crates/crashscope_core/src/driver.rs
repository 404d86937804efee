//! The observe/act loop.
//!
//! `Idle -> Starting -> AwaitingPolicy -> Executing -> AwaitingPolicy ... ->
//! Concluded | Failed | MaxStepsReached`. Every run ends with exactly one
//! `answer` event and a [`SessionReport`], and the debugger is always torn
//! down before the report is returned.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::controller::Controller;
use crate::events::{self, EventSink, EventStream};
use crate::mi::{MiCommand, MiResult, Record, ResultClass};
use crate::observation::{truncate_middle, ObservationBuilder};
use crate::policy::{parse_action, Action, Allowlist, Policy};
use crate::state::{HistoryEntry, Lifecycle, SessionState};
use crate::transcript::Transcript;
use crate::{Result, ScopeError};

const RESULT_SUMMARY_CHARS: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Idle,
    Starting,
    AwaitingPolicy,
    Executing,
    Concluded,
    Failed,
    MaxStepsReached,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Concluded { summary: String },
    MaxStepsReached { steps: usize },
    Failed { reason: String },
}

impl Outcome {
    fn cancelled() -> Self {
        Self::Failed {
            reason: "cancelled".to_string(),
        }
    }

    fn from_error(error: &ScopeError) -> Self {
        match error {
            ScopeError::Cancelled => Self::cancelled(),
            other => Self::Failed {
                reason: other.to_string(),
            },
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concluded { summary } => write!(f, "concluded: {summary}"),
            Self::MaxStepsReached { steps } => write!(f, "step limit reached after {steps} steps"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub outcome: Outcome,
    pub steps: usize,
    pub lifecycle: Lifecycle,
    pub last_stop: Option<String>,
    pub history: Vec<HistoryEntry>,
    pub transcript: Option<PathBuf>,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Concluded { .. })
    }
}

pub struct SessionDriver<P> {
    config: SessionConfig,
    policy: P,
    allowlist: Allowlist,
    cancel: CancellationToken,
    events: EventSink,
    state: DriverState,
    session_id: Uuid,
    steps: usize,
    transcript: Option<PathBuf>,
}

impl<P: Policy> SessionDriver<P> {
    pub fn new(config: SessionConfig, policy: P) -> (Self, EventStream) {
        let (events, stream) = events::channel();
        let driver = Self {
            config,
            policy,
            allowlist: Allowlist::default(),
            cancel: CancellationToken::new(),
            events,
            state: DriverState::Idle,
            session_id: Uuid::new_v4(),
            steps: 0,
            transcript: None,
        };
        (driver, stream)
    }

    pub fn with_allowlist(mut self, allowlist: Allowlist) -> Self {
        self.allowlist = allowlist;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    fn transition(&mut self, next: DriverState) {
        debug!(from = ?self.state, to = ?next, "driver state");
        self.state = next;
    }

    pub async fn run(mut self) -> SessionReport {
        info!(
            session = %self.session_id,
            target = %self.config.target.display(),
            policy = self.policy.name(),
            "debugging session starting"
        );
        self.transition(DriverState::Starting);
        let mut session = SessionState::new(&self.config.target);

        let outcome = match self.start(&mut session).await {
            Ok(mut controller) => {
                self.transcript = controller.transcript_path().map(|p| p.to_path_buf());
                let outcome = self.drive(&mut controller, &mut session).await;
                if let Err(e) = controller.close().await {
                    warn!(error = %e, "debugger teardown failed");
                }
                outcome
            }
            Err(e) => {
                warn!(error = %e, "session start-up failed");
                match e {
                    ScopeError::Cancelled => Outcome::cancelled(),
                    other => Outcome::Failed {
                        reason: format!("start-up failed: {other}"),
                    },
                }
            }
        };

        self.finish(outcome, session)
    }

    async fn start(&mut self, session: &mut SessionState) -> Result<Controller> {
        let mut controller = Controller::launch(&self.config, self.cancel.clone())?;
        session.debugger_pid = controller.transport().pid();

        if let Some(dir) = &self.config.transcript_dir {
            match Transcript::create(dir, &self.session_id.to_string()).await {
                Ok(transcript) => {
                    info!(path = %transcript.path().display(), "writing transcript");
                    controller = controller.with_transcript(transcript);
                }
                Err(e) => warn!(error = %e, "transcript disabled"),
            }
        }

        if let Err(e) = controller.load_target(&self.config).await {
            if let Err(close_err) = controller.close().await {
                warn!(error = %close_err, "debugger teardown failed");
            }
            return Err(e);
        }

        let records = controller.drain_async();
        session.fold_records(&records);
        self.events.trace(format!(
            "Loaded {} (debugger pid {})",
            self.config.target.display(),
            session
                .debugger_pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "?".to_string())
        ));
        Ok(controller)
    }

    async fn drive(&mut self, controller: &mut Controller, session: &mut SessionState) -> Outcome {
        let cancel = self.cancel.clone();
        let retry = self.config.retry.clone();
        let mut rejections = 0u32;
        let mut timeouts = 0u32;
        let mut notes: Vec<String> = Vec::new();
        let mut records = controller.drain_async();
        session.fold_records(&records);

        loop {
            if cancel.is_cancelled() {
                return Outcome::cancelled();
            }
            if self.steps >= self.config.max_steps {
                info!(steps = self.steps, "step limit reached");
                return Outcome::MaxStepsReached { steps: self.steps };
            }
            self.steps += 1;
            let step = self.steps;
            self.transition(DriverState::AwaitingPolicy);

            let observation = ObservationBuilder::new(session, &self.config.observation)
                .step(step)
                .source_root(self.config.source_root.as_deref())
                .notes(notes.drain(..))
                .build(&records);
            records.clear();
            self.events.trace(observation.render());

            let reply = tokio::select! {
                reply = self.policy.decide(&observation, session.history()) => reply,
                _ = cancel.cancelled() => return Outcome::cancelled(),
            };

            let reply = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    rejections += 1;
                    warn!(error = %e, rejections, "policy failed to answer");
                    session.record_history(HistoryEntry::new(step, "(no reply)", false, format!("policy error: {e}")));
                    if rejections >= retry.max_rejections {
                        return Outcome::Failed {
                            reason: format!("policy failed {rejections} times in a row: {e}"),
                        };
                    }
                    notes.push(format!("The previous request to the policy failed: {e}"));
                    continue;
                }
            };
            self.events.cot(reply.trim());

            let validated = match parse_action(&reply) {
                Ok(Action::Conclude { summary }) => {
                    info!(step, "policy concluded");
                    let summary = if summary.is_empty() {
                        "The policy concluded without a summary.".to_string()
                    } else {
                        summary
                    };
                    return Outcome::Concluded { summary };
                }
                Ok(action) => self.allowlist.validate(&action),
                Err(e) => Err(e),
            };

            let command = match validated {
                Ok(command) => {
                    rejections = 0;
                    command
                }
                Err(disallowed) => {
                    rejections += 1;
                    warn!(input = %disallowed.input, reason = %disallowed.reason, rejections, "rejected policy action");
                    session.record_history(HistoryEntry::new(
                        step,
                        disallowed.input.clone(),
                        false,
                        format!("rejected: {}", disallowed.reason),
                    ));
                    self.events.trace(format!("Rejected: {disallowed}"));
                    if rejections >= retry.max_rejections {
                        return Outcome::Failed {
                            reason: format!(
                                "policy produced {rejections} invalid actions in a row; last: {disallowed}"
                            ),
                        };
                    }
                    notes.push(format!(
                        "{disallowed}. Reply with one allowed MI command ({}) or DONE: <summary>.",
                        self.allowlist.verbs().collect::<Vec<_>>().join(", ")
                    ));
                    continue;
                }
            };

            self.transition(DriverState::Executing);
            let mut retried = false;
            loop {
                let executed = self
                    .execute(controller, session, &command, step, &mut records, &mut notes)
                    .await;
                match executed {
                    Ok(()) => {
                        timeouts = 0;
                        break;
                    }
                    Err(e) if e.is_timeout() => {
                        timeouts += 1;
                        if timeouts >= retry.max_consecutive_timeouts {
                            session.lifecycle = Lifecycle::Errored;
                            return Outcome::Failed {
                                reason: format!("{e} ({timeouts} consecutive timeouts)"),
                            };
                        }
                        if retried {
                            notes.push(e.to_string());
                            break;
                        }
                        retried = true;
                        let delay = retry.backoff * 2u32.saturating_pow(timeouts - 1);
                        info!(command = %command, delay_ms = delay.as_millis() as u64, "retrying after timeout");
                        tokio::select! {
                            _ = sleep(delay) => {}
                            _ = cancel.cancelled() => return Outcome::cancelled(),
                        }
                    }
                    Err(e) if e.is_fatal() => {
                        session.lifecycle = Lifecycle::Errored;
                        return Outcome::from_error(&e);
                    }
                    Err(e) => {
                        debug!(error = %e, "recoverable command failure");
                        notes.push(e.to_string());
                        break;
                    }
                }
            }
        }
    }

    /// Runs one validated command and folds everything it produced.
    async fn execute(
        &mut self,
        controller: &mut Controller,
        session: &mut SessionState,
        command: &MiCommand,
        step: usize,
        records: &mut Vec<Record>,
        notes: &mut Vec<String>,
    ) -> Result<()> {
        let stops_before = controller.stop_seq();
        self.events.trace(format!("-> {command}"));
        let sent = controller
            .send_command(command, self.config.timeout_for(&command.verb))
            .await;
        let mut fresh = controller.drain_async();

        let result = match sent {
            Ok(result) => result,
            Err(e) => {
                session.fold_records(&fresh);
                session.record_history(
                    HistoryEntry::new(step, command.to_string(), false, e.to_string()).with_records(&fresh),
                );
                records.append(&mut fresh);
                return Err(e);
            }
        };

        // A stop can arrive before `^running`; fold the result first so the
        // stop wins.
        let folded = if result.class == ResultClass::Running {
            let folded = session.fold_result(command, &result);
            session.fold_records(&fresh);
            folded
        } else {
            session.fold_records(&fresh);
            session.fold_result(command, &result)
        };
        if let Err(e) = folded {
            warn!(error = %e, "could not fold command result");
            notes.push(e.to_string());
        }

        if result.class == ResultClass::Running && controller.stop_seq() == stops_before {
            let run_timeout = self.config.run_timeout;
            match controller.wait_for_stop_after(stops_before, run_timeout).await {
                Ok(Some(_)) => {}
                Ok(None) => notes.push(format!(
                    "The target is still running {run_timeout:?} after {command}."
                )),
                Err(e) => {
                    session.record_history(
                        HistoryEntry::new(step, command.to_string(), false, e.to_string()).with_records(&fresh),
                    );
                    records.append(&mut fresh);
                    return Err(e);
                }
            }
            let more = controller.drain_async();
            session.fold_records(&more);
            fresh.extend(more);
        }

        let stopped = controller.stop_seq() > stops_before;
        session.record_history(
            HistoryEntry::new(step, command.to_string(), true, summarize_result(&result)).with_records(&fresh),
        );
        records.append(&mut fresh);
        self.events.trace(format!(
            "<- {}",
            session.history().last().map(|h| h.outcome.as_str()).unwrap_or("")
        ));

        if stopped
            && self.config.auto_backtrace
            && session.lifecycle == Lifecycle::Stopped
            && command.verb != "stack-list-frames"
        {
            self.fetch_backtrace(controller, session, records, notes).await?;
        }
        Ok(())
    }

    async fn fetch_backtrace(
        &mut self,
        controller: &mut Controller,
        session: &mut SessionState,
        records: &mut Vec<Record>,
        notes: &mut Vec<String>,
    ) -> Result<()> {
        let command = MiCommand::new("stack-list-frames", "");
        let sent = controller
            .send_command(&command, self.config.command_timeout)
            .await;
        let fresh = controller.drain_async();
        session.fold_records(&fresh);
        records.extend(fresh);

        match sent {
            Ok(result) => {
                if let Err(e) = session.fold_result(&command, &result) {
                    warn!(error = %e, "automatic backtrace unusable");
                    notes.push(e.to_string());
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(error = %e, "automatic backtrace failed");
                notes.push(format!("Automatic backtrace failed: {e}"));
                Ok(())
            }
        }
    }

    fn finish(mut self, outcome: Outcome, mut session: SessionState) -> SessionReport {
        let final_state = match &outcome {
            Outcome::Concluded { .. } => DriverState::Concluded,
            Outcome::MaxStepsReached { .. } => DriverState::MaxStepsReached,
            Outcome::Failed { .. } => DriverState::Failed,
        };
        self.transition(final_state);

        let tail = session.history_tail(self.config.report_tail);
        let with_tail = |headline: String| {
            if tail.is_empty() {
                headline
            } else {
                format!("{headline}\n\nLast steps:\n{tail}")
            }
        };
        let answer = match &outcome {
            Outcome::Concluded { summary } => summary.clone(),
            Outcome::MaxStepsReached { steps } => with_tail(format!(
                "Reached the step limit ({steps}) without a conclusion."
            )),
            Outcome::Failed { reason } => {
                session.lifecycle = Lifecycle::Errored;
                with_tail(format!("Session failed: {reason}"))
            }
        };
        self.events.answer(answer);

        info!(session = %self.session_id, steps = self.steps, outcome = %outcome, "debugging session finished");
        SessionReport {
            session_id: self.session_id.to_string(),
            outcome,
            steps: self.steps,
            lifecycle: session.lifecycle,
            last_stop: session.last_stop.as_ref().map(|stop| stop.describe()),
            history: session.history().to_vec(),
            transcript: self.transcript,
        }
    }
}

/// `^done,value="3"` style summary without the token.
fn summarize_result(result: &MiResult) -> String {
    let record = Record::Result(MiResult {
        token: None,
        class: result.class,
        payload: result.payload.clone(),
    });
    truncate_middle(&record.to_string(), RESULT_SUMMARY_CHARS)
}
