//! The boundary to whatever picks the next debugger command.
//!
//! A policy sees an [`Observation`] plus the command history and answers with
//! free text. The text is parsed into an [`Action`] and checked against the
//! [`Allowlist`] before anything is written to the debugger.

mod action;
mod allowlist;
pub mod chat;
pub mod prompt;
mod scripted;

use anyhow::Result;
use async_trait::async_trait;

use crate::observation::Observation;
use crate::state::HistoryEntry;

pub use action::{parse_action, Action, InspectKind};
pub use allowlist::{Allowlist, DisallowedCommand, DEFAULT_ALLOWED_VERBS};
pub use chat::{ChatConfig, ChatPolicy};
pub use scripted::{ScriptedPolicy, EXHAUSTED_REPLY};

#[async_trait]
pub trait Policy: Send {
    async fn decide(&mut self, observation: &Observation, history: &[HistoryEntry]) -> Result<String>;

    fn name(&self) -> &str {
        "policy"
    }
}

#[async_trait]
impl<P: Policy + ?Sized> Policy for Box<P> {
    async fn decide(&mut self, observation: &Observation, history: &[HistoryEntry]) -> Result<String> {
        (**self).decide(observation, history).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
