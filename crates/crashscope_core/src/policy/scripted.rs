use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use super::Policy;
use crate::observation::Observation;
use crate::state::HistoryEntry;

/// Reply used once the script runs out.
pub const EXHAUSTED_REPLY: &str = "DONE: scripted policy exhausted";

/// Replays a fixed list of replies, for tests and offline runs.
pub struct ScriptedPolicy {
    replies: VecDeque<String>,
    fallback: Option<String>,
    seen: Arc<Mutex<Vec<Observation>>>,
}

impl ScriptedPolicy {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: replies.into_iter().map(Into::into).collect(),
            fallback: Some(EXHAUSTED_REPLY.to_string()),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Repeats `reply` forever once the script is exhausted.
    pub fn repeating(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(reply.into());
        self
    }

    /// Fails `decide` once the script is exhausted.
    pub fn strict(mut self) -> Self {
        self.fallback = None;
        self
    }

    /// Shared handle to every observation passed to `decide`.
    pub fn observations(&self) -> Arc<Mutex<Vec<Observation>>> {
        Arc::clone(&self.seen)
    }
}

#[async_trait]
impl Policy for ScriptedPolicy {
    async fn decide(&mut self, observation: &Observation, _history: &[HistoryEntry]) -> Result<String> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(observation.clone());
        }
        match self.replies.pop_front() {
            Some(reply) => Ok(reply),
            None => self
                .fallback
                .clone()
                .ok_or_else(|| anyhow::anyhow!("scripted policy has no replies left")),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
