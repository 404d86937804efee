//! Token correlation between outstanding commands and incoming records.
//!
//! Pure bookkeeping with no I/O: the controller feeds every parsed record in
//! and acts on the returned [`Disposition`].

use std::collections::{HashMap, VecDeque};

use tokio::time::Instant;
use tracing::warn;

use crate::mi::{MiCommand, MiResult, Record};

/// Timed-out tokens remembered so late replies can be told apart from unknown ones.
const EVICTED_MEMORY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub token: u64,
    pub command: MiCommand,
    pub issued_at: Instant,
    pub deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The token timed out earlier.
    Late,
    /// No command was ever issued with this token.
    Unknown,
    /// The result carried no token at all.
    Untagged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Resolved(PendingCommand, MiResult),
    Discarded {
        token: Option<u64>,
        reason: DiscardReason,
    },
    /// Appended to the async side channel.
    Queued,
}

#[derive(Debug)]
pub struct Correlator {
    pending: HashMap<u64, PendingCommand>,
    evicted: VecDeque<u64>,
    backlog: VecDeque<Record>,
    capacity: usize,
    discarded: u64,
    overflowed: u64,
}

impl Correlator {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: HashMap::new(),
            evicted: VecDeque::new(),
            backlog: VecDeque::new(),
            capacity: capacity.max(1),
            discarded: 0,
            overflowed: 0,
        }
    }

    pub fn register(&mut self, command: PendingCommand) {
        self.pending.insert(command.token, command);
    }

    pub fn is_pending(&self, token: u64) -> bool {
        self.pending.contains_key(&token)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drops a command that was never delivered (e.g. the write failed).
    pub fn cancel(&mut self, token: u64) -> Option<PendingCommand> {
        self.pending.remove(&token)
    }

    /// Expires a command; a reply arriving later is discarded as late.
    pub fn evict(&mut self, token: u64) -> Option<PendingCommand> {
        let removed = self.pending.remove(&token);
        if removed.is_some() {
            self.evicted.push_back(token);
            while self.evicted.len() > EVICTED_MEMORY {
                self.evicted.pop_front();
            }
        }
        removed
    }

    pub fn accept(&mut self, record: Record) -> Disposition {
        let result = match record {
            Record::Result(result) => result,
            other => {
                self.enqueue(other);
                return Disposition::Queued;
            }
        };

        match result.token {
            Some(token) => match self.pending.remove(&token) {
                Some(pending) => Disposition::Resolved(pending, result),
                None if self.evicted.contains(&token) => {
                    warn!(token, class = result.class.as_str(), "discarding late result for timed-out command");
                    self.discard(Some(token), DiscardReason::Late)
                }
                None => {
                    warn!(token, class = result.class.as_str(), "discarding result for unknown token");
                    self.discard(Some(token), DiscardReason::Unknown)
                }
            },
            None => {
                warn!(class = result.class.as_str(), "discarding untagged result");
                self.discard(None, DiscardReason::Untagged)
            }
        }
    }

    fn discard(&mut self, token: Option<u64>, reason: DiscardReason) -> Disposition {
        self.discarded += 1;
        Disposition::Discarded { token, reason }
    }

    fn enqueue(&mut self, record: Record) {
        self.backlog.push_back(record);
        while self.backlog.len() > self.capacity {
            if let Some(dropped) = self.backlog.pop_front() {
                self.overflowed += 1;
                warn!(kind = dropped.kind(), capacity = self.capacity, "async backlog full, dropping oldest record");
            }
        }
    }

    /// Hands over every queued async record in arrival order.
    pub fn drain_async(&mut self) -> Vec<Record> {
        self.backlog.drain(..).collect()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn overflowed(&self) -> u64 {
        self.overflowed
    }
}
