use std::time::Duration;
use thiserror::Error;

use crate::mi::ProtocolParseError;
use crate::policy::DisallowedCommand;

#[derive(Error, Debug)]
pub enum ScopeError {
    #[error("Failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Debugger pipe closed: {0}")]
    BrokenPipe(String),

    #[error("MI parse error: {0}")]
    Parse(#[from] ProtocolParseError),

    #[error("Command '{verb}' (token {token}) timed out after {after:?}")]
    Timeout {
        verb: String,
        token: u64,
        after: Duration,
    },

    #[error("Command '{verb}' failed: {message}")]
    Command { verb: String, message: String },

    #[error("Malformed backtrace: {0}")]
    MalformedBacktrace(String),

    #[error(transparent)]
    Disallowed(#[from] DisallowedCommand),

    #[error("Session cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ScopeError {
    pub fn spawn(program: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Spawn {
            program: program.into(),
            reason: reason.into(),
        }
    }

    pub fn command(verb: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            verb: verb.into(),
            message: message.into(),
        }
    }

    /// Fatal errors end the session; everything else is reported and the
    /// loop keeps going.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Spawn { .. } | Self::BrokenPipe(_) | Self::Cancelled | Self::Io(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
