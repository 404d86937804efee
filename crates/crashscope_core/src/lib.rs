//! Crashscope Core
//!
//! An async engine that drives GDB through its Machine Interface (MI) and feeds
//! the resulting state to a reasoning policy in an observe/act loop.
//! Provides the subprocess transport, MI codec, command correlation, session
//! state, observation building, the policy boundary and the session driver.

pub mod backtrace;
pub mod config;
pub mod controller;
pub mod correlator;
pub mod driver;
pub mod error;
pub mod events;
pub mod mi;
pub mod observation;
pub mod policy;
pub mod state;
pub mod transcript;
pub mod transport;

// Re-export commonly used types
pub use config::SessionConfig;
pub use controller::Controller;
pub use driver::{Outcome, SessionDriver, SessionReport};
pub use error::ScopeError;
pub use events::{EventKind, EventStream, SessionEvent};
pub use observation::Observation;
pub use policy::{Action, Policy};
pub use transport::Transport;

/// Result type alias using ScopeError
pub type Result<T> = std::result::Result<T, ScopeError>;
