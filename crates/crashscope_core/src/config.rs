use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Result, ScopeError};

pub const DEFAULT_DEBUGGER: &str = "gdb";
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_STEPS: usize = 15;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_BACKLOG_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub struct ObservationConfig {
    /// Character budget for console/target/log stream text.
    pub stream_budget: usize,
    /// Lines shown on each side of the stopped line in the source excerpt.
    pub source_context: usize,
    /// Number of history entries rendered into the policy prompt.
    pub history_window: usize,
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            stream_budget: 4000,
            source_context: 5,
            history_window: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_consecutive_timeouts: u32,
    pub backoff: Duration,
    pub max_rejections: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_timeouts: 2,
            backoff: Duration::from_millis(250),
            max_rejections: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub target: PathBuf,
    pub target_args: Vec<String>,
    /// Explicit debugger binary; `None` resolves `gdb` from PATH.
    pub debugger: Option<PathBuf>,
    pub debugger_args: Vec<String>,
    pub command_timeout: Duration,
    /// Timeout for commands that resume the target (`exec-run`, `exec-continue`, ...).
    pub run_timeout: Duration,
    pub max_steps: usize,
    pub source_root: Option<PathBuf>,
    pub poll_interval: Duration,
    pub backlog_capacity: usize,
    pub auto_backtrace: bool,
    pub transcript_dir: Option<PathBuf>,
    /// History lines attached to fatal reports.
    pub report_tail: usize,
    pub observation: ObservationConfig,
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target: PathBuf::new(),
            target_args: Vec::new(),
            debugger: None,
            debugger_args: default_debugger_args(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            run_timeout: DEFAULT_RUN_TIMEOUT,
            max_steps: DEFAULT_MAX_STEPS,
            source_root: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            backlog_capacity: DEFAULT_BACKLOG_CAPACITY,
            auto_backtrace: true,
            transcript_dir: None,
            report_tail: 10,
            observation: ObservationConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

fn default_debugger_args() -> Vec<String> {
    vec![
        "--interpreter=mi3".to_string(),
        "--quiet".to_string(),
        "--nx".to_string(),
    ]
}

fn env_duration_ms(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

impl SessionConfig {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `CRASHSCOPE_*` environment variables.
    pub fn from_env(target: impl Into<PathBuf>) -> Self {
        let mut config = Self::new(target);

        if let Ok(debugger) = std::env::var("CRASHSCOPE_GDB") {
            config.debugger = Some(PathBuf::from(debugger));
        }
        if let Some(timeout) = env_duration_ms("CRASHSCOPE_TIMEOUT_MS") {
            config.command_timeout = timeout;
        }
        if let Some(timeout) = env_duration_ms("CRASHSCOPE_RUN_TIMEOUT_MS") {
            config.run_timeout = timeout;
        }
        if let Some(steps) = std::env::var("CRASHSCOPE_MAX_STEPS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            config.max_steps = steps;
        }
        if let Ok(root) = std::env::var("CRASHSCOPE_SOURCE_ROOT") {
            config.source_root = Some(PathBuf::from(root));
        }
        if let Ok(dir) = std::env::var("CRASHSCOPE_TRANSCRIPT_DIR") {
            config.transcript_dir = Some(PathBuf::from(dir));
        }

        config
    }

    /// Timeout for a verb: resuming commands get the longer run timeout.
    pub fn timeout_for(&self, verb: &str) -> Duration {
        if is_resuming_verb(verb) {
            self.run_timeout
        } else {
            self.command_timeout
        }
    }

    /// Resolves the debugger binary, searching PATH when no explicit path is set.
    pub fn resolve_debugger(&self) -> Result<PathBuf> {
        match &self.debugger {
            Some(path) if path.components().count() > 1 => {
                if path.is_file() {
                    Ok(path.clone())
                } else {
                    Err(ScopeError::spawn(
                        path.display().to_string(),
                        "debugger binary does not exist",
                    ))
                }
            }
            Some(name) => find_in_path(name).ok_or_else(|| {
                ScopeError::spawn(name.display().to_string(), "not found in PATH")
            }),
            None => find_in_path(Path::new(DEFAULT_DEBUGGER))
                .ok_or_else(|| ScopeError::spawn(DEFAULT_DEBUGGER, "not found in PATH")),
        }
    }

    pub fn check_target(&self) -> Result<()> {
        if self.target.as_os_str().is_empty() {
            return Err(ScopeError::spawn("target", "no target executable configured"));
        }
        if !self.target.is_file() {
            return Err(ScopeError::spawn(
                self.target.display().to_string(),
                "target executable does not exist",
            ));
        }
        Ok(())
    }
}

pub fn is_resuming_verb(verb: &str) -> bool {
    matches!(
        verb.trim_start_matches('-'),
        "exec-run"
            | "exec-continue"
            | "exec-next"
            | "exec-step"
            | "exec-finish"
            | "exec-next-instruction"
            | "exec-step-instruction"
            | "exec-until"
            | "exec-return"
    )
}

fn find_in_path(name: &Path) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.command_timeout, Duration::from_secs(10));
        assert_eq!(config.run_timeout, Duration::from_secs(30));
        assert_eq!(config.max_steps, 15);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.debugger_args[0], "--interpreter=mi3");
        assert!(config.auto_backtrace);
    }

    #[test]
    fn test_timeout_for_resuming_verbs() {
        let config = SessionConfig::new("/bin/true");
        assert_eq!(config.timeout_for("exec-run"), config.run_timeout);
        assert_eq!(config.timeout_for("-exec-continue"), config.run_timeout);
        assert_eq!(config.timeout_for("stack-list-frames"), config.command_timeout);
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("CRASHSCOPE_TIMEOUT_MS", "2500");
        std::env::set_var("CRASHSCOPE_MAX_STEPS", "30");

        let config = SessionConfig::from_env("/bin/true");
        assert_eq!(config.command_timeout, Duration::from_millis(2500));
        assert_eq!(config.max_steps, 30);
        assert_eq!(config.target, PathBuf::from("/bin/true"));

        std::env::remove_var("CRASHSCOPE_TIMEOUT_MS");
        std::env::remove_var("CRASHSCOPE_MAX_STEPS");
    }

    #[test]
    fn test_resolve_missing_debugger_is_spawn_error() {
        let mut config = SessionConfig::new("/bin/true");
        config.debugger = Some(PathBuf::from("/definitely/not/here/gdb"));
        let err = config.resolve_debugger().expect_err("missing binary must fail");
        assert!(matches!(err, ScopeError::Spawn { .. }));

        config.debugger = Some(PathBuf::from("no-such-debugger-binary-xyz"));
        let err = config.resolve_debugger().expect_err("unresolvable name must fail");
        assert!(err.to_string().contains("not found in PATH"));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_debugger_from_path() {
        let mut config = SessionConfig::new("/bin/true");
        config.debugger = Some(PathBuf::from("sh"));
        let resolved = config.resolve_debugger().expect("sh should be on PATH");
        assert!(resolved.ends_with("sh"));
    }

    #[test]
    fn test_check_target() {
        let config = SessionConfig::new("/definitely/not/a/target");
        assert!(matches!(
            config.check_target(),
            Err(ScopeError::Spawn { .. })
        ));
        assert!(SessionConfig::default().check_target().is_err());
    }
}
