use std::collections::BTreeSet;

use thiserror::Error;

use super::Action;
use crate::mi::MiCommand;

pub const DEFAULT_ALLOWED_VERBS: &[&str] = &[
    "exec-run",
    "exec-continue",
    "exec-next",
    "exec-step",
    "exec-finish",
    "exec-next-instruction",
    "exec-step-instruction",
    "stack-list-frames",
    "stack-select-frame",
    "stack-info-frame",
    "stack-list-variables",
    "stack-list-locals",
    "stack-list-arguments",
    "data-evaluate-expression",
    "data-list-register-values",
    "break-insert",
    "break-list",
    "break-delete",
    "thread-info",
    "thread-select",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Disallowed command '{input}': {reason}")]
pub struct DisallowedCommand {
    pub input: String,
    pub reason: String,
}

impl DisallowedCommand {
    pub fn new(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

/// Verbs the policy may issue. Checked before anything reaches the debugger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allowlist {
    verbs: BTreeSet<String>,
}

impl Default for Allowlist {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_VERBS.iter().copied())
    }
}

impl Allowlist {
    pub fn new<I, S>(verbs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            verbs: verbs
                .into_iter()
                .map(|verb| verb.into().trim_start_matches('-').to_string())
                .collect(),
        }
    }

    pub fn allow(mut self, verb: impl Into<String>) -> Self {
        self.verbs.insert(verb.into().trim_start_matches('-').to_string());
        self
    }

    pub fn allows(&self, verb: &str) -> bool {
        self.verbs.contains(verb.trim_start_matches('-'))
    }

    pub fn verbs(&self) -> impl Iterator<Item = &str> {
        self.verbs.iter().map(String::as_str)
    }

    pub fn validate(&self, action: &Action) -> Result<MiCommand, DisallowedCommand> {
        match action.to_command() {
            Some(command) => self.validate_command(&command),
            None => Err(DisallowedCommand::new(
                "conclude",
                "a conclusion is not a debugger command",
            )),
        }
    }

    pub fn validate_command(&self, command: &MiCommand) -> Result<MiCommand, DisallowedCommand> {
        let input = command.to_string();
        let verb = command.verb.as_str();

        if verb.is_empty() {
            return Err(DisallowedCommand::new(input, "empty verb"));
        }
        if !verb
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(DisallowedCommand::new(
                input,
                "verb contains characters outside [a-z0-9-]",
            ));
        }
        if command.args.chars().any(char::is_control) {
            return Err(DisallowedCommand::new(input, "arguments contain control characters"));
        }
        if !self.allows(verb) {
            return Err(DisallowedCommand::new(
                input,
                format!("'{verb}' is not an allowed command"),
            ));
        }
        Ok(command.clone())
    }
}
