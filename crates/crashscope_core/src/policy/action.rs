use serde::Serialize;

use super::DisallowedCommand;
use crate::mi::MiCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InspectKind {
    Expression,
    Locals,
    Backtrace,
    Frame,
}

/// What the policy asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    RunCommand { verb: String, args: String },
    Inspect { kind: InspectKind, target: String },
    Conclude { summary: String },
}

impl Action {
    /// The MI command this action maps to; `None` for `Conclude`.
    pub fn to_command(&self) -> Option<MiCommand> {
        match self {
            Self::RunCommand { verb, args } => Some(MiCommand::new(verb.as_str(), args.as_str())),
            Self::Inspect { kind, target } => Some(match kind {
                InspectKind::Expression => MiCommand::new("data-evaluate-expression", target.as_str()),
                InspectKind::Locals if target.is_empty() => {
                    MiCommand::new("stack-list-variables", "--simple-values")
                }
                InspectKind::Locals => MiCommand::new("stack-list-variables", target.as_str()),
                InspectKind::Backtrace => MiCommand::new("stack-list-frames", target.as_str()),
                InspectKind::Frame => MiCommand::new("stack-info-frame", target.as_str()),
            }),
            Self::Conclude { .. } => None,
        }
    }

    pub fn is_conclude(&self) -> bool {
        matches!(self, Self::Conclude { .. })
    }
}

const CONCLUDE_PREFIXES: &[&str] = &["DONE", "CONCLUDE", "CONCLUSION", "FINAL ANSWER"];

/// Turns free policy text into an [`Action`].
///
/// Accepts the command alone or wrapped in backticks or a code fence, with
/// or without the leading `-`. `DONE`, `DONE: <summary>` and
/// `CONCLUDE: <summary>` conclude the session; text after the marker line
/// is part of the summary.
pub fn parse_action(text: &str) -> Result<Action, DisallowedCommand> {
    let lines: Vec<&str> = text
        .lines()
        .map(clean_line)
        .filter(|line| !line.is_empty() && !line.starts_with("```"))
        .collect();

    if lines.is_empty() {
        return Err(DisallowedCommand::new(text, "empty response"));
    }

    for (i, line) in lines.iter().enumerate() {
        if let Some(summary) = conclude_summary(line) {
            let mut summary = summary.to_string();
            for rest in &lines[i + 1..] {
                if !summary.is_empty() {
                    summary.push('\n');
                }
                summary.push_str(rest);
            }
            return Ok(Action::Conclude { summary });
        }
    }

    // Prefer the first line that looks like an MI command.
    let command = lines
        .iter()
        .find(|line| line.starts_with('-'))
        .unwrap_or(&lines[0]);
    let command = command.trim_start_matches('-').trim();
    let (verb, args) = match command.split_once(char::is_whitespace) {
        Some((verb, args)) => (verb, args.trim()),
        None => (command, ""),
    };
    if verb.is_empty() {
        return Err(DisallowedCommand::new(text, "no command found"));
    }

    Ok(match verb {
        "data-evaluate-expression" => Action::Inspect {
            kind: InspectKind::Expression,
            target: args.to_string(),
        },
        "stack-list-variables" | "stack-list-locals" => Action::Inspect {
            kind: InspectKind::Locals,
            target: args.to_string(),
        },
        "stack-list-frames" => Action::Inspect {
            kind: InspectKind::Backtrace,
            target: args.to_string(),
        },
        "stack-info-frame" => Action::Inspect {
            kind: InspectKind::Frame,
            target: args.to_string(),
        },
        _ => Action::RunCommand {
            verb: verb.to_string(),
            args: args.to_string(),
        },
    })
}

fn clean_line(line: &str) -> &str {
    let line = line.trim();
    if line.starts_with("```") {
        return line;
    }
    line.trim_matches('`').trim()
}

fn conclude_summary(line: &str) -> Option<&str> {
    let upper = line.to_ascii_uppercase();
    CONCLUDE_PREFIXES.iter().find_map(|prefix| {
        if !upper.starts_with(prefix) {
            return None;
        }
        let rest = &line[prefix.len()..];
        if rest.is_empty() {
            Some("")
        } else if let Some(summary) = rest.strip_prefix(':') {
            Some(summary.trim())
        } else {
            None
        }
    })
}
