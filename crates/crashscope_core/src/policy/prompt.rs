use std::fmt::Write as _;

use crate::observation::Observation;
use crate::state::HistoryEntry;

pub const INSTRUCTIONS: &str = "\
You are debugging a C/C++ program through GDB's Machine Interface (MI).
You get a bug description, the history of commands you already issued, and
an observation of the current debugger state.
Reply with exactly one MI command and nothing else, for example:
-exec-run
-break-insert main
-stack-list-frames
-stack-list-variables --simple-values
-data-evaluate-expression buffer
When you have found the root cause, reply with `DONE: <explanation>` naming
the faulty function, the line and what goes wrong there.";

/// User prompt for one step: bug, recent history, current observation.
pub fn build_prompt(
    bug_description: &str,
    observation: &Observation,
    history: &[HistoryEntry],
    window: usize,
) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Bug description: {bug_description}\n");

    prompt.push_str("Command history:\n");
    if history.is_empty() {
        prompt.push_str("(no commands executed yet)\n");
    } else {
        let start = history.len().saturating_sub(window);
        if start > 0 {
            let _ = writeln!(prompt, "({start} earlier steps omitted)");
        }
        for entry in &history[start..] {
            prompt.push_str(&entry.render());
            prompt.push('\n');
        }
    }

    prompt.push('\n');
    prompt.push_str(&observation.render());
    prompt.push_str("\nNext MI command:");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObservationConfig;
    use crate::observation::build_observation;
    use crate::state::SessionState;

    #[test]
    fn prompt_windows_history() {
        let state = SessionState::new("/nonexistent/a.out");
        let observation = build_observation(&state, &[], &ObservationConfig::default());
        let history: Vec<_> = (1..=5)
            .map(|step| HistoryEntry::new(step, format!("-exec-next #{step}"), true, "^running"))
            .collect();

        let prompt = build_prompt("crashes on long input", &observation, &history, 2);
        assert!(prompt.starts_with("Bug description: crashes on long input"));
        assert!(prompt.contains("(3 earlier steps omitted)"));
        assert!(prompt.contains("#4") && prompt.contains("#5"));
        assert!(!prompt.contains("#3"));
        assert!(prompt.contains("State: not started"));
        assert!(prompt.ends_with("Next MI command:"));
    }

    #[test]
    fn empty_history_is_stated() {
        let state = SessionState::new("/nonexistent/a.out");
        let observation = build_observation(&state, &[], &ObservationConfig::default());
        let prompt = build_prompt("bug", &observation, &[], 8);
        assert!(prompt.contains("(no commands executed yet)"));
    }
}
