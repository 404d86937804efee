use std::fmt;

/// A validated MI command without its token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiCommand {
    pub verb: String,
    pub args: String,
}

impl MiCommand {
    pub fn new(verb: impl Into<String>, args: impl Into<String>) -> Self {
        let verb: String = verb.into();
        Self {
            verb: verb.trim().trim_start_matches('-').to_string(),
            args: args.into().trim().to_string(),
        }
    }

    pub fn encode(&self, token: u64) -> String {
        encode(token, &self.verb, &self.args)
    }
}

impl fmt::Display for MiCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            write!(f, "-{}", self.verb)
        } else {
            write!(f, "-{} {}", self.verb, self.args)
        }
    }
}

/// `<token>-<verb> <args>\n`
pub fn encode(token: u64, verb: &str, args: &str) -> String {
    let verb = verb.trim().trim_start_matches('-');
    let args = args.trim();
    if args.is_empty() {
        format!("{token}-{verb}\n")
    } else {
        format!("{token}-{verb} {args}\n")
    }
}

/// Quotes an argument as an MI c-string when it contains spaces, quotes or
/// backslashes; plain words pass through unchanged.
pub fn quote_arg(arg: &str) -> String {
    let needs_quotes = arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\\');
    if !needs_quotes {
        return arg.to_string();
    }

    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\t' => quoted.push_str("\\t"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_formats_token_verb_and_args() {
        assert_eq!(encode(7, "exec-run", ""), "7-exec-run\n");
        assert_eq!(
            encode(8, "-data-evaluate-expression", "buffer"),
            "8-data-evaluate-expression buffer\n"
        );
        assert_eq!(encode(9, " stack-list-frames ", "  0 3 "), "9-stack-list-frames 0 3\n");
    }

    #[test]
    fn command_display_and_encode_agree() {
        let cmd = MiCommand::new("-break-insert", "main");
        assert_eq!(cmd.verb, "break-insert");
        assert_eq!(cmd.to_string(), "-break-insert main");
        assert_eq!(cmd.encode(3), "3-break-insert main\n");
        assert_eq!(MiCommand::new("exec-run", "").to_string(), "-exec-run");
    }

    #[test]
    fn quote_arg_only_quotes_when_needed() {
        assert_eq!(quote_arg("/tmp/a.out"), "/tmp/a.out");
        assert_eq!(quote_arg("/tmp/my dir/a.out"), "\"/tmp/my dir/a.out\"");
        assert_eq!(quote_arg(r#"say "hi""#), r#""say \"hi\"""#);
        assert_eq!(quote_arg(""), "\"\"");
    }
}
