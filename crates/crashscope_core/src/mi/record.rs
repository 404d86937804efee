use std::fmt;

use super::MiValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

impl ResultClass {
    pub fn parse(class: &str) -> Option<Self> {
        match class {
            "done" => Some(Self::Done),
            "running" => Some(Self::Running),
            "connected" => Some(Self::Connected),
            "error" => Some(Self::Error),
            "exit" => Some(Self::Exit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Running => "running",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Exit => "exit",
        }
    }
}

/// A `^` result record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiResult {
    pub token: Option<u64>,
    pub class: ResultClass,
    pub payload: MiValue,
}

impl MiResult {
    /// The `msg` field of an `^error` record.
    pub fn error_message(&self) -> Option<&str> {
        match self.class {
            ResultClass::Error => Some(self.payload.get_str("msg").unwrap_or("unknown error")),
            _ => None,
        }
    }
}

/// A `*`, `+` or `=` out-of-band record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncRecord {
    pub token: Option<u64>,
    pub class: String,
    pub payload: MiValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Result(MiResult),
    AsyncExec(AsyncRecord),
    AsyncStatus(AsyncRecord),
    AsyncNotify(AsyncRecord),
    ConsoleStream(String),
    TargetStream(String),
    LogStream(String),
}

impl Record {
    pub fn token(&self) -> Option<u64> {
        match self {
            Self::Result(r) => r.token,
            Self::AsyncExec(r) | Self::AsyncStatus(r) | Self::AsyncNotify(r) => r.token,
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Result(_) => "result",
            Self::AsyncExec(_) => "exec",
            Self::AsyncStatus(_) => "status",
            Self::AsyncNotify(_) => "notify",
            Self::ConsoleStream(_) => "console",
            Self::TargetStream(_) => "target",
            Self::LogStream(_) => "log",
        }
    }

    /// The payload of a `*stopped` record.
    pub fn as_stop(&self) -> Option<&MiValue> {
        match self {
            Self::AsyncExec(r) if r.class == "stopped" => Some(&r.payload),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::AsyncExec(r) if r.class == "running")
    }

    pub fn stream_text(&self) -> Option<&str> {
        match self {
            Self::ConsoleStream(text) | Self::TargetStream(text) | Self::LogStream(text) => {
                Some(text)
            }
            _ => None,
        }
    }
}

fn write_token(f: &mut fmt::Formatter<'_>, token: Option<u64>) -> fmt::Result {
    match token {
        Some(token) => write!(f, "{token}"),
        None => Ok(()),
    }
}

fn write_class(f: &mut fmt::Formatter<'_>, class: &str, payload: &MiValue) -> fmt::Result {
    f.write_str(class)?;
    if let MiValue::Tuple(entries) = payload {
        for (name, value) in entries {
            write!(f, ",{name}={value}")?;
        }
    }
    Ok(())
}

/// Renders the record back as an MI output line (without the newline).
impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Result(r) => {
                write_token(f, r.token)?;
                f.write_str("^")?;
                write_class(f, r.class.as_str(), &r.payload)
            }
            Self::AsyncExec(r) => {
                write_token(f, r.token)?;
                f.write_str("*")?;
                write_class(f, &r.class, &r.payload)
            }
            Self::AsyncStatus(r) => {
                write_token(f, r.token)?;
                f.write_str("+")?;
                write_class(f, &r.class, &r.payload)
            }
            Self::AsyncNotify(r) => {
                write_token(f, r.token)?;
                f.write_str("=")?;
                write_class(f, &r.class, &r.payload)
            }
            Self::ConsoleStream(text) => write!(f, "~{}", MiValue::Const(text.clone())),
            Self::TargetStream(text) => write!(f, "@{}", MiValue::Const(text.clone())),
            Self::LogStream(text) => write!(f, "&{}", MiValue::Const(text.clone())),
        }
    }
}
