use std::fmt;

use serde::Serialize;

use crate::mi::MiValue;
use crate::{Result, ScopeError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackFrame {
    pub level: u32,
    pub function: String,
    pub file: Option<String>,
    pub fullname: Option<String>,
    pub line: Option<u32>,
    pub address: Option<String>,
    /// Shared object for frames without debug info.
    pub library: Option<String>,
}

impl StackFrame {
    /// `file:line` when the frame has source information.
    pub fn location(&self) -> Option<String> {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => Some(format!("{file}:{line}")),
            (Some(file), None) => Some(file.clone()),
            _ => None,
        }
    }
}

/// `0: cause_crash (test_1.c:7)`
impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.level, self.function)?;
        if let Some(location) = self.location() {
            write!(f, " ({location})")
        } else if let Some(library) = &self.library {
            write!(f, " (from {library})")
        } else if let Some(address) = &self.address {
            write!(f, " ({address})")
        } else {
            Ok(())
        }
    }
}

/// Frames ordered innermost first, levels contiguous from 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Backtrace {
    frames: Vec<StackFrame>,
}

impl Backtrace {
    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub fn innermost(&self) -> Option<&StackFrame> {
        self.frames.first()
    }

    /// Innermost frame that has source information.
    pub fn first_with_source(&self) -> Option<&StackFrame> {
        self.frames.iter().find(|frame| frame.file.is_some() && frame.line.is_some())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn render(&self) -> String {
        self.frames
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Builds a backtrace from a `-stack-list-frames` result payload.
///
/// Fails with [`ScopeError::MalformedBacktrace`] when the `stack` field is
/// missing, a frame has no parseable level, or levels are not `0..N-1`.
pub fn parse_backtrace(payload: &MiValue) -> Result<Backtrace> {
    let stack = payload
        .get("stack")
        .ok_or_else(|| ScopeError::MalformedBacktrace("result has no stack field".to_string()))?;

    let frames = stack
        .items()
        .into_iter()
        .map(parse_frame)
        .collect::<Result<Vec<_>>>()?;

    for (expected, frame) in frames.iter().enumerate() {
        if frame.level as usize != expected {
            return Err(ScopeError::MalformedBacktrace(format!(
                "expected frame level {expected}, found {}",
                frame.level
            )));
        }
    }

    Ok(Backtrace { frames })
}

pub fn parse_frame(frame: &MiValue) -> Result<StackFrame> {
    let level = frame
        .get_str("level")
        .ok_or_else(|| ScopeError::MalformedBacktrace(format!("frame without level: {frame}")))?;
    let level = level.parse::<u32>().map_err(|_| {
        ScopeError::MalformedBacktrace(format!("frame level is not a number: '{level}'"))
    })?;

    Ok(StackFrame {
        level,
        function: frame.get_str("func").unwrap_or("??").to_string(),
        file: frame.get_str("file").map(str::to_string),
        fullname: frame.get_str("fullname").map(str::to_string),
        line: frame.get_str("line").and_then(|l| l.parse().ok()),
        address: frame.get_str("addr").map(str::to_string),
        library: frame.get_str("from").map(str::to_string),
    })
}
