use thiserror::Error;

use super::record::{AsyncRecord, MiResult, Record, ResultClass};
use super::MiValue;

/// Nesting guard so a hostile line cannot overflow the stack.
const MAX_NESTING: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason} at column {column}: {line}")]
pub struct ProtocolParseError {
    pub line: String,
    pub column: usize,
    pub reason: String,
}

/// Parses one line of debugger output.
///
/// Returns `Ok(None)` for the `(gdb)` prompt and blank lines.
pub fn parse_line(line: &str) -> Result<Option<Record>, ProtocolParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed == "(gdb)" {
        return Ok(None);
    }

    let mut cursor = Cursor::new(line);
    cursor.parse_record().map(Some)
}

struct Cursor<'a> {
    line: &'a str,
    bytes: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Cursor<'a> {
    fn new(line: &'a str) -> Self {
        Self {
            line,
            bytes: line.as_bytes(),
            pos: 0,
            depth: 0,
        }
    }

    fn error(&self, reason: impl Into<String>) -> ProtocolParseError {
        ProtocolParseError {
            line: self.line.to_string(),
            column: self.pos,
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn expect(&mut self, expected: u8) -> Result<(), ProtocolParseError> {
        match self.bump() {
            Some(byte) if byte == expected => Ok(()),
            Some(byte) => {
                self.pos -= 1;
                Err(self.error(format!(
                    "expected '{}', found '{}'",
                    expected as char, byte as char
                )))
            }
            None => Err(self.error(format!("expected '{}', found end of line", expected as char))),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn parse_record(&mut self) -> Result<Record, ProtocolParseError> {
        let token = self.parse_token()?;
        let prefix = self
            .bump()
            .ok_or_else(|| self.error("missing record prefix"))?;

        match prefix {
            b'^' => {
                let class_name = self.parse_class()?;
                let class = ResultClass::parse(class_name).ok_or_else(|| {
                    self.error(format!("unknown result class '{class_name}'"))
                })?;
                let payload = self.parse_tail()?;
                Ok(Record::Result(MiResult {
                    token,
                    class,
                    payload,
                }))
            }
            b'*' | b'+' | b'=' => {
                let class = self.parse_class()?.to_string();
                let payload = self.parse_tail()?;
                let record = AsyncRecord {
                    token,
                    class,
                    payload,
                };
                Ok(match prefix {
                    b'*' => Record::AsyncExec(record),
                    b'+' => Record::AsyncStatus(record),
                    _ => Record::AsyncNotify(record),
                })
            }
            b'~' | b'@' | b'&' => {
                if token.is_some() {
                    self.pos -= 1;
                    return Err(self.error("stream records cannot carry a token"));
                }
                let text = self.parse_cstring()?;
                if !self.at_end() {
                    return Err(self.error("trailing characters after stream record"));
                }
                Ok(match prefix {
                    b'~' => Record::ConsoleStream(text),
                    b'@' => Record::TargetStream(text),
                    _ => Record::LogStream(text),
                })
            }
            other => {
                self.pos -= 1;
                Err(self.error(format!("unrecognized record prefix '{}'", other as char)))
            }
        }
    }

    fn parse_token(&mut self) -> Result<Option<u64>, ProtocolParseError> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if start == self.pos {
            return Ok(None);
        }
        self.line[start..self.pos]
            .parse::<u64>()
            .map(Some)
            .map_err(|e| self.error(format!("invalid token: {e}")))
    }

    fn parse_class(&mut self) -> Result<&'a str, ProtocolParseError> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || b == b'-' || b == b'_') {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("missing record class"));
        }
        let line = self.line;
        Ok(&line[start..self.pos])
    }

    /// `("," result)*` up to the end of the line, as a tuple.
    fn parse_tail(&mut self) -> Result<MiValue, ProtocolParseError> {
        let mut entries = Vec::new();
        while !self.at_end() {
            self.expect(b',')?;
            entries.push(self.parse_result()?);
        }
        Ok(MiValue::Tuple(entries))
    }

    fn parse_result(&mut self) -> Result<(String, MiValue), ProtocolParseError> {
        let name = self.parse_variable()?;
        self.expect(b'=')?;
        let value = self.parse_value()?;
        Ok((name, value))
    }

    fn parse_variable(&mut self) -> Result<String, ProtocolParseError> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if !matches!(b, b'=' | b',' | b'{' | b'}' | b'[' | b']' | b'"')) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected variable name"));
        }
        Ok(self.line[start..self.pos].to_string())
    }

    fn parse_value(&mut self) -> Result<MiValue, ProtocolParseError> {
        match self.peek() {
            Some(b'"') => self.parse_cstring().map(MiValue::Const),
            Some(b'{') => self.nested(Self::parse_tuple),
            Some(b'[') => self.nested(Self::parse_list),
            Some(other) => Err(self.error(format!("unexpected '{}' where a value was expected", other as char))),
            None => Err(self.error("unexpected end of line where a value was expected")),
        }
    }

    fn nested(
        &mut self,
        parse: fn(&mut Self) -> Result<MiValue, ProtocolParseError>,
    ) -> Result<MiValue, ProtocolParseError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error("nesting too deep"));
        }
        self.depth += 1;
        let value = parse(self);
        self.depth -= 1;
        value
    }

    fn parse_tuple(&mut self) -> Result<MiValue, ProtocolParseError> {
        self.expect(b'{')?;
        let mut entries = Vec::new();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(MiValue::Tuple(entries));
        }
        loop {
            entries.push(self.parse_result()?);
            match self.bump() {
                Some(b',') => continue,
                Some(b'}') => return Ok(MiValue::Tuple(entries)),
                Some(other) => {
                    self.pos -= 1;
                    return Err(self.error(format!("expected ',' or '}}' in tuple, found '{}'", other as char)));
                }
                None => return Err(self.error("unterminated tuple")),
            }
        }
    }

    fn parse_list(&mut self) -> Result<MiValue, ProtocolParseError> {
        self.expect(b'[')?;
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(MiValue::List(Vec::new()));
        }

        let holds_values = matches!(self.peek(), Some(b'"' | b'{' | b'['));
        if holds_values {
            let mut values = Vec::new();
            loop {
                values.push(self.parse_value()?);
                if self.close_or_continue(b']')? {
                    return Ok(MiValue::List(values));
                }
            }
        }

        let mut entries = Vec::new();
        loop {
            entries.push(self.parse_result()?);
            if self.close_or_continue(b']')? {
                return Ok(MiValue::ResultList(entries));
            }
        }
    }

    /// Consumes `,` (returns false) or the closing byte (returns true).
    fn close_or_continue(&mut self, close: u8) -> Result<bool, ProtocolParseError> {
        match self.bump() {
            Some(b',') => Ok(false),
            Some(byte) if byte == close => Ok(true),
            Some(other) => {
                self.pos -= 1;
                Err(self.error(format!(
                    "expected ',' or '{}', found '{}'",
                    close as char, other as char
                )))
            }
            None => Err(self.error("unterminated list")),
        }
    }

    fn parse_cstring(&mut self) -> Result<String, ProtocolParseError> {
        self.expect(b'"')?;
        let mut out: Vec<u8> = Vec::new();
        loop {
            let byte = self
                .bump()
                .ok_or_else(|| self.error("unterminated string"))?;
            match byte {
                b'"' => break,
                b'\\' => {
                    let escaped = self
                        .bump()
                        .ok_or_else(|| self.error("dangling escape at end of line"))?;
                    match escaped {
                        b'n' => out.push(b'\n'),
                        b't' => out.push(b'\t'),
                        b'r' => out.push(b'\r'),
                        b'e' => out.push(0x1b),
                        b'a' => out.push(0x07),
                        b'b' => out.push(0x08),
                        b'f' => out.push(0x0c),
                        b'v' => out.push(0x0b),
                        b'0'..=b'7' => {
                            let mut code = u32::from(escaped - b'0');
                            for _ in 0..2 {
                                match self.peek() {
                                    Some(digit @ b'0'..=b'7') => {
                                        code = code * 8 + u32::from(digit - b'0');
                                        self.pos += 1;
                                    }
                                    _ => break,
                                }
                            }
                            out.push((code & 0xff) as u8);
                        }
                        // \" \\ and anything unknown map to the character itself.
                        other => out.push(other),
                    }
                }
                other => out.push(other),
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}
