use std::fmt;

use serde_json::{Map, Value};

/// A value in an MI payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiValue {
    Const(String),
    Tuple(Vec<(String, MiValue)>),
    List(Vec<MiValue>),
    /// A bracketed list whose items are `name=value` results, e.g. `stack=[frame={..},frame={..}]`.
    ResultList(Vec<(String, MiValue)>),
}

impl MiValue {
    pub fn empty_tuple() -> Self {
        Self::Tuple(Vec::new())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Const(s) => Some(s),
            _ => None,
        }
    }

    /// First entry named `key` in a tuple or result list.
    pub fn get(&self, key: &str) -> Option<&MiValue> {
        match self {
            Self::Tuple(entries) | Self::ResultList(entries) => entries
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MiValue::as_str)
    }

    /// Items of a list, ignoring result names for result lists.
    pub fn items(&self) -> Vec<&MiValue> {
        match self {
            Self::List(values) => values.iter().collect(),
            Self::ResultList(entries) => entries.iter().map(|(_, value)| value).collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Const(s) => s.is_empty(),
            Self::Tuple(entries) | Self::ResultList(entries) => entries.is_empty(),
            Self::List(values) => values.is_empty(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Const(s) => Value::String(s.clone()),
            Self::Tuple(entries) => {
                let mut map = Map::new();
                for (name, value) in entries {
                    // Repeated keys (rare in tuples) collapse into an array.
                    match map.get_mut(name) {
                        Some(Value::Array(existing)) => existing.push(value.to_json()),
                        Some(existing) => {
                            let first = existing.take();
                            *existing = Value::Array(vec![first, value.to_json()]);
                        }
                        None => {
                            map.insert(name.clone(), value.to_json());
                        }
                    }
                }
                Value::Object(map)
            }
            Self::List(values) => Value::Array(values.iter().map(MiValue::to_json).collect()),
            Self::ResultList(entries) => {
                Value::Array(entries.iter().map(|(_, value)| value.to_json()).collect())
            }
        }
    }
}

fn write_cstring(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            '\r' => f.write_str("\\r")?,
            c => write!(f, "{c}")?,
        }
    }
    f.write_str("\"")
}

fn write_results(f: &mut fmt::Formatter<'_>, entries: &[(String, MiValue)]) -> fmt::Result {
    for (i, (name, value)) in entries.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{name}={value}")?;
    }
    Ok(())
}

/// Renders the value back in MI syntax.
impl fmt::Display for MiValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Const(s) => write_cstring(f, s),
            Self::Tuple(entries) => {
                f.write_str("{")?;
                write_results(f, entries)?;
                f.write_str("}")
            }
            Self::List(values) => {
                f.write_str("[")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("]")
            }
            Self::ResultList(entries) => {
                f.write_str("[")?;
                write_results(f, entries)?;
                f.write_str("]")
            }
        }
    }
}
