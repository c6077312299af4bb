// value.rs - tagged value model for the host/script boundary

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A script-side value, host-side.
///
/// Every value crossing the boundary is modeled as one of these variants;
/// host objects never store untyped values themselves. Typed accessors on
/// bridged objects declare their concrete type once (at registration) and
/// the codec converts to and from `ScriptValue` at each crossing.
///
/// Strings are byte-counted on the script side; embedded NUL bytes survive
/// the crossing in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScriptValue {
    Nil,
    Bool(bool),
    Integer(i64),
    Number(f64),
    String(String),
    Array(Vec<ScriptValue>),
    Map(BTreeMap<String, ScriptValue>),
}

impl ScriptValue {
    /// Script-facing type name, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::Nil => "nil",
            ScriptValue::Bool(_) => "boolean",
            ScriptValue::Integer(_) => "integer",
            ScriptValue::Number(_) => "number",
            ScriptValue::String(_) => "string",
            ScriptValue::Array(_) => "array",
            ScriptValue::Map(_) => "map",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, ScriptValue::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScriptValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Exact integer view.
    ///
    /// Accepts `Integer` directly and `Number` only when it has no
    /// fractional part, so integer-typed parameters reject values like
    /// `1.5` instead of silently truncating them.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ScriptValue::Integer(i) => Some(*i),
            ScriptValue::Number(n) if n.fract() == 0.0 && n.is_finite() => {
                // i64::MAX is not exactly representable as f64; stay inside
                // the lossless window.
                if *n >= -(2f64.powi(63)) && *n < 2f64.powi(63) {
                    Some(*n as i64)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            ScriptValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[ScriptValue]> {
        match self {
            ScriptValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, ScriptValue>> {
        match self {
            ScriptValue::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn array(items: Vec<ScriptValue>) -> Self {
        ScriptValue::Array(items)
    }

    pub fn map<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, ScriptValue)>,
    {
        ScriptValue::Map(entries.into_iter().collect())
    }
}

impl fmt::Display for ScriptValue {
    /// Script-flavored rendering, matching what `print` shows.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Nil => write!(f, "nil"),
            ScriptValue::Bool(b) => write!(f, "{b}"),
            ScriptValue::Integer(i) => write!(f, "{i}"),
            ScriptValue::Number(n) => write!(f, "{n}"),
            ScriptValue::String(s) => write!(f, "{s}"),
            ScriptValue::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            ScriptValue::Map(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key} = {value}")?;
                }
                write!(f, "}}")
            }
        }
    }
}
