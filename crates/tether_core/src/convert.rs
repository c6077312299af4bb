//! Named custom converters.
//!
//! Converters translate between a flat script representation (usually a
//! string) and a structured one, and are looked up by name at runtime and
//! applied explicitly. They sit outside the typed codec: the codec handles
//! shapes the type system knows about, converters handle conventions
//! ("2024-06-01" is a date, "https://host/x" is a URL) that only a call
//! site can assert.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{Position, ScriptError, ScriptResult};
use crate::value::ScriptValue;

type ConvertFn = Box<dyn Fn(&ScriptValue) -> ScriptResult<ScriptValue>>;

struct Converter {
    parse: ConvertFn,
    format: ConvertFn,
}

/// Registry of named converters. Per runtime instance, populated with the
/// built-ins (`date`, `url`) and extended by host code.
pub struct ConverterRegistry {
    converters: HashMap<String, Converter>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self { converters: HashMap::new() }
    }

    /// Registry pre-populated with the `date` and `url` converters.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("date", parse_date, format_date);
        registry.register("url", parse_url, format_url);
        registry
    }

    /// Register (or replace) a converter under `name`.
    ///
    /// `parse` maps the flat script form to the structured form; `format`
    /// is the reverse direction.
    pub fn register<P, F>(&mut self, name: impl Into<String>, parse: P, format: F)
    where
        P: Fn(&ScriptValue) -> ScriptResult<ScriptValue> + 'static,
        F: Fn(&ScriptValue) -> ScriptResult<ScriptValue> + 'static,
    {
        let name = name.into();
        debug!(converter = %name, "registered value converter");
        self.converters.insert(
            name,
            Converter { parse: Box::new(parse), format: Box::new(format) },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.converters.contains_key(name)
    }

    /// Flat form to structured form.
    pub fn parse(&self, name: &str, value: &ScriptValue) -> ScriptResult<ScriptValue> {
        let converter = self.lookup(name)?;
        (converter.parse)(value)
    }

    /// Structured form back to flat form.
    pub fn format(&self, name: &str, value: &ScriptValue) -> ScriptResult<ScriptValue> {
        let converter = self.lookup(name)?;
        (converter.format)(value)
    }

    fn lookup(&self, name: &str) -> ScriptResult<&Converter> {
        self.converters
            .get(name)
            .ok_or_else(|| ScriptError::runtime(format!("no converter named '{name}'")))
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn mismatch(name: &str, expected: &str, value: &ScriptValue) -> ScriptError {
    ScriptError::mismatch(expected, value.type_name(), Position::Converter(name.into()))
}

/* ------------------------------ date ------------------------------ */

// "YYYY-MM-DD" <-> { year, month, day }

fn parse_date(value: &ScriptValue) -> ScriptResult<ScriptValue> {
    let text = value
        .as_str()
        .ok_or_else(|| mismatch("date", "string", value))?;

    let bad = || ScriptError::runtime(format!("'{text}' is not a YYYY-MM-DD date"));

    let bytes = text.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return Err(bad());
    }
    let year: i64 = text[0..4].parse().map_err(|_| bad())?;
    let month: i64 = text[5..7].parse().map_err(|_| bad())?;
    let day: i64 = text[8..10].parse().map_err(|_| bad())?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err(bad());
    }

    Ok(ScriptValue::map([
        ("year".to_string(), ScriptValue::Integer(year)),
        ("month".to_string(), ScriptValue::Integer(month)),
        ("day".to_string(), ScriptValue::Integer(day)),
    ]))
}

fn format_date(value: &ScriptValue) -> ScriptResult<ScriptValue> {
    let map = value
        .as_map()
        .ok_or_else(|| mismatch("date", "map", value))?;
    let field = |key: &str| -> ScriptResult<i64> {
        map.get(key)
            .and_then(ScriptValue::as_integer)
            .ok_or_else(|| ScriptError::runtime(format!("date map is missing integer field '{key}'")))
    };
    let (year, month, day) = (field("year")?, field("month")?, field("day")?);
    Ok(ScriptValue::String(format!("{year:04}-{month:02}-{day:02}")))
}

/* ------------------------------ url ------------------------------- */

// "scheme://host/path" <-> { scheme, host, path }

fn parse_url(value: &ScriptValue) -> ScriptResult<ScriptValue> {
    let text = value
        .as_str()
        .ok_or_else(|| mismatch("url", "string", value))?;

    let (scheme, rest) = text
        .split_once("://")
        .ok_or_else(|| ScriptError::runtime(format!("'{text}' is not a URL")))?;
    if scheme.is_empty() || rest.is_empty() {
        return Err(ScriptError::runtime(format!("'{text}' is not a URL")));
    }
    let (host, path) = match rest.split_once('/') {
        Some((host, tail)) => (host, format!("/{tail}")),
        None => (rest, "/".to_string()),
    };

    Ok(ScriptValue::map([
        ("scheme".to_string(), ScriptValue::String(scheme.into())),
        ("host".to_string(), ScriptValue::String(host.into())),
        ("path".to_string(), ScriptValue::String(path)),
    ]))
}

fn format_url(value: &ScriptValue) -> ScriptResult<ScriptValue> {
    let map = value
        .as_map()
        .ok_or_else(|| mismatch("url", "map", value))?;
    let field = |key: &str| -> ScriptResult<&str> {
        map.get(key)
            .and_then(ScriptValue::as_str)
            .ok_or_else(|| ScriptError::runtime(format!("url map is missing string field '{key}'")))
    };
    Ok(ScriptValue::String(format!(
        "{}://{}{}",
        field("scheme")?,
        field("host")?,
        field("path")?
    )))
}
