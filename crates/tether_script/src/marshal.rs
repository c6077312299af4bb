//! Marshaling between the tagged value model and engine-native values,
//! plus classification of engine errors into the bridge taxonomy.
//!
//! This is the only module that converts `ScriptValue` to and from
//! `mlua::Value`; everything above it (dispatch tables, thunks, proxies)
//! works purely in `ScriptValue` terms.

use std::collections::BTreeMap;

use mlua::{Lua, MultiValue, Value};
use tracing::trace;

use tether_core::{ScriptError, ScriptValue};

/// Encode a tagged value onto the script side.
pub(crate) fn to_lua(lua: &Lua, value: &ScriptValue) -> mlua::Result<Value> {
    match value {
        ScriptValue::Nil => Ok(Value::Nil),
        ScriptValue::Bool(b) => Ok(Value::Boolean(*b)),
        ScriptValue::Integer(i) => Ok(Value::Integer(*i)),
        ScriptValue::Number(n) => Ok(Value::Number(*n)),
        // Script strings are byte-counted; embedded NULs survive.
        ScriptValue::String(s) => Ok(Value::String(lua.create_string(s.as_bytes())?)),
        ScriptValue::Array(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, to_lua(lua, item)?)?;
            }
            Ok(Value::Table(table))
        }
        ScriptValue::Map(entries) => {
            let table = lua.create_table()?;
            for (key, item) in entries {
                table.raw_set(key.as_str(), to_lua(lua, item)?)?;
            }
            Ok(Value::Table(table))
        }
    }
}

/// Decode an engine value into the tagged model.
///
/// Values with no host representation (functions, userdata, threads)
/// decode as nil; this is the documented encode-side contract applied in
/// reverse, not an error. Tables whose entries are exactly the sequence
/// `1..=#t` decode as arrays (an empty table is an empty array); other
/// tables decode as maps keeping only their string keys.
pub(crate) fn from_lua(value: &Value) -> ScriptValue {
    match value {
        Value::Nil => ScriptValue::Nil,
        Value::Boolean(b) => ScriptValue::Bool(*b),
        Value::Integer(i) => ScriptValue::Integer(*i),
        Value::Number(n) => ScriptValue::Number(*n),
        Value::String(s) => {
            ScriptValue::String(String::from_utf8_lossy(&s.as_bytes()).into_owned())
        }
        Value::Table(table) => {
            let len = table.raw_len() as usize;
            let mut entries = 0usize;
            let mut map = BTreeMap::new();
            let mut array = vec![ScriptValue::Nil; len];
            let mut sequential = true;
            for pair in table.clone().pairs::<Value, Value>() {
                let Ok((key, item)) = pair else { continue };
                entries += 1;
                match &key {
                    Value::Integer(i) if (1..=len as i64).contains(i) => {
                        array[(*i - 1) as usize] = from_lua(&item);
                    }
                    Value::String(s) => {
                        sequential = false;
                        let key = String::from_utf8_lossy(&s.as_bytes()).into_owned();
                        map.insert(key, from_lua(&item));
                    }
                    _ => {
                        sequential = false;
                        trace!("dropping table entry with unsupported key type");
                    }
                }
            }
            if sequential && entries == len {
                ScriptValue::Array(array)
            } else {
                ScriptValue::Map(map)
            }
        }
        other => {
            trace!(kind = lua_type_name(other), "value has no host representation, decoding as nil");
            ScriptValue::Nil
        }
    }
}

/// Convert an argument pack, in call order.
pub(crate) fn from_multi(args: MultiValue) -> Vec<ScriptValue> {
    args.into_iter().map(|v| from_lua(&v)).collect()
}

pub(crate) fn lua_type_name(value: &Value) -> &'static str {
    match value {
        Value::Nil => "nil",
        Value::Boolean(_) => "boolean",
        Value::Integer(_) => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Table(_) => "table",
        Value::Function(_) => "function",
        Value::UserData(_) => "userdata",
        Value::Thread(_) => "thread",
        _ => "unknown",
    }
}

/// Raise a bridge error through the engine's native mechanism, at the
/// boundary crossing closest to the cause, so script-level `pcall` can
/// intercept it.
pub(crate) fn raise(err: ScriptError) -> mlua::Error {
    mlua::Error::external(err)
}

/// Classify an engine error into the bridge taxonomy.
///
/// Bridge errors that round-tripped through the engine (raised by a thunk,
/// caught crossing back to the host) are recovered as their original typed
/// value rather than re-wrapped as opaque runtime errors.
pub(crate) fn classify(err: mlua::Error) -> ScriptError {
    match err {
        mlua::Error::SyntaxError { message, .. } => ScriptError::Syntax {
            line: syntax_line(&message),
            message,
        },
        mlua::Error::MemoryError(message) => ScriptError::AllocationFailure { message },
        mlua::Error::CallbackError { cause, .. } => classify((*cause).clone()),
        mlua::Error::WithContext { cause, .. } => classify((*cause).clone()),
        mlua::Error::BadArgument { cause, .. } => classify((*cause).clone()),
        mlua::Error::ExternalError(inner) => {
            match inner.downcast_ref::<ScriptError>() {
                Some(script_err) => script_err.clone(),
                None => ScriptError::Runtime { message: inner.to_string() },
            }
        }
        mlua::Error::RuntimeError(message) => ScriptError::Runtime { message },
        other => ScriptError::Runtime { message: other.to_string() },
    }
}

/// Extract the `:<line>:` component from an engine syntax message.
fn syntax_line(message: &str) -> u32 {
    for (i, _) in message.match_indices(':') {
        let rest = &message[i + 1..];
        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if digits > 0 && rest[digits..].starts_with(':') {
            if let Ok(line) = rest[..digits].parse() {
                return line;
            }
        }
    }
    0
}
