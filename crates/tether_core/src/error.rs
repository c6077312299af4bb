use std::fmt;
use thiserror::Error;

/// Where in a boundary crossing a value conversion was attempted.
///
/// Carried by [`ScriptError::TypeMismatch`] so diagnostics can point at the
/// exact argument, property, or element that failed to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Position {
    /// Positional call argument (1-based, matching script-side convention).
    Argument { index: usize, name: Option<String> },
    /// A declared property on a bridged object.
    Property(String),
    /// One element of a bridged collection property.
    Element { property: String, index: usize },
    /// The value returned by an executed chunk or called function.
    ReturnValue,
    /// A script global.
    Global(String),
    /// Input to a named custom converter.
    Converter(String),
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Argument { index, name: Some(name) } => {
                write!(f, "argument {index} ('{name}')")
            }
            Position::Argument { index, name: None } => write!(f, "argument {index}"),
            Position::Property(name) => write!(f, "property '{name}'"),
            Position::Element { property, index } => {
                write!(f, "element {index} of '{property}'")
            }
            Position::ReturnValue => write!(f, "return value"),
            Position::Global(name) => write!(f, "global '{name}'"),
            Position::Converter(name) => write!(f, "converter '{name}'"),
        }
    }
}

/// Errors surfaced by the bridge to host code.
///
/// Every failure mode crossing the host/script boundary is classified into
/// one of these. Script-side, the same values are raised through the
/// engine's native error mechanism so `pcall` can intercept them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    /// Script text failed to parse.
    #[error("syntax error at line {line}: {message}")]
    Syntax { line: u32, message: String },

    /// Script raised an error during execution.
    #[error("runtime error: {message}")]
    Runtime { message: String },

    /// A value could not be decoded to the declared host type.
    #[error("type mismatch at {position}: expected {expected}, found {actual}")]
    TypeMismatch {
        expected: String,
        actual: String,
        position: Position,
    },

    /// A bridged callable received fewer arguments than its declared arity.
    #[error("wrong argument count: expected {expected}, received {actual}")]
    ArgumentCount { expected: usize, actual: usize },

    /// A `will_change` hook or collection validator vetoed a mutation.
    #[error("validation rejected for property '{property}': {reason}")]
    ValidationRejected { property: String, reason: String },

    /// The embedded engine could not be created or ran out of memory.
    /// Fatal to the affected runtime instance.
    #[error("script engine allocation failure: {message}")]
    AllocationFailure { message: String },

    /// A bridged method was called with a receiver that is not a handle of
    /// the expected class.
    #[error("invalid receiver: expected a '{expected}' handle")]
    InvalidReceiver { expected: String },

    /// The call trampoline was handed something that is not a live bridged
    /// callable (missing id, or its slot was already finalized).
    #[error("invalid callable: not a live bridged function")]
    InvalidCallable,

    /// A handle referenced a host object slot that was already released.
    #[error("stale handle: host object was released")]
    StaleHandle,

    /// A collection index outside the valid range.
    #[error("index {index} out of bounds for collection of length {len}")]
    Bounds { index: i64, len: usize },
}

impl ScriptError {
    /// Positional type-mismatch constructor used throughout the codec path.
    pub fn mismatch(
        expected: impl Into<String>,
        actual: impl Into<String>,
        position: Position,
    ) -> Self {
        ScriptError::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
            position,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        ScriptError::Runtime { message: message.into() }
    }
}

pub type ScriptResult<T> = Result<T, ScriptError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_message_names_position() {
        let err = ScriptError::mismatch(
            "integer",
            "string",
            Position::Argument { index: 2, name: Some("count".into()) },
        );
        assert_eq!(
            err.to_string(),
            "type mismatch at argument 2 ('count'): expected integer, found string"
        );
    }

    #[test]
    fn validation_message_carries_reason_verbatim() {
        let err = ScriptError::ValidationRejected {
            property: "health".into(),
            reason: "must be non-negative".into(),
        };
        assert!(err.to_string().contains("health"));
        assert!(err.to_string().contains("must be non-negative"));
    }
}
