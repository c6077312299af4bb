//! Tether Core
//!
//! Engine-agnostic half of the scripting bridge:
//! - Tagged value model crossing the host/script boundary
//! - Value codec (typed encode/decode with positional diagnostics)
//! - Named custom converters (date strings, URLs, ...)
//! - Structured error taxonomy shared by host and script surfaces
//!
//! Nothing in this crate knows which scripting engine is embedded;
//! `tether_script` supplies the engine-specific half.

pub mod codec;
pub mod convert;
pub mod error;
pub mod value;

pub use codec::ScriptConvert;
pub use convert::ConverterRegistry;
pub use error::{Position, ScriptError, ScriptResult};
pub use value::ScriptValue;

/// Bridge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
