//! Tether Scripting Bridge
//!
//! Embeds a Lua 5.4 runtime (via mlua) inside a host application and
//! bridges host objects, closures, and collections into it.
//!
//! ## Architecture
//!
//! - **Object bridge:** registered classes get per-type dispatch tables;
//!   instances cross as generation-checked handle userdata
//! - **Function bridge:** host closures live in an id-keyed slot registry
//!   behind fixed-arity call trampolines
//! - **Collection proxy:** array-typed properties are manipulated
//!   element-by-element with script-native 1-based indexing
//! - **Validation:** per-class `will_change`/`did_change` hooks gate and
//!   observe every script-originated mutation
//!
//! Value conversion and the error taxonomy live in `tether_core`; this
//! crate supplies the engine-specific half.

pub mod class;
pub mod collection;
pub mod deferred;
pub mod output;
pub mod runtime;
pub mod settings;

mod arena;
mod functions;
mod marshal;
mod object;

pub use class::{ClassBuilder, Validation};
pub use deferred::{Deferred, DeferredFactory, DeferredResolver};
pub use output::{CapturePolicy, Truncation};
pub use runtime::{Namespace, ScriptRuntime};
pub use settings::RuntimeSettings;

pub use mlua;
pub use tether_core::{
    ConverterRegistry, Position, ScriptConvert, ScriptError, ScriptResult, ScriptValue,
};
