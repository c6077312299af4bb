//! Deferred completion of asynchronous host work.
//!
//! A host closure that wants to do asynchronous work returns a
//! [`Deferred`] token immediately and keeps the paired
//! [`DeferredResolver`]. The resolver may be used from any thread: it
//! only enqueues the completion. Script state is touched exclusively on
//! the runtime's owning thread, when the host calls
//! `ScriptRuntime::pump_deferred`, which invokes the callbacks scripts
//! registered through `deferred.done(token, fn)`.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::mpsc::Sender;

use mlua::{Lua, MultiValue, RegistryKey, Value};
use tracing::{debug, trace};

use tether_core::{ScriptConvert, ScriptError, ScriptResult, ScriptValue};

use crate::marshal::{classify, raise, to_lua};
use crate::runtime::Shared;

const TOKEN_FIELD: &str = "__deferred";

/// Script-side bookkeeping for in-flight deferreds. Owned-thread only.
pub(crate) struct DeferredState {
    next_id: u64,
    callbacks: HashMap<u64, RegistryKey>,
    resolved: HashMap<u64, ScriptValue>,
}

impl DeferredState {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            callbacks: HashMap::new(),
            resolved: HashMap::new(),
        }
    }
}

/// Opaque in-flight token. Encodes as a small map the script hands back
/// to `deferred.done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deferred {
    id: u64,
}

impl ScriptConvert for Deferred {
    fn type_name() -> String {
        "deferred".into()
    }

    fn encode(&self) -> ScriptValue {
        ScriptValue::map([(TOKEN_FIELD.to_string(), ScriptValue::Integer(self.id as i64))])
    }

    fn decode(value: &ScriptValue) -> Option<Self> {
        let id = value.as_map()?.get(TOKEN_FIELD)?.as_integer()?;
        (id > 0).then(|| Deferred { id: id as u64 })
    }
}

/// Completes a [`Deferred`] from any thread.
pub struct DeferredResolver {
    id: u64,
    tx: Sender<(u64, ScriptValue)>,
}

impl DeferredResolver {
    /// Enqueue the completion value. Never touches script state; the
    /// runtime applies it on its owning thread at the next pump.
    pub fn resolve(self, value: ScriptValue) -> ScriptResult<()> {
        self.tx
            .send((self.id, value))
            .map_err(|_| ScriptError::runtime("script runtime was dropped before resolution"))
    }
}

/// Creates deferred/resolver pairs. Handed to host closures so they can
/// start asynchronous work from inside a script call; not `Send`, it
/// stays with the runtime's owning thread.
pub struct DeferredFactory {
    shared: Rc<Shared>,
}

impl DeferredFactory {
    pub(crate) fn new(shared: Rc<Shared>) -> Self {
        Self { shared }
    }

    pub fn create(&self) -> (Deferred, DeferredResolver) {
        let mut state = self.shared.deferred.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        debug!(id, "created deferred");
        (
            Deferred { id },
            DeferredResolver { id, tx: self.shared.completions_tx.clone() },
        )
    }
}

/// Install the script-facing `deferred.done(token, fn)` entry point.
pub(crate) fn install(lua: &Lua, shared: &Rc<Shared>) -> mlua::Result<()> {
    let done_shared = shared.clone();
    let done = lua.create_function(move |lua, (token, callback): (Value, mlua::Function)| {
        let id = match &token {
            Value::Table(table) => match table.raw_get::<Value>(TOKEN_FIELD) {
                Ok(Value::Integer(id)) if id > 0 => id as u64,
                _ => return Err(raise(ScriptError::runtime("not a deferred token"))),
            },
            _ => return Err(raise(ScriptError::runtime("not a deferred token"))),
        };

        // Completion may already have been pumped before the script got
        // around to registering; deliver immediately in that case.
        let already = done_shared.deferred.borrow_mut().resolved.remove(&id);
        if let Some(value) = already {
            let arg = to_lua(lua, &value)?;
            callback.call::<()>(arg)?;
        } else {
            let key = lua.create_registry_value(callback)?;
            done_shared.deferred.borrow_mut().callbacks.insert(id, key);
        }
        Ok(())
    })?;

    let table = lua.create_table()?;
    table.set("done", done)?;
    lua.globals().set("deferred", table)?;
    Ok(())
}

/// Drain queued completions on the owning thread, invoking registered
/// callbacks. Returns how many callbacks ran; completions whose token has
/// no callback yet are parked until `deferred.done` claims them.
pub(crate) fn pump(lua: &Lua, shared: &Rc<Shared>) -> ScriptResult<usize> {
    let mut delivered = 0;
    loop {
        let message = shared.completions_rx.borrow().try_recv();
        let Ok((id, value)) = message else {
            break;
        };
        let callback = shared.deferred.borrow_mut().callbacks.remove(&id);
        match callback {
            Some(key) => {
                let func: mlua::Function = lua.registry_value(&key).map_err(classify)?;
                let arg = to_lua(lua, &value).map_err(classify)?;
                func.call::<MultiValue>(arg).map_err(classify)?;
                let _ = lua.remove_registry_value(key);
                trace!(id, "deferred completion delivered");
                delivered += 1;
            }
            None => {
                shared.deferred.borrow_mut().resolved.insert(id, value);
            }
        }
    }
    Ok(delivered)
}
