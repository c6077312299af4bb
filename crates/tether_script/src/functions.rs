//! Function bridge: host closures as script callables.
//!
//! The engine never sees a host closure. A wrapped closure lives in a
//! per-runtime slot registry keyed by a monotonically increasing id, and
//! the script-visible callable is a plain table holding only that id,
//! with a shared metatable whose `__call` is one fixed trampoline and
//! whose `__gc` removes the slot. Ids are never reused while a live
//! callable references them; a slot disappears only when its callable is
//! finalized.
//!
//! Each supported arity (0 through 3) is a distinct instantiation: the
//! engine ABI wants fixed-signature trampolines, so there is no generic
//! variadic path.

use std::collections::HashMap;
use std::rc::Rc;

use mlua::{Lua, MultiValue, Table, Value};
use tracing::{debug, trace};

use tether_core::{ScriptConvert, ScriptError, ScriptResult, ScriptValue};

use crate::class::{arg, check_arity};
use crate::marshal::{from_lua, raise, to_lua};
use crate::runtime::Shared;

pub(crate) type ClosureInvoker = Rc<dyn Fn(&[ScriptValue]) -> ScriptResult<ScriptValue>>;

pub(crate) struct ClosureSlot {
    pub arity: usize,
    pub invoke: ClosureInvoker,
}

/// Registry of live host closures, keyed by slot id.
pub(crate) struct ClosureSlots {
    entries: HashMap<u64, ClosureSlot>,
    next_id: u64,
}

impl ClosureSlots {
    pub fn new() -> Self {
        Self { entries: HashMap::new(), next_id: 1 }
    }

    pub fn insert(&mut self, arity: usize, invoke: ClosureInvoker) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, ClosureSlot { arity, invoke });
        id
    }

    pub fn get(&self, id: u64) -> Option<(usize, ClosureInvoker)> {
        self.entries.get(&id).map(|slot| (slot.arity, slot.invoke.clone()))
    }

    pub fn remove(&mut self, id: u64) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

const CALLABLE_FACTORY: &str = "tether.callable_factory";

/// Install the trampoline, finalizer, and callable factory. Once per
/// runtime, at creation.
pub(crate) fn install(lua: &Lua, shared: &Rc<Shared>) -> mlua::Result<()> {
    let call_shared = shared.clone();
    let trampoline = lua.create_function(move |lua, args: MultiValue| {
        let mut iter = args.into_iter();
        // First argument is the callable table itself.
        let callable = match iter.next() {
            Some(Value::Table(table)) => table,
            _ => return Err(raise(ScriptError::InvalidCallable)),
        };
        let id = match callable.raw_get::<Value>("__fn") {
            Ok(Value::Integer(id)) if id > 0 => id as u64,
            // A stale table with its id field stripped is not callable.
            _ => return Err(raise(ScriptError::InvalidCallable)),
        };
        let slot = call_shared.slots.borrow().get(id);
        let Some((arity, invoke)) = slot else {
            return Err(raise(ScriptError::InvalidCallable));
        };

        let values: Vec<ScriptValue> = iter.map(|v| from_lua(&v)).collect();
        check_arity(arity, values.len()).map_err(raise)?;
        trace!(id, arity, "host closure invoked");
        let result = invoke(&values).map_err(raise)?;
        to_lua(lua, &result)
    })?;

    let gc_shared = shared.clone();
    let finalize = lua.create_function(move |_lua, callable: Table| {
        if let Ok(Value::Integer(id)) = callable.raw_get::<Value>("__fn") {
            if id > 0 && gc_shared.slots.borrow_mut().remove(id as u64) {
                trace!(id, "closure slot finalized");
            }
        }
        Ok(())
    })?;

    let factory: mlua::Function = lua
        .load(
            r#"
            local trampoline, finalize = ...
            local mt = { __call = trampoline, __gc = finalize }
            return function(id)
                return setmetatable({ __fn = id }, mt)
            end
            "#,
        )
        .set_name("callable_factory")
        .call((trampoline, finalize))?;
    lua.set_named_registry_value(CALLABLE_FACTORY, factory)?;
    Ok(())
}

/// Allocate a slot for `invoke` and build its script-visible callable.
pub(crate) fn make_callable(
    lua: &Lua,
    shared: &Rc<Shared>,
    arity: usize,
    invoke: ClosureInvoker,
) -> mlua::Result<Table> {
    let id = shared.slots.borrow_mut().insert(arity, invoke);
    let factory: mlua::Function = lua.named_registry_value(CALLABLE_FACTORY)?;
    let callable: Table = factory.call(id)?;
    debug!(id, arity, "wrapped host closure as script callable");
    Ok(callable)
}

/* --------------------- per-arity invoker builders -------------------- */

// Argument count is enforced by the trampoline before these run; they
// only decode positionally and encode the result. Optional returns
// encode absence as nil through the codec.

pub(crate) fn invoker0<R, F>(f: F) -> ClosureInvoker
where
    R: ScriptConvert + 'static,
    F: Fn() -> R + 'static,
{
    Rc::new(move |_args| Ok(f().encode()))
}

pub(crate) fn invoker1<A, R, F>(f: F) -> ClosureInvoker
where
    A: ScriptConvert + 'static,
    R: ScriptConvert + 'static,
    F: Fn(A) -> R + 'static,
{
    Rc::new(move |args| {
        let a = arg::<A>(args, 0)?;
        Ok(f(a).encode())
    })
}

pub(crate) fn invoker2<A, B, R, F>(f: F) -> ClosureInvoker
where
    A: ScriptConvert + 'static,
    B: ScriptConvert + 'static,
    R: ScriptConvert + 'static,
    F: Fn(A, B) -> R + 'static,
{
    Rc::new(move |args| {
        let a = arg::<A>(args, 0)?;
        let b = arg::<B>(args, 1)?;
        Ok(f(a, b).encode())
    })
}

pub(crate) fn invoker3<A, B, C, R, F>(f: F) -> ClosureInvoker
where
    A: ScriptConvert + 'static,
    B: ScriptConvert + 'static,
    C: ScriptConvert + 'static,
    R: ScriptConvert + 'static,
    F: Fn(A, B, C) -> R + 'static,
{
    Rc::new(move |args| {
        let a = arg::<A>(args, 0)?;
        let b = arg::<B>(args, 1)?;
        let c = arg::<C>(args, 2)?;
        Ok(f(a, b, c).encode())
    })
}
