//! Object bridge: host instances as script objects.
//!
//! A registered class gets one global constructor table (`Point.new(...)`)
//! and every instance crossing the boundary becomes an [`ObjectHandle`]
//! userdata. The handle carries its class dispatch table and an arena
//! slot; a single generic `__index`/`__newindex` pair per class routes
//! property reads, property writes, and method lookup through the table.
//!
//! Reading an undeclared property returns nil, mirroring table lookup
//! semantics; calling an undeclared method errors because the call itself
//! is performed on the nil that the lookup produced.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use mlua::{AnyUserData, Lua, MetaMethod, MultiValue, UserData, UserDataMethods, Value};
use tracing::trace;

use tether_core::{Position, ScriptError, ScriptResult, ScriptValue};

use crate::arena::ArenaSlot;
use crate::class::{ClassDef, PropertyDef, Validation};
use crate::collection::{commit_collection, CollectionProxy};
use crate::marshal::{from_lua, from_multi, lua_type_name, raise, to_lua};
use crate::runtime::Shared;

/// Script-side reference to one host object.
///
/// The handle's arena slot owns the strong reference for the handle's
/// lifetime; dropping the handle (engine finalization) releases the slot
/// exactly once. Two handles to the same object resolve to the same
/// shared state.
pub struct ObjectHandle {
    pub(crate) class: Rc<ClassDef>,
    pub(crate) slot: ArenaSlot,
    pub(crate) shared: Rc<Shared>,
}

impl ObjectHandle {
    pub(crate) fn resolve(&self) -> ScriptResult<Rc<RefCell<dyn Any>>> {
        self.shared
            .arena
            .borrow()
            .get(self.slot)
            .ok_or(ScriptError::StaleHandle)
    }
}

impl Drop for ObjectHandle {
    fn drop(&mut self) {
        if self.shared.arena.borrow_mut().release(self.slot) {
            trace!(class = %self.class.name, index = self.slot.index, "released script handle");
        }
    }
}

impl UserData for ObjectHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: Value| {
            let Value::String(key) = key else {
                return Ok(Value::Nil);
            };
            let key: String = key.to_string_lossy().into();

            if let Some(def) = this.class.properties.get(key.as_str()) {
                let object = this.resolve().map_err(raise)?;
                return match def {
                    PropertyDef::Scalar(prop) => {
                        let value = {
                            let borrow = object.borrow();
                            (prop.get)(&*borrow).map_err(raise)?
                        };
                        trace!(class = %this.class.name, property = %key, "property read");
                        to_lua(lua, &value)
                    }
                    PropertyDef::Collection(def) => {
                        let proxy = CollectionProxy {
                            object,
                            class: this.class.clone(),
                            def: def.clone(),
                        };
                        Ok(Value::UserData(lua.create_userdata(proxy)?))
                    }
                };
            }

            if this.class.methods.contains_key(key.as_str()) {
                let bound = bind_method(lua, this.class.clone(), key)?;
                return Ok(Value::Function(bound));
            }

            // Undeclared names read as nil, never as an error.
            Ok(Value::Nil)
        });

        methods.add_meta_method(
            MetaMethod::NewIndex,
            |_lua, this, (key, value): (Value, Value)| {
                let Value::String(key) = key else {
                    return Err(raise(ScriptError::runtime(format!(
                        "cannot set a {} key on '{}'",
                        lua_type_name(&key),
                        this.class.name
                    ))));
                };
                let key: String = key.to_string_lossy().into();
                set_property(this, &key, value).map_err(raise)
            },
        );

        methods.add_meta_method(MetaMethod::ToString, |_lua, this, ()| {
            Ok(format!("{}@{}", this.class.name, this.slot.index))
        });
    }
}

/// Route one scalar or whole-collection property write through decode,
/// validation, store, and notification, in that order.
fn set_property(handle: &ObjectHandle, key: &str, value: Value) -> ScriptResult<()> {
    let class = &handle.class;
    let Some(def) = class.properties.get(key) else {
        return Err(ScriptError::runtime(format!(
            "type '{}' has no writable property '{key}'",
            class.name
        )));
    };

    let new_value = from_lua(&value);
    let object = handle.resolve()?;

    match def {
        PropertyDef::Scalar(prop) => {
            let (Some(decode), Some(store)) = (&prop.decode, &prop.store) else {
                return Err(ScriptError::runtime(format!(
                    "property '{key}' of '{}' is read-only",
                    class.name
                )));
            };
            // Type check precedes the hooks so they only ever see values
            // the property could actually hold.
            let decoded = decode(&new_value)?;
            let old = {
                let borrow = object.borrow();
                (prop.get)(&*borrow)?
            };
            if let Some(hook) = &class.will_change {
                let borrow = object.borrow();
                if let Validation::Reject(reason) = hook(&*borrow, key, &old, &new_value) {
                    trace!(class = %class.name, property = %key, "mutation vetoed");
                    return Err(ScriptError::ValidationRejected {
                        property: key.to_string(),
                        reason,
                    });
                }
            }
            {
                let mut borrow = object.borrow_mut();
                store(&mut *borrow, decoded)?;
            }
            trace!(class = %class.name, property = %key, "property written");
            if let Some(hook) = &class.did_change {
                let mut borrow = object.borrow_mut();
                hook(&mut *borrow, key, &old, &new_value);
            }
            Ok(())
        }
        PropertyDef::Collection(def) => {
            // Whole-array assignment; element-level writes go through the
            // proxy instead.
            let Some(proposed) = new_value.as_array() else {
                return Err(ScriptError::mismatch(
                    format!("array of {}", def.elem_type),
                    new_value.type_name(),
                    Position::Property(key.to_string()),
                ));
            };
            for (i, elem) in proposed.iter().enumerate() {
                if !(def.check_elem)(elem) {
                    return Err(ScriptError::mismatch(
                        def.elem_type.clone(),
                        elem.type_name(),
                        Position::Element { property: key.to_string(), index: i + 1 },
                    ));
                }
            }
            let old = {
                let borrow = object.borrow();
                (def.read)(&*borrow)?
            };
            commit_collection(&object, class, def, proposed.to_vec(), old)
        }
    }
}

/// A method value: a fresh function bound to the method name, validating
/// its receiver at call time so `a.method(b)` with a foreign receiver
/// fails as an invalid receiver instead of corrupting dispatch.
fn bind_method(lua: &Lua, class: Rc<ClassDef>, name: String) -> mlua::Result<mlua::Function> {
    lua.create_function(move |lua, args: MultiValue| {
        let mut iter = args.into_iter();
        let receiver = match iter.next() {
            Some(Value::UserData(ud)) => ud,
            _ => return Err(raise(class.invalid_receiver())),
        };
        let handle = receiver
            .borrow::<ObjectHandle>()
            .map_err(|_| raise(class.invalid_receiver()))?;
        if handle.class.type_id != class.type_id {
            return Err(raise(class.invalid_receiver()));
        }
        let object = handle.resolve().map_err(raise)?;

        let args: Vec<ScriptValue> = iter.map(|v| from_lua(&v)).collect();
        let Some(method) = class.methods.get(&name) else {
            return Err(raise(ScriptError::runtime(format!(
                "type '{}' has no method '{name}'",
                class.name
            ))));
        };
        trace!(class = %class.name, method = %name, "method call");
        let result = {
            let mut borrow = object
                .try_borrow_mut()
                .map_err(|_| raise(ScriptError::runtime("object is already borrowed")))?;
            (method.invoke)(&mut *borrow, &args).map_err(raise)?
        };
        to_lua(lua, &result)
    })
}

/// Install the global constructor table for a registered class.
pub(crate) fn install_class(
    lua: &Lua,
    shared: &Rc<Shared>,
    class: &Rc<ClassDef>,
) -> mlua::Result<()> {
    let Some(ctor) = class.constructor.clone() else {
        return Ok(());
    };
    let table = lua.create_table()?;
    let shared = shared.clone();
    let ctor_class = class.clone();
    let new_fn = lua.create_function(move |lua, args: MultiValue| {
        let values = from_multi(args);
        let object = ctor(&values).map_err(raise)?;
        let handle = create_handle(lua, &shared, ctor_class.clone(), object)?;
        Ok(Value::UserData(handle))
    })?;
    table.set("new", new_fn)?;
    lua.globals().set(class.name.as_str(), table)?;
    Ok(())
}

/// Wrap a host object in a fresh handle. Called for construction and for
/// host-initiated pushes; each call allocates its own arena slot, so the
/// same object may be behind any number of handles.
pub(crate) fn create_handle(
    lua: &Lua,
    shared: &Rc<Shared>,
    class: Rc<ClassDef>,
    object: Rc<RefCell<dyn Any>>,
) -> mlua::Result<AnyUserData> {
    let slot = shared.arena.borrow_mut().insert(object);
    trace!(class = %class.name, index = slot.index, "created script handle");
    lua.create_userdata(ObjectHandle { class, slot, shared: shared.clone() })
}
