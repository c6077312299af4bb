//! Collection proxy: element-level script access to array-typed
//! properties.
//!
//! Reading a declared collection property yields a proxy userdata
//! instead of a by-value copy. The proxy holds the owning object (the
//! object owns the storage, the proxy never does) plus the property's
//! read/write thunks, so every operation observes and mutates the live
//! backing array.
//!
//! Indexing is 1-based, matching the script's native convention. Reads
//! are valid in `[1, length]` and return nil outside it; writes are
//! valid in `[1, length + 1]`, where `length + 1` appends. Any other
//! write index is a bounds error, never an out-of-bounds access.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use mlua::{MetaMethod, UserData, UserDataMethods, Value};
use tracing::trace;

use tether_core::{Position, ScriptError, ScriptResult, ScriptValue};

use crate::class::{ClassDef, CollectionDef, Validation};
use crate::marshal::{from_lua, raise, to_lua};

pub struct CollectionProxy {
    pub(crate) object: Rc<RefCell<dyn Any>>,
    pub(crate) class: Rc<ClassDef>,
    pub(crate) def: Rc<CollectionDef>,
}

impl CollectionProxy {
    fn current(&self) -> ScriptResult<Vec<ScriptValue>> {
        let borrow = self.object.borrow();
        (self.def.read)(&*borrow)
    }
}

fn integral_index(key: &Value) -> Option<i64> {
    match key {
        Value::Integer(i) => Some(*i),
        Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
        _ => None,
    }
}

impl UserData for CollectionProxy {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        // Snapshot of the backing array as a plain script table.
        methods.add_method("snapshot", |lua, this, ()| {
            let items = this.current().map_err(raise)?;
            to_lua(lua, &ScriptValue::Array(items))
        });

        // Iterator over (index, value) pairs, ascending and 1-based.
        // The iteration length is snapshotted when the iterator is
        // created: mutating the backing array mid-iteration never changes
        // the number of steps, but values at indices not yet visited are
        // read live and will reflect the mutation.
        methods.add_method("iter", |lua, this, ()| {
            let object = this.object.clone();
            let def = this.def.clone();
            let steps = this.current().map_err(raise)?.len();
            let cursor = Cell::new(0usize);
            lua.create_function(move |lua, ()| {
                let next = cursor.get() + 1;
                if next > steps {
                    return Ok((Value::Nil, Value::Nil));
                }
                cursor.set(next);
                let items = {
                    let borrow = object.borrow();
                    (def.read)(&*borrow).map_err(raise)?
                };
                let value = items.get(next - 1).cloned().unwrap_or(ScriptValue::Nil);
                Ok((Value::Integer(next as i64), to_lua(lua, &value)?))
            })
        });

        methods.add_meta_method(MetaMethod::Len, |_lua, this, ()| {
            Ok(this.current().map_err(raise)?.len() as i64)
        });

        methods.add_meta_method(MetaMethod::Index, |lua, this, key: Value| {
            let Some(index) = integral_index(&key) else {
                return Ok(Value::Nil);
            };
            let items = this.current().map_err(raise)?;
            if index < 1 || index as usize > items.len() {
                return Ok(Value::Nil);
            }
            to_lua(lua, &items[index as usize - 1])
        });

        methods.add_meta_method(
            MetaMethod::NewIndex,
            |_lua, this, (key, value): (Value, Value)| {
                let Some(index) = integral_index(&key) else {
                    return Err(raise(ScriptError::runtime(format!(
                        "collection '{}' accepts integer indices only",
                        this.def.property
                    ))));
                };
                set_element(this, index, from_lua(&value)).map_err(raise)
            },
        );

        methods.add_meta_method(MetaMethod::ToString, |_lua, this, ()| {
            Ok(format!("collection '{}'", this.def.property))
        });
    }
}

/// Replace or append one element, then commit the proposed full array
/// through validation and notification.
fn set_element(proxy: &CollectionProxy, index: i64, value: ScriptValue) -> ScriptResult<()> {
    let def = &proxy.def;
    let old = proxy.current()?;
    let len = old.len();

    if index < 1 || index as usize > len + 1 {
        return Err(ScriptError::Bounds { index, len });
    }
    if !(def.check_elem)(&value) {
        return Err(ScriptError::mismatch(
            def.elem_type.clone(),
            value.type_name(),
            Position::Element { property: def.property.clone(), index: index as usize },
        ));
    }

    let mut proposed = old.clone();
    if index as usize == len + 1 {
        proposed.push(value);
    } else {
        proposed[index as usize - 1] = value;
    }
    trace!(property = %def.property, index, "collection element write");
    commit_collection(&proxy.object, &proxy.class, def, proposed, old)
}

/// Validate a proposed full array and commit it to the backing property.
///
/// Order: collection validator, then the class `will_change` hook, then
/// the write, then `did_change`. A rejection at either gate leaves the
/// backing array untouched and suppresses notification.
pub(crate) fn commit_collection(
    object: &Rc<RefCell<dyn Any>>,
    class: &ClassDef,
    def: &CollectionDef,
    proposed: Vec<ScriptValue>,
    old: Vec<ScriptValue>,
) -> ScriptResult<()> {
    if let Some(validator) = &def.validator {
        let borrow = object.borrow();
        if let Validation::Reject(reason) = validator(&*borrow, &proposed) {
            trace!(property = %def.property, "collection mutation vetoed");
            return Err(ScriptError::ValidationRejected {
                property: def.property.clone(),
                reason,
            });
        }
    }

    let old_value = ScriptValue::Array(old);
    let new_value = ScriptValue::Array(proposed.clone());

    if let Some(hook) = &class.will_change {
        let borrow = object.borrow();
        if let Validation::Reject(reason) = hook(&*borrow, &def.property, &old_value, &new_value) {
            return Err(ScriptError::ValidationRejected {
                property: def.property.clone(),
                reason,
            });
        }
    }

    {
        let mut borrow = object.borrow_mut();
        (def.write)(&mut *borrow, &proposed)?;
    }

    if let Some(hook) = &class.did_change {
        let mut borrow = object.borrow_mut();
        hook(&mut *borrow, &def.property, &old_value, &new_value);
    }
    Ok(())
}
