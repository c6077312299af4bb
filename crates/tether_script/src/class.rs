//! Per-class dispatch tables and the registration builder.
//!
//! A host type is described once, fluently, at registration time; the
//! builder turns each declared member into a type-erased thunk keyed by
//! name. The resulting [`ClassDef`] is immutable and shared by every
//! handle of that class, so there is no per-instance dispatch state and
//! no code generation step.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;

use tracing::debug;

use tether_core::{Position, ScriptConvert, ScriptError, ScriptResult, ScriptValue};

/// Outcome of a pre-mutation hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Accept,
    Reject(String),
}

impl Validation {
    pub fn reject(reason: impl Into<String>) -> Self {
        Validation::Reject(reason.into())
    }
}

pub(crate) type GetThunk = Rc<dyn Fn(&dyn Any) -> ScriptResult<ScriptValue>>;
pub(crate) type DecodeThunk = Rc<dyn Fn(&ScriptValue) -> ScriptResult<Box<dyn Any>>>;
pub(crate) type StoreThunk = Rc<dyn Fn(&mut dyn Any, Box<dyn Any>) -> ScriptResult<()>>;
pub(crate) type MethodThunk = Rc<dyn Fn(&mut dyn Any, &[ScriptValue]) -> ScriptResult<ScriptValue>>;
pub(crate) type ConstructorThunk = Rc<dyn Fn(&[ScriptValue]) -> ScriptResult<Rc<RefCell<dyn Any>>>>;
pub(crate) type WillChangeThunk =
    Rc<dyn Fn(&dyn Any, &str, &ScriptValue, &ScriptValue) -> Validation>;
pub(crate) type DidChangeThunk = Rc<dyn Fn(&mut dyn Any, &str, &ScriptValue, &ScriptValue)>;
pub(crate) type CollectionValidator = Rc<dyn Fn(&dyn Any, &[ScriptValue]) -> Validation>;

/// One scalar property: typed getter, and for writable properties a
/// decode step (type check) split from the store step so validation hooks
/// run between them, on already-checked values.
pub(crate) struct ScalarProperty {
    pub get: GetThunk,
    pub decode: Option<DecodeThunk>,
    pub store: Option<StoreThunk>,
}

/// One array-typed property surfaced to script as a live proxy.
pub(crate) struct CollectionDef {
    pub property: String,
    pub elem_type: String,
    pub read: Rc<dyn Fn(&dyn Any) -> ScriptResult<Vec<ScriptValue>>>,
    pub write: Rc<dyn Fn(&mut dyn Any, &[ScriptValue]) -> ScriptResult<()>>,
    pub check_elem: Rc<dyn Fn(&ScriptValue) -> bool>,
    pub validator: Option<CollectionValidator>,
}

pub(crate) enum PropertyDef {
    Scalar(ScalarProperty),
    Collection(Rc<CollectionDef>),
}

pub(crate) struct MethodDef {
    pub arity: usize,
    pub invoke: MethodThunk,
}

/// Immutable per-class dispatch table, built once at registration and
/// shared read-only across all handles of the class.
pub(crate) struct ClassDef {
    pub name: String,
    pub type_id: TypeId,
    pub constructor: Option<ConstructorThunk>,
    pub properties: HashMap<String, PropertyDef>,
    pub methods: HashMap<String, MethodDef>,
    pub will_change: Option<WillChangeThunk>,
    pub did_change: Option<DidChangeThunk>,
}

impl ClassDef {
    pub(crate) fn invalid_receiver(&self) -> ScriptError {
        ScriptError::InvalidReceiver { expected: self.name.clone() }
    }
}

/// Decode positional argument `index` (0-based) out of `args`, reporting
/// absence as a nil mismatch at that position.
pub(crate) fn arg<T: ScriptConvert>(args: &[ScriptValue], index: usize) -> ScriptResult<T> {
    let value = args.get(index).cloned().unwrap_or(ScriptValue::Nil);
    T::decode_at(&value, Position::Argument { index: index + 1, name: None })
}

fn downcast_ref<'a, O: 'static>(class: &str, obj: &'a dyn Any) -> ScriptResult<&'a O> {
    obj.downcast_ref::<O>()
        .ok_or_else(|| ScriptError::InvalidReceiver { expected: class.to_string() })
}

fn downcast_mut<'a, O: 'static>(class: &str, obj: &'a mut dyn Any) -> ScriptResult<&'a mut O> {
    obj.downcast_mut::<O>()
        .ok_or_else(|| ScriptError::InvalidReceiver { expected: class.to_string() })
}

/// Fluent registration builder for one host type.
///
/// ```ignore
/// runtime.register_class(
///     ClassBuilder::<Point>::new("Point")
///         .constructor2(|x: f64, y: f64| Point { x, y })
///         .property("x", |p: &Point| p.x, |p: &mut Point, x| p.x = x)
///         .method1("translate", |p: &mut Point, dx: f64| { p.x += dx; p.x }),
/// )?;
/// ```
pub struct ClassBuilder<O: 'static> {
    name: String,
    constructor: Option<ConstructorThunk>,
    properties: HashMap<String, PropertyDef>,
    methods: HashMap<String, MethodDef>,
    will_change: Option<WillChangeThunk>,
    did_change: Option<DidChangeThunk>,
    _marker: PhantomData<fn() -> O>,
}

impl<O: 'static> ClassBuilder<O> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constructor: None,
            properties: HashMap::new(),
            methods: HashMap::new(),
            will_change: None,
            did_change: None,
            _marker: PhantomData,
        }
    }

    /* ------------------------- constructors ------------------------- */

    // One distinct registration entry point per arity; the engine ABI
    // wants fixed-signature trampolines, so there is no variadic path.
    // A missing constructor argument decodes as nil and surfaces as a
    // positional type mismatch.

    pub fn constructor0(mut self, f: impl Fn() -> O + 'static) -> Self {
        self.constructor = Some(Rc::new(move |_args| {
            Ok(Rc::new(RefCell::new(f())) as Rc<RefCell<dyn Any>>)
        }));
        self
    }

    pub fn constructor1<A>(mut self, f: impl Fn(A) -> O + 'static) -> Self
    where
        A: ScriptConvert + 'static,
    {
        self.constructor = Some(Rc::new(move |args| {
            let a = arg::<A>(args, 0)?;
            Ok(Rc::new(RefCell::new(f(a))) as Rc<RefCell<dyn Any>>)
        }));
        self
    }

    pub fn constructor2<A, B>(mut self, f: impl Fn(A, B) -> O + 'static) -> Self
    where
        A: ScriptConvert + 'static,
        B: ScriptConvert + 'static,
    {
        self.constructor = Some(Rc::new(move |args| {
            let a = arg::<A>(args, 0)?;
            let b = arg::<B>(args, 1)?;
            Ok(Rc::new(RefCell::new(f(a, b))) as Rc<RefCell<dyn Any>>)
        }));
        self
    }

    pub fn constructor3<A, B, C>(mut self, f: impl Fn(A, B, C) -> O + 'static) -> Self
    where
        A: ScriptConvert + 'static,
        B: ScriptConvert + 'static,
        C: ScriptConvert + 'static,
    {
        self.constructor = Some(Rc::new(move |args| {
            let a = arg::<A>(args, 0)?;
            let b = arg::<B>(args, 1)?;
            let c = arg::<C>(args, 2)?;
            Ok(Rc::new(RefCell::new(f(a, b, c))) as Rc<RefCell<dyn Any>>)
        }));
        self
    }

    /* -------------------------- properties -------------------------- */

    /// Declare a readable and writable property of concrete type `T`.
    pub fn property<T, G, S>(mut self, name: impl Into<String>, get: G, set: S) -> Self
    where
        T: ScriptConvert + 'static,
        G: Fn(&O) -> T + 'static,
        S: Fn(&mut O, T) + 'static,
    {
        let name = name.into();
        let class = self.name.clone();
        let get_class = class.clone();
        let get_thunk: GetThunk = Rc::new(move |obj| {
            Ok(get(downcast_ref::<O>(&get_class, obj)?).encode())
        });
        let prop = name.clone();
        let decode: DecodeThunk = Rc::new(move |value| {
            let typed = T::decode_at(value, Position::Property(prop.clone()))?;
            Ok(Box::new(typed) as Box<dyn Any>)
        });
        let store: StoreThunk = Rc::new(move |obj, boxed| {
            let typed = boxed
                .downcast::<T>()
                .map_err(|_| ScriptError::runtime("decoded property value changed type"))?;
            set(downcast_mut::<O>(&class, obj)?, *typed);
            Ok(())
        });
        self.properties.insert(
            name,
            PropertyDef::Scalar(ScalarProperty {
                get: get_thunk,
                decode: Some(decode),
                store: Some(store),
            }),
        );
        self
    }

    /// Declare a read-only property. Script writes fail with a runtime
    /// error naming the property.
    pub fn readonly<T, G>(mut self, name: impl Into<String>, get: G) -> Self
    where
        T: ScriptConvert + 'static,
        G: Fn(&O) -> T + 'static,
    {
        let class = self.name.clone();
        let get_thunk: GetThunk = Rc::new(move |obj| {
            Ok(get(downcast_ref::<O>(&class, obj)?).encode())
        });
        self.properties.insert(
            name.into(),
            PropertyDef::Scalar(ScalarProperty {
                get: get_thunk,
                decode: None,
                store: None,
            }),
        );
        self
    }

    /// Declare an array-typed property accessed from script through a
    /// live, element-level proxy rather than by value.
    pub fn collection<T, G, S>(self, name: impl Into<String>, get: G, set: S) -> Self
    where
        T: ScriptConvert + 'static,
        G: Fn(&O) -> Vec<T> + 'static,
        S: Fn(&mut O, Vec<T>) + 'static,
    {
        self.collection_inner(name.into(), get, set, None::<fn(&O, &[T]) -> Validation>)
    }

    /// Like [`collection`](Self::collection), with a validator consulted
    /// against the proposed full array before any element write commits.
    pub fn collection_validated<T, G, S, V>(
        self,
        name: impl Into<String>,
        get: G,
        set: S,
        validate: V,
    ) -> Self
    where
        T: ScriptConvert + 'static,
        G: Fn(&O) -> Vec<T> + 'static,
        S: Fn(&mut O, Vec<T>) + 'static,
        V: Fn(&O, &[T]) -> Validation + 'static,
    {
        self.collection_inner(name.into(), get, set, Some(validate))
    }

    fn collection_inner<T, G, S, V>(
        mut self,
        name: String,
        get: G,
        set: S,
        validate: Option<V>,
    ) -> Self
    where
        T: ScriptConvert + 'static,
        G: Fn(&O) -> Vec<T> + 'static,
        S: Fn(&mut O, Vec<T>) + 'static,
        V: Fn(&O, &[T]) -> Validation + 'static,
    {
        let class = self.name.clone();
        let read_class = class.clone();
        let read: Rc<dyn Fn(&dyn Any) -> ScriptResult<Vec<ScriptValue>>> =
            Rc::new(move |obj| {
                let typed = get(downcast_ref::<O>(&read_class, obj)?);
                Ok(typed.iter().map(ScriptConvert::encode).collect())
            });

        let write_class = class.clone();
        let write_prop = name.clone();
        let write: Rc<dyn Fn(&mut dyn Any, &[ScriptValue]) -> ScriptResult<()>> =
            Rc::new(move |obj, values| {
                let mut typed = Vec::with_capacity(values.len());
                for (i, value) in values.iter().enumerate() {
                    let elem = T::decode_at(
                        value,
                        Position::Element { property: write_prop.clone(), index: i + 1 },
                    )?;
                    typed.push(elem);
                }
                set(downcast_mut::<O>(&write_class, obj)?, typed);
                Ok(())
            });

        let check_elem: Rc<dyn Fn(&ScriptValue) -> bool> =
            Rc::new(|value| T::decode(value).is_some());

        let validator: Option<CollectionValidator> = validate.map(|v| {
            Rc::new(move |obj: &dyn Any, proposed: &[ScriptValue]| {
                let Some(typed) = proposed
                    .iter()
                    .map(T::decode)
                    .collect::<Option<Vec<T>>>()
                else {
                    // Element type errors are reported before validation.
                    return Validation::Accept;
                };
                match obj.downcast_ref::<O>() {
                    Some(o) => v(o, &typed),
                    None => Validation::Accept,
                }
            }) as CollectionValidator
        });

        self.properties.insert(
            name.clone(),
            PropertyDef::Collection(Rc::new(CollectionDef {
                property: name,
                elem_type: T::type_name(),
                read,
                write,
                check_elem,
                validator,
            })),
        );
        self
    }

    /* --------------------------- methods ---------------------------- */

    pub fn method0<R>(mut self, name: impl Into<String>, f: impl Fn(&mut O) -> R + 'static) -> Self
    where
        R: ScriptConvert + 'static,
    {
        let class = self.name.clone();
        self.methods.insert(
            name.into(),
            MethodDef {
                arity: 0,
                invoke: Rc::new(move |obj, _args| {
                    Ok(f(downcast_mut::<O>(&class, obj)?).encode())
                }),
            },
        );
        self
    }

    pub fn method1<A, R>(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&mut O, A) -> R + 'static,
    ) -> Self
    where
        A: ScriptConvert + 'static,
        R: ScriptConvert + 'static,
    {
        let class = self.name.clone();
        self.methods.insert(
            name.into(),
            MethodDef {
                arity: 1,
                invoke: Rc::new(move |obj, args| {
                    check_arity(1, args.len())?;
                    let a = arg::<A>(args, 0)?;
                    Ok(f(downcast_mut::<O>(&class, obj)?, a).encode())
                }),
            },
        );
        self
    }

    pub fn method2<A, B, R>(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&mut O, A, B) -> R + 'static,
    ) -> Self
    where
        A: ScriptConvert + 'static,
        B: ScriptConvert + 'static,
        R: ScriptConvert + 'static,
    {
        let class = self.name.clone();
        self.methods.insert(
            name.into(),
            MethodDef {
                arity: 2,
                invoke: Rc::new(move |obj, args| {
                    check_arity(2, args.len())?;
                    let a = arg::<A>(args, 0)?;
                    let b = arg::<B>(args, 1)?;
                    Ok(f(downcast_mut::<O>(&class, obj)?, a, b).encode())
                }),
            },
        );
        self
    }

    pub fn method3<A, B, C, R>(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&mut O, A, B, C) -> R + 'static,
    ) -> Self
    where
        A: ScriptConvert + 'static,
        B: ScriptConvert + 'static,
        C: ScriptConvert + 'static,
        R: ScriptConvert + 'static,
    {
        let class = self.name.clone();
        self.methods.insert(
            name.into(),
            MethodDef {
                arity: 3,
                invoke: Rc::new(move |obj, args| {
                    check_arity(3, args.len())?;
                    let a = arg::<A>(args, 0)?;
                    let b = arg::<B>(args, 1)?;
                    let c = arg::<C>(args, 2)?;
                    Ok(f(downcast_mut::<O>(&class, obj)?, a, b, c).encode())
                }),
            },
        );
        self
    }

    /* ---------------------------- hooks ----------------------------- */

    /// Pre-mutation veto hook, consulted before any script-originated
    /// property or collection-element write.
    pub fn on_will_change(
        mut self,
        f: impl Fn(&O, &str, &ScriptValue, &ScriptValue) -> Validation + 'static,
    ) -> Self {
        self.will_change = Some(Rc::new(move |obj, prop, old, new| {
            match obj.downcast_ref::<O>() {
                Some(o) => f(o, prop, old, new),
                None => Validation::Accept,
            }
        }));
        self
    }

    /// Post-commit notification hook. Never called for rejected writes.
    pub fn on_did_change(
        mut self,
        f: impl Fn(&mut O, &str, &ScriptValue, &ScriptValue) + 'static,
    ) -> Self {
        self.did_change = Some(Rc::new(move |obj, prop, old, new| {
            if let Some(o) = obj.downcast_mut::<O>() {
                f(o, prop, old, new);
            }
        }));
        self
    }

    pub(crate) fn build(self) -> ClassDef {
        debug!(
            class = %self.name,
            properties = self.properties.len(),
            methods = self.methods.len(),
            "built class dispatch table"
        );
        ClassDef {
            name: self.name,
            type_id: TypeId::of::<O>(),
            constructor: self.constructor,
            properties: self.properties,
            methods: self.methods,
            will_change: self.will_change,
            did_change: self.did_change,
        }
    }
}

pub(crate) fn check_arity(expected: usize, actual: usize) -> ScriptResult<()> {
    if actual < expected {
        Err(ScriptError::ArgumentCount { expected, actual })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Point {
        x: f64,
        y: f64,
    }

    fn point_class() -> ClassDef {
        ClassBuilder::<Point>::new("Point")
            .constructor2(|x: f64, y: f64| Point { x, y })
            .property("x", |p: &Point| p.x, |p: &mut Point, x| p.x = x)
            .readonly("y", |p: &Point| p.y)
            .method1("translate", |p: &mut Point, dx: f64| {
                p.x += dx;
                p.x
            })
            .build()
    }

    #[test]
    fn dispatch_table_holds_declared_members() {
        let class = point_class();
        assert!(class.constructor.is_some());
        assert!(matches!(class.properties.get("x"), Some(PropertyDef::Scalar(p)) if p.store.is_some()));
        assert!(matches!(class.properties.get("y"), Some(PropertyDef::Scalar(p)) if p.store.is_none()));
        assert_eq!(class.methods.get("translate").map(|m| m.arity), Some(1));
    }

    #[test]
    fn constructor_thunk_reports_missing_argument_positionally() {
        let class = point_class();
        let ctor = class.constructor.as_ref().unwrap();
        let err = ctor(&[ScriptValue::Number(1.0)]).unwrap_err();
        match err {
            ScriptError::TypeMismatch { actual, position, .. } => {
                assert_eq!(actual, "nil");
                assert_eq!(position, Position::Argument { index: 2, name: None });
            }
            other => panic!("expected TypeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn method_thunk_checks_arity_then_types() {
        let class = point_class();
        let method = class.methods.get("translate").unwrap();
        let mut point = Point { x: 1.0, y: 2.0 };

        let err = (method.invoke)(&mut point, &[]).unwrap_err();
        assert_eq!(err, ScriptError::ArgumentCount { expected: 1, actual: 0 });

        let err = (method.invoke)(&mut point, &[ScriptValue::String("no".into())]).unwrap_err();
        assert!(matches!(err, ScriptError::TypeMismatch { .. }));

        let out = (method.invoke)(&mut point, &[ScriptValue::Number(2.5)]).unwrap();
        assert_eq!(out, ScriptValue::Number(3.5));
    }

    #[test]
    fn wrong_receiver_type_is_an_invalid_receiver() {
        let class = point_class();
        let method = class.methods.get("translate").unwrap();
        let mut not_a_point = 5i32;
        let err = (method.invoke)(&mut not_a_point, &[ScriptValue::Number(1.0)]).unwrap_err();
        assert_eq!(err, ScriptError::InvalidReceiver { expected: "Point".into() });
    }
}
