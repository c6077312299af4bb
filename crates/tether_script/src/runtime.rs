//! Script runtime management
//!
//! One [`ScriptRuntime`] embeds one engine instance plus the bridge state
//! shared by every boundary crossing: the host object arena, per-class
//! dispatch tables, the closure slot registry, captured print output, the
//! converter registry, and the deferred completion queue.
//!
//! A runtime is single-threaded by construction (it is not `Send`); drive
//! it from one thread at a time. Independent runtimes are fully isolated
//! and may run concurrently on different threads.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, Sender};

use mlua::{Lua, LuaOptions, MultiValue, StdLib, Table, Value};
use tracing::{debug, info};

use tether_core::{
    ConverterRegistry, Position, ScriptConvert, ScriptError, ScriptResult, ScriptValue,
};

use crate::arena::HostArena;
use crate::class::{ClassBuilder, ClassDef};
use crate::deferred::{self, DeferredFactory, DeferredState};
use crate::functions::{self, ClosureSlots};
use crate::marshal::{classify, from_lua, to_lua};
use crate::object::{create_handle, install_class};
use crate::output::OutputBuffer;
use crate::settings::RuntimeSettings;

/// Bridge state shared by every callback installed into the engine.
/// Append/remove only; touched exclusively from the owning thread.
pub(crate) struct Shared {
    pub arena: RefCell<HostArena>,
    pub classes: RefCell<HashMap<String, Rc<ClassDef>>>,
    pub slots: RefCell<ClosureSlots>,
    pub output: RefCell<OutputBuffer>,
    pub sink: RefCell<Option<Box<dyn FnMut(&str)>>>,
    pub converters: RefCell<ConverterRegistry>,
    pub deferred: RefCell<DeferredState>,
    pub completions_tx: Sender<(u64, ScriptValue)>,
    pub completions_rx: RefCell<Receiver<(u64, ScriptValue)>>,
    pub log_prints: bool,
}

/// Script execution context with the full bridge installed.
pub struct ScriptRuntime {
    lua: Lua,
    shared: Rc<Shared>,
    settings: RuntimeSettings,
}

impl ScriptRuntime {
    pub fn new() -> ScriptResult<Self> {
        Self::with_settings(RuntimeSettings::default())
    }

    pub fn with_settings(settings: RuntimeSettings) -> ScriptResult<Self> {
        let lua = Lua::new_with(StdLib::ALL_SAFE, LuaOptions::default())
            .map_err(|e| ScriptError::AllocationFailure { message: e.to_string() })?;
        if let Some(limit) = settings.memory_limit {
            lua.set_memory_limit(limit)
                .map_err(|e| ScriptError::AllocationFailure { message: e.to_string() })?;
        }

        let (completions_tx, completions_rx) = mpsc::channel();
        let shared = Rc::new(Shared {
            arena: RefCell::new(HostArena::new()),
            classes: RefCell::new(HashMap::new()),
            slots: RefCell::new(ClosureSlots::new()),
            output: RefCell::new(OutputBuffer::new(settings.capture)),
            sink: RefCell::new(None),
            converters: RefCell::new(ConverterRegistry::with_builtins()),
            deferred: RefCell::new(DeferredState::new()),
            completions_tx,
            completions_rx: RefCell::new(completions_rx),
            log_prints: settings.log_prints,
        });

        functions::install(&lua, &shared).map_err(classify)?;
        deferred::install(&lua, &shared).map_err(classify)?;
        install_print(&lua, &shared).map_err(classify)?;

        info!(memory_limit = ?settings.memory_limit, "script runtime created");
        Ok(Self { lua, shared, settings })
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /* -------------------------- registration ------------------------- */

    /// Register a host type described by `builder`. If the class declares
    /// a constructor, scripts gain a global `Name.new(...)`.
    pub fn register_class<O: 'static>(&self, builder: ClassBuilder<O>) -> ScriptResult<()> {
        let class = Rc::new(builder.build());
        {
            let mut classes = self.shared.classes.borrow_mut();
            if classes.contains_key(&class.name) {
                return Err(ScriptError::runtime(format!(
                    "class '{}' is already registered",
                    class.name
                )));
            }
            classes.insert(class.name.clone(), class.clone());
        }
        install_class(&self.lua, &self.shared, &class).map_err(classify)?;
        info!(class = %class.name, "registered host class");
        Ok(())
    }

    /// Wrap an existing host object in a handle bound to a global.
    ///
    /// Every call allocates a fresh handle; binding the same object twice
    /// yields two handles observing the same host-side state.
    pub fn bind_object<O: 'static>(
        &self,
        global: &str,
        class_name: &str,
        object: Rc<RefCell<O>>,
    ) -> ScriptResult<()> {
        let class = self
            .shared
            .classes
            .borrow()
            .get(class_name)
            .cloned()
            .ok_or_else(|| {
                ScriptError::runtime(format!("class '{class_name}' is not registered"))
            })?;
        if class.type_id != TypeId::of::<O>() {
            return Err(ScriptError::runtime(format!(
                "class '{class_name}' was registered for a different host type"
            )));
        }
        let erased: Rc<RefCell<dyn Any>> = object;
        let handle = create_handle(&self.lua, &self.shared, class, erased).map_err(classify)?;
        self.lua.globals().set(global, handle).map_err(classify)?;
        Ok(())
    }

    pub fn register_function0<R, F>(&self, name: &str, f: F) -> ScriptResult<()>
    where
        R: ScriptConvert + 'static,
        F: Fn() -> R + 'static,
    {
        self.install_callable(name, 0, functions::invoker0(f))
    }

    pub fn register_function1<A, R, F>(&self, name: &str, f: F) -> ScriptResult<()>
    where
        A: ScriptConvert + 'static,
        R: ScriptConvert + 'static,
        F: Fn(A) -> R + 'static,
    {
        self.install_callable(name, 1, functions::invoker1(f))
    }

    pub fn register_function2<A, B, R, F>(&self, name: &str, f: F) -> ScriptResult<()>
    where
        A: ScriptConvert + 'static,
        B: ScriptConvert + 'static,
        R: ScriptConvert + 'static,
        F: Fn(A, B) -> R + 'static,
    {
        self.install_callable(name, 2, functions::invoker2(f))
    }

    pub fn register_function3<A, B, C, R, F>(&self, name: &str, f: F) -> ScriptResult<()>
    where
        A: ScriptConvert + 'static,
        B: ScriptConvert + 'static,
        C: ScriptConvert + 'static,
        R: ScriptConvert + 'static,
        F: Fn(A, B, C) -> R + 'static,
    {
        self.install_callable(name, 3, functions::invoker3(f))
    }

    fn install_callable(
        &self,
        name: &str,
        arity: usize,
        invoke: functions::ClosureInvoker,
    ) -> ScriptResult<()> {
        let callable =
            functions::make_callable(&self.lua, &self.shared, arity, invoke).map_err(classify)?;
        self.lua.globals().set(name, callable).map_err(classify)?;
        debug!(function = name, arity, "registered host function");
        Ok(())
    }

    /// Registration-flavored alias for [`set_global`](Self::set_global).
    pub fn register_global<T: ScriptConvert>(&self, name: &str, value: &T) -> ScriptResult<()> {
        self.set_global(name, value)
    }

    /// Create (or reuse) a global table for nested registration.
    pub fn register_namespace(&self, name: &str) -> ScriptResult<Namespace<'_>> {
        let path = vec![name.to_string()];
        self.namespace_table(&path)?;
        debug!(namespace = name, "registered namespace");
        Ok(Namespace { runtime: self, path })
    }

    /* --------------------------- execution --------------------------- */

    /// Run a chunk and return the output captured from `print`.
    pub fn execute(&self, source: &str) -> ScriptResult<String> {
        self.lua
            .load(source)
            .set_name("chunk")
            .exec()
            .map_err(classify)?;
        Ok(self.take_output())
    }

    /// Run a script file and return the captured output.
    pub fn execute_file(&self, path: &Path) -> ScriptResult<String> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            ScriptError::runtime(format!("failed to read '{}': {e}", path.display()))
        })?;
        self.execute(&source)
    }

    /// Run a chunk and decode its return value.
    pub fn execute_returning<T: ScriptConvert>(&self, source: &str) -> ScriptResult<T> {
        let value: Value = self
            .lua
            .load(source)
            .set_name("chunk")
            .eval()
            .map_err(classify)?;
        T::decode_at(&from_lua(&value), Position::ReturnValue)
    }

    /// Call a global script function by name with encoded arguments.
    pub fn call_function<T: ScriptConvert>(
        &self,
        name: &str,
        args: &[ScriptValue],
    ) -> ScriptResult<T> {
        let target: Value = self.lua.globals().get(name).map_err(classify)?;
        let func = match target {
            Value::Function(func) => func,
            _ => {
                return Err(ScriptError::runtime(format!(
                    "global '{name}' is not a function"
                )))
            }
        };
        let mut lua_args = Vec::with_capacity(args.len());
        for value in args {
            lua_args.push(to_lua(&self.lua, value).map_err(classify)?);
        }
        let result: Value = func
            .call(MultiValue::from_vec(lua_args))
            .map_err(classify)?;
        T::decode_at(&from_lua(&result), Position::ReturnValue)
    }

    /* ---------------------------- globals ---------------------------- */

    pub fn set_global<T: ScriptConvert>(&self, name: &str, value: &T) -> ScriptResult<()> {
        let encoded = to_lua(&self.lua, &value.encode()).map_err(classify)?;
        self.lua.globals().set(name, encoded).map_err(classify)
    }

    pub fn get_global<T: ScriptConvert>(&self, name: &str) -> ScriptResult<T> {
        let value: Value = self.lua.globals().get(name).map_err(classify)?;
        T::decode_at(&from_lua(&value), Position::Global(name.to_string()))
    }

    /* -------------------------- output capture ----------------------- */

    /// Drain the retained `print` output.
    pub fn take_output(&self) -> String {
        self.shared.output.borrow_mut().take()
    }

    /// Install a callback invoked once per `print` statement with the
    /// formatted line. The retained buffer keeps filling regardless.
    pub fn set_print_sink(&self, sink: impl FnMut(&str) + 'static) {
        *self.shared.sink.borrow_mut() = Some(Box::new(sink));
    }

    pub fn clear_print_sink(&self) {
        *self.shared.sink.borrow_mut() = None;
    }

    /* --------------------------- converters -------------------------- */

    pub fn register_converter<P, F>(&self, name: impl Into<String>, parse: P, format: F)
    where
        P: Fn(&ScriptValue) -> ScriptResult<ScriptValue> + 'static,
        F: Fn(&ScriptValue) -> ScriptResult<ScriptValue> + 'static,
    {
        self.shared.converters.borrow_mut().register(name, parse, format);
    }

    pub fn convert_parse(&self, name: &str, value: &ScriptValue) -> ScriptResult<ScriptValue> {
        self.shared.converters.borrow().parse(name, value)
    }

    pub fn convert_format(&self, name: &str, value: &ScriptValue) -> ScriptResult<ScriptValue> {
        self.shared.converters.borrow().format(name, value)
    }

    /* ---------------------------- deferred ---------------------------- */

    /// Factory handed to host closures that start asynchronous work.
    pub fn deferred_factory(&self) -> DeferredFactory {
        DeferredFactory::new(self.shared.clone())
    }

    /// Apply queued deferred completions on the owning thread. Returns
    /// the number of script callbacks invoked.
    pub fn pump_deferred(&self) -> ScriptResult<usize> {
        deferred::pump(&self.lua, &self.shared)
    }

    /* --------------------------- diagnostics -------------------------- */

    /// Live host closure slots. Drops back down as script-side callables
    /// are finalized.
    pub fn closure_slot_count(&self) -> usize {
        self.shared.slots.borrow().len()
    }

    /// Live host object handles.
    pub fn live_handle_count(&self) -> usize {
        self.shared.arena.borrow().live()
    }

    /// Run a full garbage collection cycle, twice, so finalizers queued
    /// by the first pass also run.
    pub fn gc(&self) -> ScriptResult<()> {
        self.lua.gc_collect().map_err(classify)?;
        self.lua.gc_collect().map_err(classify)
    }

    /* ---------------------------- internals --------------------------- */

    fn namespace_table(&self, path: &[String]) -> ScriptResult<Table> {
        let mut table = self.lua.globals();
        for segment in path {
            let next = match table.raw_get::<Value>(segment.as_str()).map_err(classify)? {
                Value::Table(t) => t,
                Value::Nil => {
                    let t = self.lua.create_table().map_err(classify)?;
                    table
                        .raw_set(segment.as_str(), t.clone())
                        .map_err(classify)?;
                    t
                }
                _ => {
                    return Err(ScriptError::runtime(format!(
                        "global '{segment}' exists and is not a table"
                    )))
                }
            };
            table = next;
        }
        Ok(table)
    }
}

impl Default for ScriptRuntime {
    fn default() -> Self {
        Self::new().expect("Failed to create script runtime")
    }
}

/// Handle for registering functions and values under a global table
/// instead of the global scope itself. Nests.
pub struct Namespace<'rt> {
    runtime: &'rt ScriptRuntime,
    path: Vec<String>,
}

impl std::fmt::Debug for Namespace<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace").field("path", &self.path).finish_non_exhaustive()
    }
}

impl<'rt> Namespace<'rt> {
    /// Create (or reuse) a nested namespace under this one.
    pub fn namespace(&self, name: &str) -> ScriptResult<Namespace<'rt>> {
        let mut path = self.path.clone();
        path.push(name.to_string());
        self.runtime.namespace_table(&path)?;
        Ok(Namespace { runtime: self.runtime, path })
    }

    pub fn register_global<T: ScriptConvert>(&self, name: &str, value: &T) -> ScriptResult<()> {
        let table = self.runtime.namespace_table(&self.path)?;
        let encoded = to_lua(&self.runtime.lua, &value.encode()).map_err(classify)?;
        table.set(name, encoded).map_err(classify)
    }

    pub fn register_function0<R, F>(&self, name: &str, f: F) -> ScriptResult<()>
    where
        R: ScriptConvert + 'static,
        F: Fn() -> R + 'static,
    {
        self.install_callable(name, 0, functions::invoker0(f))
    }

    pub fn register_function1<A, R, F>(&self, name: &str, f: F) -> ScriptResult<()>
    where
        A: ScriptConvert + 'static,
        R: ScriptConvert + 'static,
        F: Fn(A) -> R + 'static,
    {
        self.install_callable(name, 1, functions::invoker1(f))
    }

    pub fn register_function2<A, B, R, F>(&self, name: &str, f: F) -> ScriptResult<()>
    where
        A: ScriptConvert + 'static,
        B: ScriptConvert + 'static,
        R: ScriptConvert + 'static,
        F: Fn(A, B) -> R + 'static,
    {
        self.install_callable(name, 2, functions::invoker2(f))
    }

    pub fn register_function3<A, B, C, R, F>(&self, name: &str, f: F) -> ScriptResult<()>
    where
        A: ScriptConvert + 'static,
        B: ScriptConvert + 'static,
        C: ScriptConvert + 'static,
        R: ScriptConvert + 'static,
        F: Fn(A, B, C) -> R + 'static,
    {
        self.install_callable(name, 3, functions::invoker3(f))
    }

    fn install_callable(
        &self,
        name: &str,
        arity: usize,
        invoke: functions::ClosureInvoker,
    ) -> ScriptResult<()> {
        let runtime = self.runtime;
        let callable = functions::make_callable(&runtime.lua, &runtime.shared, arity, invoke)
            .map_err(classify)?;
        let table = runtime.namespace_table(&self.path)?;
        table.set(name, callable).map_err(classify)?;
        debug!(namespace = %self.path.join("."), function = name, "registered host function");
        Ok(())
    }
}

/// Replace the engine's `print` with the capturing version.
fn install_print(lua: &Lua, shared: &Rc<Shared>) -> mlua::Result<()> {
    let print_shared = shared.clone();
    let tostring: mlua::Function = lua.globals().get("tostring")?;
    let print = lua.create_function(move |_lua, args: MultiValue| {
        let mut parts = Vec::with_capacity(args.len());
        for value in args {
            match value {
                // Byte passthrough; embedded NULs are preserved.
                Value::String(s) => {
                    parts.push(String::from_utf8_lossy(&s.as_bytes()).into_owned())
                }
                other => {
                    let rendered: mlua::String = tostring.call(other)?;
                    parts.push(String::from_utf8_lossy(&rendered.as_bytes()).into_owned());
                }
            }
        }
        let line = parts.join("\t");
        if print_shared.log_prints {
            debug!(target: "tether_script::print", "{line}");
        }
        if let Some(sink) = print_shared.sink.borrow_mut().as_mut() {
            sink(&line);
        }
        print_shared.output.borrow_mut().push(line);
        Ok(())
    })?;
    lua.globals().set("print", print)?;
    Ok(())
}
