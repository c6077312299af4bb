use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tether_script::{
    CapturePolicy, DeferredResolver, RuntimeSettings, ScriptError, ScriptRuntime, ScriptValue,
    Truncation,
};

fn runtime() -> ScriptRuntime {
    ScriptRuntime::new().expect("runtime should initialize")
}

/* ---------------------------- execution ----------------------------- */

#[test]
fn execute_captures_print_output_in_order() {
    let rt = runtime();
    let output = rt.execute(r#"print("a") print("b")"#).unwrap();
    assert_eq!(output, "a\nb\n");
}

#[test]
fn print_joins_arguments_with_tabs() {
    let rt = runtime();
    let output = rt.execute(r#"print("x", 1, true, nil)"#).unwrap();
    assert_eq!(output, "x\t1\ttrue\tnil\n");
}

#[test]
fn output_is_retained_between_executions_until_taken() {
    let rt = runtime();
    rt.execute(r#"print("one")"#).unwrap();
    // execute drains; a second run starts from an empty buffer
    let output = rt.execute(r#"print("two")"#).unwrap();
    assert_eq!(output, "two\n");
}

#[test]
fn print_sink_sees_each_line_as_it_happens() {
    let rt = runtime();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink_seen = seen.clone();
    rt.set_print_sink(move |line| sink_seen.borrow_mut().push(line.to_string()));
    rt.execute(r#"print("first") print("second")"#).unwrap();
    assert_eq!(*seen.borrow(), vec!["first".to_string(), "second".to_string()]);
}

#[test]
fn bounded_capture_truncates_oldest() {
    let settings = RuntimeSettings {
        capture: CapturePolicy::MaxSize { bytes: 8, truncation: Truncation::Oldest },
        ..RuntimeSettings::default()
    };
    let rt = ScriptRuntime::with_settings(settings).unwrap();
    let output = rt.execute(r#"print("aaa") print("bbb") print("ccc")"#).unwrap();
    assert_eq!(output, "bbb\nccc\n");
}

#[test]
fn execute_returning_decodes_script_results() {
    let rt = runtime();
    assert_eq!(rt.execute_returning::<i64>("return 2 + 2").unwrap(), 4);
    assert_eq!(
        rt.execute_returning::<Vec<i64>>("return {1, 2, 3}").unwrap(),
        vec![1, 2, 3]
    );
    let map: BTreeMap<String, i64> = rt
        .execute_returning("return { a = 1, b = 2 }")
        .unwrap();
    assert_eq!(map.get("a"), Some(&1));
    assert_eq!(map.get("b"), Some(&2));
}

#[test]
fn execute_returning_reports_return_value_mismatch() {
    let rt = runtime();
    let err = rt.execute_returning::<i64>("return 'text'").unwrap_err();
    match err {
        ScriptError::TypeMismatch { expected, actual, .. } => {
            assert_eq!(expected, "integer");
            assert_eq!(actual, "string");
        }
        other => panic!("expected TypeMismatch, got {other:?}"),
    }
}

#[test]
fn integer_results_reject_fractional_numbers() {
    let rt = runtime();
    assert!(rt.execute_returning::<i64>("return 1.5").is_err());
    assert_eq!(rt.execute_returning::<i64>("return 3.0").unwrap(), 3);
}

#[test]
fn strings_with_embedded_nul_cross_both_ways() {
    let rt = runtime();
    let text: String = rt.execute_returning(r#"return "a\0b""#).unwrap();
    assert_eq!(text.as_bytes(), b"a\0b");

    rt.set_global("s", &String::from("x\0y")).unwrap();
    let len: i64 = rt.execute_returning("return #s").unwrap();
    assert_eq!(len, 3);
}

#[test]
fn syntax_errors_carry_a_line_number() {
    let rt = runtime();
    let err = rt.execute("local x =\nlocal y = 2").unwrap_err();
    match err {
        ScriptError::Syntax { line, .. } => assert_eq!(line, 2),
        other => panic!("expected Syntax, got {other:?}"),
    }
}

#[test]
fn script_errors_classify_as_runtime() {
    let rt = runtime();
    let err = rt.execute("error('boom')").unwrap_err();
    match err {
        ScriptError::Runtime { message } => assert!(message.contains("boom"), "got: {message}"),
        other => panic!("expected Runtime, got {other:?}"),
    }
}

#[test]
fn call_function_round_trips_arguments() {
    let rt = runtime();
    rt.execute("function double(n) return n * 2 end").unwrap();
    let doubled: i64 = rt
        .call_function("double", &[ScriptValue::Integer(21)])
        .unwrap();
    assert_eq!(doubled, 42);

    let err = rt
        .call_function::<i64>("missing", &[])
        .unwrap_err();
    assert!(err.to_string().contains("not a function"));
}

/* ------------------------------ globals ----------------------------- */

#[test]
fn globals_round_trip_through_the_codec() {
    let rt = runtime();
    rt.set_global("count", &7i64).unwrap();
    assert_eq!(rt.get_global::<i64>("count").unwrap(), 7);

    rt.register_global("tags", &vec!["a".to_string(), "b".to_string()]).unwrap();
    let joined: String = rt
        .execute_returning("return tags[1] .. tags[2]")
        .unwrap();
    assert_eq!(joined, "ab");

    let err = rt.get_global::<i64>("tags").unwrap_err();
    assert!(matches!(err, ScriptError::TypeMismatch { .. }));
}

/* -------------------------- function bridge ------------------------- */

#[test]
fn wrapped_closure_adds_like_the_host_closure() {
    let rt = runtime();
    rt.register_function2("add", |a: i64, b: i64| a + b).unwrap();
    assert_eq!(rt.execute_returning::<i64>("return add(10, 32)").unwrap(), 42);
}

#[test]
fn insufficient_arguments_raise_argument_count() {
    let rt = runtime();
    rt.register_function2("add", |a: i64, b: i64| a + b).unwrap();
    let err = rt.execute("return add(10)").unwrap_err();
    assert_eq!(err, ScriptError::ArgumentCount { expected: 2, actual: 1 });
}

#[test]
fn mistyped_argument_raises_positional_mismatch() {
    let rt = runtime();
    rt.register_function2("add", |a: i64, b: i64| a + b).unwrap();
    let err = rt.execute("return add('ten', 32)").unwrap_err();
    match err {
        ScriptError::TypeMismatch { expected, actual, .. } => {
            assert_eq!(expected, "integer");
            assert_eq!(actual, "string");
        }
        other => panic!("expected TypeMismatch, got {other:?}"),
    }
}

#[test]
fn bridge_errors_are_pcall_interceptable() {
    let rt = runtime();
    rt.register_function1("shout", |s: String| s.to_uppercase()).unwrap();
    let caught: bool = rt
        .execute_returning("local ok = pcall(shout, {}) return ok")
        .unwrap();
    assert!(!caught);
}

#[test]
fn finalized_callable_releases_its_slot() {
    let rt = runtime();
    rt.register_function0("tick", || 1i64).unwrap();
    assert_eq!(rt.closure_slot_count(), 1);

    rt.execute("tick = nil").unwrap();
    rt.gc().unwrap();
    assert_eq!(rt.closure_slot_count(), 0);
}

#[test]
fn tampered_callable_is_invalid() {
    let rt = runtime();
    rt.register_function0("tick", || 1i64).unwrap();
    let message: String = rt
        .execute_returning(
            r#"
            tick.__fn = nil
            local ok, err = pcall(tick)
            return tostring(err)
            "#,
        )
        .unwrap();
    assert!(message.contains("invalid callable"), "got: {message}");
}

#[test]
fn surplus_arguments_are_ignored() {
    let rt = runtime();
    rt.register_function1("inc", |n: i64| n + 1).unwrap();
    assert_eq!(rt.execute_returning::<i64>("return inc(1, 'extra')").unwrap(), 2);
}

#[test]
fn nested_optional_returns_collapse() {
    let rt = runtime();
    rt.register_function0("present", || Some(Some(Some(7i64)))).unwrap();
    rt.register_function0("absent", || -> Option<Option<Option<i64>>> { Some(None) })
        .unwrap();

    assert_eq!(rt.execute_returning::<i64>("return present()").unwrap(), 7);
    let is_nil: bool = rt.execute_returning("return absent() == nil").unwrap();
    assert!(is_nil);
}

#[test]
fn optional_parameters_accept_nil() {
    let rt = runtime();
    rt.register_function1("describe", |n: Option<i64>| match n {
        Some(n) => format!("got {n}"),
        None => "got nothing".to_string(),
    })
    .unwrap();
    assert_eq!(
        rt.execute_returning::<String>("return describe(4)").unwrap(),
        "got 4"
    );
    assert_eq!(
        rt.execute_returning::<String>("return describe(nil)").unwrap(),
        "got nothing"
    );
}

/* ---------------------------- namespaces ---------------------------- */

#[test]
fn namespaces_nest_and_hold_functions_and_values() {
    let rt = runtime();
    let game = rt.register_namespace("game").unwrap();
    game.register_global("gravity", &9.81f64).unwrap();
    let math_ns = game.namespace("math").unwrap();
    math_ns.register_function2("add", |a: i64, b: i64| a + b).unwrap();

    assert_eq!(
        rt.execute_returning::<i64>("return game.math.add(2, 3)").unwrap(),
        5
    );
    assert_eq!(
        rt.execute_returning::<f64>("return game.gravity").unwrap(),
        9.81
    );
}

#[test]
fn namespace_over_a_non_table_global_fails() {
    let rt = runtime();
    rt.set_global("game", &1i64).unwrap();
    let err = rt.register_namespace("game").unwrap_err();
    assert!(err.to_string().contains("not a table"));
}

/* ---------------------------- converters ---------------------------- */

#[test]
fn converters_are_reachable_through_the_runtime() {
    let rt = runtime();
    let parsed = rt
        .convert_parse("date", &ScriptValue::String("2026-08-06".into()))
        .unwrap();
    let back = rt.convert_format("date", &parsed).unwrap();
    assert_eq!(back, ScriptValue::String("2026-08-06".into()));

    rt.register_converter(
        "csv",
        |v| {
            let text = v.as_str().unwrap_or_default();
            Ok(ScriptValue::Array(
                text.split(',').map(|s| ScriptValue::String(s.into())).collect(),
            ))
        },
        |v| Ok(v.clone()),
    );
    let split = rt
        .convert_parse("csv", &ScriptValue::String("a,b".into()))
        .unwrap();
    assert_eq!(
        split,
        ScriptValue::Array(vec![
            ScriptValue::String("a".into()),
            ScriptValue::String("b".into())
        ])
    );
}

/* ----------------------------- deferred ----------------------------- */

#[test]
fn deferred_resolves_from_another_thread_via_pump() {
    let rt = runtime();
    let factory = rt.deferred_factory();
    let resolvers: Rc<RefCell<Vec<DeferredResolver>>> = Rc::new(RefCell::new(Vec::new()));
    let stash = resolvers.clone();
    rt.register_function0("fetch", move || {
        let (deferred, resolver) = factory.create();
        stash.borrow_mut().push(resolver);
        deferred
    })
    .unwrap();

    rt.execute(
        r#"
        local token = fetch()
        deferred.done(token, function(v) result = v end)
        "#,
    )
    .unwrap();

    let resolver = resolvers.borrow_mut().pop().expect("closure stored a resolver");
    let worker = std::thread::spawn(move || resolver.resolve(ScriptValue::Integer(42)));
    worker.join().expect("worker thread").unwrap();

    // Nothing is delivered until the owning thread pumps.
    assert!(rt.get_global::<Option<i64>>("result").unwrap().is_none());
    assert_eq!(rt.pump_deferred().unwrap(), 1);
    assert_eq!(rt.get_global::<i64>("result").unwrap(), 42);
}

#[test]
fn completion_arriving_before_done_is_parked() {
    let rt = runtime();
    let factory = rt.deferred_factory();
    let (deferred, resolver) = factory.create();
    resolver.resolve(ScriptValue::String("early".into())).unwrap();
    assert_eq!(rt.pump_deferred().unwrap(), 0);

    rt.set_global("token", &deferred).unwrap();
    rt.execute("deferred.done(token, function(v) result = v end)").unwrap();
    assert_eq!(rt.get_global::<String>("result").unwrap(), "early");
}

/* --------------------------- resource model -------------------------- */

#[test]
fn independent_runtimes_are_isolated() {
    let a = runtime();
    let b = runtime();
    a.set_global("shared", &1i64).unwrap();
    assert!(b.get_global::<Option<i64>>("shared").unwrap().is_none());
}

#[test]
fn memory_limited_runtime_fails_allocation_instead_of_aborting() {
    let settings = RuntimeSettings {
        memory_limit: Some(1),
        ..RuntimeSettings::default()
    };
    let rt = match ScriptRuntime::with_settings(settings) {
        Ok(rt) => rt,
        // Some engines refuse the limit at creation; that is the same
        // failure surfaced earlier.
        Err(ScriptError::AllocationFailure { .. }) => return,
        Err(other) => panic!("expected AllocationFailure, got {other:?}"),
    };
    let err = rt
        .execute("local t = {} for i = 1, 100000 do t[i] = i end")
        .unwrap_err();
    assert!(matches!(err, ScriptError::AllocationFailure { .. } | ScriptError::Runtime { .. }));
}
