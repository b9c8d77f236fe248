//! Integration tests for the host API
//!
//! Covers calling into scripts, registering natives, rooting, userdata and
//! the guarantee that a panicking native never takes the host down.

mod common;

use common::{function, run, run_err, run_ok, show};
use ember_core::{FunctionBuilder, Number, OpCode, Value};
use ember_runtime::{InterpretResult, NativeResult, RuntimeError, Tracer, UserData, Vm, expect_number};
use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;

fn define_add(vm: &mut Vm) -> Value {
    let mut add = FunctionBuilder::new("add").with_arity(2);
    add.get_local(1).get_local(2).op(OpCode::Add).op(OpCode::Return);
    let mut main = FunctionBuilder::new("main");
    main.closure(function(add), &[]).set_global("add").op(OpCode::Return);
    run_ok(vm, main)
}

#[test]
fn test_call_script_function() {
    let mut vm = Vm::new();
    let add = define_add(&mut vm);

    let result = vm.call(add, &[Value::fixed(2), Value::fixed(3)]);
    assert!(matches!(result, InterpretResult::Ok(Value::Number(Number::Fixed(5)))));

    let result = vm.call(add, &[Value::fixed(2), Value::float(3.5)]);
    assert!(matches!(result, InterpretResult::Ok(Value::Number(Number::Float(f))) if f == 5.5));

    // missing arguments read as null, which is 0 next to a number
    let result = vm.call(add, &[Value::fixed(2)]);
    assert_eq!(result, InterpretResult::Ok(Value::fixed(2)));
    assert_eq!(vm.root_depth(), 0);
}

#[test]
fn test_call_method_reports_missing_method_as_invalid() {
    let mut vm = Vm::new();
    let array = vm.make_array(vec![Value::fixed(1)]);
    vm.push_root(array);
    assert_eq!(vm.call_method(array, "flatten", &[]), InterpretResult::Invalid);
    assert_eq!(
        vm.call_method(array, "push", &[Value::fixed(2)]),
        InterpretResult::Ok(array)
    );
    assert_eq!(show(&mut vm, array), "[1, 2]");
    vm.pop_root();
}

#[test]
fn test_call_non_callable_is_a_runtime_error() {
    let mut vm = Vm::new();
    let result = vm.call(Value::fixed(3), &[]);
    assert!(matches!(result, InterpretResult::RuntimeError(_)));
    let message = &vm.last_error().unwrap().message;
    assert!(message.contains("neither function nor class"), "{}", message);
}

fn twice(vm: &mut Vm, args: &[Value]) -> NativeResult<Value> {
    let callback = args.first().copied().unwrap_or_default();
    let once = vm.invoke(callback, &[Value::fixed(1)])?;
    vm.invoke(callback, &[once])
}

#[test]
fn test_native_calls_back_into_script() {
    let mut vm = Vm::new();
    vm.define_native("twice", twice);

    let mut double = FunctionBuilder::new("double").with_arity(1);
    double.get_local(1).fixed(2).op(OpCode::Multiply).op(OpCode::Return);
    let mut main = FunctionBuilder::new("main");
    main.get_global("twice")
        .closure(function(double), &[])
        .call(1)
        .op(OpCode::Return);

    assert_eq!(run_ok(&mut vm, main), Value::fixed(4));
}

#[test]
fn test_native_errors_propagate_through_invoke() {
    let mut vm = Vm::new();
    vm.define_native("twice", twice);

    let mut failing = FunctionBuilder::new("failing").with_arity(1);
    failing
        .get_global("Fiber")
        .string("callback failed")
        .invoke("abort", 1)
        .op(OpCode::Return);
    let mut main = FunctionBuilder::new("main");
    main.get_global("twice")
        .closure(function(failing), &[])
        .call(1)
        .op(OpCode::Return);

    assert_eq!(run_err(&mut vm, main), "callback failed");
}

fn explode(_vm: &mut Vm, _args: &[Value]) -> NativeResult<Value> {
    panic!("kaboom")
}

#[test]
fn test_panicking_native_becomes_runtime_error() {
    let mut vm = Vm::new();
    vm.define_native("explode", explode);
    let mut main = FunctionBuilder::new("main");
    main.fixed(1).get_global("explode").call(0).op(OpCode::Return);

    assert_eq!(run_err(&mut vm, main), "internal error: kaboom");
    assert_eq!(vm.root_depth(), 0);
    assert_eq!(vm.current_fiber(), None);

    // the vm is still usable afterwards
    let add = define_add(&mut vm);
    assert_eq!(
        vm.call(add, &[Value::fixed(1), Value::fixed(1)]),
        InterpretResult::Ok(Value::fixed(2))
    );
}

fn checked_sqrt(_vm: &mut Vm, args: &[Value]) -> NativeResult<Value> {
    let n = expect_number(args, 0, "sqrt")?;
    if n.as_f64() < 0.0 {
        return Err(RuntimeError::new("sqrt() of a negative number"));
    }
    Ok(Value::float(n.as_f64().sqrt()))
}

#[test]
fn test_native_argument_checks() {
    let mut vm = Vm::new();
    vm.define_native("sqrt", checked_sqrt);
    let sqrt = vm.get_global("sqrt").unwrap();

    assert_eq!(vm.call(sqrt, &[Value::fixed(9)]), InterpretResult::Ok(Value::float(3.0)));

    let text = vm.new_string("nine");
    assert!(!vm.call(sqrt, &[text]).is_ok());
    assert_eq!(
        vm.last_error().unwrap().message,
        "sqrt() expects a number as argument 1"
    );

    assert!(!vm.call(sqrt, &[Value::fixed(-1)]).is_ok());
    assert_eq!(vm.last_error().unwrap().message, "sqrt() of a negative number");
}

#[test]
fn test_globals_round_trip() {
    let mut vm = Vm::new();
    vm.set_global("fixed", Value::fixed(7));
    vm.set_global("float", Value::float(7.0));
    assert!(matches!(vm.get_global("fixed"), Some(Value::Number(Number::Fixed(7)))));
    assert!(matches!(vm.get_global("float"), Some(Value::Number(Number::Float(f))) if f == 7.0));
    assert_eq!(vm.get_global("missing"), None);
}

#[test]
fn test_values_equal_never_matches_objects() {
    let mut vm = Vm::new();
    let class = vm.define_class("Point");
    let a = vm.make_instance(class);
    vm.push_root(a);
    let b = vm.make_instance(class);
    vm.push_root(b);

    assert!(!vm.values_equal(a, a));
    assert!(!vm.values_equal(a, b));
    let (x, y) = (vm.new_string("same"), vm.new_string("same"));
    assert!(!vm.values_equal(x, y));
    assert!(!vm.values_equal(x, Value::Null));

    assert!(vm.values_equal(Value::fixed(2), Value::float(2.0)));
    assert!(vm.values_equal(Value::Null, Value::Null));
    assert!(vm.values_equal(Value::Bool(false), Value::Bool(false)));
    assert!(!vm.values_equal(Value::Null, Value::fixed(0)));
    vm.pop_root();
    vm.pop_root();
}

#[test]
fn test_values_equal_runs_instance_operator() {
    let mut vm = Vm::new();
    vm.set_global("compared", Value::fixed(0));
    let class = vm.define_class("Always");
    vm.bind_method(class, "==", |vm, _receiver, _args| {
        let count = match vm.get_global("compared") {
            Some(Value::Number(n)) => n.as_i64(),
            _ => 0,
        };
        vm.set_global("compared", Value::fixed(count + 1));
        Ok(Value::Bool(true))
    });
    let a = vm.make_instance(class);
    vm.push_root(a);

    assert!(!vm.values_equal(a, a));
    assert_eq!(vm.get_global("compared"), Some(Value::fixed(1)));
    vm.pop_root();
}

struct Counter {
    count: i64,
    label: Value,
    dropped: Rc<Cell<bool>>,
}

impl UserData for Counter {
    fn type_name(&self) -> &str {
        "counter"
    }

    fn trace(&self, tracer: &mut Tracer) {
        tracer.value(self.label);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for Counter {
    fn drop(&mut self) {
        self.dropped.set(true);
    }
}

fn bump(vm: &mut Vm, args: &[Value]) -> NativeResult<Value> {
    let target = args.first().copied().unwrap_or_default();
    let counter = vm
        .userdata_mut::<Counter>(target)
        .ok_or_else(|| RuntimeError::new("bump() expects a counter"))?;
    counter.count += 1;
    Ok(Value::fixed(counter.count))
}

#[test]
fn test_userdata_lifecycle() {
    let mut vm = Vm::new();
    vm.define_native("bump", bump);
    let dropped = Rc::new(Cell::new(false));
    let label = vm.new_string("a label only the counter holds");
    let counter = vm.make_userdata(Counter {
        count: 0,
        label,
        dropped: dropped.clone(),
    });
    vm.set_global("counter", counter);

    let mut main = FunctionBuilder::new("main");
    main.get_global("bump").get_global("counter").call(1).op(OpCode::Pop);
    main.get_global("bump").get_global("counter").call(1).op(OpCode::Return);
    assert!(matches!(run(&mut vm, main), InterpretResult::Ok(v) if v == Value::fixed(2)));
    assert_eq!(show(&mut vm, counter), "<counter>");

    vm.collect_garbage();
    assert!(!dropped.get());
    assert_eq!(vm.str_value(label), Some("a label only the counter holds"));

    vm.set_global("counter", Value::Null);
    vm.collect_garbage();
    assert!(dropped.get());
}

#[test]
fn test_with_root_protects_values() {
    let mut vm = Vm::new();
    let array = vm.make_array(vec![Value::fixed(1)]);
    let r = array.as_object().unwrap();
    let depth = vm.with_root(array, |vm| {
        vm.collect_garbage();
        assert!(vm.heap().contains(r));
        vm.root_depth()
    });
    assert_eq!(depth, 1);
    assert_eq!(vm.root_depth(), 0);
    vm.collect_garbage();
    assert!(!vm.heap().contains(r));
}
