//! Integration tests for values as scripts see them: storage round trips,
//! numeric widening, operators on primitives, references and variadic calls

mod common;

use common::{function, return_locals, run_ok, show};
use ember_core::{FunctionBuilder, Number, OpCode, Value};
use ember_runtime::{InterpretResult, Vm};

fn element(vm: &mut Vm, array: Value, index: i64) -> Value {
    vm.set_global("result", array);
    match vm.call_method(array, "[]", &[Value::fixed(index)]) {
        InterpretResult::Ok(value) => value,
        other => panic!("subscript failed: {:?}", other),
    }
}

#[test]
fn test_storage_round_trip_keeps_sub_tag() {
    let mut vm = Vm::new();

    let mut through_upvalue = FunctionBuilder::new("throughUpvalue");
    through_upvalue
        .float(1.5)
        .set_upvalue(0)
        .op(OpCode::Pop)
        .get_upvalue(0)
        .op(OpCode::Return);

    let mut main = FunctionBuilder::new("main");
    main.null(); // slot 1
    main.fixed(7).set_local(1).op(OpCode::Pop);
    main.get_local(1); // slot 2
    main.float(7.0).set_global("g").op(OpCode::Pop);
    main.get_global("g"); // slot 3
    main.fixed(9).set_private(0).op(OpCode::Pop);
    main.get_private(0); // slot 4
    main.closure(function(through_upvalue), &[(true, 1)]).call(0); // slot 5
    main.float(-0.25).set_private(1).op(OpCode::Pop);
    main.get_private(1); // slot 6
    return_locals(&mut main, &[2, 3, 4, 5, 6]);
    let image = main.finish_module("roundtrip", &["a", "b"]).unwrap();

    let array = vm.interpret_image(&image).value().unwrap();
    assert!(matches!(element(&mut vm, array, 0), Value::Number(Number::Fixed(7))));
    assert!(matches!(element(&mut vm, array, 1), Value::Number(Number::Float(f)) if f == 7.0));
    assert!(matches!(element(&mut vm, array, 2), Value::Number(Number::Fixed(9))));
    assert!(matches!(element(&mut vm, array, 3), Value::Number(Number::Float(f)) if f == 1.5));
    assert!(matches!(element(&mut vm, array, 4), Value::Number(Number::Float(f)) if f == -0.25));
}

#[test]
fn test_numeric_widening() {
    let mut vm = Vm::new();
    let mut main = FunctionBuilder::new("main");
    main.fixed(2).fixed(3).op(OpCode::Add); // slot 1
    main.fixed(2).float(3.5).op(OpCode::Add); // slot 2
    main.fixed(2).float(2.0).op(OpCode::Equal); // slot 3
    main.fixed(7).fixed(2).op(OpCode::FloorDivide); // slot 4
    main.fixed(1).fixed(4).op(OpCode::LeftShift); // slot 5
    return_locals(&mut main, &[1, 2, 3, 4, 5]);

    let array = run_ok(&mut vm, main);
    assert!(matches!(element(&mut vm, array, 0), Value::Number(Number::Fixed(5))));
    assert!(matches!(element(&mut vm, array, 1), Value::Number(Number::Float(f)) if f == 5.5));
    assert_eq!(element(&mut vm, array, 2), Value::Bool(true));
    assert_eq!(show(&mut vm, array), "[5, 5.5, true, 3, 16]");
}

#[test]
fn test_bool_operands_dispatch_to_bool_class() {
    let mut vm = Vm::new();
    let mut main = FunctionBuilder::new("main");
    main.op(OpCode::True).op(OpCode::True).op(OpCode::Equal); // slot 1
    main.op(OpCode::True).op(OpCode::False).op(OpCode::Equal); // slot 2
    main.op(OpCode::False).fixed(0).op(OpCode::Equal); // slot 3
    return_locals(&mut main, &[1, 2, 3]);

    let array = run_ok(&mut vm, main);
    assert_eq!(show(&mut vm, array), "[true, false, false]");
}

#[test]
fn test_methods_on_primitive_receivers() {
    let mut vm = Vm::new();
    let text = vm.invoke_method(Value::fixed(5), "toString", &[]).unwrap();
    assert_eq!(vm.str_value(text), Some("5"));
    let text = vm.invoke_method(Value::Bool(false), "toString", &[]).unwrap();
    assert_eq!(vm.str_value(text), Some("false"));
    assert_eq!(
        vm.invoke_method(Value::Bool(true), "==", &[Value::Bool(true)]).unwrap(),
        Value::Bool(true)
    );
    let text = vm.call_method(Value::float(2.5), "toString", &[]).value().unwrap();
    assert_eq!(vm.str_value(text), Some("2.5"));

    let mut main = FunctionBuilder::new("main");
    main.fixed(42).invoke("toString", 0).op(OpCode::Return);
    let text = run_ok(&mut vm, main);
    assert_eq!(vm.str_value(text), Some("42"));
}

#[test]
fn test_logical_operators_short_circuit() {
    let mut vm = Vm::new();
    let mut main = FunctionBuilder::new("main");

    // false and (never evaluated)
    main.op(OpCode::False);
    let skip = main.jump(OpCode::And);
    main.get_global("missing").call(0);
    main.patch_jump(skip); // slot 1

    // null ?? 4
    main.null();
    let present = main.jump(OpCode::NullOr);
    main.fixed(4);
    main.patch_jump(present); // slot 2

    // 0 or 5
    main.fixed(0);
    let truthy = main.jump(OpCode::Or);
    main.fixed(5);
    main.patch_jump(truthy); // slot 3
    return_locals(&mut main, &[1, 2, 3]);

    let result = run_ok(&mut vm, main);
    assert_eq!(show(&mut vm, result), "[false, 4, 5]");
}

#[test]
fn test_reference_to_local_and_global() {
    let mut vm = Vm::new();

    // fn(ref) { ref = 42 }
    let mut assign = FunctionBuilder::new("assign").with_arity(1);
    assign
        .fixed(42)
        .get_local(1)
        .op(OpCode::SetReference)
        .op(OpCode::Return);

    let mut main = FunctionBuilder::new("main");
    main.fixed(0); // slot 1
    main.closure(function(assign), &[]).set_global("assign").op(OpCode::Pop);
    main.get_global("assign").op_short(OpCode::ReferenceLocal, 1).call(1).op(OpCode::Pop);
    main.fixed(1).set_global("g").op(OpCode::Pop);
    let g = main.name_constant("g");
    main.get_global("assign").op_short(OpCode::ReferenceGlobal, g).call(1).op(OpCode::Pop);
    main.get_global("g"); // slot 2
    return_locals(&mut main, &[1, 2]);

    let result = run_ok(&mut vm, main);
    assert_eq!(show(&mut vm, result), "[42, 42]");
}

#[test]
fn test_reference_to_missing_global() {
    let mut vm = Vm::new();
    let mut main = FunctionBuilder::new("main");
    let name = main.name_constant("nowhere");
    main.op_short(OpCode::ReferenceGlobal, name).op(OpCode::Return);
    assert_eq!(
        common::run_err(&mut vm, main),
        "attempt to reference a null value"
    );
}

#[test]
fn test_varargs_collect_and_splice() {
    let mut vm = Vm::new();

    // fn count(...) { return args.length }
    let mut count = FunctionBuilder::new("count").with_vararg();
    count.get_local(1).get_field("length").op(OpCode::Return);

    // fn forward(...) { return count(...) }
    let mut forward = FunctionBuilder::new("forward").with_vararg();
    forward
        .get_global("count")
        .op_byte(OpCode::VarArg, 1)
        .call(1)
        .op(OpCode::Return);

    let mut main = FunctionBuilder::new("main");
    main.closure(function(count), &[]).set_global("count").op(OpCode::Pop);
    main.get_global("count").call(0); // slot 1
    main.get_global("count").fixed(1).fixed(2).fixed(3).call(3); // slot 2
    main.closure(function(forward), &[])
        .fixed(1)
        .fixed(2)
        .fixed(3)
        .fixed(4)
        .call(4); // slot 3
    return_locals(&mut main, &[1, 2, 3]);

    let result = run_ok(&mut vm, main);
    assert_eq!(show(&mut vm, result), "[0, 3, 4]");
}

#[test]
fn test_ranges_and_maps() {
    let mut vm = Vm::new();
    let mut main = FunctionBuilder::new("main");
    main.fixed(10).fixed(4).op(OpCode::Range); // slot 1: 4 .. 10
    main.get_local(1).get_field("length"); // slot 2
    main.op(OpCode::Object)
        .string("b")
        .fixed(2)
        .op(OpCode::PushObjectField)
        .string("a")
        .fixed(1)
        .op(OpCode::PushObjectField); // slot 3
    main.get_local(3).get_field("length"); // slot 4
    return_locals(&mut main, &[2, 3, 4]);

    let result = run_ok(&mut vm, main);
    assert_eq!(show(&mut vm, result), "[6, {a: 1, b: 2}, 2]");
}
