//! Integration tests for closures and upvalues
//!
//! Captured locals stay shared while their scope is open, become private
//! copies once it closes, and survive the owning fiber's stack growing
//! underneath them.

mod common;

use common::{deep, function, return_locals, run_ok, show};
use ember_core::{FunctionBuilder, OpCode};
use ember_runtime::{Vm, VmConfig};

/// `fn() { upvalue = upvalue + 1; return upvalue }`
fn increment() -> FunctionBuilder {
    let mut f = FunctionBuilder::new("increment");
    f.get_upvalue(0)
        .fixed(1)
        .op(OpCode::Add)
        .set_upvalue(0)
        .op(OpCode::Return);
    f
}

/// `fn() { return upvalue }`
fn read() -> FunctionBuilder {
    let mut f = FunctionBuilder::new("read");
    f.get_upvalue(0).op(OpCode::Return);
    f
}

#[test]
fn test_open_capture_is_shared() {
    let mut vm = Vm::new();
    let mut main = FunctionBuilder::new("main");
    main.fixed(0); // slot 1: x
    main.closure(function(increment()), &[(true, 1)]); // slot 2
    main.closure(function(read()), &[(true, 1)]); // slot 3
    main.get_local(2).call(0).op(OpCode::Pop);
    main.get_local(2).call(0).op(OpCode::Pop);
    main.get_local(3).call(0); // slot 4
    main.get_local(1); // slot 5
    return_locals(&mut main, &[4, 5]);

    let result = run_ok(&mut vm, main);
    assert_eq!(show(&mut vm, result), "[2, 2]");
}

#[test]
fn test_closed_captures_are_independent() {
    let mut vm = Vm::new();

    let mut make = FunctionBuilder::new("makeCounter");
    make.fixed(0)
        .closure(function(increment()), &[(true, 1)])
        .op(OpCode::Return);

    let mut main = FunctionBuilder::new("main");
    main.closure(function(make), &[]); // slot 1
    main.get_local(1).call(0); // slot 2: first counter
    main.get_local(1).call(0); // slot 3: second counter
    main.get_local(2).call(0).op(OpCode::Pop);
    main.get_local(2).call(0).op(OpCode::Pop);
    main.get_local(3).call(0); // slot 4
    main.get_local(2).call(0); // slot 5
    return_locals(&mut main, &[4, 5]);

    let result = run_ok(&mut vm, main);
    assert_eq!(show(&mut vm, result), "[1, 3]");
}

#[test]
fn test_close_upvalue_detaches_from_slot() {
    let mut vm = Vm::new();
    let mut main = FunctionBuilder::new("main");
    main.null(); // slot 1: holder
    main.fixed(10); // slot 2: block-scoped x
    main.closure(function(read()), &[(true, 2)]);
    main.set_local(1).op(OpCode::Pop);
    main.op(OpCode::CloseUpvalue);
    main.fixed(20); // slot 2 reused by a new local
    main.get_local(1).call(0).op(OpCode::Return);

    let result = run_ok(&mut vm, main);
    assert_eq!(show(&mut vm, result), "10");
}

#[test]
fn test_nested_capture_through_enclosing_upvalue() {
    let mut vm = Vm::new();

    // outer captures main's slot 1; inner captures outer's upvalue 0
    let mut outer = FunctionBuilder::new("outer");
    outer
        .closure(function(increment()), &[(false, 0)])
        .op(OpCode::Return);

    let mut main = FunctionBuilder::new("main");
    main.fixed(5); // slot 1
    main.closure(function(outer), &[(true, 1)]); // slot 2
    main.get_local(2).call(0); // slot 3: inner
    main.get_local(3).call(0).op(OpCode::Pop);
    main.get_local(1); // slot 4
    return_locals(&mut main, &[4]);

    let result = run_ok(&mut vm, main);
    assert_eq!(show(&mut vm, result), "[6]");
}

#[test]
fn test_upvalue_survives_stack_growth() {
    let config = VmConfig::new().with_initial_stack(8).with_initial_frames(4);
    let mut vm = Vm::with_config(config);

    let mut main = FunctionBuilder::new("main");
    main.closure(deep(), &[]).set_global("deep").op(OpCode::Pop);
    main.fixed(41); // slot 1
    main.closure(function(increment()), &[(true, 1)]); // slot 2
    main.get_global("deep").fixed(200).call(1); // slot 3
    main.get_local(2).call(0); // slot 4
    main.get_local(1); // slot 5
    return_locals(&mut main, &[3, 4, 5]);

    let result = run_ok(&mut vm, main);
    assert_eq!(show(&mut vm, result), "[200, 42, 42]");
}
