//! Shared helpers for the runtime integration tests

#![allow(dead_code)]

use ember_core::{FunctionBuilder, FunctionImage, OpCode, Value};
use ember_runtime::{InterpretResult, Vm};

/// Route `tracing` output through the test harness; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Assemble `main` as module "test" and run it
pub fn run(vm: &mut Vm, main: FunctionBuilder) -> InterpretResult {
    init_tracing();
    let image = main.finish_module("test", &[]).expect("program assembles");
    vm.interpret_image(&image)
}

/// Run `main` and return the value it produced, failing on any error
pub fn run_ok(vm: &mut Vm, main: FunctionBuilder) -> Value {
    match run(vm, main) {
        InterpretResult::Ok(value) => value,
        other => panic!("program failed: {:?} {:?}", other, vm.last_error()),
    }
}

/// Run `main` and return the message of the error that escaped
pub fn run_err(vm: &mut Vm, main: FunctionBuilder) -> String {
    match run(vm, main) {
        InterpretResult::RuntimeError(_) => vm
            .last_error()
            .map(|e| e.message.clone())
            .expect("an escaped error is recorded"),
        other => panic!("expected a runtime error, got {:?}", other),
    }
}

pub fn show(vm: &mut Vm, value: Value) -> String {
    vm.to_display_string(value).expect("value displays")
}

pub fn function(builder: FunctionBuilder) -> FunctionImage {
    builder.finish().expect("function assembles")
}

/// `deep(n)`: recurses `n` times and returns `n`
pub fn deep() -> FunctionImage {
    let mut f = FunctionBuilder::new("deep").with_arity(1);
    f.get_local(1).fixed(0).op(OpCode::Equal);
    let base = f.jump(OpCode::JumpIfFalse);
    f.fixed(0).op(OpCode::Return);
    f.patch_jump(base);
    f.get_global("deep")
        .get_local(1)
        .fixed(1)
        .op(OpCode::Subtract)
        .call(1)
        .fixed(1)
        .op(OpCode::Add)
        .op(OpCode::Return);
    function(f)
}

/// Emit an array literal of the given locals and return it
pub fn return_locals(main: &mut FunctionBuilder, slots: &[u16]) {
    main.op(OpCode::Array);
    for slot in slots {
        main.get_local(*slot).op(OpCode::PushArrayElement);
    }
    main.op(OpCode::Return);
}
