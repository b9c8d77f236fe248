//! Integration tests for running serialized bytecode images

mod common;

use common::{function, init_tracing, show};
use ember_core::{FunctionBuilder, ModuleImage, OpCode, Value};
use ember_runtime::{InterpretResult, Vm};
use std::fs::File;
use tempfile::TempDir;

/// A module that bumps the global `loads` and returns a greeting built from
/// a private variable and a nested function
fn greeting_module() -> ModuleImage {
    let mut suffix = FunctionBuilder::new("suffix");
    suffix.string("!").op(OpCode::Return);

    let mut main = FunctionBuilder::new("main");
    main.get_global("loads")
        .fixed(1)
        .op(OpCode::Add)
        .set_global("loads")
        .op(OpCode::Pop);
    main.string("hello").set_private(0).op(OpCode::Pop);
    main.get_private(0)
        .closure(function(suffix), &[])
        .call(0)
        .op(OpCode::Add)
        .op(OpCode::Return);
    main.finish_module("greeting", &["word"]).unwrap()
}

#[test]
fn test_interpret_file() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("greeting.emb");
    greeting_module()
        .write_to(File::create(&path).unwrap())
        .unwrap();

    let mut vm = Vm::new();
    vm.set_global("loads", Value::fixed(0));
    let value = vm.interpret_file(&path).value().unwrap();
    assert_eq!(show(&mut vm, value), "hello!");
    assert_eq!(vm.get_global("loads"), Some(Value::fixed(1)));
    assert!(vm.module("greeting").is_some());
}

#[test]
fn test_module_runs_once_and_caches_its_value() {
    let mut vm = Vm::new();
    vm.set_global("loads", Value::fixed(0));
    let module = vm.load_image(&greeting_module());

    let first = vm.interpret_module(module).value().unwrap();
    let second = vm.interpret_module(module).value().unwrap();
    assert_eq!(first, second);
    assert_eq!(vm.get_global("loads"), Some(Value::fixed(1)));
}

#[test]
fn test_missing_file_is_a_compile_error() {
    let dir = TempDir::new().unwrap();
    let mut vm = Vm::new();
    let result = vm.interpret_file(dir.path().join("absent.emb"));
    assert_eq!(result, InterpretResult::CompileError);
    let message = &vm.last_error().unwrap().message;
    assert!(message.starts_with("cannot read '"), "{}", message);
    assert!(message.contains("absent.emb"));
}

#[test]
fn test_corrupt_image_is_a_compile_error() {
    let mut vm = Vm::new();
    let mut bytes = greeting_module().to_bytes().unwrap();
    bytes.truncate(bytes.len() / 2);
    assert_eq!(vm.interpret_bytes(&bytes), InterpretResult::CompileError);
    assert!(vm.last_error().is_some());
    assert!(vm.module("greeting").is_none());
}

#[test]
fn test_line_information_survives_serialization() {
    let mut main = FunctionBuilder::new("main");
    main.set_line(12);
    main.get_global("nothing").call(0).op(OpCode::Return);
    let bytes = main.finish_module("lines", &[]).unwrap().to_bytes().unwrap();

    let mut vm = Vm::new();
    assert!(matches!(
        vm.interpret_bytes(&bytes),
        InterpretResult::RuntimeError(_)
    ));
    let err = vm.last_error().unwrap();
    assert_eq!(err.traceback, vec!["[line 12] in main()".to_string()]);
}

#[test]
fn test_field_constants_survive_serialization() {
    let mut getter = FunctionBuilder::new("Five:get value");
    getter.fixed(5).op(OpCode::Return);

    let mut main = FunctionBuilder::new("main");
    main.class("Five")
        .field(Some(function(getter)), None)
        .define_field("value")
        .op(OpCode::Pop);
    main.get_global("Five").call(0).get_field("value").op(OpCode::Return);
    let bytes = main.finish_module("fields", &[]).unwrap().to_bytes().unwrap();

    let mut vm = Vm::new();
    assert_eq!(vm.interpret_bytes(&bytes), InterpretResult::Ok(Value::fixed(5)));
}

#[test]
fn test_modules_share_globals() {
    let mut producer = FunctionBuilder::new("main");
    producer.fixed(40).set_global("shared").op(OpCode::Return);
    let mut consumer = FunctionBuilder::new("main");
    consumer
        .get_global("shared")
        .fixed(2)
        .op(OpCode::Add)
        .op(OpCode::Return);

    let mut vm = Vm::new();
    let producer = producer.finish_module("producer", &[]).unwrap();
    let consumer = consumer.finish_module("consumer", &[]).unwrap();
    assert!(vm.interpret_image(&producer).is_ok());
    assert_eq!(vm.interpret_image(&consumer), InterpretResult::Ok(Value::fixed(42)));

    let snapshot = vm.snapshot();
    assert_eq!(snapshot.modules, vec!["consumer".to_string(), "producer".to_string()]);
}
