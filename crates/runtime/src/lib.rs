//! Ember Runtime: execution engine and embedding API
//!
//! Key design principles:
//! - Heap objects live in an arena addressed by generational handles
//!   (`ObjRef`), so cycles are representable and the mark-sweep collector is
//!   the only thing that frees memory
//! - Fibers own their value and frame stacks; frames and open upvalues
//!   address slots by index, so stacks grow without rebasing anything
//! - Natives return `NativeResult`; script errors travel as values and are
//!   routed to the nearest catching fiber or back to the host
//!
//! # Embedding
//!
//! ```rust
//! use ember_core::{FunctionBuilder, OpCode, Value};
//! use ember_runtime::{InterpretResult, Vm};
//!
//! let mut vm = Vm::new();
//! vm.define_native("double", |_vm, args| match args.first() {
//!     Some(Value::Number(n)) => Ok(Value::Number(n.mul(ember_core::Number::Fixed(2)))),
//!     _ => Ok(Value::Null),
//! });
//!
//! let mut main = FunctionBuilder::new("main");
//! main.get_global("double").fixed(21).call(1).op(OpCode::Return);
//! let image = main.finish_module("demo", &[]).unwrap();
//!
//! assert_eq!(vm.interpret_image(&image), InterpretResult::Ok(Value::fixed(42)));
//! ```

mod api;
mod arithmetic;
mod call;
pub mod config;
pub mod core_lib;
pub mod diagnostics;
pub mod disassembler;
mod dispatch;
pub mod display;
pub mod error;
pub mod fiber;
mod fiber_lib;
mod gc;
mod gc_lib;
pub mod heap;
mod interpreter;
mod loader;
pub mod object;
pub mod vm;

pub use arithmetic::numeric_op;
pub use config::VmConfig;
pub use core_lib::{argument, expect_number, expect_string};
pub use diagnostics::{VmSnapshot, dump_diagnostics};
pub use disassembler::{disassemble_chunk, disassemble_instruction};
pub use display::{format_float, format_number};
pub use error::{InterpretResult, NativeResult, RuntimeError, format_panic_payload};
pub use fiber::{CallFrame, Fiber};
pub use heap::Heap;
pub use object::{
    NativeFn, NativeMethodFn, NativePrimitiveFn, Object, PrimitiveMethodFn, Tracer, UserData,
};
pub use vm::{CoreClasses, Vm};

pub use ember_core::{ObjRef, Value};
