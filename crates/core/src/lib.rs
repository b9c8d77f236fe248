//! Ember Core: the heap-independent half of the Ember virtual machine
//!
//! Everything a front end needs to hand code to the engine, and nothing that
//! depends on a live heap.
//!
//! # Modules
//!
//! - `value`: `Value`, `Number` and the `ObjRef` heap handle
//! - `opcode`: the instruction set and operand layouts
//! - `chunk`: code + constants + run-length-encoded line table
//! - `image`: serializable module/function images (serde + bincode)
//! - `assembler`: `FunctionBuilder`, a bytecode emitter with jump patching

pub mod assembler;
pub mod chunk;
pub mod image;
pub mod opcode;
pub mod value;

pub use assembler::{AssembleError, FunctionBuilder, JumpPatch};
pub use chunk::{Chunk, LineTable};
pub use image::{Constant, FunctionImage, ImageError, ModuleImage};
pub use opcode::{OpCode, OperandLayout};
pub use value::{Number, ObjRef, Value};
