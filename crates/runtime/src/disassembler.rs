//! Human-readable listings of bytecode
//!
//! ```text
//! == main ==
//! 0000    1 CONSTANT            0 '42'
//! 0002    | SET_GLOBAL          1 'answer'
//! 0005    2 JUMP_IF_FALSE       5 -> 13
//! ```

use crate::object::Object;
use crate::vm::Vm;
use ember_core::{Chunk, OpCode, OperandLayout, Value};
use std::fmt::Write;

/// Listing of a whole chunk under a `== name ==` header
pub fn disassemble_chunk(vm: &Vm, chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {} ==\n", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(vm, chunk, offset, &mut out);
    }
    out
}

/// Append one instruction to `out`; returns the offset of the next one
pub fn disassemble_instruction(vm: &Vm, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let _ = write!(out, "{:04} ", offset);
    let line = chunk.line_at(offset);
    match line {
        Some(_) if offset > 0 && chunk.line_at(offset - 1) == line => out.push_str("   | "),
        Some(line) => {
            let _ = write!(out, "{:4} ", line);
        }
        None => out.push_str("     "),
    }

    let byte = chunk.code[offset];
    let op = match OpCode::try_from(byte) {
        Ok(op) => op,
        Err(byte) => {
            let _ = writeln!(out, "UNKNOWN {}", byte);
            return offset + 1;
        }
    };
    let byte_at = |i: usize| chunk.code.get(i).copied().unwrap_or(0);
    let short_at = |i: usize| u16::from_be_bytes([byte_at(i), byte_at(i + 1)]);
    let constant = |index: usize| {
        let value = chunk.constants.get(index).copied().unwrap_or_default();
        vm.describe(value)
    };

    match op.layout() {
        OperandLayout::None => {
            let _ = writeln!(out, "{}", op.name());
            offset + 1
        }
        OperandLayout::Byte => {
            let operand = byte_at(offset + 1) as usize;
            if op == OpCode::Constant {
                let _ = writeln!(out, "{:<20}{:>4} '{}'", op.name(), operand, constant(operand));
            } else {
                let _ = writeln!(out, "{:<20}{:>4}", op.name(), operand);
            }
            offset + 2
        }
        OperandLayout::Short => {
            let operand = short_at(offset + 1) as usize;
            let next = offset + 3;
            match op {
                OpCode::Jump
                | OpCode::JumpIfFalse
                | OpCode::JumpIfNull
                | OpCode::JumpIfNullPopping
                | OpCode::And
                | OpCode::Or
                | OpCode::NullOr => {
                    let _ = writeln!(out, "{:<20}{:>4} -> {}", op.name(), operand, next + operand);
                }
                OpCode::JumpBack => {
                    let target = next.saturating_sub(operand);
                    let _ = writeln!(out, "{:<20}{:>4} -> {}", op.name(), operand, target);
                }
                OpCode::ConstantLong
                | OpCode::SetGlobal
                | OpCode::GetGlobal
                | OpCode::Class
                | OpCode::StaticField
                | OpCode::Method
                | OpCode::DefineField
                | OpCode::GetSuperMethod
                | OpCode::ReferenceGlobal => {
                    let _ = writeln!(out, "{:<20}{:>4} '{}'", op.name(), operand, constant(operand));
                }
                _ => {
                    let _ = writeln!(out, "{:<20}{:>4}", op.name(), operand);
                }
            }
            next
        }
        OperandLayout::Invoke => {
            let argc = byte_at(offset + 1);
            let name = short_at(offset + 2) as usize;
            let _ = writeln!(
                out,
                "{:<20}({} args){:>4} '{}'",
                op.name(),
                argc,
                name,
                constant(name)
            );
            offset + 4
        }
        OperandLayout::Closure => {
            let index = short_at(offset + 1) as usize;
            let function = chunk.constants.get(index).copied().unwrap_or_default();
            let _ = writeln!(out, "{:<20}{:>4} {}", op.name(), index, vm.describe(function));
            let upvalues = match vm.heap.object_of(function) {
                Some(Object::Function(f)) => f.upvalue_count as usize,
                _ => 0,
            };
            let mut next = offset + 3;
            for _ in 0..upvalues {
                let kind = if byte_at(next) != 0 { "local" } else { "upvalue" };
                let _ = writeln!(out, "{:04}    |   {} {}", next, kind, byte_at(next + 1));
                next += 2;
            }
            next
        }
    }
}

impl Vm {
    /// Listing of a function or closure value
    pub fn disassemble(&self, value: Value) -> Option<String> {
        let function = match self.heap.object_of(value)? {
            Object::Function(_) => value.as_object()?,
            Object::Closure(c) => c.function,
            _ => return None,
        };
        let f = self.heap.function(function);
        let name = match f.name {
            Some(name) => self.heap.str(name),
            None => "unknown",
        };
        Some(disassemble_chunk(self, &f.chunk, name))
    }
}
