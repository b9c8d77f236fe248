//! Function builder
//!
//! `FunctionBuilder` emits well-formed bytecode for one function: it picks
//! the short or long form of an instruction from the index size, patches
//! forward jumps once their target is known, computes backward jump
//! offsets, and deduplicates string constants. It is what a front end (or a
//! test) uses to produce a [`FunctionImage`].
//!
//! Emission methods chain; the first problem encountered (a jump that is
//! too long, a constant pool that overflowed) is reported by `finish`.
//!
//! # Example
//!
//! ```rust
//! use ember_core::{FunctionBuilder, OpCode};
//!
//! let mut f = FunctionBuilder::new("main");
//! f.fixed(1).fixed(2).op(OpCode::Add).op(OpCode::Return);
//! let image = f.finish().unwrap();
//! assert_eq!(image.code.last(), Some(&(OpCode::Return as u8)));
//! ```

use crate::image::{Constant, FunctionImage, ModuleImage};
use crate::opcode::OpCode;
use std::collections::HashMap;

/// Error surfaced by `FunctionBuilder::finish`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembleError {
    /// More constants than a 2-byte index can address
    TooManyConstants(String),
    /// A jump distance that does not fit in 2 bytes
    JumpTooLong { function: String, distance: usize },
    /// A backward jump to an offset ahead of the current position
    BadLoopTarget { function: String, target: usize },
}

impl std::fmt::Display for AssembleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssembleError::TooManyConstants(name) => {
                write!(f, "Too many constants in '{}'", name)
            }
            AssembleError::JumpTooLong { function, distance } => {
                write!(f, "Jump of {} bytes is too long in '{}'", distance, function)
            }
            AssembleError::BadLoopTarget { function, target } => {
                write!(f, "Loop target {} is ahead of the loop in '{}'", target, function)
            }
        }
    }
}

impl std::error::Error for AssembleError {}

/// A forward jump awaiting its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a forward jump must be patched"]
pub struct JumpPatch(usize);

/// Builds the code and constant pool for a single function
#[derive(Debug, Clone)]
pub struct FunctionBuilder {
    name: Option<String>,
    arity: u8,
    vararg: bool,
    max_slots: u16,
    upvalue_count: u8,
    code: Vec<u8>,
    lines: Option<Vec<(u32, u32)>>,
    line: u32,
    constants: Vec<Constant>,
    strings: HashMap<String, usize>,
    error: Option<AssembleError>,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        FunctionBuilder {
            name: Some(name.into()),
            arity: 0,
            vararg: false,
            max_slots: 16,
            upvalue_count: 0,
            code: Vec::new(),
            lines: Some(Vec::new()),
            line: 1,
            constants: Vec::new(),
            strings: HashMap::new(),
            error: None,
        }
    }

    /// A function without a name, shown as `unknown` in tracebacks
    pub fn anonymous() -> Self {
        let mut builder = Self::new("");
        builder.name = None;
        builder
    }

    pub fn with_arity(mut self, arity: u8) -> Self {
        self.arity = arity;
        self
    }

    /// The last declared parameter collects surplus arguments into an array
    pub fn with_vararg(mut self) -> Self {
        self.vararg = true;
        self
    }

    pub fn with_max_slots(mut self, slots: u16) -> Self {
        self.max_slots = slots;
        self
    }

    pub fn with_upvalues(mut self, count: u8) -> Self {
        self.upvalue_count = count;
        self
    }

    /// Emit no line table
    pub fn without_lines(mut self) -> Self {
        self.lines = None;
        self
    }

    /// Source line attributed to subsequently emitted bytes
    pub fn set_line(&mut self, line: u32) -> &mut Self {
        self.line = line;
        self
    }

    /// Current code offset, usable as a loop target
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn byte(&mut self, byte: u8) -> &mut Self {
        self.code.push(byte);
        if let Some(runs) = self.lines.as_mut() {
            match runs.last_mut() {
                Some((line, count)) if *line == self.line => *count += 1,
                _ => runs.push((self.line, 1)),
            }
        }
        self
    }

    pub fn short(&mut self, value: u16) -> &mut Self {
        let [hi, lo] = value.to_be_bytes();
        self.byte(hi).byte(lo)
    }

    pub fn op(&mut self, op: OpCode) -> &mut Self {
        self.byte(op as u8)
    }

    pub fn op_byte(&mut self, op: OpCode, operand: u8) -> &mut Self {
        self.op(op).byte(operand)
    }

    pub fn op_short(&mut self, op: OpCode, operand: u16) -> &mut Self {
        self.op(op).short(operand)
    }

    fn fail(&mut self, error: AssembleError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "unknown".to_string())
    }

    /// Add a constant to the pool and return its index
    pub fn add_constant(&mut self, constant: Constant) -> u16 {
        if let Constant::String(s) = &constant {
            if let Some(&index) = self.strings.get(s) {
                return index as u16;
            }
        }
        let index = self.constants.len();
        if index > u16::MAX as usize {
            let name = self.display_name();
            self.fail(AssembleError::TooManyConstants(name));
            return 0;
        }
        if let Constant::String(s) = &constant {
            self.strings.insert(s.clone(), index);
        }
        self.constants.push(constant);
        index as u16
    }

    /// Index of a name string in the pool
    pub fn name_constant(&mut self, name: &str) -> u16 {
        self.add_constant(Constant::String(name.to_string()))
    }

    /// Push a constant, choosing the short form when the index fits
    pub fn constant(&mut self, constant: Constant) -> &mut Self {
        let index = self.add_constant(constant);
        match u8::try_from(index) {
            Ok(short) => self.op_byte(OpCode::Constant, short),
            Err(_) => self.op_short(OpCode::ConstantLong, index),
        }
    }

    pub fn fixed(&mut self, n: i64) -> &mut Self {
        self.constant(Constant::Fixed(n))
    }

    pub fn float(&mut self, f: f64) -> &mut Self {
        self.constant(Constant::Float(f))
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        self.constant(Constant::String(s.to_string()))
    }

    pub fn null(&mut self) -> &mut Self {
        self.op(OpCode::Null)
    }

    pub fn get_local(&mut self, slot: u16) -> &mut Self {
        match u8::try_from(slot) {
            Ok(short) => self.op_byte(OpCode::GetLocal, short),
            Err(_) => self.op_short(OpCode::GetLocalLong, slot),
        }
    }

    pub fn set_local(&mut self, slot: u16) -> &mut Self {
        match u8::try_from(slot) {
            Ok(short) => self.op_byte(OpCode::SetLocal, short),
            Err(_) => self.op_short(OpCode::SetLocalLong, slot),
        }
    }

    pub fn get_private(&mut self, index: u16) -> &mut Self {
        match u8::try_from(index) {
            Ok(short) => self.op_byte(OpCode::GetPrivate, short),
            Err(_) => self.op_short(OpCode::GetPrivateLong, index),
        }
    }

    pub fn set_private(&mut self, index: u16) -> &mut Self {
        match u8::try_from(index) {
            Ok(short) => self.op_byte(OpCode::SetPrivate, short),
            Err(_) => self.op_short(OpCode::SetPrivateLong, index),
        }
    }

    pub fn get_upvalue(&mut self, index: u8) -> &mut Self {
        self.op_byte(OpCode::GetUpvalue, index)
    }

    pub fn set_upvalue(&mut self, index: u8) -> &mut Self {
        self.op_byte(OpCode::SetUpvalue, index)
    }

    pub fn get_global(&mut self, name: &str) -> &mut Self {
        let index = self.name_constant(name);
        self.op_short(OpCode::GetGlobal, index)
    }

    pub fn set_global(&mut self, name: &str) -> &mut Self {
        let index = self.name_constant(name);
        self.op_short(OpCode::SetGlobal, index)
    }

    /// `[object]` -> `object.name`
    pub fn get_field(&mut self, name: &str) -> &mut Self {
        self.string(name).op(OpCode::GetField)
    }

    /// `[object, value]` -> value, after `object.name = value`
    pub fn set_field(&mut self, name: &str) -> &mut Self {
        self.string(name).op(OpCode::SetField)
    }

    pub fn call(&mut self, argc: u8) -> &mut Self {
        self.op_byte(OpCode::Call, argc)
    }

    fn invoke_op(&mut self, op: OpCode, name: &str, argc: u8) -> &mut Self {
        let index = self.name_constant(name);
        self.op_byte(op, argc).short(index)
    }

    pub fn invoke(&mut self, name: &str, argc: u8) -> &mut Self {
        self.invoke_op(OpCode::Invoke, name, argc)
    }

    pub fn invoke_ignoring(&mut self, name: &str, argc: u8) -> &mut Self {
        self.invoke_op(OpCode::InvokeIgnoring, name, argc)
    }

    pub fn invoke_super(&mut self, name: &str, argc: u8) -> &mut Self {
        self.invoke_op(OpCode::InvokeSuper, name, argc)
    }

    pub fn invoke_super_ignoring(&mut self, name: &str, argc: u8) -> &mut Self {
        self.invoke_op(OpCode::InvokeSuperIgnoring, name, argc)
    }

    /// Emit a class declaration; the class is left on the stack
    pub fn class(&mut self, name: &str) -> &mut Self {
        let index = self.name_constant(name);
        self.op_short(OpCode::Class, index)
    }

    /// `[class, method]` -> class
    pub fn method(&mut self, name: &str) -> &mut Self {
        let index = self.name_constant(name);
        self.op_short(OpCode::Method, index)
    }

    pub fn static_field(&mut self, name: &str) -> &mut Self {
        let index = self.name_constant(name);
        self.op_short(OpCode::StaticField, index)
    }

    pub fn define_field(&mut self, name: &str) -> &mut Self {
        let index = self.name_constant(name);
        self.op_short(OpCode::DefineField, index)
    }

    pub fn get_super_method(&mut self, name: &str) -> &mut Self {
        let index = self.name_constant(name);
        self.op_short(OpCode::GetSuperMethod, index)
    }

    /// Build a closure over `function`, capturing one upvalue per
    /// `(is_local, index)` pair
    pub fn closure(&mut self, function: FunctionImage, captures: &[(bool, u8)]) -> &mut Self {
        let mut function = function;
        function.upvalue_count = captures.len() as u8;
        let index = self.add_constant(Constant::Function(Box::new(function)));
        self.op_short(OpCode::Closure, index);
        for &(is_local, slot) in captures {
            self.byte(is_local as u8).byte(slot);
        }
        self
    }

    /// Push a field object; pair with `define_field` or `static_field`
    pub fn field(
        &mut self,
        getter: Option<FunctionImage>,
        setter: Option<FunctionImage>,
    ) -> &mut Self {
        self.constant(Constant::Field {
            getter: getter.map(Box::new),
            setter: setter.map(Box::new),
        })
    }

    /// Emit a forward jump whose offset is filled in by `patch_jump`
    pub fn jump(&mut self, op: OpCode) -> JumpPatch {
        self.op(op).short(u16::MAX);
        JumpPatch(self.code.len() - 2)
    }

    /// Point a forward jump at the current offset
    pub fn patch_jump(&mut self, jump: JumpPatch) -> &mut Self {
        let distance = self.code.len() - jump.0 - 2;
        match u16::try_from(distance) {
            Ok(d) => {
                let [hi, lo] = d.to_be_bytes();
                self.code[jump.0] = hi;
                self.code[jump.0 + 1] = lo;
            }
            Err(_) => {
                let function = self.display_name();
                self.fail(AssembleError::JumpTooLong { function, distance });
            }
        }
        self
    }

    /// Jump backward to `target`, an offset recorded earlier
    pub fn loop_back(&mut self, target: usize) -> &mut Self {
        let after = self.code.len() + 3;
        if target > self.code.len() {
            let function = self.display_name();
            self.fail(AssembleError::BadLoopTarget { function, target });
            return self;
        }
        let distance = after - target;
        match u16::try_from(distance) {
            Ok(d) => self.op_short(OpCode::JumpBack, d),
            Err(_) => {
                let function = self.display_name();
                self.fail(AssembleError::JumpTooLong { function, distance });
                self
            }
        }
    }

    pub fn finish(self) -> Result<FunctionImage, AssembleError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        Ok(FunctionImage {
            name: self.name,
            arity: self.arity,
            upvalue_count: self.upvalue_count,
            vararg: self.vararg,
            max_slots: self.max_slots,
            code: self.code,
            lines: self.lines,
            constants: self.constants,
        })
    }

    /// Finish this function as the main function of a module
    pub fn finish_module(
        self,
        name: impl Into<String>,
        private_names: &[&str],
    ) -> Result<ModuleImage, AssembleError> {
        Ok(ModuleImage {
            name: name.into(),
            private_names: private_names.iter().map(|s| s.to_string()).collect(),
            main: self.finish()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strings_are_deduplicated() {
        let mut f = FunctionBuilder::new("f");
        let a = f.name_constant("x");
        let b = f.name_constant("y");
        let c = f.name_constant("x");
        assert_eq!(a, c);
        assert_ne!(a, b);
    }

    #[test]
    fn test_long_constant_form() {
        let mut f = FunctionBuilder::new("f");
        for i in 0..300 {
            f.add_constant(Constant::Fixed(i));
        }
        f.fixed(1000);
        let image = f.finish().unwrap();
        assert_eq!(image.code[0], OpCode::ConstantLong as u8);
        assert_eq!(u16::from_be_bytes([image.code[1], image.code[2]]), 300);
    }

    #[test]
    fn test_forward_jump_is_patched() {
        let mut f = FunctionBuilder::new("f");
        f.op(OpCode::True);
        let jump = f.jump(OpCode::JumpIfFalse);
        f.fixed(1).op(OpCode::Pop);
        f.patch_jump(jump);
        let image = f.finish().unwrap();
        // TRUE, JUMP_IF_FALSE hi lo, CONSTANT 0, POP
        assert_eq!(&image.code[2..4], &[0, 3]);
        image.validate().unwrap();
    }

    #[test]
    fn test_loop_back_offset() {
        let mut f = FunctionBuilder::new("f");
        let start = f.offset();
        f.op(OpCode::Null).op(OpCode::Pop);
        f.loop_back(start);
        let image = f.finish().unwrap();
        // the jump lands on offset 0 from offset 5
        assert_eq!(&image.code[2..], &[OpCode::JumpBack as u8, 0, 5]);
    }

    #[test]
    fn test_local_forms() {
        let mut f = FunctionBuilder::new("f");
        f.get_local(3).get_local(300);
        let image = f.finish().unwrap();
        assert_eq!(
            image.code,
            vec![
                OpCode::GetLocal as u8,
                3,
                OpCode::GetLocalLong as u8,
                1,
                44
            ]
        );
    }

    #[test]
    fn test_closure_descriptors() {
        let inner = FunctionBuilder::new("inner").finish().unwrap();
        let mut f = FunctionBuilder::new("outer");
        f.closure(inner, &[(true, 1), (false, 0)]);
        let image = f.finish().unwrap();
        assert_eq!(image.code, vec![OpCode::Closure as u8, 0, 0, 1, 1, 0, 0]);
        match &image.constants[0] {
            Constant::Function(func) => assert_eq!(func.upvalue_count, 2),
            other => panic!("Expected function constant, got {:?}", other),
        }
    }

    #[test]
    fn test_field_constant() {
        let getter = FunctionBuilder::new("get x").finish().unwrap();
        let mut f = FunctionBuilder::new("f");
        f.field(Some(getter), None);
        let image = f.finish().unwrap();
        assert_eq!(image.code, vec![OpCode::Constant as u8, 0]);
        assert!(matches!(
            &image.constants[0],
            Constant::Field { getter: Some(_), setter: None }
        ));
    }

    #[test]
    fn test_lines_are_run_length_encoded() {
        let mut f = FunctionBuilder::new("f");
        f.op(OpCode::Null).op(OpCode::Pop);
        f.set_line(4).op(OpCode::Null);
        let image = f.finish().unwrap();
        assert_eq!(image.lines, Some(vec![(1, 2), (4, 1)]));
    }

    #[test]
    fn test_bad_loop_target_is_reported() {
        let mut f = FunctionBuilder::new("f");
        f.loop_back(10);
        assert!(matches!(
            f.finish(),
            Err(AssembleError::BadLoopTarget { target: 10, .. })
        ));
    }
}
