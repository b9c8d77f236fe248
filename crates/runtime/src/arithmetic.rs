//! Binary operators
//!
//! Two numbers (or null, which reads as 0 next to a number) are computed
//! directly. Anything else on the left dispatches to the operator method of
//! the left operand's class, e.g. `a + b` calls `a.+(b)`.

use crate::error::{NativeResult, RuntimeError};
use crate::interpreter::{ExecState, Flow};
use crate::vm::Vm;
use ember_core::{Number, OpCode, Value};

/// Apply a numeric binary operator
pub fn numeric_op(op: OpCode, a: Number, b: Number) -> Option<Value> {
    let value = match op {
        OpCode::Add => Value::Number(a.add(b)),
        OpCode::Subtract => Value::Number(a.sub(b)),
        OpCode::Multiply => Value::Number(a.mul(b)),
        OpCode::Power => Value::Number(a.pow(b)),
        OpCode::Divide => Value::Number(a.div(b)),
        OpCode::FloorDivide => Value::Number(a.floor_div(b)),
        OpCode::Mod => Value::Number(a.rem(b)),
        OpCode::BitAnd => Value::Number(a.bit_and(b)),
        OpCode::BitOr => Value::Number(a.bit_or(b)),
        OpCode::BitXor => Value::Number(a.bit_xor(b)),
        OpCode::LeftShift => Value::Number(a.shl(b)),
        OpCode::RightShift => Value::Number(a.shr(b)),
        OpCode::Equal => Value::Bool(a == b),
        OpCode::Greater => Value::Bool(a > b),
        OpCode::GreaterEqual => Value::Bool(a >= b),
        OpCode::Less => Value::Bool(a < b),
        OpCode::LessEqual => Value::Bool(a <= b),
        _ => return None,
    };
    Some(value)
}

fn as_operand(value: Value) -> Option<Number> {
    match value {
        Value::Number(n) => Some(n),
        Value::Null => Some(Number::Float(0.0)),
        _ => None,
    }
}

impl Vm {
    /// `[a, b] -> a op b`
    pub(crate) fn binary_op(&mut self, state: &mut ExecState, op: OpCode) -> NativeResult<Flow> {
        let fiber = self.heap.fiber(state.fiber);
        let (a, b) = (fiber.peek(1), fiber.peek(0));
        let method = op.operator_method().unwrap_or("?");

        if op == OpCode::FloorDivide {
            if let (Value::Number(x), Value::Number(y)) = (a, b) {
                return self.finish_numeric(state, op, x, y);
            }
            return self.invoke_operator(state, a, method, 1);
        }

        match as_operand(a) {
            Some(x) => match as_operand(b) {
                Some(y) => self.finish_numeric(state, op, x, y),
                None => Err(RuntimeError::new(format!(
                    "cannot use op '{}' with a 'number' and a '{}'",
                    method,
                    self.type_name(b)
                ))),
            },
            None => self.invoke_operator(state, a, method, 1),
        }
    }

    fn finish_numeric(
        &mut self,
        state: &mut ExecState,
        op: OpCode,
        a: Number,
        b: Number,
    ) -> NativeResult<Flow> {
        let result = numeric_op(op, a, b)
            .ok_or_else(|| RuntimeError::new(format!("{} is not a binary operator", op)))?;
        let fiber = self.heap.fiber_mut(state.fiber);
        fiber.drop_n(1);
        fiber.set_top(result);
        Ok(Flow::Continue)
    }
}
