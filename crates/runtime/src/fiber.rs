//! Fibers and call frames
//!
//! A fiber owns a value stack and a call-frame stack. Frames and open
//! upvalues address the value stack by *index*, never by pointer, so the
//! stack can be reallocated at any time (while a frame is executing, while
//! upvalues are open, during a nested native call) without rebasing
//! anything.
//!
//! Open upvalues are kept sorted by slot, so closing every upvalue above a
//! depth is a pop loop from the end and capturing reuses an existing cell
//! through a binary search.

use crate::object::Tracer;
use ember_core::{ObjRef, Value};
use std::mem::size_of;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFrame {
    pub function: ObjRef,
    pub closure: Option<ObjRef>,
    /// Offset of the next instruction in the function's chunk
    pub ip: usize,
    /// Stack index of slot 0 (the callee or receiver)
    pub base: usize,
    /// Leave the callee slot in place instead of pushing the result
    pub result_ignored: bool,
    /// Returning from this frame hands the result back to native code
    pub return_to_host: bool,
}

impl CallFrame {
    pub fn new(function: ObjRef, closure: Option<ObjRef>, base: usize) -> Self {
        CallFrame {
            function,
            closure,
            ip: 0,
            base,
            result_ignored: false,
            return_to_host: false,
        }
    }
}

#[derive(Debug)]
pub struct Fiber {
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    /// (slot, upvalue) pairs, ascending by slot
    pub open_upvalues: Vec<(usize, ObjRef)>,
    pub parent: Option<ObjRef>,
    pub module: Option<ObjRef>,
    /// Entry function of a fiber created from script
    pub function: Option<Value>,
    pub error: Value,
    pub abort: bool,
    /// Errors stop here instead of propagating to the parent
    pub catcher: bool,
    pub started: bool,
}

impl Fiber {
    pub fn new(
        module: Option<ObjRef>,
        function: Option<Value>,
        stack_capacity: usize,
        frame_capacity: usize,
    ) -> Self {
        Fiber {
            stack: Vec::with_capacity(stack_capacity),
            frames: Vec::with_capacity(frame_capacity),
            open_upvalues: Vec::new(),
            parent: None,
            module,
            function,
            error: Value::Null,
            abort: false,
            catcher: false,
            started: false,
        }
    }

    /// Aborted, or ran to completion
    pub fn is_done(&self) -> bool {
        self.abort || (self.started && self.frames.is_empty())
    }

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or_default()
    }

    /// Value `distance` slots below the top (0 is the top)
    #[inline]
    pub fn peek(&self, distance: usize) -> Value {
        let len = self.stack.len();
        if distance < len {
            self.stack[len - 1 - distance]
        } else {
            Value::Null
        }
    }

    #[inline]
    pub fn set_top(&mut self, value: Value) {
        match self.stack.last_mut() {
            Some(top) => *top = value,
            None => self.stack.push(value),
        }
    }

    #[inline]
    pub fn drop_n(&mut self, n: usize) {
        let len = self.stack.len().saturating_sub(n);
        self.stack.truncate(len);
    }

    pub fn top_frame(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    pub fn top_frame_mut(&mut self) -> Option<&mut CallFrame> {
        self.frames.last_mut()
    }

    /// Make room for `additional` more values; returns the bytes acquired
    pub fn reserve(&mut self, additional: usize) -> usize {
        let before = self.stack.capacity();
        self.stack.reserve(additional);
        (self.stack.capacity() - before) * size_of::<Value>()
    }

    pub(crate) fn footprint(&self) -> usize {
        self.stack.capacity() * size_of::<Value>()
            + self.frames.capacity() * size_of::<CallFrame>()
            + self.open_upvalues.capacity() * size_of::<(usize, ObjRef)>()
    }

    pub(crate) fn trace(&self, tracer: &mut Tracer) {
        tracer.values(&self.stack);
        for frame in &self.frames {
            tracer.object(frame.function);
            if let Some(closure) = frame.closure {
                tracer.object(closure);
            }
        }
        for (_, upvalue) in &self.open_upvalues {
            tracer.object(*upvalue);
        }
        if let Some(parent) = self.parent {
            tracer.object(parent);
        }
        if let Some(module) = self.module {
            tracer.object(module);
        }
        if let Some(function) = self.function {
            tracer.value(function);
        }
        tracer.value(self.error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_done_states() {
        let mut fiber = Fiber::new(None, None, 4, 4);
        assert!(!fiber.is_done(), "a fresh fiber has not run yet");
        fiber.started = true;
        assert!(fiber.is_done(), "started with no frames left");
        fiber.frames.push(CallFrame::new(ObjRef::new(0, 0), None, 0));
        assert!(!fiber.is_done());
        fiber.abort = true;
        assert!(fiber.is_done());
    }

    #[test]
    fn test_peek_and_set_top() {
        let mut fiber = Fiber::new(None, None, 4, 4);
        fiber.push(Value::fixed(1));
        fiber.push(Value::fixed(2));
        assert_eq!(fiber.peek(0), Value::fixed(2));
        assert_eq!(fiber.peek(1), Value::fixed(1));
        assert_eq!(fiber.peek(5), Value::Null);
        fiber.set_top(Value::Bool(true));
        assert_eq!(fiber.pop(), Value::Bool(true));
        fiber.drop_n(10);
        assert!(fiber.stack.is_empty());
    }

    #[test]
    fn test_frames_survive_reallocation() {
        let mut fiber = Fiber::new(None, None, 2, 4);
        fiber.push(Value::fixed(10));
        fiber.push(Value::fixed(20));
        fiber.frames.push(CallFrame::new(ObjRef::new(0, 0), None, 1));
        let grown = fiber.reserve(1024);
        assert!(grown > 0);
        let base = fiber.frames[0].base;
        assert_eq!(fiber.stack[base], Value::fixed(20));
    }

    #[test]
    fn test_trace_includes_frames_and_upvalues() {
        let mut fiber = Fiber::new(None, None, 2, 2);
        let function = ObjRef::new(1, 0);
        let upvalue = ObjRef::new(2, 0);
        fiber.frames.push(CallFrame::new(function, None, 0));
        fiber.open_upvalues.push((0, upvalue));
        let mut tracer = Tracer::new();
        fiber.trace(&mut tracer);
        let children: Vec<ObjRef> = tracer.drain().collect();
        assert!(children.contains(&function));
        assert!(children.contains(&upvalue));
    }
}
