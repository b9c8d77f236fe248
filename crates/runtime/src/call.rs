//! Calls, upvalues and references
//!
//! `call_value` is the single entry for invoking anything callable that sits
//! on the running fiber's stack as `[callee, args..]`. Script functions get
//! a new frame and return `true` (the dispatch loop must reload its cached
//! state). Natives run to completion and leave their result in the callee
//! slot, returning `false`; primitives may instead transfer control and
//! return `true`.

use crate::error::{NativeResult, RuntimeError};
use crate::fiber::CallFrame;
use crate::object::{
    Array, Instance, NativeFn, NativeMethodFn, NativePrimitiveFn, Object, PrimitiveMethodFn,
    RefTarget, Table, Upvalue,
};
use crate::vm::Vm;
use ember_core::{ObjRef, Value};

/// What a callee resolved to, copied out of the heap before calling
enum Callee {
    Function(ObjRef, Option<ObjRef>),
    Native(NativeFn),
    Primitive(NativePrimitiveFn),
    Method(NativeMethodFn),
    PrimitiveMethod(PrimitiveMethodFn),
    Class(ObjRef, Option<Value>),
    Bound(Value, Value),
}

impl Vm {
    /// Call the value at `[callee, args..]` on top of the running fiber
    pub(crate) fn call_value(&mut self, callee: Value, argc: usize) -> NativeResult<bool> {
        let fiber = self.running_fiber()?;
        let slot = self.callee_slot(fiber, argc)?;
        let r = match callee {
            Value::Object(r) if self.heap.contains(r) => r,
            _ => return Err(self.not_callable(callee, fiber)),
        };
        let resolved = match self.heap.get(r) {
            Object::Function(_) => Callee::Function(r, None),
            Object::Closure(c) => Callee::Function(c.function, Some(r)),
            Object::NativeFunction(n) => Callee::Native(n.function),
            Object::NativePrimitive(n) => Callee::Primitive(n.function),
            Object::NativeMethod(m) => Callee::Method(m.method),
            Object::PrimitiveMethod(m) => Callee::PrimitiveMethod(m.method),
            Object::Class(c) => Callee::Class(r, c.init_method),
            Object::BoundMethod(b) => Callee::Bound(b.receiver, b.method),
            _ => return Err(self.not_callable(callee, fiber)),
        };

        match resolved {
            Callee::Function(function, closure) => self.call_callable(function, closure, argc),
            Callee::Native(function) => {
                let args = self.arguments(fiber, slot);
                let result = function(self, &args)?;
                self.finish_native(fiber, slot, result);
                Ok(false)
            }
            Callee::Primitive(function) => {
                let args = self.arguments(fiber, slot);
                let transferred = function(self, &args)?;
                Ok(self.finish_primitive(fiber, slot, transferred))
            }
            Callee::Method(method) => {
                let receiver = self.heap.fiber(fiber).stack[slot];
                let args = self.arguments(fiber, slot);
                let result = method(self, receiver, &args)?;
                self.finish_native(fiber, slot, result);
                Ok(false)
            }
            Callee::PrimitiveMethod(method) => {
                let receiver = self.heap.fiber(fiber).stack[slot];
                let args = self.arguments(fiber, slot);
                let transferred = method(self, receiver, &args)?;
                Ok(self.finish_primitive(fiber, slot, transferred))
            }
            Callee::Class(class, init) => {
                let instance = self.alloc(Object::Instance(Instance {
                    class,
                    fields: Table::new(),
                }));
                self.heap.fiber_mut(fiber).stack[slot] = Value::Object(instance);
                match init {
                    Some(init) => self.call_value(init, argc),
                    None => {
                        self.heap.fiber_mut(fiber).stack.truncate(slot + 1);
                        Ok(false)
                    }
                }
            }
            Callee::Bound(receiver, method) => self.call_bound(fiber, slot, receiver, method, argc),
        }
    }

    fn call_bound(
        &mut self,
        fiber: ObjRef,
        slot: usize,
        receiver: Value,
        method: Value,
        argc: usize,
    ) -> NativeResult<bool> {
        match self.heap.object_of(method) {
            Some(Object::NativeMethod(m)) => {
                let method = m.method;
                let args = self.arguments(fiber, slot);
                let result = method(self, receiver, &args)?;
                self.finish_native(fiber, slot, result);
                Ok(false)
            }
            Some(Object::PrimitiveMethod(m)) => {
                let method = m.method;
                let args = self.arguments(fiber, slot);
                let transferred = method(self, receiver, &args)?;
                Ok(self.finish_primitive(fiber, slot, transferred))
            }
            Some(Object::Function(_)) => {
                self.heap.fiber_mut(fiber).stack[slot] = receiver;
                match method {
                    Value::Object(function) => self.call_callable(function, None, argc),
                    _ => Err(self.not_callable(method, fiber)),
                }
            }
            Some(Object::Closure(c)) => {
                let function = c.function;
                self.heap.fiber_mut(fiber).stack[slot] = receiver;
                self.call_callable(function, method.as_object(), argc)
            }
            _ => {
                self.heap.fiber_mut(fiber).stack[slot] = method;
                self.call_value(method, argc)
            }
        }
    }

    pub(crate) fn callee_slot(&self, fiber: ObjRef, argc: usize) -> NativeResult<usize> {
        self.heap
            .fiber(fiber)
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or_else(|| RuntimeError::new("call with fewer values on the stack than arguments"))
    }

    fn arguments(&self, fiber: ObjRef, slot: usize) -> Vec<Value> {
        self.heap.fiber(fiber).stack[slot + 1..].to_vec()
    }

    fn finish_native(&mut self, fiber: ObjRef, slot: usize, result: Value) {
        let f = self.heap.fiber_mut(fiber);
        f.stack.truncate(slot);
        f.stack.push(result);
    }

    /// A primitive that transferred control leaves the callee slot to
    /// receive the eventual result (whoever resumes this fiber overwrites
    /// it); otherwise the call produced null.
    fn finish_primitive(&mut self, fiber: ObjRef, slot: usize, transferred: bool) -> bool {
        let f = self.heap.fiber_mut(fiber);
        if transferred {
            f.stack.truncate(slot + 1);
        } else {
            f.stack.truncate(slot);
            f.stack.push(Value::Null);
        }
        transferred
    }

    fn not_callable(&self, callee: Value, fiber: ObjRef) -> RuntimeError {
        let shown = if callee.is_null() {
            self.heap.fiber(fiber).peek(0)
        } else {
            callee
        };
        let name = self.function_name(shown).unwrap_or("unknown");
        if callee.is_null() {
            RuntimeError::new(format!("attempt to call '{}' which is null", name))
        } else {
            RuntimeError::new(format!(
                "attempt to call '{}' which is neither function nor class, but is {}",
                name,
                self.type_name(callee)
            ))
        }
    }

    /// Push a frame for a script function whose callee and arguments are
    /// already on the running fiber's stack
    pub(crate) fn call_callable(
        &mut self,
        function: ObjRef,
        closure: Option<ObjRef>,
        argc: usize,
    ) -> NativeResult<bool> {
        let fiber = self.running_fiber()?;
        if self.heap.fiber(fiber).frames.len() >= self.config.max_frames {
            return Err(RuntimeError::new("stack overflow"));
        }
        let (arity, vararg, max_slots) = {
            let f = self.heap.function(function);
            let arity = f.arity as usize;
            let arity = if f.vararg { arity.max(1) } else { arity };
            (arity, f.vararg, f.max_slots as usize)
        };
        self.ensure_stack(fiber, max_slots + arity + 1);
        let base = self.callee_slot(fiber, argc)?;
        {
            let f = self.heap.fiber_mut(fiber);
            f.frames.push(CallFrame::new(function, closure, base));
            f.started = true;
        }

        if argc < arity {
            let missing = arity - argc - usize::from(vararg);
            let f = self.heap.fiber_mut(fiber);
            f.stack.extend(std::iter::repeat_n(Value::Null, missing));
            if vararg {
                let rest = self.alloc(Object::Array(Array::default()));
                self.heap.fiber_mut(fiber).push(Value::Object(rest));
            }
        } else if argc > arity {
            if vararg {
                let rest = self.alloc(Object::Array(Array::default()));
                let f = self.heap.fiber_mut(fiber);
                let start = f.stack.len() - (argc - arity + 1);
                let values = f.stack.split_off(start);
                f.stack.push(Value::Object(rest));
                self.heap.array_mut(rest).values = values;
            } else {
                self.heap.fiber_mut(fiber).drop_n(argc - arity);
            }
        } else if vararg {
            let rest = self.alloc(Object::Array(Array::default()));
            let f = self.heap.fiber_mut(fiber);
            let last = f.pop();
            f.push(Value::Object(rest));
            self.heap.array_mut(rest).values.push(last);
        }
        Ok(true)
    }

    /// Guarantee `additional` free slots above the current top
    pub(crate) fn ensure_stack(&mut self, fiber: ObjRef, additional: usize) {
        let f = self.heap.fiber_mut(fiber);
        if f.stack.capacity() - f.stack.len() >= additional {
            return;
        }
        let grown = f.reserve(additional);
        self.heap.note_growth(grown);
    }

    /// Upvalue for a stack slot, reusing an open one if it exists
    pub(crate) fn capture_upvalue(&mut self, fiber: ObjRef, slot: usize) -> ObjRef {
        let position = {
            let open = &self.heap.fiber(fiber).open_upvalues;
            match open.binary_search_by_key(&slot, |(s, _)| *s) {
                Ok(found) => return open[found].1,
                Err(position) => position,
            }
        };
        let upvalue = self.alloc(Object::Upvalue(Upvalue::Open { fiber, slot }));
        self.heap
            .fiber_mut(fiber)
            .open_upvalues
            .insert(position, (slot, upvalue));
        upvalue
    }

    /// Close every open upvalue at or above `from`
    pub(crate) fn close_upvalues(&mut self, fiber: ObjRef, from: usize) {
        loop {
            let f = self.heap.fiber_mut(fiber);
            let (slot, upvalue) = match f.open_upvalues.last() {
                Some(&(slot, upvalue)) if slot >= from => (slot, upvalue),
                _ => break,
            };
            f.open_upvalues.pop();
            let value = f.stack.get(slot).copied().unwrap_or_default();
            *self.heap.upvalue_mut(upvalue) = Upvalue::Closed(value);
        }
    }

    pub(crate) fn upvalue_get(&self, upvalue: ObjRef) -> Value {
        match *self.heap.upvalue(upvalue) {
            Upvalue::Open { fiber, slot } => self
                .heap
                .fiber(fiber)
                .stack
                .get(slot)
                .copied()
                .unwrap_or_default(),
            Upvalue::Closed(value) => value,
        }
    }

    pub(crate) fn upvalue_set(&mut self, upvalue: ObjRef, value: Value) {
        match *self.heap.upvalue(upvalue) {
            Upvalue::Open { fiber, slot } => {
                if let Some(cell) = self.heap.fiber_mut(fiber).stack.get_mut(slot) {
                    *cell = value;
                }
            }
            Upvalue::Closed(_) => *self.heap.upvalue_mut(upvalue) = Upvalue::Closed(value),
        }
    }

    /// Current value behind a reference
    pub fn read_reference(&self, reference: ObjRef) -> Value {
        match self.heap.reference(reference).target {
            RefTarget::Stack { fiber, slot } => self
                .heap
                .fiber(fiber)
                .stack
                .get(slot)
                .copied()
                .unwrap_or_default(),
            RefTarget::Private { module, index } => self
                .heap
                .module(module)
                .privates
                .get(index)
                .copied()
                .unwrap_or_default(),
            RefTarget::Upvalue(upvalue) => self.upvalue_get(upvalue),
            RefTarget::Global(name) => self.globals.get(&name).copied().unwrap_or_default(),
            RefTarget::Field { instance, name } => self
                .heap
                .instance(instance)
                .fields
                .get(&name)
                .copied()
                .unwrap_or_default(),
        }
    }

    /// Store through a reference
    pub fn write_reference(&mut self, reference: ObjRef, value: Value) -> NativeResult<()> {
        match self.heap.reference(reference).target {
            RefTarget::Stack { fiber, slot } => {
                match self.heap.fiber_mut(fiber).stack.get_mut(slot) {
                    Some(cell) => *cell = value,
                    None => return Err(RuntimeError::new("reference to a stack slot that no longer exists")),
                }
            }
            RefTarget::Private { module, index } => {
                match self.heap.module_mut(module).privates.get_mut(index) {
                    Some(cell) => *cell = value,
                    None => return Err(RuntimeError::new("private variable index out of range")),
                }
            }
            RefTarget::Upvalue(upvalue) => self.upvalue_set(upvalue, value),
            RefTarget::Global(name) => {
                self.globals.insert(name, value);
            }
            RefTarget::Field { instance, name } => {
                self.heap.instance_mut(instance).fields.insert(name, value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Fiber;

    fn vm_with_fiber() -> (Vm, ObjRef) {
        let mut vm = Vm::new();
        let fiber = vm.alloc(Object::Fiber(Fiber::new(None, None, 2, 2)));
        vm.fiber = Some(fiber);
        (vm, fiber)
    }

    #[test]
    fn test_capture_reuses_open_upvalue() {
        let (mut vm, fiber) = vm_with_fiber();
        vm.heap.fiber_mut(fiber).push(Value::fixed(1));
        vm.heap.fiber_mut(fiber).push(Value::fixed(2));
        let a = vm.capture_upvalue(fiber, 1);
        let b = vm.capture_upvalue(fiber, 1);
        let c = vm.capture_upvalue(fiber, 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let slots: Vec<usize> = vm.heap.fiber(fiber).open_upvalues.iter().map(|(s, _)| *s).collect();
        assert_eq!(slots, vec![0, 1], "open upvalues stay ordered by slot");
    }

    #[test]
    fn test_close_copies_slot_value() {
        let (mut vm, fiber) = vm_with_fiber();
        vm.heap.fiber_mut(fiber).push(Value::fixed(5));
        let up = vm.capture_upvalue(fiber, 0);
        vm.upvalue_set(up, Value::fixed(6));
        assert_eq!(vm.heap.fiber(fiber).stack[0], Value::fixed(6));
        vm.close_upvalues(fiber, 0);
        vm.heap.fiber_mut(fiber).stack[0] = Value::fixed(100);
        assert_eq!(vm.upvalue_get(up), Value::fixed(6));
        assert!(vm.heap.fiber(fiber).open_upvalues.is_empty());
    }

    #[test]
    fn test_open_upvalue_survives_stack_growth() {
        let (mut vm, fiber) = vm_with_fiber();
        vm.heap.fiber_mut(fiber).push(Value::fixed(9));
        let up = vm.capture_upvalue(fiber, 0);
        vm.ensure_stack(fiber, 10_000);
        assert!(vm.heap.fiber(fiber).stack.capacity() >= 10_000);
        assert_eq!(vm.upvalue_get(up), Value::fixed(9));
    }

    #[test]
    fn test_calling_null_names_the_callee() {
        let (mut vm, fiber) = vm_with_fiber();
        let name = vm.new_string("missing");
        vm.heap.fiber_mut(fiber).push(Value::Null);
        vm.heap.fiber_mut(fiber).push(name);
        let err = vm.call_value(Value::Null, 1).unwrap_err();
        assert_eq!(err.message, "attempt to call 'missing' which is null");
    }

    #[test]
    fn test_calling_a_number_fails() {
        let (mut vm, fiber) = vm_with_fiber();
        vm.heap.fiber_mut(fiber).push(Value::fixed(3));
        let err = vm.call_value(Value::fixed(3), 0).unwrap_err();
        assert!(err.message.contains("neither function nor class, but is number"));
    }

    #[test]
    fn test_native_result_replaces_callee_and_args() {
        fn add(_vm: &mut Vm, args: &[Value]) -> NativeResult<Value> {
            let sum = args.iter().filter_map(|v| v.as_number()).map(|n| n.as_i64()).sum::<i64>();
            Ok(Value::fixed(sum))
        }
        let (mut vm, fiber) = vm_with_fiber();
        vm.define_native("add", add);
        let callee = vm.get_global("add").unwrap();
        let f = vm.heap.fiber_mut(fiber);
        f.push(callee);
        f.push(Value::fixed(2));
        f.push(Value::fixed(3));
        assert_eq!(vm.call_value(callee, 2), Ok(false));
        assert_eq!(vm.heap.fiber(fiber).stack, vec![Value::fixed(5)]);
    }
}
