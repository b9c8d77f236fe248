//! Host API: calling into scripts and registering natives
//!
//! # Calling
//!
//! Every host call runs a tiny generated function (a trampoline) whose body
//! is `CALL argc; RETURN` or `INVOKE argc name; RETURN`. The trampoline's
//! frame is marked `return_to_host`, so its return ends the nested dispatch
//! loop and hands the value back. A call made while a script is running
//! nests on the running fiber; otherwise it uses the VM's API fiber.
//!
//! Two flavors exist:
//!
//! - [`Vm::call`], [`Vm::call_method`] and friends are top-level entry
//!   points. They never panic, never propagate: the outcome is an
//!   [`InterpretResult`].
//! - [`Vm::invoke`] and [`Vm::invoke_method`] are for natives calling back
//!   into script code. They return a [`NativeResult`] so a failure can be
//!   propagated with `?` and continue unwinding the outer script.
//!
//! # Panics
//!
//! Top-level entry points run behind `catch_unwind`. A panic inside a native
//! (or an internal invariant violation) is converted into a runtime error,
//! and the VM is restored to the state it had when the call started.

use crate::error::{CallFailure, InterpretResult, NativeResult, RuntimeError, format_panic_payload};
use crate::object::{
    BoundMethod, Field, Function, NativeFn, NativeFunction, NativeMethod, NativeMethodFn, NativePrimitive,
    NativePrimitiveFn, Object, PrimitiveMethod, PrimitiveMethodFn,
};
use crate::vm::{Trampoline, Vm};
use ember_core::{Chunk, ObjRef, OpCode, Value};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use tracing::{debug, warn};

/// VM state to restore if a host call panics
struct Checkpoint {
    fiber: Option<ObjRef>,
    boundaries: usize,
    roots: usize,
    gc_pause: usize,
    display: usize,
    marks: Vec<(ObjRef, usize, usize)>,
}

impl Vm {
    fn checkpoint(&self) -> Checkpoint {
        let mut marks = Vec::new();
        for fiber in self.fiber.into_iter().chain(Some(self.api_fiber)) {
            let f = self.heap.fiber(fiber);
            marks.push((fiber, f.stack.len(), f.frames.len()));
        }
        Checkpoint {
            fiber: self.fiber,
            boundaries: self.boundaries.len(),
            roots: self.roots.len(),
            gc_pause: self.gc_pause,
            display: self.display_stack.len(),
            marks,
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.boundaries.truncate(checkpoint.boundaries);
        self.roots.truncate(checkpoint.roots);
        self.display_stack.truncate(checkpoint.display);
        self.gc_pause = checkpoint.gc_pause;
        self.fiber = checkpoint.fiber;
        for (fiber, stack, frames) in checkpoint.marks {
            if self.heap.contains(fiber) {
                let f = self.heap.fiber(fiber);
                let frames = frames.min(f.frames.len());
                let stack = stack.min(f.stack.len());
                self.unwind_fiber(fiber, stack, frames);
            }
        }
    }

    /// Run `f` so that a panic becomes an error and leaves the VM usable
    fn guarded<T>(
        &mut self,
        f: impl FnOnce(&mut Vm) -> Result<T, CallFailure>,
    ) -> Result<T, CallFailure> {
        let checkpoint = self.checkpoint();
        match catch_unwind(AssertUnwindSafe(|| f(self))) {
            Ok(result) => result,
            Err(payload) => {
                let message = format_panic_payload(&payload);
                warn!(panic = %message, "recovered from a panic inside the vm");
                self.restore(checkpoint);
                Err(CallFailure::Runtime(RuntimeError::new(format!(
                    "internal error: {}",
                    message
                ))))
            }
        }
    }

    /// Convert the outcome of a top-level call into its public shape
    pub(crate) fn host_result(&mut self, outcome: Result<Value, CallFailure>) -> InterpretResult {
        match outcome {
            Ok(value) => InterpretResult::Ok(value),
            Err(CallFailure::Invalid) => InterpretResult::Invalid,
            Err(CallFailure::Runtime(err)) => {
                debug!(error = %err, "runtime error escaped to the host");
                let text = self.new_string(&err.to_string());
                self.last_error = Some(err);
                InterpretResult::RuntimeError(text)
            }
        }
    }

    pub(crate) fn run_guarded(
        &mut self,
        f: impl FnOnce(&mut Vm) -> Result<Value, CallFailure>,
    ) -> InterpretResult {
        let outcome = self.guarded(f);
        self.host_result(outcome)
    }

    /// Call any callable value
    pub fn call(&mut self, callee: Value, args: &[Value]) -> InterpretResult {
        self.call_with(callee, args, false)
    }

    /// Call a value; with `ignore_fiber` the call runs on the API fiber even
    /// if a script is currently executing
    pub fn call_with(&mut self, callee: Value, args: &[Value], ignore_fiber: bool) -> InterpretResult {
        let argc = match self.argument_count(args) {
            Ok(argc) => argc,
            Err(err) => return self.host_result(Err(err.into())),
        };
        self.run_guarded(|vm| vm.call_through(Trampoline::Call(argc), callee, args, ignore_fiber))
    }

    /// Find method `name` on `receiver` and call it; `Invalid` if there is
    /// no such method
    pub fn call_method(&mut self, receiver: Value, name: &str, args: &[Value]) -> InterpretResult {
        let argc = match self.argument_count(args) {
            Ok(argc) => argc,
            Err(err) => return self.host_result(Err(err.into())),
        };
        self.run_guarded(|vm| {
            let name = vm.method_name(receiver, name, args)?;
            vm.call_through(Trampoline::Invoke(argc, name), receiver, args, false)
        })
    }

    /// Call a value from inside a native, propagating failures
    pub fn invoke(&mut self, callee: Value, args: &[Value]) -> NativeResult<Value> {
        let argc = self.argument_count(args)?;
        self.call_through(Trampoline::Call(argc), callee, args, false)
            .map_err(CallFailure::into_runtime)
    }

    /// Call a method from inside a native, propagating failures
    pub fn invoke_method(&mut self, receiver: Value, name: &str, args: &[Value]) -> NativeResult<Value> {
        let argc = self.argument_count(args)?;
        let name = self.method_name(receiver, name, args).map_err(|_| {
            RuntimeError::new(format!(
                "cannot call undefined method '{}' of class '{}'",
                name,
                self.class_name_of(receiver)
            ))
        })?;
        self.call_through(Trampoline::Invoke(argc, name), receiver, args, false)
            .map_err(CallFailure::into_runtime)
    }

    fn argument_count(&self, args: &[Value]) -> NativeResult<u8> {
        u8::try_from(args.len())
            .ok()
            .filter(|n| *n < u8::MAX)
            .ok_or_else(|| RuntimeError::new("too many arguments"))
    }

    /// Interned method name, after checking the receiver has it
    fn method_name(&mut self, receiver: Value, name: &str, args: &[Value]) -> Result<ObjRef, CallFailure> {
        let depth = self.roots.len();
        self.roots.push(receiver);
        self.roots.extend_from_slice(args);
        let key = self.intern(name);
        self.roots.truncate(depth);
        match self.find_method(receiver, key) {
            Some(_) => Ok(key),
            None => Err(CallFailure::Invalid),
        }
    }

    fn call_through(
        &mut self,
        kind: Trampoline,
        callee: Value,
        args: &[Value],
        ignore_fiber: bool,
    ) -> Result<Value, CallFailure> {
        let previous = self.fiber;
        let fiber = match self.fiber {
            Some(fiber) if !ignore_fiber => fiber,
            _ => self.api_fiber,
        };
        let (stack_mark, frame_mark) = {
            let f = self.heap.fiber_mut(fiber);
            let marks = (f.stack.len(), f.frames.len());
            f.push(Value::Null);
            f.push(callee);
            f.stack.extend_from_slice(args);
            marks
        };
        self.fiber = Some(fiber);

        let trampoline = self.trampoline(kind);
        self.heap.fiber_mut(fiber).stack[stack_mark] = Value::Object(trampoline);
        let result = match self.call_callable(trampoline, None, args.len() + 1) {
            Ok(_) => {
                if let Some(frame) = self.heap.fiber_mut(fiber).top_frame_mut() {
                    frame.return_to_host = true;
                }
                self.run_boundary(fiber, stack_mark, frame_mark)
            }
            Err(err) => {
                self.unwind_fiber(fiber, stack_mark, frame_mark);
                Err(err)
            }
        };
        self.fiber = previous;
        result.map_err(CallFailure::from)
    }

    /// Generated entry function for a host call, cached per shape
    fn trampoline(&mut self, kind: Trampoline) -> ObjRef {
        if let Some(function) = self.trampolines.get(&kind) {
            return *function;
        }
        let mut chunk = Chunk::without_lines();
        let argc = match kind {
            Trampoline::Call(argc) => {
                chunk.write(OpCode::Call.into(), 0);
                chunk.write(argc, 0);
                argc
            }
            Trampoline::Invoke(argc, name) => {
                let index = chunk.add_constant(Value::Object(name)) as u16;
                chunk.write(OpCode::Invoke.into(), 0);
                chunk.write(argc, 0);
                for byte in index.to_be_bytes() {
                    chunk.write(byte, 0);
                }
                argc
            }
        };
        chunk.write(OpCode::Return.into(), 0);

        if let Trampoline::Invoke(_, name) = kind {
            self.push_root(Value::Object(name));
        }
        let function = self.alloc(Object::Function(Function {
            name: None,
            chunk: Rc::new(chunk),
            arity: argc + 1,
            upvalue_count: 0,
            max_slots: argc as u16 + 2,
            vararg: false,
            module: None,
            synthetic: true,
        }));
        if let Trampoline::Invoke(..) = kind {
            self.pop_root();
        }
        self.trampolines.insert(kind, function);
        function
    }

    /// Display form of any value, running its `toString` if it has one
    pub fn to_display_string(&mut self, value: Value) -> NativeResult<String> {
        if let Some(s) = self.heap.as_str(value) {
            return Ok(s.to_string());
        }
        let to_string = self.names.to_string;
        if value.is_object() && self.find_method(value, to_string).is_some() {
            let result = self
                .call_through(Trampoline::Invoke(0, to_string), value, &[], false)
                .map_err(CallFailure::into_runtime)?;
            return Ok(match self.heap.as_str(result) {
                Some(s) => s.to_string(),
                None => self.describe(result),
            });
        }
        Ok(self.describe(value))
    }

    /// Read member `name` of `object` the way a field access does: a
    /// getter-backed field runs its getter, anything else is returned as
    /// stored. Missing members read as null.
    pub fn get_field(&mut self, object: Value, name: &str) -> NativeResult<Value> {
        let key = self.with_root(object, |vm| vm.intern(name));
        let value = match self.find_method(object, key) {
            Some(value) => value,
            None => return Ok(Value::Null),
        };
        let getter = match self.heap.object_of(value) {
            Some(Object::Field(field)) => field.getter.ok_or_else(|| {
                RuntimeError::new(format!(
                    "class {} does not have a getter for field '{}'",
                    self.class_name_of(object),
                    name
                ))
            })?,
            _ => return Ok(value),
        };
        let depth = self.roots.len();
        self.push_root(object);
        let bound = Value::Object(self.alloc(Object::BoundMethod(BoundMethod {
            receiver: object,
            method: getter,
        })));
        self.push_root(bound);
        let result = self.invoke(bound, &[]);
        self.roots.truncate(depth);
        result
    }

    /// Equality as the host sees it
    ///
    /// Numbers, booleans and null compare by value. Two objects never
    /// compare equal, not even an object with itself; an instance with a
    /// `==` method still has it invoked first.
    pub fn values_equal(&mut self, a: Value, b: Value) -> bool {
        let equal = self.names.equal;
        if self.heap.is_instance(a) && self.find_method(a, equal).is_some() {
            let _ = self.call_through(Trampoline::Invoke(1, equal), a, &[b], false);
        }
        match (a, b) {
            (Value::Object(_), _) | (_, Value::Object(_)) => false,
            _ => a == b,
        }
    }

    fn native_name(&mut self, name: &str) -> ObjRef {
        self.intern(name)
    }

    /// Register a global native function
    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        let name = self.native_name(name);
        self.with_root(Value::Object(name), |vm| {
            let native = vm.alloc(Object::NativeFunction(NativeFunction { name, function }));
            vm.globals.insert(name, Value::Object(native));
        });
    }

    /// Register a global primitive; see [`NativePrimitiveFn`]
    pub fn define_primitive(&mut self, name: &str, function: NativePrimitiveFn) {
        let name = self.native_name(name);
        self.with_root(Value::Object(name), |vm| {
            let native = vm.alloc(Object::NativePrimitive(NativePrimitive { name, function }));
            vm.globals.insert(name, Value::Object(native));
        });
    }

    fn native_method(&mut self, name: ObjRef, method: NativeMethodFn) -> Value {
        Value::Object(self.alloc(Object::NativeMethod(NativeMethod { name, method })))
    }

    fn primitive_method(&mut self, name: ObjRef, method: PrimitiveMethodFn) -> Value {
        Value::Object(self.alloc(Object::PrimitiveMethod(PrimitiveMethod { name, method })))
    }

    /// Add a native instance method to `class`
    pub fn bind_method(&mut self, class: ObjRef, name: &str, method: NativeMethodFn) {
        let name = self.native_name(name);
        self.with_root(Value::Object(name), |vm| {
            let value = vm.native_method(name, method);
            vm.heap.class_mut(class).methods.insert(name, value);
        });
    }

    /// Add a native static method; the receiver is the class itself
    pub fn bind_static_method(&mut self, class: ObjRef, name: &str, method: NativeMethodFn) {
        let name = self.native_name(name);
        self.with_root(Value::Object(name), |vm| {
            let value = vm.native_method(name, method);
            vm.heap.class_mut(class).static_fields.insert(name, value);
        });
    }

    pub fn bind_primitive(&mut self, class: ObjRef, name: &str, method: PrimitiveMethodFn) {
        let name = self.native_name(name);
        self.with_root(Value::Object(name), |vm| {
            let value = vm.primitive_method(name, method);
            vm.heap.class_mut(class).methods.insert(name, value);
        });
    }

    pub fn bind_static_primitive(&mut self, class: ObjRef, name: &str, method: PrimitiveMethodFn) {
        let name = self.native_name(name);
        self.with_root(Value::Object(name), |vm| {
            let value = vm.primitive_method(name, method);
            vm.heap.class_mut(class).static_fields.insert(name, value);
        });
    }

    /// Add a field backed by native accessors
    pub fn bind_getter_setter(
        &mut self,
        class: ObjRef,
        name: &str,
        getter: Option<NativeMethodFn>,
        setter: Option<NativeMethodFn>,
        is_static: bool,
    ) {
        let name = self.native_name(name);
        let depth = self.roots.len();
        self.push_root(Value::Object(name));
        let getter = getter.map(|g| {
            let value = self.native_method(name, g);
            self.push_root(value);
            value
        });
        let setter = setter.map(|s| {
            let value = self.native_method(name, s);
            self.push_root(value);
            value
        });
        let field = Value::Object(self.alloc(Object::Field(Field { getter, setter })));
        self.roots.truncate(depth);
        let class = self.heap.class_mut(class);
        if is_static {
            class.static_fields.insert(name, field);
        } else {
            class.methods.insert(name, field);
        }
    }

    /// Native constructor; it receives the new instance and returns it
    pub fn bind_constructor(&mut self, class: ObjRef, method: NativeMethodFn) {
        let name = self.names.constructor;
        let value = self.native_method(name, method);
        let class = self.heap.class_mut(class);
        class.methods.insert(name, value);
        class.init_method = Some(value);
    }
}
