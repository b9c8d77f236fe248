//! Instruction semantics
//!
//! One arm per opcode. Stack effects are written in the opcode docs in
//! `ember_core::opcode`; everything that can call back into script code
//! saves the instruction pointer first and answers `Flow::Reload`.

use crate::error::{NativeResult, RuntimeError};
use crate::interpreter::{ExecState, Flow};
use crate::object::{
    BoundMethod, Class, Closure, Object, Range, RefTarget, Reference,
};
use crate::vm::Vm;
use ember_core::{ObjRef, OpCode, Value};

impl Vm {
    #[inline]
    fn push(&mut self, state: &ExecState, value: Value) {
        self.heap.fiber_mut(state.fiber).push(value);
    }

    #[inline]
    fn pop(&mut self, state: &ExecState) -> Value {
        self.heap.fiber_mut(state.fiber).pop()
    }

    #[inline]
    fn peek(&self, state: &ExecState, distance: usize) -> Value {
        self.heap.fiber(state.fiber).peek(distance)
    }

    #[inline]
    fn set_top(&mut self, state: &ExecState, value: Value) {
        self.heap.fiber_mut(state.fiber).set_top(value);
    }

    #[inline]
    fn drop_values(&mut self, state: &ExecState, n: usize) {
        self.heap.fiber_mut(state.fiber).drop_n(n);
    }

    fn slot(&self, state: &ExecState, index: usize) -> Value {
        self.heap
            .fiber(state.fiber)
            .stack
            .get(state.base + index)
            .copied()
            .unwrap_or_default()
    }

    fn set_slot(&mut self, state: &ExecState, index: usize, value: Value) -> NativeResult<()> {
        match self.heap.fiber_mut(state.fiber).stack.get_mut(state.base + index) {
            Some(cell) => {
                *cell = value;
                Ok(())
            }
            None => Err(RuntimeError::new("local slot out of range")),
        }
    }

    /// A string constant naming a global, field or method
    fn name_constant(&self, state: &ExecState, index: usize) -> NativeResult<ObjRef> {
        let value = state.constant(index);
        match value {
            Value::Object(r) if self.heap.is_string(value) => Ok(r),
            _ => Err(RuntimeError::new("expected a string constant")),
        }
    }

    fn string_operand(&self, value: Value, what: &str) -> NativeResult<ObjRef> {
        match value {
            Value::Object(r) if self.heap.is_string(value) => Ok(r),
            _ => Err(RuntimeError::new(format!("{} must be a string", what))),
        }
    }

    fn class_operand(&self, value: Value) -> NativeResult<ObjRef> {
        match value {
            Value::Object(r) if self.heap.is_class(value) => Ok(r),
            _ => Err(RuntimeError::new(format!(
                "expected a class, got {}",
                self.type_name(value)
            ))),
        }
    }

    fn current_module(&self, state: &ExecState) -> NativeResult<ObjRef> {
        state
            .module
            .ok_or_else(|| RuntimeError::new("private variable access outside of a module"))
    }

    fn get_private(&self, state: &ExecState, index: usize) -> NativeResult<Value> {
        let module = self.current_module(state)?;
        self.heap
            .module(module)
            .privates
            .get(index)
            .copied()
            .ok_or_else(|| RuntimeError::new("private variable index out of range"))
    }

    fn set_private(&mut self, state: &ExecState, index: usize, value: Value) -> NativeResult<()> {
        let module = self.current_module(state)?;
        match self.heap.module_mut(module).privates.get_mut(index) {
            Some(cell) => {
                *cell = value;
                Ok(())
            }
            None => Err(RuntimeError::new("private variable index out of range")),
        }
    }

    fn frame_upvalue(&self, state: &ExecState, index: usize) -> NativeResult<ObjRef> {
        state
            .closure
            .and_then(|c| self.heap.closure(c).upvalues.get(index).copied())
            .ok_or_else(|| RuntimeError::new("upvalue index out of range"))
    }

    pub(crate) fn dispatch(&mut self, state: &mut ExecState, op: OpCode) -> NativeResult<Flow> {
        match op {
            OpCode::Pop => {
                self.pop(state);
            }
            OpCode::Dup => {
                let top = self.peek(state, 0);
                self.push(state, top);
            }
            OpCode::Return => return self.op_return(state),
            OpCode::Constant => {
                let index = state.fetch() as usize;
                let value = state.constant(index);
                self.push(state, value);
            }
            OpCode::ConstantLong => {
                let index = state.fetch_short() as usize;
                let value = state.constant(index);
                self.push(state, value);
            }
            OpCode::True => self.push(state, Value::Bool(true)),
            OpCode::False => self.push(state, Value::Bool(false)),
            OpCode::Null => self.push(state, Value::Null),
            OpCode::Array => {
                let array = self.make_array(Vec::new());
                self.push(state, array);
            }
            OpCode::Object => {
                let map = self.make_map();
                self.push(state, map);
            }
            OpCode::Range => {
                let from = self.pop(state);
                let to = self.pop(state);
                let (from, to) = match (from.as_number(), to.as_number()) {
                    (Some(from), Some(to)) => (from.as_f64(), to.as_f64()),
                    _ => return Err(RuntimeError::new("range fields must be numbers")),
                };
                let range = self.alloc(Object::Range(Range { from, to }));
                self.push(state, Value::Object(range));
            }
            OpCode::Negate => match self.peek(state, 0).as_number() {
                Some(n) => self.set_top(state, Value::Number(n.neg())),
                None => return Err(RuntimeError::new("operand must be a number")),
            },
            OpCode::Not => {
                let value = self.peek(state, 0);
                if self.heap.is_instance(value) {
                    let not = self.names.not;
                    if let Some(method) = self.find_method(value, not) {
                        self.save_ip(state);
                        self.call_value(method, 0)?;
                        return Ok(Flow::Reload);
                    }
                    self.set_top(state, Value::Bool(false));
                } else {
                    self.set_top(state, Value::Bool(value.is_falsey()));
                }
            }
            OpCode::BitNot => match self.peek(state, 0).as_number() {
                Some(n) => self.set_top(state, Value::Number(n.bit_not())),
                None => return Err(RuntimeError::new("Operand must be a number")),
            },
            OpCode::Add
            | OpCode::Subtract
            | OpCode::Multiply
            | OpCode::Power
            | OpCode::Divide
            | OpCode::FloorDivide
            | OpCode::Mod
            | OpCode::BitAnd
            | OpCode::BitOr
            | OpCode::BitXor
            | OpCode::LeftShift
            | OpCode::RightShift
            | OpCode::Equal
            | OpCode::Greater
            | OpCode::GreaterEqual
            | OpCode::Less
            | OpCode::LessEqual => return self.binary_op(state, op),

            OpCode::SetGlobal => {
                let index = state.fetch_short() as usize;
                let name = self.name_constant(state, index)?;
                let value = self.peek(state, 0);
                self.globals.insert(name, value);
            }
            OpCode::GetGlobal => {
                let index = state.fetch_short() as usize;
                let name = self.name_constant(state, index)?;
                let value = self.globals.get(&name).copied().unwrap_or_default();
                self.push(state, value);
            }
            OpCode::SetLocal | OpCode::SetLocalLong => {
                let index = self.index_operand(state, op == OpCode::SetLocalLong);
                let value = self.peek(state, 0);
                self.set_slot(state, index, value)?;
            }
            OpCode::GetLocal | OpCode::GetLocalLong => {
                let index = self.index_operand(state, op == OpCode::GetLocalLong);
                let value = self.slot(state, index);
                self.push(state, value);
            }
            OpCode::SetPrivate | OpCode::SetPrivateLong => {
                let index = self.index_operand(state, op == OpCode::SetPrivateLong);
                let value = self.peek(state, 0);
                self.set_private(state, index, value)?;
            }
            OpCode::GetPrivate | OpCode::GetPrivateLong => {
                let index = self.index_operand(state, op == OpCode::GetPrivateLong);
                let value = self.get_private(state, index)?;
                self.push(state, value);
            }
            OpCode::SetUpvalue => {
                let index = state.fetch() as usize;
                let upvalue = self.frame_upvalue(state, index)?;
                let value = self.peek(state, 0);
                self.upvalue_set(upvalue, value);
            }
            OpCode::GetUpvalue => {
                let index = state.fetch() as usize;
                let upvalue = self.frame_upvalue(state, index)?;
                let value = self.upvalue_get(upvalue);
                self.push(state, value);
            }

            OpCode::JumpIfFalse => {
                let offset = state.fetch_short() as usize;
                if self.pop(state).is_falsey() {
                    state.ip += offset;
                }
            }
            OpCode::JumpIfNull => {
                let offset = state.fetch_short() as usize;
                if self.peek(state, 0).is_null() {
                    state.ip += offset;
                }
            }
            OpCode::JumpIfNullPopping => {
                let offset = state.fetch_short() as usize;
                if self.pop(state).is_null() {
                    state.ip += offset;
                }
            }
            OpCode::Jump => {
                let offset = state.fetch_short() as usize;
                state.ip += offset;
            }
            OpCode::JumpBack => {
                let offset = state.fetch_short() as usize;
                state.ip = state
                    .ip
                    .checked_sub(offset)
                    .ok_or_else(|| RuntimeError::new("jump before the start of the function"))?;
            }
            OpCode::And => {
                let offset = state.fetch_short() as usize;
                if self.peek(state, 0).is_falsey() {
                    state.ip += offset;
                } else {
                    self.pop(state);
                }
            }
            OpCode::Or => {
                let offset = state.fetch_short() as usize;
                if self.peek(state, 0).is_falsey() {
                    self.pop(state);
                } else {
                    state.ip += offset;
                }
            }
            OpCode::NullOr => {
                let offset = state.fetch_short() as usize;
                if self.peek(state, 0).is_null() {
                    self.pop(state);
                } else {
                    state.ip += offset;
                }
            }

            OpCode::Closure => return self.op_closure(state),
            OpCode::CloseUpvalue => {
                let top = self.heap.fiber(state.fiber).stack.len().saturating_sub(1);
                self.close_upvalues(state.fiber, top);
                self.pop(state);
            }
            OpCode::Class => {
                let index = state.fetch_short() as usize;
                let name = self.name_constant(state, index)?;
                let class = self.alloc(Object::Class(Class::new(name)));
                self.push(state, Value::Object(class));
                let object = self.classes.object;
                self.inherit(class, object);
                self.globals.insert(name, Value::Object(class));
            }
            OpCode::GetField => return self.op_get_field(state),
            OpCode::SetField => return self.op_set_field(state),
            OpCode::SubscriptGet => {
                let receiver = self.peek(state, 1);
                return self.invoke_operator(state, receiver, "[]", 1);
            }
            OpCode::SubscriptSet => {
                let receiver = self.peek(state, 2);
                return self.invoke_operator(state, receiver, "[]", 2);
            }
            OpCode::PushArrayElement => {
                let value = self.peek(state, 0);
                match self.peek(state, 1) {
                    Value::Object(r) if self.heap.is_array(Value::Object(r)) => {
                        self.heap.array_mut(r).values.push(value);
                    }
                    other => {
                        return Err(RuntimeError::new(format!(
                            "cannot push an element into a {}",
                            self.type_name(other)
                        )));
                    }
                }
                self.pop(state);
            }
            OpCode::PushObjectField => {
                let target = self.peek(state, 2);
                let key = self.string_operand(self.peek(state, 1), "object key")?;
                let value = self.peek(state, 0);
                match (target, self.heap.object_of(target)) {
                    (Value::Object(r), Some(Object::Map(_))) => {
                        self.heap.map_mut(r).values.insert(key, value);
                    }
                    (Value::Object(r), Some(Object::Instance(_))) => {
                        self.heap.instance_mut(r).fields.insert(key, value);
                    }
                    _ => {
                        return Err(RuntimeError::new(format!(
                            "cannot set field '{}' on a {}",
                            self.heap.str(key),
                            self.type_name(target)
                        )));
                    }
                }
                self.drop_values(state, 2);
            }
            OpCode::StaticField => {
                let index = state.fetch_short() as usize;
                let name = self.name_constant(state, index)?;
                let class = self.class_operand(self.peek(state, 1))?;
                let value = self.peek(state, 0);
                self.heap.class_mut(class).static_fields.insert(name, value);
                self.pop(state);
            }
            OpCode::Method => {
                let index = state.fetch_short() as usize;
                let name = self.name_constant(state, index)?;
                let class = self.class_operand(self.peek(state, 1))?;
                let method = self.peek(state, 0);
                if name == self.names.constructor {
                    let inherited = self
                        .heap
                        .class(class)
                        .superclass
                        .and_then(|s| self.heap.class(s).init_method);
                    let current = self.heap.class(class).init_method;
                    if current.is_none() || current == inherited {
                        self.heap.class_mut(class).init_method = Some(method);
                    }
                }
                self.heap.class_mut(class).methods.insert(name, method);
                self.pop(state);
            }
            OpCode::DefineField => {
                let index = state.fetch_short() as usize;
                let name = self.name_constant(state, index)?;
                let class = self.class_operand(self.peek(state, 1))?;
                let field = self.peek(state, 0);
                self.heap.class_mut(class).methods.insert(name, field);
                self.pop(state);
            }
            OpCode::Invoke | OpCode::InvokeIgnoring => {
                let argc = state.fetch();
                let argc = state.take_argc(argc);
                let index = state.fetch_short() as usize;
                let name = self.name_constant(state, index)?;
                self.save_ip(state);
                return self.op_invoke(state, argc, name, op == OpCode::InvokeIgnoring);
            }
            OpCode::InvokeSuper | OpCode::InvokeSuperIgnoring => {
                let argc = state.fetch();
                let argc = state.take_argc(argc);
                let index = state.fetch_short() as usize;
                let name = self.name_constant(state, index)?;
                let class = self.pop(state);
                let class = self.class_operand(class)?;
                self.save_ip(state);
                let receiver = self.peek(state, argc);
                let method = match self.heap.object_of(receiver) {
                    Some(Object::Instance(i)) => i.fields.get(&name).copied(),
                    _ => None,
                }
                .or_else(|| self.heap.class(class).methods.get(&name).copied());
                let method = method.ok_or_else(|| {
                    RuntimeError::new(format!(
                        "cannot call undefined method '{}' of class '{}'",
                        self.heap.str(name),
                        self.class_name(class)
                    ))
                })?;
                return self.call_method_value(
                    state,
                    method,
                    argc,
                    receiver,
                    op == OpCode::InvokeSuperIgnoring,
                );
            }
            OpCode::GetSuperMethod => {
                let index = state.fetch_short() as usize;
                let name = self.name_constant(state, index)?;
                let class = self.class_operand(self.peek(state, 0))?;
                let instance = self.peek(state, 1);
                let bound = match self.heap.class(class).methods.get(&name).copied() {
                    Some(method) => Value::Object(self.alloc(Object::BoundMethod(BoundMethod {
                        receiver: instance,
                        method,
                    }))),
                    None => Value::Null,
                };
                self.drop_values(state, 1);
                self.set_top(state, bound);
            }
            OpCode::Inherit => {
                let superclass = match self.peek(state, 1) {
                    Value::Object(r) if self.heap.is_class(Value::Object(r)) => r,
                    _ => return Err(RuntimeError::new("superclass must be a class")),
                };
                let class = self.class_operand(self.peek(state, 0))?;
                self.inherit(class, superclass);
            }
            OpCode::Call => {
                let argc = state.fetch();
                let argc = state.take_argc(argc);
                self.save_ip(state);
                let callee = self.peek(state, argc);
                self.call_value(callee, argc)?;
                return Ok(Flow::Reload);
            }
            OpCode::Is => {
                let value = self.peek(state, 1);
                let target = self.peek(state, 0);
                let result = if value.is_null() {
                    false
                } else {
                    let class = match (self.class_of(value), self.heap.is_class(target)) {
                        (Some(class), true) => class,
                        _ => {
                            return Err(RuntimeError::new(
                                "operands must be an instance or a class",
                            ));
                        }
                    };
                    self.is_subclass(class, target)
                };
                self.drop_values(state, 1);
                self.set_top(state, Value::Bool(result));
            }
            OpCode::PopLocals => {
                let count = state.fetch_short() as usize;
                self.drop_values(state, count);
            }
            OpCode::VarArg => {
                let index = state.fetch() as usize;
                let value = self.slot(state, index);
                match (value, self.heap.object_of(value)) {
                    (Value::Object(r), Some(Object::Array(_))) => {
                        let values = self.heap.array(r).values.clone();
                        self.ensure_stack(state.fiber, values.len());
                        state.pending_varargs += values.len() as isize - 1;
                        self.heap.fiber_mut(state.fiber).stack.extend(values);
                    }
                    _ => self.push(state, value),
                }
            }

            OpCode::ReferenceGlobal => {
                let index = state.fetch_short() as usize;
                let name = self.name_constant(state, index)?;
                if !self.globals.contains_key(&name) {
                    return Err(RuntimeError::new("attempt to reference a null value"));
                }
                self.push_reference(state, RefTarget::Global(name));
            }
            OpCode::ReferencePrivate => {
                let index = state.fetch_short() as usize;
                let module = self.current_module(state)?;
                self.get_private(state, index)?;
                self.push_reference(state, RefTarget::Private { module, index });
            }
            OpCode::ReferenceLocal => {
                let index = state.fetch_short() as usize;
                let slot = state.base + index;
                self.push_reference(
                    state,
                    RefTarget::Stack {
                        fiber: state.fiber,
                        slot,
                    },
                );
            }
            OpCode::ReferenceUpvalue => {
                let index = state.fetch() as usize;
                let upvalue = self.frame_upvalue(state, index)?;
                self.push_reference(state, RefTarget::Upvalue(upvalue));
            }
            OpCode::ReferenceField => {
                let object = self.peek(state, 1);
                if object.is_null() {
                    return Err(RuntimeError::new("attempt to index a null value"));
                }
                let name = self.string_operand(self.peek(state, 0), "field name")?;
                let instance = match object {
                    Value::Object(r) if self.heap.is_instance(object) => r,
                    _ => {
                        return Err(RuntimeError::new(format!(
                            "cannot reference field '{}' of a non-instance",
                            self.heap.str(name)
                        )));
                    }
                };
                if !self.heap.instance(instance).fields.contains_key(&name) {
                    return Err(RuntimeError::new("attempt to reference a null value"));
                }
                let reference = self.alloc(Object::Reference(Reference {
                    target: RefTarget::Field { instance, name },
                }));
                self.drop_values(state, 1);
                self.set_top(state, Value::Object(reference));
            }
            OpCode::SetReference => {
                let reference = self.pop(state);
                let reference = match (reference, self.heap.object_of(reference)) {
                    (Value::Object(r), Some(Object::Reference(_))) => r,
                    _ => {
                        return Err(RuntimeError::new(
                            "cannot set reference value of a non-reference",
                        ));
                    }
                };
                let value = self.peek(state, 0);
                self.write_reference(reference, value)?;
            }
        }
        Ok(Flow::Continue)
    }

    fn index_operand(&self, state: &mut ExecState, long: bool) -> usize {
        if long {
            state.fetch_short() as usize
        } else {
            state.fetch() as usize
        }
    }

    fn push_reference(&mut self, state: &ExecState, target: RefTarget) {
        let reference = self.alloc(Object::Reference(Reference { target }));
        self.push(state, Value::Object(reference));
    }

    /// Whether `class` is `target` or inherits from it
    pub(crate) fn is_subclass(&self, class: ObjRef, target: Value) -> bool {
        let mut current = Some(class);
        while let Some(c) = current {
            if Value::Object(c) == target {
                return true;
            }
            current = self.heap.class(c).superclass;
        }
        false
    }

    fn op_return(&mut self, state: &mut ExecState) -> NativeResult<Flow> {
        let fiber = state.fiber;
        let result = self.pop(state);
        self.close_upvalues(fiber, state.base);
        let f = self.heap.fiber_mut(fiber);
        let frame = f
            .frames
            .pop()
            .ok_or_else(|| RuntimeError::new("return without a frame"))?;

        if frame.return_to_host {
            f.stack.truncate(frame.base);
            return Ok(Flow::Finish(result));
        }

        if f.frames.is_empty() {
            f.stack.truncate(frame.base);
            let module = f.module;
            let parent = f.parent.take();
            if let Some(module) = module {
                self.heap.module_mut(module).return_value = result;
            }
            return match parent {
                None => Ok(Flow::Finish(result)),
                Some(parent) => {
                    self.heap.fiber_mut(parent).set_top(result);
                    self.fiber = Some(parent);
                    Ok(Flow::Reload)
                }
            };
        }

        if frame.result_ignored {
            f.stack.truncate(frame.base + 1);
        } else {
            f.stack.truncate(frame.base);
            f.stack.push(result);
        }
        Ok(Flow::Reload)
    }

    fn op_closure(&mut self, state: &mut ExecState) -> NativeResult<Flow> {
        let index = state.fetch_short() as usize;
        let function = match state.constant(index) {
            Value::Object(r) if matches!(self.heap.try_get(r), Some(Object::Function(_))) => r,
            _ => return Err(RuntimeError::new("closure operand is not a function")),
        };
        let count = self.heap.function(function).upvalue_count as usize;
        let closure = self.alloc(Object::Closure(Closure {
            function,
            upvalues: Vec::with_capacity(count),
        }));
        self.push(state, Value::Object(closure));
        for _ in 0..count {
            let is_local = state.fetch() != 0;
            let index = state.fetch() as usize;
            let upvalue = if is_local {
                self.capture_upvalue(state.fiber, state.base + index)
            } else {
                self.frame_upvalue(state, index)?
            };
            self.heap.closure_mut(closure).upvalues.push(upvalue);
        }
        Ok(Flow::Continue)
    }

    /// Field object behind a table entry: (getter, setter)
    fn field_accessors(&self, value: Value) -> Option<(Option<Value>, Option<Value>)> {
        match self.heap.object_of(value)? {
            Object::Field(f) => Some((f.getter, f.setter)),
            _ => None,
        }
    }

    fn is_native_method(&self, value: Value) -> bool {
        matches!(
            self.heap.object_of(value),
            Some(Object::NativeMethod(_)) | Some(Object::PrimitiveMethod(_))
        )
    }

    fn call_getter(
        &mut self,
        state: &ExecState,
        getter: Option<Value>,
        class: ObjRef,
        name: ObjRef,
    ) -> NativeResult<Flow> {
        let getter = getter.ok_or_else(|| {
            RuntimeError::new(format!(
                "class {} does not have a getter for field '{}'",
                self.class_name(class),
                self.heap.str(name)
            ))
        })?;
        self.drop_values(state, 1);
        self.save_ip(state);
        self.call_value(getter, 0)?;
        Ok(Flow::Reload)
    }

    fn call_setter(
        &mut self,
        state: &ExecState,
        setter: Option<Value>,
        class: ObjRef,
        name: ObjRef,
    ) -> NativeResult<Flow> {
        let setter = setter.ok_or_else(|| {
            RuntimeError::new(format!(
                "class {} does not have a setter for field '{}'",
                self.class_name(class),
                self.heap.str(name)
            ))
        })?;
        let value = self.peek(state, 1);
        self.drop_values(state, 2);
        self.push(state, value);
        self.save_ip(state);
        self.call_value(setter, 1)?;
        Ok(Flow::Reload)
    }

    fn bind(&mut self, receiver: Value, method: Value) -> Value {
        Value::Object(self.alloc(Object::BoundMethod(BoundMethod { receiver, method })))
    }

    /// `[object, name] -> value`
    fn op_get_field(&mut self, state: &mut ExecState) -> NativeResult<Flow> {
        let object = self.peek(state, 1);
        let name = self.string_operand(self.peek(state, 0), "field name")?;
        if object.is_null() {
            return Err(RuntimeError::new(format!(
                "attempt to get field '{}' of a null value",
                self.heap.str(name)
            )));
        }

        let value = match self.heap.object_of(object) {
            Some(Object::Instance(instance)) => {
                let class = instance.class;
                match instance.fields.get(&name).copied() {
                    Some(value) => value,
                    None => match self.heap.class(class).methods.get(&name).copied() {
                        Some(method) => match self.field_accessors(method) {
                            Some((getter, _)) => {
                                return self.call_getter(state, getter, class, name);
                            }
                            None => self.bind(object, method),
                        },
                        None => Value::Null,
                    },
                }
            }
            Some(Object::Class(c)) => match c.static_fields.get(&name).copied() {
                Some(member) => {
                    let class = object.as_object().unwrap_or(self.classes.class);
                    if let Some((getter, _)) = self.field_accessors(member) {
                        return self.call_getter(state, getter, class, name);
                    }
                    if self.is_native_method(member) {
                        self.bind(object, member)
                    } else {
                        member
                    }
                }
                None => Value::Null,
            },
            _ => {
                let class = self.class_of(object).ok_or_else(|| {
                    RuntimeError::new(format!(
                        "cannot get class object for type '{}'",
                        self.type_name(object)
                    ))
                })?;
                match self.heap.class(class).methods.get(&name).copied() {
                    Some(member) => {
                        if let Some((getter, _)) = self.field_accessors(member) {
                            return self.call_getter(state, getter, class, name);
                        }
                        if self.is_native_method(member) {
                            self.bind(object, member)
                        } else {
                            member
                        }
                    }
                    None => Value::Null,
                }
            }
        };
        self.drop_values(state, 1);
        self.set_top(state, value);
        Ok(Flow::Continue)
    }

    /// `[object, value, name] -> value`
    fn op_set_field(&mut self, state: &mut ExecState) -> NativeResult<Flow> {
        let object = self.peek(state, 2);
        let value = self.peek(state, 1);
        let name = self.string_operand(self.peek(state, 0), "field name")?;
        if object.is_null() {
            return Err(RuntimeError::new(format!(
                "attempt to set field '{}' of a null value",
                self.heap.str(name)
            )));
        }

        match (object, self.heap.object_of(object)) {
            (Value::Object(class), Some(Object::Class(c))) => {
                let existing = c.static_fields.get(&name).copied();
                if let Some((_, setter)) = existing.and_then(|m| self.field_accessors(m)) {
                    return self.call_setter(state, setter, class, name);
                }
                let statics = &mut self.heap.class_mut(class).static_fields;
                if value.is_null() {
                    statics.remove(&name);
                } else {
                    statics.insert(name, value);
                }
            }
            (Value::Object(instance), Some(Object::Instance(i))) => {
                let class = i.class;
                let member = self.heap.class(class).methods.get(&name).copied();
                if let Some((_, setter)) = member.and_then(|m| self.field_accessors(m)) {
                    return self.call_setter(state, setter, class, name);
                }
                let fields = &mut self.heap.instance_mut(instance).fields;
                if value.is_null() {
                    fields.remove(&name);
                } else {
                    fields.insert(name, value);
                }
            }
            _ => {
                let class = self.class_of(object).ok_or_else(|| {
                    RuntimeError::new("only instances and classes have fields")
                })?;
                let member = self.heap.class(class).methods.get(&name).copied();
                match member.and_then(|m| self.field_accessors(m)) {
                    Some((_, setter)) => return self.call_setter(state, setter, class, name),
                    None => {
                        return Err(RuntimeError::new(format!(
                            "class '{}' does not contain field '{}'",
                            self.class_name(class),
                            self.heap.str(name)
                        )));
                    }
                }
            }
        }
        self.drop_values(state, 2);
        self.set_top(state, value);
        Ok(Flow::Continue)
    }

    /// `[receiver, args..]` with the method looked up by name
    fn op_invoke(
        &mut self,
        state: &mut ExecState,
        argc: usize,
        name: ObjRef,
        ignoring: bool,
    ) -> NativeResult<Flow> {
        let receiver = self.peek(state, argc);
        if receiver.is_null() {
            return Err(RuntimeError::new(format!(
                "cannot index a null value with '{}'",
                self.heap.str(name)
            )));
        }
        let method = match (receiver, self.heap.object_of(receiver)) {
            (Value::Object(class), Some(Object::Class(c))) => {
                (c.static_fields.get(&name).copied(), class)
            }
            (_, Some(Object::Instance(i))) => {
                if let Some(value) = i.fields.get(&name).copied() {
                    let slot = self.callee_slot(state.fiber, argc)?;
                    self.heap.fiber_mut(state.fiber).stack[slot] = value;
                    return self.call_method_value(state, value, argc, receiver, ignoring);
                }
                let class = i.class;
                (self.heap.class(class).methods.get(&name).copied(), class)
            }
            _ => {
                let class = self
                    .class_of(receiver)
                    .ok_or_else(|| RuntimeError::new("cannot get class"))?;
                (self.heap.class(class).methods.get(&name).copied(), class)
            }
        };
        match method {
            (Some(method), _) => self.call_method_value(state, method, argc, receiver, ignoring),
            (None, class) => Err(RuntimeError::new(format!(
                "cannot call undefined method '{}' of class '{}'",
                self.heap.str(name),
                self.class_name(class)
            ))),
        }
    }

    pub(crate) fn call_method_value(
        &mut self,
        state: &ExecState,
        method: Value,
        argc: usize,
        receiver: Value,
        ignoring: bool,
    ) -> NativeResult<Flow> {
        let fiber = state.fiber;
        let depth = self.heap.fiber(fiber).frames.len();
        let pushed = self.call_value(method, argc)?;
        if ignoring {
            let f = self.heap.fiber_mut(fiber);
            if !pushed {
                f.set_top(receiver);
            } else if self.fiber == Some(fiber) && f.frames.len() > depth {
                if let Some(frame) = f.top_frame_mut() {
                    frame.result_ignored = true;
                }
            }
        }
        Ok(Flow::Reload)
    }

    /// Call an operator method on `receiver`, whose arguments are already
    /// on the stack above it
    pub(crate) fn invoke_operator(
        &mut self,
        state: &ExecState,
        receiver: Value,
        name: &str,
        argc: usize,
    ) -> NativeResult<Flow> {
        if receiver.is_null() {
            return Err(RuntimeError::new(format!(
                "cannot call method '{}' of null-instance",
                name
            )));
        }
        let class = self.class_of(receiver).ok_or_else(|| {
            RuntimeError::new(format!("cannot call method '{}' of a non-class", name))
        })?;
        let key = self.intern(name);
        let method = self.find_method(receiver, key).ok_or_else(|| {
            RuntimeError::new(format!(
                "cannot call undefined method '{}' of class '{}'",
                name,
                self.class_name(class)
            ))
        })?;
        self.save_ip(state);
        self.call_value(method, argc)?;
        Ok(Flow::Reload)
    }
}
