//! The `Fiber` class
//!
//! ```text
//! var f = Fiber(fn(a) {
//!     var b = Fiber.yield(a + 1)
//!     return b * 2
//! })
//! f.run(1)    // 2
//! f.run(10)   // 20
//! f.done      // true
//! ```
//!
//! `run` and `try` are primitives: they switch the VM to the target fiber
//! and leave the calling fiber's callee slot to receive whatever the target
//! later yields, returns or (for `try`) fails with.

use crate::core_lib::argument;
use crate::error::{NativeResult, RuntimeError};
use crate::fiber::Fiber;
use crate::object::Object;
use crate::vm::Vm;
use ember_core::{ObjRef, Value};

pub(crate) fn open(vm: &mut Vm) {
    let class = vm.classes().fiber;
    vm.bind_constructor(class, construct);
    vm.bind_primitive(class, "run", run);
    vm.bind_primitive(class, "try", try_run);
    vm.bind_getter_setter(class, "done", Some(done), None, false);
    vm.bind_getter_setter(class, "error", Some(error), None, false);
    vm.bind_static_primitive(class, "yield", yield_fiber);
    vm.bind_static_primitive(class, "abort", abort);
    vm.bind_getter_setter(class, "current", Some(current), None, true);
}

fn this_fiber(vm: &Vm, receiver: Value) -> NativeResult<ObjRef> {
    match (receiver, vm.heap.object_of(receiver)) {
        (Value::Object(r), Some(Object::Fiber(_))) => Ok(r),
        _ => Err(RuntimeError::new(format!(
            "expected a fiber, got {}",
            vm.type_name(receiver)
        ))),
    }
}

fn construct(vm: &mut Vm, _receiver: Value, args: &[Value]) -> NativeResult<Value> {
    let function = argument(args, 0);
    if !matches!(
        vm.heap.object_of(function),
        Some(Object::Function(_) | Object::Closure(_))
    ) {
        return Err(RuntimeError::new(
            "Fiber constructor expects a function as its argument",
        ));
    }
    let parent = vm.current_fiber();
    let module = parent.and_then(|f| vm.heap.fiber(f).module);
    let mut fiber = Fiber::new(
        module,
        Some(function),
        vm.config.initial_stack,
        vm.config.initial_frames,
    );
    fiber.parent = parent;
    Ok(Value::Object(vm.alloc(Object::Fiber(fiber))))
}

fn run(vm: &mut Vm, receiver: Value, args: &[Value]) -> NativeResult<bool> {
    switch_to(vm, receiver, args, false)
}

fn try_run(vm: &mut Vm, receiver: Value, args: &[Value]) -> NativeResult<bool> {
    switch_to(vm, receiver, args, true)
}

/// Transfer control to the receiver fiber, starting it on first run
fn switch_to(vm: &mut Vm, receiver: Value, args: &[Value], catcher: bool) -> NativeResult<bool> {
    let target = this_fiber(vm, receiver)?;
    let caller = vm.running_fiber()?;
    if vm.heap.fiber(target).is_done() {
        return Err(RuntimeError::new("Fiber already finished executing"));
    }
    let mut ancestor = Some(caller);
    while let Some(fiber) = ancestor {
        if fiber == target {
            return Err(RuntimeError::new("Fiber is already running"));
        }
        ancestor = vm.heap.fiber(fiber).parent;
    }

    let f = vm.heap.fiber_mut(target);
    f.parent = Some(caller);
    f.catcher = catcher;
    if f.started {
        f.set_top(argument(args, 0));
        vm.fiber = Some(target);
        return Ok(true);
    }

    let function = f
        .function
        .ok_or_else(|| RuntimeError::new("Fiber has no function to run"))?;
    f.push(function);
    f.stack.extend_from_slice(args);
    vm.fiber = Some(target);
    if let Err(err) = vm.call_value(function, args.len()) {
        let f = vm.heap.fiber_mut(target);
        f.stack.clear();
        f.frames.clear();
        f.parent = None;
        vm.fiber = Some(caller);
        return Err(err);
    }
    Ok(true)
}

fn yield_fiber(vm: &mut Vm, _receiver: Value, args: &[Value]) -> NativeResult<bool> {
    let fiber = vm.running_fiber()?;
    let parent = match vm.heap.fiber(fiber).parent {
        Some(parent) => parent,
        None => {
            let message = match args.first() {
                Some(value) => vm.to_display_string(*value)?,
                None => "Fiber was yielded".to_string(),
            };
            return Err(RuntimeError::new(message));
        }
    };
    if vm.boundaries.last().is_some_and(|b| b.fiber == fiber) {
        return Err(RuntimeError::new(
            "cannot yield from a fiber that was entered from native code",
        ));
    }
    vm.heap.fiber_mut(fiber).parent = None;
    vm.heap.fiber_mut(parent).set_top(argument(args, 0));
    vm.fiber = Some(parent);
    Ok(true)
}

fn abort(vm: &mut Vm, _receiver: Value, args: &[Value]) -> NativeResult<bool> {
    let message = match args.first() {
        Some(value) => vm.to_display_string(*value)?,
        None => "Fiber was aborted".to_string(),
    };
    Err(RuntimeError::new(message))
}

fn done(vm: &mut Vm, receiver: Value, _args: &[Value]) -> NativeResult<Value> {
    let fiber = this_fiber(vm, receiver)?;
    Ok(Value::Bool(vm.heap.fiber(fiber).is_done()))
}

fn error(vm: &mut Vm, receiver: Value, _args: &[Value]) -> NativeResult<Value> {
    let fiber = this_fiber(vm, receiver)?;
    Ok(vm.heap.fiber(fiber).error)
}

fn current(vm: &mut Vm, _receiver: Value, _args: &[Value]) -> NativeResult<Value> {
    Ok(vm.current_fiber().map(Value::Object).unwrap_or_default())
}
