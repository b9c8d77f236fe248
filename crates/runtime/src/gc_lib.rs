//! The `GC` class: `GC.memoryUsed`, `GC.nextRound` and `GC.trigger()`

use crate::error::NativeResult;
use crate::vm::Vm;
use ember_core::Value;

pub(crate) fn open(vm: &mut Vm) {
    let class = vm.classes().gc;
    vm.bind_getter_setter(class, "memoryUsed", Some(memory_used), None, true);
    vm.bind_getter_setter(class, "nextRound", Some(next_round), None, true);
    vm.bind_static_method(class, "trigger", trigger);
}

fn memory_used(vm: &mut Vm, _receiver: Value, _args: &[Value]) -> NativeResult<Value> {
    Ok(Value::fixed(vm.bytes_allocated() as i64))
}

fn next_round(vm: &mut Vm, _receiver: Value, _args: &[Value]) -> NativeResult<Value> {
    Ok(Value::fixed(vm.next_gc() as i64))
}

/// Collect now; returns the bytes freed
fn trigger(vm: &mut Vm, _receiver: Value, _args: &[Value]) -> NativeResult<Value> {
    Ok(Value::fixed(vm.collect_garbage() as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_frees_garbage() {
        let mut vm = Vm::new();
        for _ in 0..10 {
            vm.make_array(vec![Value::fixed(1); 16]);
        }
        let gc = vm.get_global("GC").unwrap();
        let freed = vm.invoke_method(gc, "trigger", &[]).unwrap();
        assert!(matches!(freed, Value::Number(n) if n.as_i64() > 0));
    }

    #[test]
    fn test_memory_getters() {
        let mut vm = Vm::new();
        let gc = vm.get_global("GC").unwrap();
        let used = vm.get_field(gc, "memoryUsed").unwrap();
        let next = vm.get_field(gc, "nextRound").unwrap();
        assert!(matches!(used, Value::Number(n) if n.as_i64() > 0));
        assert_eq!(next, Value::fixed(vm.next_gc() as i64));
    }
}
