//! Builtin classes
//!
//! Every VM starts with `Class`, `Object`, `Number`, `String`, `Bool`,
//! `Function`, `Module`, `Array`, `Map` and `Range` bound as globals.
//! `Object` copies its tables from `Class`, and every other class copies
//! from `Object`, so the generic members (`==`, `toString`, the static
//! `name` and `super` getters) are available everywhere.
//!
//! Members are plain native methods; fields such as `length` are
//! getter-backed `Field` objects so they read like properties:
//!
//! ```text
//! var a = [1, 2, 3]
//! a.push(4)
//! a.length        // 4
//! a[-1]           // 4
//! ```

use crate::display::{display_container, format_number};
use crate::error::{NativeResult, RuntimeError};
use crate::vm::Vm;
use ember_core::{Number, ObjRef, Value};
use std::mem::size_of;

/// Argument `index`, or null when the caller passed fewer
pub fn argument(args: &[Value], index: usize) -> Value {
    args.get(index).copied().unwrap_or_default()
}

/// Numeric argument `index` of native `function`
pub fn expect_number(args: &[Value], index: usize, function: &str) -> NativeResult<Number> {
    match argument(args, index) {
        Value::Number(n) => Ok(n),
        _ => Err(RuntimeError::new(format!(
            "{}() expects a number as argument {}",
            function,
            index + 1
        ))),
    }
}

/// String argument `index` of native `function`, as its interned handle
pub fn expect_string(vm: &Vm, args: &[Value], index: usize, function: &str) -> NativeResult<ObjRef> {
    let value = argument(args, index);
    match value {
        Value::Object(r) if vm.heap.is_string(value) => Ok(r),
        _ => Err(RuntimeError::new(format!(
            "{}() expects a string as argument {}",
            function,
            index + 1
        ))),
    }
}

fn receiver_of(vm: &Vm, receiver: Value, kind: &'static str, method: &str) -> NativeResult<ObjRef> {
    match receiver {
        Value::Object(r) if vm.heap.type_name(receiver) == kind => Ok(r),
        _ => Err(RuntimeError::new(format!(
            "{}() called on a {} instead of a {}",
            method,
            vm.type_name(receiver),
            kind
        ))),
    }
}

pub(crate) fn open(vm: &mut Vm) {
    let classes = *vm.classes();
    for class in [
        classes.class,
        classes.object,
        classes.number,
        classes.string,
        classes.bool,
        classes.function,
        classes.module,
        classes.array,
        classes.map,
        classes.range,
        classes.fiber,
        classes.gc,
    ] {
        let name = vm.heap.class(class).name;
        vm.globals.insert(name, Value::Object(class));
    }

    vm.bind_method(classes.class, "==", identical);
    vm.bind_method(classes.class, "toString", describe);
    vm.bind_getter_setter(classes.class, "name", Some(class_name), None, true);
    vm.bind_getter_setter(classes.class, "super", Some(class_super), None, true);
    vm.bind_static_method(classes.class, "toString", describe);

    vm.inherit(classes.object, classes.class);
    vm.bind_getter_setter(classes.object, "class", Some(object_class), None, false);

    for class in [
        classes.number,
        classes.string,
        classes.bool,
        classes.function,
        classes.module,
        classes.array,
        classes.map,
        classes.range,
        classes.fiber,
        classes.gc,
    ] {
        vm.inherit(class, classes.object);
    }

    vm.bind_method(classes.number, "toString", number_to_string);

    vm.bind_method(classes.string, "+", string_concat);
    vm.bind_method(classes.string, "==", string_equal);
    vm.bind_getter_setter(classes.string, "length", Some(string_length), None, false);
    vm.bind_method(classes.string, "toString", identity);

    vm.bind_method(classes.bool, "==", bool_equal);
    vm.bind_method(classes.bool, "toString", describe);

    vm.bind_getter_setter(classes.function, "name", Some(function_name), None, false);
    vm.bind_getter_setter(classes.module, "name", Some(module_name), None, false);

    vm.bind_method(classes.array, "[]", array_subscript);
    vm.bind_method(classes.array, "push", array_push);
    vm.bind_getter_setter(classes.array, "length", Some(array_length), None, false);
    vm.bind_method(classes.array, "toString", container_to_string);

    vm.bind_method(classes.map, "[]", map_subscript);
    vm.bind_getter_setter(classes.map, "length", Some(map_length), None, false);
    vm.bind_method(classes.map, "toString", container_to_string);

    vm.bind_getter_setter(classes.range, "from", Some(range_from), Some(set_range_from), false);
    vm.bind_getter_setter(classes.range, "to", Some(range_to), Some(set_range_to), false);
    vm.bind_getter_setter(classes.range, "length", Some(range_length), None, false);
}

fn identical(_vm: &mut Vm, receiver: Value, args: &[Value]) -> NativeResult<Value> {
    Ok(Value::Bool(receiver == argument(args, 0)))
}

fn identity(_vm: &mut Vm, receiver: Value, _args: &[Value]) -> NativeResult<Value> {
    Ok(receiver)
}

fn describe(vm: &mut Vm, receiver: Value, _args: &[Value]) -> NativeResult<Value> {
    let text = vm.describe(receiver);
    Ok(vm.new_string(&text))
}

fn class_name(vm: &mut Vm, receiver: Value, _args: &[Value]) -> NativeResult<Value> {
    let class = receiver_of(vm, receiver, "class", "name")?;
    Ok(Value::Object(vm.heap.class(class).name))
}

fn class_super(vm: &mut Vm, receiver: Value, _args: &[Value]) -> NativeResult<Value> {
    let class = receiver_of(vm, receiver, "class", "super")?;
    Ok(vm
        .heap
        .class(class)
        .superclass
        .map(Value::Object)
        .unwrap_or_default())
}

fn object_class(vm: &mut Vm, receiver: Value, _args: &[Value]) -> NativeResult<Value> {
    Ok(vm.class_of(receiver).map(Value::Object).unwrap_or_default())
}

fn number_to_string(vm: &mut Vm, receiver: Value, _args: &[Value]) -> NativeResult<Value> {
    let text = match receiver {
        Value::Number(n) => format_number(n),
        other => vm.describe(other),
    };
    Ok(vm.new_string(&text))
}

fn string_concat(vm: &mut Vm, receiver: Value, args: &[Value]) -> NativeResult<Value> {
    let left = receiver_of(vm, receiver, "string", "+")?;
    let right = vm.to_display_string(argument(args, 0))?;
    let joined = format!("{}{}", vm.heap.str(left), right);
    Ok(vm.new_string(&joined))
}

fn string_equal(vm: &mut Vm, receiver: Value, args: &[Value]) -> NativeResult<Value> {
    let other = argument(args, 0);
    if other.is_null() {
        return Ok(Value::Bool(false));
    }
    match (vm.heap.as_str(receiver), vm.heap.as_str(other)) {
        (Some(a), Some(b)) => Ok(Value::Bool(a == b)),
        _ => Err(RuntimeError::new(
            "can only compare string to another string or null",
        )),
    }
}

fn string_length(vm: &mut Vm, receiver: Value, _args: &[Value]) -> NativeResult<Value> {
    let s = receiver_of(vm, receiver, "string", "length")?;
    Ok(Value::fixed(vm.heap.str(s).chars().count() as i64))
}

fn bool_equal(_vm: &mut Vm, receiver: Value, args: &[Value]) -> NativeResult<Value> {
    Ok(Value::Bool(match (receiver, argument(args, 0)) {
        (Value::Bool(a), Value::Bool(b)) => a == b,
        _ => false,
    }))
}

fn function_name(vm: &mut Vm, receiver: Value, _args: &[Value]) -> NativeResult<Value> {
    let name = vm.function_name(receiver).map(str::to_string);
    Ok(match name {
        Some(name) => vm.new_string(&name),
        None => Value::Null,
    })
}

fn module_name(vm: &mut Vm, receiver: Value, _args: &[Value]) -> NativeResult<Value> {
    let module = receiver_of(vm, receiver, "module", "name")?;
    Ok(Value::Object(vm.heap.module(module).name))
}

fn container_to_string(vm: &mut Vm, receiver: Value, _args: &[Value]) -> NativeResult<Value> {
    let text = display_container(vm, receiver)?;
    Ok(vm.new_string(&text))
}

/// Resolve a possibly negative index against `len`
fn array_index(index: Number, len: usize) -> Option<usize> {
    let index = index.as_i64();
    if index < 0 {
        usize::try_from(len as i64 + index).ok()
    } else {
        usize::try_from(index).ok()
    }
}

fn array_subscript(vm: &mut Vm, receiver: Value, args: &[Value]) -> NativeResult<Value> {
    let array = receiver_of(vm, receiver, "array", "[]")?;
    let index = expect_number(args, 0, "[]")?;
    let len = vm.heap.array(array).values.len();
    match args.len() {
        1 => Ok(array_index(index, len)
            .and_then(|i| vm.heap.array(array).values.get(i).copied())
            .unwrap_or_default()),
        2 => {
            let value = args[1];
            let i = array_index(index, len).ok_or_else(|| {
                RuntimeError::new(format!("array index {} out of range", format_number(index)))
            })?;
            let values = &mut vm.heap.array_mut(array).values;
            let before = values.capacity();
            if i >= values.len() {
                values.resize(i + 1, Value::Null);
            }
            values[i] = value;
            let grown = values.capacity() - before;
            vm.heap.note_growth(grown * size_of::<Value>());
            Ok(value)
        }
        n => Err(RuntimeError::new(format!(
            "[]() expects 1 or 2 arguments, got {}",
            n
        ))),
    }
}

fn array_push(vm: &mut Vm, receiver: Value, args: &[Value]) -> NativeResult<Value> {
    let array = receiver_of(vm, receiver, "array", "push")?;
    let values = &mut vm.heap.array_mut(array).values;
    let before = values.capacity();
    values.extend_from_slice(args);
    let grown = values.capacity() - before;
    vm.heap.note_growth(grown * size_of::<Value>());
    Ok(receiver)
}

fn array_length(vm: &mut Vm, receiver: Value, _args: &[Value]) -> NativeResult<Value> {
    let array = receiver_of(vm, receiver, "array", "length")?;
    Ok(Value::fixed(vm.heap.array(array).values.len() as i64))
}

fn map_subscript(vm: &mut Vm, receiver: Value, args: &[Value]) -> NativeResult<Value> {
    let map = receiver_of(vm, receiver, "map", "[]")?;
    let key = expect_string(vm, args, 0, "[]")?;
    match args.len() {
        1 => Ok(vm.heap.map(map).values.get(&key).copied().unwrap_or_default()),
        2 => {
            let value = args[1];
            let entries = &mut vm.heap.map_mut(map).values;
            if value.is_null() {
                entries.remove(&key);
            } else if entries.insert(key, value).is_none() {
                vm.heap.note_growth(size_of::<(ObjRef, Value)>());
            }
            Ok(value)
        }
        n => Err(RuntimeError::new(format!(
            "[]() expects 1 or 2 arguments, got {}",
            n
        ))),
    }
}

fn map_length(vm: &mut Vm, receiver: Value, _args: &[Value]) -> NativeResult<Value> {
    let map = receiver_of(vm, receiver, "map", "length")?;
    Ok(Value::fixed(vm.heap.map(map).values.len() as i64))
}

fn range_from(vm: &mut Vm, receiver: Value, _args: &[Value]) -> NativeResult<Value> {
    let range = receiver_of(vm, receiver, "range", "from")?;
    Ok(Value::float(vm.heap.range(range).from))
}

fn range_to(vm: &mut Vm, receiver: Value, _args: &[Value]) -> NativeResult<Value> {
    let range = receiver_of(vm, receiver, "range", "to")?;
    Ok(Value::float(vm.heap.range(range).to))
}

fn set_range_from(vm: &mut Vm, receiver: Value, args: &[Value]) -> NativeResult<Value> {
    let range = receiver_of(vm, receiver, "range", "from")?;
    let from = expect_number(args, 0, "from")?;
    vm.heap.range_mut(range).from = from.as_f64();
    Ok(Value::Number(from))
}

fn set_range_to(vm: &mut Vm, receiver: Value, args: &[Value]) -> NativeResult<Value> {
    let range = receiver_of(vm, receiver, "range", "to")?;
    let to = expect_number(args, 0, "to")?;
    vm.heap.range_mut(range).to = to.as_f64();
    Ok(Value::Number(to))
}

fn range_length(vm: &mut Vm, receiver: Value, _args: &[Value]) -> NativeResult<Value> {
    let range = receiver_of(vm, receiver, "range", "length")?;
    let r = vm.heap.range(range);
    Ok(Value::float((r.to - r.from).abs()))
}
