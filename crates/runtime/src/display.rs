//! Converting values to text
//!
//! [`Vm::describe`] is the structural form and never runs script code.
//! Containers shown through their `toString` method use
//! [`display_container`], which converts each element with
//! `to_display_string` and guards against cycles.

use crate::error::NativeResult;
use crate::object::Object;
use crate::vm::Vm;
use ember_core::{Number, ObjRef, Value};

/// Format a float the way C's `%g` does
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "infinity" } else { "-infinity" }.to_string();
    }
    if f == 0.0 {
        return if f.is_sign_negative() { "-0" } else { "0" }.to_string();
    }
    let scientific = format!("{:.5e}", f);
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((scientific.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if !(-4..6).contains(&exponent) {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", strip_zeros(mantissa), sign, exponent.abs())
    } else {
        let decimals = (5 - exponent).max(0) as usize;
        strip_zeros(&format!("{:.*}", decimals, f)).to_string()
    }
}

fn strip_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

pub fn format_number(n: Number) -> String {
    match n {
        Number::Fixed(i) => i.to_string(),
        Number::Float(f) => format_float(f),
    }
}

impl Vm {
    /// Structural text for a value
    pub fn describe(&self, value: Value) -> String {
        let mut out = String::new();
        let mut seen = Vec::new();
        self.describe_into(value, &mut out, &mut seen);
        out
    }

    fn describe_into(&self, value: Value, out: &mut String, seen: &mut Vec<ObjRef>) {
        let r = match value {
            Value::Null => return out.push_str("null"),
            Value::Bool(b) => return out.push_str(if b { "true" } else { "false" }),
            Value::Number(n) => return out.push_str(&format_number(n)),
            Value::Object(r) => r,
        };
        let object = match self.heap.try_get(r) {
            Some(object) => object,
            None => return out.push_str("<freed>"),
        };
        let name_of = |name: Option<ObjRef>| match name {
            Some(name) => self.heap.str(name).to_string(),
            None => "unknown".to_string(),
        };
        match object {
            Object::String(s) => out.push_str(s.as_str()),
            Object::Function(f) => out.push_str(&format!("<function {}>", name_of(f.name))),
            Object::Closure(c) => {
                let name = self.heap.function(c.function).name;
                out.push_str(&format!("<closure {}>", name_of(name)));
            }
            Object::NativeFunction(n) => out.push_str(&format!("<native {}>", self.heap.str(n.name))),
            Object::NativePrimitive(n) => out.push_str(&format!("<native {}>", self.heap.str(n.name))),
            Object::NativeMethod(n) => out.push_str(&format!("<native {}>", self.heap.str(n.name))),
            Object::PrimitiveMethod(n) => out.push_str(&format!("<native {}>", self.heap.str(n.name))),
            Object::BoundMethod(b) => {
                let name = self.function_name(b.method).unwrap_or("unknown");
                out.push_str(&format!("<bound_method {}>", name));
            }
            Object::Upvalue(_) => out.push_str("<upvalue>"),
            Object::Fiber(_) => out.push_str("<fiber>"),
            Object::Module(m) => out.push_str(&format!("<module {}>", self.heap.str(m.name))),
            Object::Class(c) => out.push_str(&format!("<class {}>", self.heap.str(c.name))),
            Object::Instance(i) => out.push_str(&format!("<instance {}>", self.class_name(i.class))),
            Object::Userdata(u) => out.push_str(&format!("<{}>", u.data.type_name())),
            Object::Range(range) => out.push_str(&format!(
                "<range {} .. {}>",
                format_float(range.from),
                format_float(range.to)
            )),
            Object::Field(_) => out.push_str("<field>"),
            Object::Reference(_) => {
                out.push_str("<reference => ");
                self.describe_into(self.read_reference(r), out, seen);
                out.push('>');
            }
            Object::Array(a) => {
                if seen.contains(&r) {
                    return out.push_str("[...]");
                }
                seen.push(r);
                out.push('[');
                for (i, element) in a.values.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.describe_into(*element, out, seen);
                }
                out.push(']');
                seen.pop();
            }
            Object::Map(m) => {
                if seen.contains(&r) {
                    return out.push_str("{...}");
                }
                seen.push(r);
                let mut entries: Vec<(&str, Value)> = m
                    .values
                    .iter()
                    .map(|(k, v)| (self.heap.str(*k), *v))
                    .collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                out.push('{');
                for (i, (key, element)) in entries.into_iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(key);
                    out.push_str(": ");
                    self.describe_into(element, out, seen);
                }
                out.push('}');
                seen.pop();
            }
        }
    }
}

/// Text of an array or map, converting each element with its own
/// `toString`
pub(crate) fn display_container(vm: &mut Vm, value: Value) -> NativeResult<String> {
    let r = match value {
        Value::Object(r) => r,
        _ => return Ok(vm.describe(value)),
    };
    let elements: Vec<(Option<String>, Value)> = match vm.heap.try_get(r) {
        Some(Object::Array(a)) => a.values.iter().map(|v| (None, *v)).collect(),
        Some(Object::Map(m)) => {
            let mut entries: Vec<(Option<String>, Value)> = m
                .values
                .iter()
                .map(|(k, v)| (Some(vm.heap.str(*k).to_string()), *v))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries
        }
        _ => return Ok(vm.describe(value)),
    };
    let is_map = vm.heap.try_get(r).is_some_and(|o| matches!(o, Object::Map(_)));
    if vm.display_stack.contains(&r) {
        return Ok(if is_map { "{...}" } else { "[...]" }.to_string());
    }

    let depth = vm.display_stack.len();
    vm.display_stack.push(r);
    let mut parts = Vec::with_capacity(elements.len());
    let mut failure = None;
    for (key, element) in elements {
        match vm.to_display_string(element) {
            Ok(text) => parts.push(match key {
                Some(key) => format!("{}: {}", key, text),
                None => text,
            }),
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }
    vm.display_stack.truncate(depth);
    if let Some(err) = failure {
        return Err(err);
    }
    let body = parts.join(", ");
    Ok(if is_map {
        format!("{{{}}}", body)
    } else {
        format!("[{}]", body)
    })
}
