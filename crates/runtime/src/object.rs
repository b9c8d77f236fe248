//! Heap object kinds
//!
//! Every object the collector manages is one variant of [`Object`]. Objects
//! refer to each other through [`ObjRef`] handles, never through Rust
//! references, so arbitrary cycles (instance -> closure -> upvalue ->
//! instance) are representable and only the collector decides when an object
//! dies.
//!
//! Each kind reports its outgoing handles through [`Object::trace`]; that is
//! the only thing the mark phase needs to know about it.

use crate::error::NativeResult;
use crate::fiber::Fiber;
use crate::vm::Vm;
use ember_core::{Chunk, ObjRef, Value};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::mem::size_of;
use std::rc::Rc;

/// Name-keyed table. Keys are interned string handles, so lookups compare
/// handles instead of bytes.
pub type Table = HashMap<ObjRef, Value>;

/// A native function: the result replaces the callee and its arguments
pub type NativeFn = fn(&mut Vm, &[Value]) -> NativeResult<Value>;

/// A native that manages the stack itself. Returning `true` means control
/// was transferred (typically to another fiber) and the callee slot receives
/// the eventual result.
pub type NativePrimitiveFn = fn(&mut Vm, &[Value]) -> NativeResult<bool>;

/// A native method; the receiver is passed separately from the arguments
pub type NativeMethodFn = fn(&mut Vm, Value, &[Value]) -> NativeResult<Value>;

/// A primitive native bound to a receiver
pub type PrimitiveMethodFn = fn(&mut Vm, Value, &[Value]) -> NativeResult<bool>;

/// FNV-1a, the hash cached on every string
pub fn hash_str(s: &str) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for byte in s.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

#[derive(Debug)]
pub struct StringObj {
    pub chars: Box<str>,
    pub hash: u32,
}

impl StringObj {
    pub fn new(s: &str) -> Self {
        StringObj {
            chars: s.into(),
            hash: hash_str(s),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.chars
    }
}

#[derive(Debug)]
pub struct Function {
    pub name: Option<ObjRef>,
    pub chunk: Rc<Chunk>,
    pub arity: u8,
    pub upvalue_count: u8,
    pub max_slots: u16,
    pub vararg: bool,
    pub module: Option<ObjRef>,
    /// Generated entry code for host calls; left out of tracebacks
    pub synthetic: bool,
}

#[derive(Debug)]
pub struct Closure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// A captured variable
#[derive(Debug, Clone, Copy)]
pub enum Upvalue {
    /// Still lives in a fiber's stack
    Open { fiber: ObjRef, slot: usize },
    /// Moved out of the stack when its scope ended
    Closed(Value),
}

#[derive(Debug)]
pub struct Class {
    pub name: ObjRef,
    pub init_method: Option<Value>,
    pub methods: Table,
    pub static_fields: Table,
    pub superclass: Option<ObjRef>,
}

impl Class {
    pub fn new(name: ObjRef) -> Self {
        Class {
            name,
            init_method: None,
            methods: Table::new(),
            static_fields: Table::new(),
            superclass: None,
        }
    }
}

#[derive(Debug)]
pub struct Instance {
    pub class: ObjRef,
    pub fields: Table,
}

#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Value,
}

#[derive(Debug, Default)]
pub struct Array {
    pub values: Vec<Value>,
}

#[derive(Debug, Default)]
pub struct Map {
    pub values: Table,
}

#[derive(Debug, Clone, Copy)]
pub struct Range {
    pub from: f64,
    pub to: f64,
}

/// A class member read and written through accessor functions
#[derive(Debug)]
pub struct Field {
    pub getter: Option<Value>,
    pub setter: Option<Value>,
}

/// Storage location a reference points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefTarget {
    Stack { fiber: ObjRef, slot: usize },
    Private { module: ObjRef, index: usize },
    Upvalue(ObjRef),
    Global(ObjRef),
    Field { instance: ObjRef, name: ObjRef },
}

#[derive(Debug)]
pub struct Reference {
    pub target: RefTarget,
}

/// Host data stored in the heap
///
/// Implementors that hold [`Value`]s must report them from `trace`, or the
/// collector will free what they point at.
pub trait UserData: Any {
    fn type_name(&self) -> &str {
        "userdata"
    }

    fn trace(&self, _tracer: &mut Tracer) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub struct Userdata {
    pub data: Box<dyn UserData>,
}

impl fmt::Debug for Userdata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Userdata({})", self.data.type_name())
    }
}

#[derive(Debug)]
pub struct NativeFunction {
    pub name: ObjRef,
    pub function: NativeFn,
}

#[derive(Debug)]
pub struct NativePrimitive {
    pub name: ObjRef,
    pub function: NativePrimitiveFn,
}

#[derive(Debug)]
pub struct NativeMethod {
    pub name: ObjRef,
    pub method: NativeMethodFn,
}

#[derive(Debug)]
pub struct PrimitiveMethod {
    pub name: ObjRef,
    pub method: PrimitiveMethodFn,
}

#[derive(Debug)]
pub struct Module {
    pub name: ObjRef,
    pub main_function: Option<ObjRef>,
    pub main_fiber: Option<ObjRef>,
    pub privates: Vec<Value>,
    /// Private name -> index into `privates` (stored as a fixed number)
    pub private_names: Table,
    pub return_value: Value,
    pub ran: bool,
}

#[derive(Debug)]
pub enum Object {
    String(StringObj),
    Function(Function),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
    Array(Array),
    Map(Map),
    Range(Range),
    Field(Field),
    Reference(Reference),
    Userdata(Userdata),
    NativeFunction(NativeFunction),
    NativePrimitive(NativePrimitive),
    NativeMethod(NativeMethod),
    PrimitiveMethod(PrimitiveMethod),
    Module(Module),
    Fiber(Fiber),
}

/// Collects the handles an object refers to
#[derive(Debug, Default)]
pub struct Tracer {
    children: Vec<ObjRef>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&mut self, r: ObjRef) {
        self.children.push(r);
    }

    pub fn value(&mut self, v: Value) {
        if let Value::Object(r) = v {
            self.children.push(r);
        }
    }

    pub fn values(&mut self, values: &[Value]) {
        for v in values {
            self.value(*v);
        }
    }

    pub fn table(&mut self, table: &Table) {
        for (key, value) in table {
            self.children.push(*key);
            self.value(*value);
        }
    }

    pub(crate) fn drain(&mut self) -> std::vec::Drain<'_, ObjRef> {
        self.children.drain(..)
    }
}

const VALUE: usize = size_of::<Value>();
const ENTRY: usize = size_of::<(ObjRef, Value)>();

impl Object {
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::String(_) => "string",
            Object::Function(_) => "function",
            Object::Closure(_) => "closure",
            Object::Upvalue(_) => "upvalue",
            Object::Class(_) => "class",
            Object::Instance(_) => "instance",
            Object::BoundMethod(_) => "bound_method",
            Object::Array(_) => "array",
            Object::Map(_) => "map",
            Object::Range(_) => "range",
            Object::Field(_) => "field",
            Object::Reference(_) => "reference",
            Object::Userdata(_) => "userdata",
            Object::NativeFunction(_) => "native_function",
            Object::NativePrimitive(_) => "native_primitive",
            Object::NativeMethod(_) => "native_method",
            Object::PrimitiveMethod(_) => "primitive_method",
            Object::Module(_) => "module",
            Object::Fiber(_) => "fiber",
        }
    }

    /// Approximate bytes owned by this object, used for collection pacing
    pub fn size(&self) -> usize {
        let payload = match self {
            Object::String(s) => s.chars.len(),
            Object::Function(f) => f.chunk.code.len() + f.chunk.constants.len() * VALUE,
            Object::Closure(c) => c.upvalues.len() * size_of::<ObjRef>(),
            Object::Class(c) => (c.methods.len() + c.static_fields.len()) * ENTRY,
            Object::Instance(i) => i.fields.len() * ENTRY,
            Object::Array(a) => a.values.capacity() * VALUE,
            Object::Map(m) => m.values.len() * ENTRY,
            Object::Module(m) => m.privates.len() * VALUE + m.private_names.len() * ENTRY,
            Object::Fiber(f) => f.footprint(),
            _ => 0,
        };
        size_of::<Object>() + payload
    }

    /// Report every handle this object keeps alive
    pub fn trace(&self, tracer: &mut Tracer) {
        match self {
            Object::String(_) | Object::Range(_) => {}
            Object::Function(f) => {
                if let Some(name) = f.name {
                    tracer.object(name);
                }
                if let Some(module) = f.module {
                    tracer.object(module);
                }
                tracer.values(&f.chunk.constants);
            }
            Object::Closure(c) => {
                tracer.object(c.function);
                for up in &c.upvalues {
                    tracer.object(*up);
                }
            }
            Object::Upvalue(Upvalue::Open { fiber, .. }) => tracer.object(*fiber),
            Object::Upvalue(Upvalue::Closed(v)) => tracer.value(*v),
            Object::Class(c) => {
                tracer.object(c.name);
                if let Some(init) = c.init_method {
                    tracer.value(init);
                }
                tracer.table(&c.methods);
                tracer.table(&c.static_fields);
                if let Some(superclass) = c.superclass {
                    tracer.object(superclass);
                }
            }
            Object::Instance(i) => {
                tracer.object(i.class);
                tracer.table(&i.fields);
            }
            Object::BoundMethod(b) => {
                tracer.value(b.receiver);
                tracer.value(b.method);
            }
            Object::Array(a) => tracer.values(&a.values),
            Object::Map(m) => tracer.table(&m.values),
            Object::Field(f) => {
                if let Some(getter) = f.getter {
                    tracer.value(getter);
                }
                if let Some(setter) = f.setter {
                    tracer.value(setter);
                }
            }
            Object::Reference(r) => match r.target {
                RefTarget::Stack { fiber, .. } => tracer.object(fiber),
                RefTarget::Private { module, .. } => tracer.object(module),
                RefTarget::Upvalue(up) => tracer.object(up),
                RefTarget::Global(name) => tracer.object(name),
                RefTarget::Field { instance, name } => {
                    tracer.object(instance);
                    tracer.object(name);
                }
            },
            Object::Userdata(u) => u.data.trace(tracer),
            Object::NativeFunction(n) => tracer.object(n.name),
            Object::NativePrimitive(n) => tracer.object(n.name),
            Object::NativeMethod(n) => tracer.object(n.name),
            Object::PrimitiveMethod(n) => tracer.object(n.name),
            Object::Module(m) => {
                tracer.object(m.name);
                if let Some(main) = m.main_function {
                    tracer.object(main);
                }
                if let Some(fiber) = m.main_fiber {
                    tracer.object(fiber);
                }
                tracer.values(&m.privates);
                tracer.table(&m.private_names);
                tracer.value(m.return_value);
            }
            Object::Fiber(f) => f.trace(tracer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(u32);

    impl UserData for Counter {
        fn type_name(&self) -> &str {
            "counter"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn test_hash_is_fnv1a() {
        assert_eq!(hash_str(""), 2_166_136_261);
        assert_eq!(hash_str("a"), 0xe40c292c);
        assert_ne!(hash_str("ab"), hash_str("ba"));
    }

    #[test]
    fn test_trace_reports_children() {
        let class = ObjRef::new(1, 0);
        let key = ObjRef::new(2, 0);
        let value = ObjRef::new(3, 0);
        let mut fields = Table::new();
        fields.insert(key, Value::Object(value));
        let instance = Object::Instance(Instance { class, fields });

        let mut tracer = Tracer::new();
        instance.trace(&mut tracer);
        let mut children: Vec<ObjRef> = tracer.drain().collect();
        children.sort();
        assert_eq!(children, vec![class, key, value]);
    }

    #[test]
    fn test_closed_upvalue_traces_its_value() {
        let target = ObjRef::new(7, 1);
        let up = Object::Upvalue(Upvalue::Closed(Value::Object(target)));
        let mut tracer = Tracer::new();
        up.trace(&mut tracer);
        assert_eq!(tracer.drain().collect::<Vec<_>>(), vec![target]);
    }

    #[test]
    fn test_size_grows_with_payload() {
        let small = Object::String(StringObj::new("a"));
        let large = Object::String(StringObj::new(&"a".repeat(100)));
        assert_eq!(large.size() - small.size(), 99);
    }

    #[test]
    fn test_userdata_downcast() {
        let mut data = Userdata {
            data: Box::new(Counter(1)),
        };
        if let Some(counter) = data.data.as_any_mut().downcast_mut::<Counter>() {
            counter.0 += 1;
        }
        let counter = data.data.as_any().downcast_ref::<Counter>().map(|c| c.0);
        assert_eq!(counter, Some(2));
        assert_eq!(Object::Userdata(data).type_name(), "userdata");
    }
}
