//! The virtual machine context
//!
//! `Vm` owns everything: the heap, globals, the module table, the root
//! stack, the builtin classes and the current fiber. Every operation takes
//! it explicitly; there is no ambient global state.
//!
//! # Rooting
//!
//! Any allocation may collect. A value that is only held in a Rust local
//! across an allocation must be protected first, either by putting it on a
//! fiber stack or with [`Vm::push_root`] / [`Vm::with_root`].

use crate::config::VmConfig;
use crate::error::{NativeResult, RuntimeError};
use crate::fiber::Fiber;
use crate::heap::Heap;
use crate::object::{Array, Class, Instance, Map, Object, Table, UserData, Userdata};
use crate::{core_lib, fiber_lib, gc_lib};
use ember_core::{ObjRef, Value};
use std::collections::HashMap;

/// Builtin classes created at startup
#[derive(Debug, Clone, Copy)]
pub struct CoreClasses {
    pub class: ObjRef,
    pub object: ObjRef,
    pub number: ObjRef,
    pub string: ObjRef,
    pub bool: ObjRef,
    pub function: ObjRef,
    pub module: ObjRef,
    pub array: ObjRef,
    pub map: ObjRef,
    pub range: ObjRef,
    pub fiber: ObjRef,
    pub gc: ObjRef,
}

impl CoreClasses {
    pub(crate) fn all(&self) -> [ObjRef; 12] {
        [
            self.class,
            self.object,
            self.number,
            self.string,
            self.bool,
            self.function,
            self.module,
            self.array,
            self.map,
            self.range,
            self.fiber,
            self.gc,
        ]
    }
}

/// Interned names the dispatcher looks up on hot paths
#[derive(Debug, Clone, Copy)]
pub(crate) struct Names {
    pub(crate) constructor: ObjRef,
    pub(crate) to_string: ObjRef,
    pub(crate) equal: ObjRef,
    pub(crate) not: ObjRef,
    pub(crate) subscript: ObjRef,
}

impl Names {
    pub(crate) fn all(&self) -> [ObjRef; 5] {
        [
            self.constructor,
            self.to_string,
            self.equal,
            self.not,
            self.subscript,
        ]
    }
}

/// A point where native code entered the interpreter
///
/// Errors that no catcher handles unwind the boundary's fiber back to these
/// marks and surface to whoever opened it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Boundary {
    pub(crate) fiber: ObjRef,
    pub(crate) stack: usize,
    pub(crate) frames: usize,
}

/// Shape of a generated host-call entry function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Trampoline {
    Call(u8),
    Invoke(u8, ObjRef),
}

pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) config: VmConfig,
    /// The fiber currently executing, if any
    pub(crate) fiber: Option<ObjRef>,
    /// Stack used by host calls made while nothing is running
    pub(crate) api_fiber: ObjRef,
    pub(crate) globals: Table,
    pub(crate) modules: Table,
    pub(crate) roots: Vec<Value>,
    pub(crate) classes: CoreClasses,
    pub(crate) names: Names,
    pub(crate) boundaries: Vec<Boundary>,
    pub(crate) trampolines: HashMap<Trampoline, ObjRef>,
    pub(crate) gc_pause: usize,
    /// Containers being converted to strings, for cycle detection
    pub(crate) display_stack: Vec<ObjRef>,
    pub(crate) last_error: Option<RuntimeError>,
}

fn bootstrap_class(heap: &mut Heap, name: &str) -> ObjRef {
    let name = heap.intern(name);
    heap.insert(Object::Class(Class::new(name)))
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        let mut heap = Heap::new(config.initial_gc_threshold);
        let names = Names {
            constructor: heap.intern("constructor"),
            to_string: heap.intern("toString"),
            equal: heap.intern("=="),
            not: heap.intern("!"),
            subscript: heap.intern("[]"),
        };
        let classes = CoreClasses {
            class: bootstrap_class(&mut heap, "Class"),
            object: bootstrap_class(&mut heap, "Object"),
            number: bootstrap_class(&mut heap, "Number"),
            string: bootstrap_class(&mut heap, "String"),
            bool: bootstrap_class(&mut heap, "Bool"),
            function: bootstrap_class(&mut heap, "Function"),
            module: bootstrap_class(&mut heap, "Module"),
            array: bootstrap_class(&mut heap, "Array"),
            map: bootstrap_class(&mut heap, "Map"),
            range: bootstrap_class(&mut heap, "Range"),
            fiber: bootstrap_class(&mut heap, "Fiber"),
            gc: bootstrap_class(&mut heap, "GC"),
        };
        let api_fiber = heap.insert(Object::Fiber(Fiber::new(
            None,
            None,
            config.initial_stack,
            config.initial_frames,
        )));

        let mut vm = Vm {
            heap,
            config,
            fiber: None,
            api_fiber,
            globals: Table::new(),
            modules: Table::new(),
            roots: Vec::new(),
            classes,
            names,
            boundaries: Vec::new(),
            trampolines: HashMap::new(),
            gc_pause: 1,
            display_stack: Vec::new(),
            last_error: None,
        };
        core_lib::open(&mut vm);
        fiber_lib::open(&mut vm);
        gc_lib::open(&mut vm);
        vm.gc_pause = 0;
        vm
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Read access to the object arena
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn classes(&self) -> &CoreClasses {
        &self.classes
    }

    /// The fiber currently executing, if any
    pub fn current_fiber(&self) -> Option<ObjRef> {
        self.fiber
    }

    /// The last error that escaped to the host, with its traceback
    pub fn last_error(&self) -> Option<&RuntimeError> {
        self.last_error.as_ref()
    }

    pub(crate) fn running_fiber(&self) -> NativeResult<ObjRef> {
        self.fiber
            .ok_or_else(|| RuntimeError::new("no fiber is currently running"))
    }

    /// Store a new object, collecting first if the heap is over budget
    pub(crate) fn alloc(&mut self, object: Object) -> ObjRef {
        self.maybe_collect();
        self.heap.insert(object)
    }

    /// Intern a string, allocating it if it does not exist yet
    pub fn intern(&mut self, s: &str) -> ObjRef {
        if let Some(existing) = self.heap.find_interned(s) {
            return existing;
        }
        self.maybe_collect();
        self.heap.intern(s)
    }

    pub fn new_string(&mut self, s: &str) -> Value {
        Value::Object(self.intern(s))
    }

    /// Contents of a string value
    pub fn str_value(&self, value: Value) -> Option<&str> {
        self.heap.as_str(value)
    }

    pub fn type_name(&self, value: Value) -> &'static str {
        self.heap.type_name(value)
    }

    pub fn make_array(&mut self, values: Vec<Value>) -> Value {
        let mark = self.roots.len();
        self.roots.extend_from_slice(&values);
        let array = self.alloc(Object::Array(Array { values }));
        self.roots.truncate(mark);
        Value::Object(array)
    }

    pub fn make_map(&mut self) -> Value {
        Value::Object(self.alloc(Object::Map(Map::default())))
    }

    /// A class inheriting from `Object`. The result is not rooted.
    pub fn make_class(&mut self, name: &str) -> ObjRef {
        let name = self.intern(name);
        self.push_root(Value::Object(name));
        let class = self.alloc(Object::Class(Class::new(name)));
        self.pop_root();
        let object = self.classes.object;
        self.inherit(class, object);
        class
    }

    /// A class inheriting from `Object`, bound as a global of the same name
    pub fn define_class(&mut self, name: &str) -> ObjRef {
        let class = self.make_class(name);
        let key = self.heap.class(class).name;
        self.globals.insert(key, Value::Object(class));
        class
    }

    /// A bare instance of `class`; its constructor is not run
    pub fn make_instance(&mut self, class: ObjRef) -> Value {
        Value::Object(self.alloc(Object::Instance(Instance {
            class,
            fields: Table::new(),
        })))
    }

    pub fn make_userdata<T: UserData>(&mut self, data: T) -> Value {
        Value::Object(self.alloc(Object::Userdata(Userdata {
            data: Box::new(data),
        })))
    }

    pub fn userdata<T: UserData>(&self, value: Value) -> Option<&T> {
        match self.heap.object_of(value)? {
            Object::Userdata(u) => u.data.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn userdata_mut<T: UserData>(&mut self, value: Value) -> Option<&mut T> {
        let r = value.as_object()?;
        if !self.heap.contains(r) {
            return None;
        }
        match self.heap.get_mut(r) {
            Object::Userdata(u) => u.data.as_any_mut().downcast_mut::<T>(),
            _ => None,
        }
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.push_root(value);
        let key = self.intern(name);
        self.pop_root();
        self.globals.insert(key, value);
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        let key = self.heap.find_interned(name)?;
        self.globals.get(&key).copied()
    }

    /// Registered module by name
    pub fn module(&self, name: &str) -> Option<ObjRef> {
        let key = self.heap.find_interned(name)?;
        self.modules.get(&key).and_then(|v| v.as_object())
    }

    pub fn push_root(&mut self, value: Value) {
        self.roots.push(value);
    }

    pub fn pop_root(&mut self) -> Option<Value> {
        self.roots.pop()
    }

    pub fn root_depth(&self) -> usize {
        self.roots.len()
    }

    /// Keep `value` alive for the duration of `f`
    pub fn with_root<T>(&mut self, value: Value, f: impl FnOnce(&mut Vm) -> T) -> T {
        let depth = self.roots.len();
        self.roots.push(value);
        let result = f(self);
        self.roots.truncate(depth);
        result
    }

    /// Class that provides methods for `value`; null has none
    pub fn class_of(&self, value: Value) -> Option<ObjRef> {
        let c = &self.classes;
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(c.bool),
            Value::Number(_) => Some(c.number),
            Value::Object(r) => Some(match self.heap.try_get(r)? {
                Object::String(_) => c.string,
                Object::Function(_)
                | Object::Closure(_)
                | Object::BoundMethod(_)
                | Object::NativeFunction(_)
                | Object::NativePrimitive(_)
                | Object::NativeMethod(_)
                | Object::PrimitiveMethod(_) => c.function,
                Object::Class(_) => c.class,
                Object::Instance(i) => i.class,
                Object::Array(_) => c.array,
                Object::Map(_) => c.map,
                Object::Range(_) => c.range,
                Object::Module(_) => c.module,
                Object::Fiber(_) => c.fiber,
                _ => c.object,
            }),
        }
    }

    /// Method `name` as seen by an invoke on `receiver`
    pub(crate) fn find_method(&self, receiver: Value, name: ObjRef) -> Option<Value> {
        match self.heap.object_of(receiver) {
            Some(Object::Class(c)) => return c.static_fields.get(&name).copied(),
            Some(Object::Instance(i)) => {
                if let Some(field) = i.fields.get(&name) {
                    return Some(*field);
                }
            }
            _ => {}
        }
        let class = self.class_of(receiver)?;
        self.heap.class(class).methods.get(&name).copied()
    }

    /// Copy `superclass`'s tables into `class` and link them
    pub(crate) fn inherit(&mut self, class: ObjRef, superclass: ObjRef) {
        let (methods, statics, init) = {
            let parent = self.heap.class(superclass);
            (
                parent.methods.clone(),
                parent.static_fields.clone(),
                parent.init_method,
            )
        };
        let target = self.heap.class_mut(class);
        target.superclass = Some(superclass);
        target.init_method = init;
        target.methods.extend(methods);
        target.static_fields.extend(statics);
    }

    pub(crate) fn class_name(&self, class: ObjRef) -> &str {
        self.heap.str(self.heap.class(class).name)
    }

    /// Name of the class of `value`, for error messages
    pub(crate) fn class_name_of(&self, value: Value) -> &str {
        match self.class_of(value) {
            Some(class) => self.class_name(class),
            None => "null",
        }
    }

    /// Name of a callable, if it has one
    pub fn function_name(&self, value: Value) -> Option<&str> {
        let name = match self.heap.object_of(value)? {
            Object::Function(f) => f.name?,
            Object::Closure(c) => self.heap.function(c.function).name?,
            Object::NativeFunction(n) => n.name,
            Object::NativePrimitive(n) => n.name,
            Object::NativeMethod(n) => n.name,
            Object::PrimitiveMethod(n) => n.name,
            Object::BoundMethod(b) => return self.function_name(b.method),
            Object::String(s) => return Some(s.as_str()),
            _ => return None,
        };
        Some(self.heap.str(name))
    }
}
