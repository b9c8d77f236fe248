//! Loading bytecode images and running modules
//!
//! An image is turned into heap objects with collection paused, so the
//! partially built function tree never needs rooting. The resulting module
//! is registered in the module table under its name and run on a fresh
//! fiber; a module runs at most once and afterwards answers with the value
//! its main function returned.

use crate::error::{CallFailure, InterpretResult, RuntimeError};
use crate::fiber::Fiber;
use crate::object::{Field, Function, Module, Object, Table};
use crate::vm::Vm;
use ember_core::{Chunk, Constant, FunctionImage, LineTable, ModuleImage, ObjRef, Value};
use std::path::Path;
use std::rc::Rc;
use tracing::{debug, warn};

impl Vm {
    /// Materialize `image` and register it as a module; returns the module
    pub fn load_image(&mut self, image: &ModuleImage) -> ObjRef {
        self.pause_gc();
        let name = self.intern(&image.name);
        let mut private_names = Table::new();
        for (index, private) in image.private_names.iter().enumerate() {
            let key = self.intern(private);
            private_names.insert(key, Value::fixed(index as i64));
        }
        let module = self.heap.insert(Object::Module(Module {
            name,
            main_function: None,
            main_fiber: None,
            privates: vec![Value::Null; image.private_names.len()],
            private_names,
            return_value: Value::Null,
            ran: false,
        }));
        let mut functions = 0;
        let main = self.load_function(&image.main, module, &mut functions);
        self.heap.module_mut(module).main_function = Some(main);
        self.modules.insert(name, Value::Object(module));
        self.resume_gc();

        debug!(
            module = %image.name,
            functions,
            privates = image.private_names.len(),
            "loaded module image"
        );
        module
    }

    fn load_function(&mut self, image: &FunctionImage, module: ObjRef, count: &mut usize) -> ObjRef {
        *count += 1;
        let mut constants = Vec::with_capacity(image.constants.len());
        for constant in &image.constants {
            constants.push(match constant {
                Constant::Null => Value::Null,
                Constant::Bool(b) => Value::Bool(*b),
                Constant::Fixed(n) => Value::fixed(*n),
                Constant::Float(f) => Value::float(*f),
                Constant::String(s) => self.new_string(s),
                Constant::Function(f) => Value::Object(self.load_function(f, module, count)),
                Constant::Field { getter, setter } => {
                    let mut accessor = |image: &Option<Box<FunctionImage>>| {
                        image
                            .as_deref()
                            .map(|f| Value::Object(self.load_function(f, module, count)))
                    };
                    let getter = accessor(getter);
                    let setter = accessor(setter);
                    Value::Object(self.heap.insert(Object::Field(Field { getter, setter })))
                }
            });
        }
        let lines = match &image.lines {
            Some(runs) => LineTable::from_runs(runs.clone()),
            None => LineTable::disabled(),
        };
        let chunk = Chunk {
            code: image.code.clone(),
            constants,
            lines,
        };
        let name = image.name.as_deref().map(|name| self.intern(name));
        self.heap.insert(Object::Function(Function {
            name,
            chunk: Rc::new(chunk),
            arity: image.arity,
            upvalue_count: image.upvalue_count,
            max_slots: image.max_slots,
            vararg: image.vararg,
            module: Some(module),
            synthetic: false,
        }))
    }

    /// Run a module's main function on its own fiber
    pub fn interpret_module(&mut self, module: ObjRef) -> InterpretResult {
        self.run_guarded(|vm| {
            let (ran, return_value, main) = {
                let m = vm.heap.module(module);
                (m.ran, m.return_value, m.main_function)
            };
            if ran {
                return Ok(return_value);
            }
            let main = main.ok_or(CallFailure::Invalid)?;

            let depth = vm.roots.len();
            vm.push_root(Value::Object(module));
            let fiber = vm.alloc(Object::Fiber(Fiber::new(
                Some(module),
                Some(Value::Object(main)),
                vm.config.initial_stack,
                vm.config.initial_frames,
            )));
            vm.heap.module_mut(module).main_fiber = Some(fiber);
            vm.heap.fiber_mut(fiber).push(Value::Object(main));

            let previous = vm.fiber;
            vm.fiber = Some(fiber);
            let result = match vm.call_callable(main, None, 0) {
                Ok(_) => vm.run_boundary(fiber, 0, 0),
                Err(err) => Err(err),
            };
            vm.fiber = previous;
            vm.roots.truncate(depth);

            let value = result?;
            let m = vm.heap.module_mut(module);
            m.ran = true;
            m.return_value = value;
            Ok(value)
        })
    }

    /// Load and run an image
    pub fn interpret_image(&mut self, image: &ModuleImage) -> InterpretResult {
        let module = self.load_image(image);
        self.interpret_module(module)
    }

    /// Decode, load and run a serialized image
    pub fn interpret_bytes(&mut self, bytes: &[u8]) -> InterpretResult {
        match ModuleImage::from_bytes(bytes) {
            Ok(image) => self.interpret_image(&image),
            Err(err) => {
                debug!(error = %err, "rejected bytecode image");
                self.last_error = Some(RuntimeError::new(err.to_string()));
                InterpretResult::CompileError
            }
        }
    }

    /// Read, load and run an image file
    pub fn interpret_file(&mut self, path: impl AsRef<Path>) -> InterpretResult {
        let path = path.as_ref();
        match std::fs::read(path) {
            Ok(bytes) => self.interpret_bytes(&bytes),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot read bytecode image");
                self.last_error = Some(RuntimeError::new(format!(
                    "cannot read '{}': {}",
                    path.display(),
                    err
                )));
                InterpretResult::CompileError
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{FunctionBuilder, OpCode};

    #[test]
    fn test_load_registers_module() {
        let mut vm = Vm::new();
        let mut main = FunctionBuilder::new("main");
        main.string("hello").op(OpCode::Return);
        let image = main.finish_module("greeting", &["a", "b"]).unwrap();

        let module = vm.load_image(&image);
        assert_eq!(vm.module("greeting"), Some(module));
        let m = vm.heap.module(module);
        assert_eq!(m.privates.len(), 2);
        assert!(!m.ran);
        let b = vm.heap.find_interned("b").unwrap();
        assert_eq!(vm.heap.module(module).private_names.get(&b), Some(&Value::fixed(1)));
    }

    #[test]
    fn test_module_runs_once() {
        let mut vm = Vm::new();
        let mut main = FunctionBuilder::new("main");
        main.get_global("counter")
            .fixed(1)
            .op(OpCode::Add)
            .set_global("counter")
            .op(OpCode::Return);
        let image = main.finish_module("once", &[]).unwrap();
        vm.set_global("counter", Value::fixed(0));

        let module = vm.load_image(&image);
        assert_eq!(vm.interpret_module(module), InterpretResult::Ok(Value::fixed(1)));
        assert_eq!(vm.interpret_module(module), InterpretResult::Ok(Value::fixed(1)));
        assert_eq!(vm.get_global("counter"), Some(Value::fixed(1)));
    }

    #[test]
    fn test_nested_functions_share_module() {
        let mut vm = Vm::new();
        let mut inner = FunctionBuilder::new("inner");
        inner.fixed(7).op(OpCode::Return);
        let mut main = FunctionBuilder::new("main");
        main.closure(inner.finish().unwrap(), &[]).call(0).op(OpCode::Return);
        let image = main.finish_module("nested", &[]).unwrap();
        assert_eq!(vm.interpret_image(&image), InterpretResult::Ok(Value::fixed(7)));
    }

    #[test]
    fn test_bad_bytes_are_a_compile_error() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret_bytes(&[1, 2, 3]), InterpretResult::CompileError);
        assert!(vm.last_error().is_some());
    }
}
