//! The dispatch loop and error routing
//!
//! `execute` runs until a frame marked `return_to_host` returns or a fiber
//! with no parent finishes. The hot state (chunk, ip, base, closure) is
//! cached in an [`ExecState`] and written back to the frame before anything
//! that can observe it: calls, fiber switches and errors. Any operation
//! that pushes or pops a frame or switches fibers answers
//! [`Flow::Reload`] and the cache is rebuilt from the heap.
//!
//! Errors are values. A failing operation returns `Err`, and
//! [`Vm::route_error`] walks the fiber chain from the current fiber
//! outwards: the first fiber started with `try` catches the message; if
//! none does, the innermost host boundary is unwound and the error is
//! returned to the native caller that opened it.

use crate::disassembler::disassemble_instruction;
use crate::error::{NativeResult, RuntimeError};
use crate::vm::{Boundary, Vm};
use ember_core::{Chunk, ObjRef, OpCode, Value};
use std::rc::Rc;
use tracing::{debug, trace};

/// Cached view of the executing frame
pub(crate) struct ExecState {
    pub(crate) fiber: ObjRef,
    pub(crate) chunk: Rc<Chunk>,
    pub(crate) ip: usize,
    pub(crate) base: usize,
    pub(crate) closure: Option<ObjRef>,
    pub(crate) module: Option<ObjRef>,
    /// Extra arguments spliced in by `VarArg` for the next call
    pub(crate) pending_varargs: isize,
}

impl ExecState {
    /// Next code byte; running off the end reads an invalid opcode
    #[inline]
    pub(crate) fn fetch(&mut self) -> u8 {
        let byte = self.chunk.code.get(self.ip).copied().unwrap_or(u8::MAX);
        self.ip += 1;
        byte
    }

    #[inline]
    pub(crate) fn fetch_short(&mut self) -> u16 {
        let hi = self.fetch();
        let lo = self.fetch();
        u16::from_be_bytes([hi, lo])
    }

    pub(crate) fn constant(&self, index: usize) -> Value {
        self.chunk.constants.get(index).copied().unwrap_or_default()
    }

    /// Argument count of a call, including spliced var-args
    pub(crate) fn take_argc(&mut self, encoded: u8) -> usize {
        let argc = encoded as isize + self.pending_varargs;
        self.pending_varargs = 0;
        argc.max(0) as usize
    }
}

/// What the loop does after an instruction
pub(crate) enum Flow {
    Continue,
    Reload,
    Finish(Value),
}

impl Vm {
    pub(crate) fn load_state(&self) -> NativeResult<ExecState> {
        let fiber = self.running_fiber()?;
        let f = self.heap.fiber(fiber);
        let frame = f
            .top_frame()
            .ok_or_else(|| RuntimeError::new("fiber has no frame to execute"))?;
        let function = self.heap.function(frame.function);
        Ok(ExecState {
            fiber,
            chunk: Rc::clone(&function.chunk),
            ip: frame.ip,
            base: frame.base,
            closure: frame.closure,
            module: function.module.or(f.module),
            pending_varargs: 0,
        })
    }

    pub(crate) fn save_ip(&mut self, state: &ExecState) {
        if let Some(frame) = self.heap.fiber_mut(state.fiber).top_frame_mut() {
            frame.ip = state.ip;
        }
    }

    fn execute(&mut self) -> NativeResult<Value> {
        let mut state = self.load_state()?;
        loop {
            let offset = state.ip;
            let byte = state.fetch();
            let step = match OpCode::try_from(byte) {
                Ok(op) => {
                    if self.config.trace_execution {
                        self.trace_instruction(&state, offset);
                    }
                    self.dispatch(&mut state, op)
                }
                Err(_) => Err(RuntimeError::new("unknown op code")),
            };
            match step {
                Ok(Flow::Continue) => {}
                Ok(Flow::Reload) => state = self.load_state()?,
                Ok(Flow::Finish(value)) => return Ok(value),
                Err(err) => {
                    self.save_ip(&state);
                    self.route_error(err)?;
                    state = self.load_state()?;
                }
            }
        }
    }

    fn trace_instruction(&self, state: &ExecState, offset: usize) {
        let mut text = String::new();
        disassemble_instruction(self, &state.chunk, offset, &mut text);
        let top = self.heap.fiber(state.fiber).peek(0);
        trace!(
            fiber = %state.fiber,
            depth = self.heap.fiber(state.fiber).frames.len(),
            top = %self.describe(top),
            "{}",
            text.trim_end()
        );
    }

    /// Run `fiber` until the frame at `frame_mark` hands back a result
    ///
    /// The fiber is always unwound to the marks afterwards, so a failed run
    /// leaves nothing behind on its stack.
    pub(crate) fn run_boundary(
        &mut self,
        fiber: ObjRef,
        stack_mark: usize,
        frame_mark: usize,
    ) -> NativeResult<Value> {
        self.boundaries.push(Boundary {
            fiber,
            stack: stack_mark,
            frames: frame_mark,
        });
        self.heap.fiber_mut(fiber).abort = false;
        self.fiber = Some(fiber);
        let result = self.execute();
        self.unwind_fiber(fiber, stack_mark, frame_mark);
        self.boundaries.pop();
        result
    }

    pub(crate) fn unwind_fiber(&mut self, fiber: ObjRef, stack_mark: usize, frame_mark: usize) {
        self.close_upvalues(fiber, stack_mark);
        let f = self.heap.fiber_mut(fiber);
        f.frames.truncate(frame_mark);
        f.stack.truncate(stack_mark);
    }

    /// Deliver an error to the nearest catcher, or unwind to the innermost
    /// host boundary and hand it back
    pub(crate) fn route_error(&mut self, mut err: RuntimeError) -> Result<(), RuntimeError> {
        let boundary = match self.boundaries.last() {
            Some(boundary) => *boundary,
            None => return Err(err),
        };
        let message = self.new_string(&err.message);
        let depth = self.roots.len();
        self.roots.push(message);

        let mut fiber = self.fiber.unwrap_or(boundary.fiber);
        let outcome = loop {
            if fiber == boundary.fiber {
                self.append_traceback(&mut err, fiber, boundary.frames);
                self.unwind_fiber(fiber, boundary.stack, boundary.frames);
                if boundary.frames == 0 {
                    let full = self.new_string(&err.to_string());
                    let f = self.heap.fiber_mut(fiber);
                    f.abort = true;
                    f.error = full;
                }
                self.fiber = Some(fiber);
                debug!(error = %err.message, depth = boundary.frames, "error reached host boundary");
                break Err(err);
            }

            self.append_traceback(&mut err, fiber, 0);
            self.close_upvalues(fiber, 0);
            let f = self.heap.fiber_mut(fiber);
            f.error = message;
            f.abort = true;
            let catcher = f.catcher;
            let parent = f.parent.take();
            match parent {
                Some(parent) if catcher => {
                    self.heap.fiber_mut(parent).set_top(message);
                    self.fiber = Some(parent);
                    debug!(error = %err.message, "error caught by fiber");
                    break Ok(());
                }
                Some(parent) => fiber = parent,
                None => fiber = boundary.fiber,
            }
        };
        self.roots.truncate(depth);
        outcome
    }

    /// One line per frame above `floor`, innermost first
    fn append_traceback(&self, err: &mut RuntimeError, fiber: ObjRef, floor: usize) {
        let frames = &self.heap.fiber(fiber).frames;
        for frame in frames.iter().skip(floor).rev() {
            let function = self.heap.function(frame.function);
            if function.synthetic {
                continue;
            }
            let name = match function.name {
                Some(name) => self.heap.str(name),
                None => "unknown",
            };
            match function.chunk.line_at(frame.ip.saturating_sub(1)) {
                Some(line) => err.traceback.push(format!("[line {}] in {}()", line, name)),
                None => err.traceback.push(format!("\tin {}()", name)),
            }
        }
    }
}
