//! Runtime Error Handling
//!
//! Script failures travel as values of [`RuntimeError`]: every native
//! returns a [`NativeResult`], and the interpreter routes an `Err` to the
//! nearest fiber that registered itself as a catcher. Errors that escape
//! every catcher surface to the host as an [`InterpretResult`].
//!
//! # Usage
//!
//! Natives report failures with `Err` and propagate nested failures with `?`:
//! ```ignore
//! fn divide(vm: &mut Vm, args: &[Value]) -> NativeResult<Value> {
//!     let n = expect_number(args, 0, "divide")?;
//!     let result = vm.invoke(callback, &[Value::from(n)])?;
//!     Ok(result)
//! }
//! ```
//!
//! Panics never cross the public API: every entry point runs behind a single
//! `catch_unwind` boundary, and [`format_panic_payload`] turns the payload
//! into the message of the resulting error.

use ember_core::Value;
use std::fmt;

/// A script-level failure with its traceback, innermost frame first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub message: String,
    pub traceback: Vec<String>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        RuntimeError {
            message: message.into(),
            traceback: Vec::new(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for line in &self.traceback {
            write!(f, "\n{}", line)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Result type for native functions and methods
pub type NativeResult<T> = Result<T, RuntimeError>;

/// Status of a host-level interpretation attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InterpretResult {
    /// Execution finished with this value
    Ok(Value),
    /// An uncaught runtime error; the value is the message string
    RuntimeError(Value),
    /// No bytecode could be produced or decoded
    CompileError,
    /// Nothing could run: no fiber and no catcher
    Invalid,
}

impl InterpretResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, InterpretResult::Ok(_))
    }

    /// The value carried by `Ok` or `RuntimeError`
    pub fn value(&self) -> Option<Value> {
        match self {
            InterpretResult::Ok(v) | InterpretResult::RuntimeError(v) => Some(*v),
            _ => None,
        }
    }
}

/// Why a host-level call could not produce a value
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CallFailure {
    Runtime(RuntimeError),
    Invalid,
}

impl From<RuntimeError> for CallFailure {
    fn from(e: RuntimeError) -> Self {
        CallFailure::Runtime(e)
    }
}

impl CallFailure {
    /// Collapse into a runtime error for callers that cannot express `Invalid`
    pub(crate) fn into_runtime(self) -> RuntimeError {
        match self {
            CallFailure::Runtime(e) => e,
            CallFailure::Invalid => RuntimeError::new("no fiber is available to run the call"),
        }
    }
}

/// Format a panic payload into an error message
pub fn format_panic_payload(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
