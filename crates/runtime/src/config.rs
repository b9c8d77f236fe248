//! Virtual machine configuration
//!
//! Controls collection pacing, call-depth limits and execution tracing.
//!
//! ## Configuration (Environment Variables)
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `EMBER_GC_STRESS` | `0` | `1`/`true`: collect before every allocation |
//! | `EMBER_GC_THRESHOLD` | `262144` | Bytes allocated before the first collection |
//! | `EMBER_GC_GROW_FACTOR` | `2` | Next threshold = surviving bytes x factor |
//! | `EMBER_MAX_FRAMES` | `8192` | Call depth at which a stack overflow is raised |
//! | `EMBER_TRACE_EXECUTION` | `0` | `1`/`true`: emit a trace event per instruction |
//!
//! ## Example
//!
//! ```rust
//! use ember_runtime::VmConfig;
//!
//! let config = VmConfig::new()
//!     .with_gc_stress(true)
//!     .with_max_frames(256);
//! assert!(config.gc_stress);
//!
//! let from_file = VmConfig::from_toml_str("max_frames = 64").unwrap();
//! assert_eq!(from_file.max_frames, 64);
//! assert_eq!(from_file.gc_grow_factor, 2);
//! ```

use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_GC_THRESHOLD: usize = 256 * 1024;
pub const DEFAULT_GC_GROW_FACTOR: usize = 2;
pub const DEFAULT_MAX_FRAMES: usize = 1024 * 8;
pub const DEFAULT_INITIAL_FRAMES: usize = 128;
pub const DEFAULT_INITIAL_STACK: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Collect on every allocation (for flushing out rooting bugs)
    pub gc_stress: bool,
    /// Bytes allocated before the first collection
    pub initial_gc_threshold: usize,
    /// Multiplier applied to surviving bytes to pick the next threshold
    pub gc_grow_factor: usize,
    /// Maximum call depth of a single fiber
    pub max_frames: usize,
    /// Initial frame capacity of a new fiber
    pub initial_frames: usize,
    /// Initial value-stack capacity of a new fiber
    pub initial_stack: usize,
    /// Emit a `trace` event for every executed instruction
    pub trace_execution: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            gc_stress: false,
            initial_gc_threshold: DEFAULT_GC_THRESHOLD,
            gc_grow_factor: DEFAULT_GC_GROW_FACTOR,
            max_frames: DEFAULT_MAX_FRAMES,
            initial_frames: DEFAULT_INITIAL_FRAMES,
            initial_stack: DEFAULT_INITIAL_STACK,
            trace_execution: false,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            other => {
                warn!(variable = name, value = other, "ignoring unparseable flag");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_number(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(s) => s.trim().parse().unwrap_or_else(|_| {
            warn!(variable = name, value = %s, "ignoring unparseable number");
            default
        }),
        Err(_) => default,
    }
}

impl VmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        VmConfig {
            gc_stress: env_flag("EMBER_GC_STRESS", defaults.gc_stress),
            initial_gc_threshold: env_number("EMBER_GC_THRESHOLD", defaults.initial_gc_threshold),
            gc_grow_factor: env_number("EMBER_GC_GROW_FACTOR", defaults.gc_grow_factor).max(1),
            max_frames: env_number("EMBER_MAX_FRAMES", defaults.max_frames).max(1),
            trace_execution: env_flag("EMBER_TRACE_EXECUTION", defaults.trace_execution),
            ..defaults
        }
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    pub fn with_gc_stress(mut self, stress: bool) -> Self {
        self.gc_stress = stress;
        self
    }

    pub fn with_gc_threshold(mut self, bytes: usize) -> Self {
        self.initial_gc_threshold = bytes;
        self
    }

    pub fn with_gc_grow_factor(mut self, factor: usize) -> Self {
        self.gc_grow_factor = factor.max(1);
        self
    }

    pub fn with_max_frames(mut self, frames: usize) -> Self {
        self.max_frames = frames.max(1);
        self
    }

    pub fn with_initial_frames(mut self, frames: usize) -> Self {
        self.initial_frames = frames;
        self
    }

    pub fn with_initial_stack(mut self, slots: usize) -> Self {
        self.initial_stack = slots;
        self
    }

    pub fn with_trace_execution(mut self, trace: bool) -> Self {
        self.trace_execution = trace;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [
            "EMBER_GC_STRESS",
            "EMBER_GC_THRESHOLD",
            "EMBER_GC_GROW_FACTOR",
            "EMBER_MAX_FRAMES",
            "EMBER_TRACE_EXECUTION",
        ] {
            // SAFETY: tests touching the environment are serialized
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    fn test_default_config() {
        let config = VmConfig::default();
        assert!(!config.gc_stress);
        assert_eq!(config.initial_gc_threshold, 256 * 1024);
        assert_eq!(config.gc_grow_factor, 2);
        assert_eq!(config.max_frames, 8192);
        assert_eq!(config.initial_frames, 128);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env();
        // SAFETY: tests touching the environment are serialized
        unsafe {
            std::env::set_var("EMBER_GC_STRESS", "1");
            std::env::set_var("EMBER_GC_THRESHOLD", "4096");
            std::env::set_var("EMBER_MAX_FRAMES", "not-a-number");
        }
        let config = VmConfig::from_env();
        assert!(config.gc_stress);
        assert_eq!(config.initial_gc_threshold, 4096);
        assert_eq!(config.max_frames, DEFAULT_MAX_FRAMES);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        assert_eq!(VmConfig::from_env(), VmConfig::default());
    }

    #[test]
    fn test_from_toml() {
        let config = VmConfig::from_toml_str(
            "gc_stress = true\ninitial_gc_threshold = 1024\ntrace_execution = true\n",
        )
        .unwrap();
        assert!(config.gc_stress);
        assert!(config.trace_execution);
        assert_eq!(config.initial_gc_threshold, 1024);
        assert_eq!(config.max_frames, DEFAULT_MAX_FRAMES);
    }

    #[test]
    fn test_from_toml_rejects_bad_types() {
        assert!(VmConfig::from_toml_str("max_frames = \"lots\"").is_err());
    }

    #[test]
    fn test_builder_clamps() {
        let config = VmConfig::new().with_gc_grow_factor(0).with_max_frames(0);
        assert_eq!(config.gc_grow_factor, 1);
        assert_eq!(config.max_frames, 1);
    }
}
