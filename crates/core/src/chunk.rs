//! Bytecode chunks
//!
//! A `Chunk` is one function's compiled body: the code bytes, a constant
//! pool, and an optional run-length-encoded line table. The engine treats a
//! chunk as read-only once it has been built.

use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Run-length-encoded mapping from code offsets to source lines
///
/// Each run records a line and how many consecutive code bytes belong to
/// it. A table built with `LineTable::disabled()` records nothing and answers
/// every query with `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineTable {
    enabled: bool,
    runs: Vec<(u32, u32)>,
}

impl LineTable {
    pub fn new() -> Self {
        LineTable {
            enabled: true,
            runs: Vec::new(),
        }
    }

    pub fn disabled() -> Self {
        LineTable {
            enabled: false,
            runs: Vec::new(),
        }
    }

    /// Rebuild a table from stored runs
    pub fn from_runs(runs: Vec<(u32, u32)>) -> Self {
        LineTable {
            enabled: true,
            runs,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn runs(&self) -> &[(u32, u32)] {
        &self.runs
    }

    /// Record that the next code byte came from `line`
    pub fn push(&mut self, line: u32) {
        if !self.enabled {
            return;
        }
        match self.runs.last_mut() {
            Some((last, count)) if *last == line => *count += 1,
            _ => self.runs.push((line, 1)),
        }
    }

    /// Source line for the byte at `offset`
    pub fn line_at(&self, offset: usize) -> Option<u32> {
        if !self.enabled {
            return None;
        }
        let mut remaining = offset;
        for &(line, count) in &self.runs {
            let count = count as usize;
            if remaining < count {
                return Some(line);
            }
            remaining -= count;
        }
        self.runs.last().map(|&(line, _)| line)
    }
}

/// A compiled function body
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    pub lines: LineTable,
}

impl Chunk {
    pub fn new() -> Self {
        Chunk {
            code: Vec::new(),
            constants: Vec::new(),
            lines: LineTable::new(),
        }
    }

    pub fn without_lines() -> Self {
        Chunk {
            code: Vec::new(),
            constants: Vec::new(),
            lines: LineTable::disabled(),
        }
    }

    pub fn write(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    /// Append a constant, returning its pool index
    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    pub fn line_at(&self, offset: usize) -> Option<u32> {
        self.lines.line_at(offset)
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    #[inline]
    pub fn read_byte(&self, offset: usize) -> u8 {
        self.code[offset]
    }

    /// Big-endian 2-byte operand at `offset`
    #[inline]
    pub fn read_short(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.code[offset], self.code[offset + 1]])
    }
}
