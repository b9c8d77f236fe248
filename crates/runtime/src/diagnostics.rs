//! Runtime diagnostics for embedders
//!
//! [`Vm::snapshot`] captures heap and execution statistics as a
//! serializable [`VmSnapshot`]; [`dump_diagnostics`] writes the same data as
//! a human-readable report, e.g. to stderr:
//!
//! ```rust
//! use ember_runtime::{Vm, dump_diagnostics};
//!
//! let vm = Vm::new();
//! let mut out = Vec::new();
//! dump_diagnostics(&vm, &mut out).unwrap();
//! assert!(String::from_utf8(out).unwrap().contains("[Heap]"));
//! ```
//!
//! With the `report-json` feature, `VmSnapshot::to_json` renders the
//! snapshot for log shippers.

use crate::object::{Object, Table};
use crate::vm::Vm;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Write};

/// Maximum number of globals listed in a report
const GLOBAL_DISPLAY_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmSnapshot {
    pub bytes_allocated: usize,
    pub next_gc: usize,
    pub live_objects: usize,
    /// Live objects per kind, keyed by type name
    pub objects_by_kind: BTreeMap<String, usize>,
    pub fibers: usize,
    /// Frames on the running fiber (0 when idle)
    pub frame_depth: usize,
    pub root_depth: usize,
    pub globals: Vec<String>,
    pub modules: Vec<String>,
}

impl Vm {
    pub fn snapshot(&self) -> VmSnapshot {
        let mut objects_by_kind = BTreeMap::new();
        let mut fibers = 0;
        for (_, object) in self.heap.iter() {
            *objects_by_kind
                .entry(object.type_name().to_string())
                .or_insert(0) += 1;
            if matches!(object, Object::Fiber(_)) {
                fibers += 1;
            }
        }
        let frame_depth = self
            .fiber
            .map(|f| self.heap.fiber(f).frames.len())
            .unwrap_or(0);
        let names = |table: &Table| {
            let mut names: Vec<String> = table
                .keys()
                .map(|key| self.heap.str(*key).to_string())
                .collect();
            names.sort();
            names
        };
        VmSnapshot {
            bytes_allocated: self.heap.bytes_allocated(),
            next_gc: self.heap.next_gc(),
            live_objects: self.heap.live_objects(),
            objects_by_kind,
            fibers,
            frame_depth,
            root_depth: self.roots.len(),
            globals: names(&self.globals),
            modules: names(&self.modules),
        }
    }
}

impl VmSnapshot {
    #[cfg(feature = "report-json")]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Write a human-readable diagnostics report
pub fn dump_diagnostics<W: Write>(vm: &Vm, mut out: W) -> io::Result<()> {
    let snapshot = vm.snapshot();

    writeln!(out, "=== Ember VM Diagnostics ===")?;

    writeln!(out, "\n[Heap]")?;
    writeln!(out, "  Allocated:    {}", format_bytes(snapshot.bytes_allocated))?;
    writeln!(out, "  Next GC at:   {}", format_bytes(snapshot.next_gc))?;
    writeln!(out, "  Live objects: {}", snapshot.live_objects)?;
    for (kind, count) in &snapshot.objects_by_kind {
        writeln!(out, "    {:20} {}", kind, count)?;
    }

    writeln!(out, "\n[Execution]")?;
    writeln!(out, "  Fibers:       {}", snapshot.fibers)?;
    writeln!(out, "  Frame depth:  {}", snapshot.frame_depth)?;
    writeln!(out, "  Root stack:   {}", snapshot.root_depth)?;
    if let Some(err) = vm.last_error() {
        writeln!(out, "  Last error:   {}", err.message)?;
    }

    writeln!(out, "\n[Globals]")?;
    for name in snapshot.globals.iter().take(GLOBAL_DISPLAY_LIMIT) {
        writeln!(out, "  {}", name)?;
    }
    if snapshot.globals.len() > GLOBAL_DISPLAY_LIMIT {
        writeln!(
            out,
            "  ... and {} more",
            snapshot.globals.len() - GLOBAL_DISPLAY_LIMIT
        )?;
    }

    writeln!(out, "\n[Modules]")?;
    if snapshot.modules.is_empty() {
        writeln!(out, "  (no modules loaded)")?;
    }
    for name in &snapshot.modules {
        writeln!(out, "  {}", name)?;
    }

    writeln!(out, "\n=== End Diagnostics ===")?;
    Ok(())
}

/// Format bytes as a human-readable string
fn format_bytes(bytes: usize) -> String {
    let bytes = bytes as f64;
    if bytes >= 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else if bytes >= 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}
