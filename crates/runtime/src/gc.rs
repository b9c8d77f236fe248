//! Mark-sweep collection
//!
//! Roots are the explicit root stack, the running fiber (and through its
//! parent links every suspended ancestor), the API fiber, every fiber a
//! host boundary is waiting on, the builtin classes and names, the
//! trampoline cache, globals and the module table. Everything else lives
//! only as long as something reachable refers to it.
//!
//! Marking uses an explicit gray stack, so deep object graphs cannot
//! overflow the Rust stack.

use crate::object::Tracer;
use crate::vm::Vm;
use ember_core::ObjRef;
use tracing::debug;

impl Vm {
    /// Collect if the heap is over its threshold or stress mode is on
    pub(crate) fn maybe_collect(&mut self) {
        if self.gc_pause > 0 {
            return;
        }
        if self.config.gc_stress || self.heap.bytes_allocated() > self.heap.next_gc() {
            self.collect_garbage();
        }
    }

    /// Run a full collection now; returns the bytes released
    pub fn collect_garbage(&mut self) -> usize {
        let before = self.heap.bytes_allocated();
        debug!(bytes = before, next_gc = self.heap.next_gc(), "gc begin");

        let mut gray = Vec::new();
        self.mark_roots(&mut gray);
        let mut tracer = Tracer::new();
        while let Some(r) = gray.pop() {
            self.heap.get(r).trace(&mut tracer);
            for child in tracer.drain() {
                if self.heap.mark(child) {
                    gray.push(child);
                }
            }
        }

        let stats = self.heap.sweep();
        let after = self.heap.bytes_allocated();
        let next = after.saturating_mul(self.config.gc_grow_factor);
        self.heap.set_next_gc(next);
        debug!(
            before,
            after,
            freed_objects = stats.objects,
            freed_bytes = stats.bytes,
            next_gc = next,
            "gc end"
        );
        stats.bytes
    }

    fn mark_roots(&mut self, gray: &mut Vec<ObjRef>) {
        let mut tracer = Tracer::new();
        tracer.values(&self.roots);
        if let Some(fiber) = self.fiber {
            tracer.object(fiber);
        }
        tracer.object(self.api_fiber);
        for boundary in &self.boundaries {
            tracer.object(boundary.fiber);
        }
        for class in self.classes.all() {
            tracer.object(class);
        }
        for name in self.names.all() {
            tracer.object(name);
        }
        for function in self.trampolines.values() {
            tracer.object(*function);
        }
        for object in &self.display_stack {
            tracer.object(*object);
        }
        tracer.table(&self.globals);
        tracer.table(&self.modules);

        for r in tracer.drain() {
            if self.heap.mark(r) {
                gray.push(r);
            }
        }
    }

    /// Stop collections until the matching `resume_gc`
    pub fn pause_gc(&mut self) {
        self.gc_pause += 1;
    }

    pub fn resume_gc(&mut self) {
        self.gc_pause = self.gc_pause.saturating_sub(1);
    }

    pub fn bytes_allocated(&self) -> usize {
        self.heap.bytes_allocated()
    }

    pub fn next_gc(&self) -> usize {
        self.heap.next_gc()
    }
}
