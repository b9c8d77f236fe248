//! Object arena
//!
//! Objects live in a slab of slots addressed by [`ObjRef`] (index +
//! generation). Freed slots go on a free list and are reused with a bumped
//! generation, so a stale handle can never silently alias a newer object.
//!
//! The heap itself never collects: `insert` only records the allocation.
//! Deciding *when* to collect, and what the roots are, belongs to the VM
//! (see `gc.rs`). The heap provides the two halves the collector needs:
//! `mark` and `sweep`.
//!
//! String interning is a weak table keyed by hash. Entries whose string did
//! not survive a collection are dropped during the same sweep.

use crate::fiber::Fiber;
use crate::object::{
    Array, BoundMethod, Class, Closure, Field, Function, Instance, Map, Module, Object, Range,
    Reference, StringObj, Upvalue, hash_str,
};
use ember_core::{ObjRef, Value};
use std::collections::HashMap;

#[derive(Debug)]
pub struct HeapObject {
    pub(crate) marked: bool,
    pub(crate) size: usize,
    pub object: Object,
}

#[derive(Debug)]
struct Entry {
    generation: u32,
    slot: Option<HeapObject>,
}

#[derive(Debug)]
pub struct Heap {
    entries: Vec<Entry>,
    free: Vec<u32>,
    live: usize,
    bytes_allocated: usize,
    next_gc: usize,
    interned: HashMap<u32, Vec<ObjRef>>,
}

/// What one sweep released
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub objects: usize,
    pub bytes: usize,
}

macro_rules! typed_accessors {
    ($($get:ident, $get_mut:ident, $variant:ident, $ty:ty;)*) => {
        $(
            pub fn $get(&self, r: ObjRef) -> &$ty {
                match self.get(r) {
                    Object::$variant(o) => o,
                    other => panic!(
                        concat!("expected ", stringify!($variant), " at {}, found {}"),
                        r,
                        other.type_name()
                    ),
                }
            }

            pub fn $get_mut(&mut self, r: ObjRef) -> &mut $ty {
                match self.get_mut(r) {
                    Object::$variant(o) => o,
                    other => panic!(
                        concat!("expected ", stringify!($variant), " at {}, found {}"),
                        r,
                        other.type_name()
                    ),
                }
            }
        )*
    };
}

impl Heap {
    pub fn new(initial_threshold: usize) -> Self {
        Heap {
            entries: Vec::new(),
            free: Vec::new(),
            live: 0,
            bytes_allocated: 0,
            next_gc: initial_threshold,
            interned: HashMap::new(),
        }
    }

    /// Store an object and return its handle
    pub fn insert(&mut self, object: Object) -> ObjRef {
        let size = object.size();
        self.bytes_allocated += size;
        self.live += 1;
        let slot = Some(HeapObject {
            marked: false,
            size,
            object,
        });
        match self.free.pop() {
            Some(index) => {
                let entry = &mut self.entries[index as usize];
                entry.slot = slot;
                ObjRef::new(index, entry.generation)
            }
            None => {
                let index = self.entries.len() as u32;
                self.entries.push(Entry {
                    generation: 0,
                    slot,
                });
                ObjRef::new(index, 0)
            }
        }
    }

    fn entry(&self, r: ObjRef) -> Option<&HeapObject> {
        let entry = self.entries.get(r.index())?;
        if entry.generation != r.generation() {
            return None;
        }
        entry.slot.as_ref()
    }

    fn entry_mut(&mut self, r: ObjRef) -> Option<&mut HeapObject> {
        let entry = self.entries.get_mut(r.index())?;
        if entry.generation != r.generation() {
            return None;
        }
        entry.slot.as_mut()
    }

    pub fn contains(&self, r: ObjRef) -> bool {
        self.entry(r).is_some()
    }

    pub fn try_get(&self, r: ObjRef) -> Option<&Object> {
        self.entry(r).map(|e| &e.object)
    }

    /// Access a live object. A stale handle is a collector bug, not a
    /// script error.
    pub fn get(&self, r: ObjRef) -> &Object {
        match self.entry(r) {
            Some(e) => &e.object,
            None => panic!("stale object handle {}", r),
        }
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Object {
        match self.entry_mut(r) {
            Some(e) => &mut e.object,
            None => panic!("stale object handle {}", r),
        }
    }

    typed_accessors! {
        string, string_mut, String, StringObj;
        function, function_mut, Function, Function;
        closure, closure_mut, Closure, Closure;
        upvalue, upvalue_mut, Upvalue, Upvalue;
        class, class_mut, Class, Class;
        instance, instance_mut, Instance, Instance;
        bound_method, bound_method_mut, BoundMethod, BoundMethod;
        array, array_mut, Array, Array;
        map, map_mut, Map, Map;
        range, range_mut, Range, Range;
        field, field_mut, Field, Field;
        reference, reference_mut, Reference, Reference;
        module, module_mut, Module, Module;
        fiber, fiber_mut, Fiber, Fiber;
    }

    /// Contents of a string object
    pub fn str(&self, r: ObjRef) -> &str {
        self.string(r).as_str()
    }

    /// The object behind a value, if it is a live object
    pub fn object_of(&self, v: Value) -> Option<&Object> {
        v.as_object().and_then(|r| self.try_get(r))
    }

    pub fn is_string(&self, v: Value) -> bool {
        matches!(self.object_of(v), Some(Object::String(_)))
    }

    pub fn is_class(&self, v: Value) -> bool {
        matches!(self.object_of(v), Some(Object::Class(_)))
    }

    pub fn is_instance(&self, v: Value) -> bool {
        matches!(self.object_of(v), Some(Object::Instance(_)))
    }

    pub fn is_array(&self, v: Value) -> bool {
        matches!(self.object_of(v), Some(Object::Array(_)))
    }

    /// The string behind a value, if it is one
    pub fn as_str(&self, v: Value) -> Option<&str> {
        match self.object_of(v) {
            Some(Object::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Human-readable kind of any value
    pub fn type_name(&self, v: Value) -> &'static str {
        match self.object_of(v) {
            Some(object) => object.type_name(),
            None => v.primitive_type_name(),
        }
    }

    pub fn find_interned(&self, s: &str) -> Option<ObjRef> {
        let hash = hash_str(s);
        self.interned
            .get(&hash)?
            .iter()
            .copied()
            .find(|r| self.str(*r) == s)
    }

    /// Return the interned string for `s`, creating it if needed
    pub fn intern(&mut self, s: &str) -> ObjRef {
        if let Some(existing) = self.find_interned(s) {
            return existing;
        }
        let string = StringObj::new(s);
        let hash = string.hash;
        let r = self.insert(Object::String(string));
        self.interned.entry(hash).or_default().push(r);
        r
    }

    pub fn interned_count(&self) -> usize {
        self.interned.values().map(Vec::len).sum()
    }

    /// Mark an object; returns true only the first time in a cycle
    pub fn mark(&mut self, r: ObjRef) -> bool {
        match self.entry_mut(r) {
            Some(e) if !e.marked => {
                e.marked = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_marked(&self, r: ObjRef) -> bool {
        self.entry(r).is_some_and(|e| e.marked)
    }

    /// Release every unmarked object and clear the marks of survivors
    pub fn sweep(&mut self) -> SweepStats {
        let mut stats = SweepStats::default();
        let mut surviving = 0;
        for (index, entry) in self.entries.iter_mut().enumerate() {
            let keep = match entry.slot.as_mut() {
                None => continue,
                Some(object) if object.marked => {
                    object.marked = false;
                    object.size = object.object.size();
                    surviving += object.size;
                    true
                }
                Some(_) => false,
            };
            if !keep {
                if let Some(dead) = entry.slot.take() {
                    stats.objects += 1;
                    stats.bytes += dead.object.size().max(dead.size);
                }
                entry.generation = entry.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.live -= stats.objects;

        let entries = &self.entries;
        self.interned.retain(|_, refs| {
            refs.retain(|r| {
                entries
                    .get(r.index())
                    .is_some_and(|e| e.generation == r.generation() && e.slot.is_some())
            });
            !refs.is_empty()
        });

        self.bytes_allocated = surviving;
        stats
    }

    /// Account for storage an object acquired after it was inserted
    pub fn note_growth(&mut self, bytes: usize) {
        self.bytes_allocated += bytes;
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    pub fn set_next_gc(&mut self, bytes: usize) {
        self.next_gc = bytes;
    }

    pub fn live_objects(&self) -> usize {
        self.live
    }

    /// Every live object with its handle
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, &Object)> + '_ {
        self.entries.iter().enumerate().filter_map(|(index, entry)| {
            entry
                .slot
                .as_ref()
                .map(|o| (ObjRef::new(index as u32, entry.generation), &o.object))
        })
    }
}
