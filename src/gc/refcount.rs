//! The reference-counting path: the common case for acyclic objects.
//!
//! Counts live in the packed `refcount|size` header word and move through
//! lock-free CAS. A zero crossing on an acyclic object walks its children
//! and frees immediately; maybe-cyclic objects are parked on a bounded
//! deferred queue for the tracing path, falling back to immediate cleanup
//! when the queue is full.

use atomic::Ordering;

use crate::gc::trace::for_each_child;
use crate::gc::GcManager;
use crate::header::GcHeader;
use crate::value::Value;

/// A buffered reference operation. The interpreter's optimizer batches
/// these and flushes in order, so a delayed increment can never be
/// overtaken by its matching decrement.
#[derive(Debug, Clone, Copy)]
pub enum RefOp {
    Inc(usize),
    Dec(usize),
}

impl GcManager {
    /// `on_object_referenced`: a new slot now holds this object.
    #[inline]
    pub fn inc_ref(&self, header: *mut GcHeader) {
        if header.is_null() {
            return;
        }
        unsafe {
            (*header).inc_ref();
        }
    }

    /// `on_object_dereferenced`: a slot stopped holding this object. The
    /// caller that drives the count to zero owns the cleanup.
    #[inline]
    pub fn dec_ref(&self, header: *mut GcHeader) {
        if header.is_null() {
            return;
        }
        let remaining = unsafe { (*header).dec_ref() };
        if remaining == 0 {
            self.handle_zero(header);
        }
    }

    /// Façade aliases for the event hooks the interpreter emits.
    #[inline]
    pub fn on_object_referenced(&self, header: *mut GcHeader) {
        self.inc_ref(header);
    }

    #[inline]
    pub fn on_object_dereferenced(&self, header: *mut GcHeader) {
        self.dec_ref(header);
    }

    /// Value-level hooks; inline values are no-ops.
    #[inline]
    pub fn retain_value(&self, value: Value) {
        if value.is_gc_managed() {
            self.inc_ref(value.object_ptr());
        }
    }

    #[inline]
    pub fn release_value(&self, value: Value) {
        if value.is_gc_managed() {
            self.dec_ref(value.object_ptr());
        }
    }

    /// Assignment discipline in one place: decrement the old target,
    /// increment the new one, store.
    #[inline]
    pub fn write_value(&self, slot: &mut Value, new: Value) {
        let old = *slot;
        self.retain_value(new);
        *slot = new;
        self.release_value(old);
    }

    /// Apply a buffered operation.
    #[inline]
    pub fn apply_ref_op(&self, op: RefOp) {
        match op {
            RefOp::Inc(addr) => self.inc_ref(addr as *mut GcHeader),
            RefOp::Dec(addr) => self.dec_ref(addr as *mut GcHeader),
        }
    }

    fn handle_zero(&self, header: *mut GcHeader) {
        // the caller just observed the zero crossing, so the header is
        // still readable here
        let maybe_cyclic = unsafe { (*header).is_maybe_cyclic() };
        if maybe_cyclic {
            let mut queue = self.deferred.lock();
            if queue.len() < self.config.deferred_queue_size {
                queue.push_back(header as usize);
                drop(queue);
                self.counters.deferred.fetch_add(1, Ordering::Relaxed);
                return;
            }
            drop(queue);
            self.counters
                .deferred_overflows
                .fetch_add(1, Ordering::Relaxed);
        }
        self.release_object(header, maybe_cyclic);
    }

    /// Free a dead object: decrement each child, cascading iteratively,
    /// then return the blocks to the allocator.
    ///
    /// A tracked object must be claimed out of the tracked set before its
    /// header is touched: the sweep claims through the same set, so exactly
    /// one side frees any given object. Losing the claim means the tracer
    /// already reclaimed it.
    fn release_object(&self, header: *mut GcHeader, cyclic: bool) {
        let mut dead: Vec<(*mut GcHeader, bool)> = vec![(header, cyclic)];
        let mut freed: Vec<*mut GcHeader> = Vec::new();
        while let Some((object, cyclic)) = dead.pop() {
            let addr = object as usize;
            {
                let mut trace = self.trace.lock();
                trace.roots.remove(&addr);
                if cyclic && !trace.tracked.remove(&addr) {
                    continue;
                }
            }
            unsafe {
                for_each_child(object, |child| {
                    if (*child).dec_ref() == 0 {
                        if (*child).is_maybe_cyclic() {
                            let mut queue = self.deferred.lock();
                            if queue.len() < self.config.deferred_queue_size {
                                queue.push_back(child as usize);
                                drop(queue);
                                self.counters.deferred.fetch_add(1, Ordering::Relaxed);
                                return;
                            }
                            drop(queue);
                            self.counters
                                .deferred_overflows
                                .fetch_add(1, Ordering::Relaxed);
                            dead.push((child, true));
                        } else {
                            dead.push((child, false));
                        }
                    }
                });
            }
            let size = unsafe { (*object).size() };
            self.counters.live_objects.fetch_sub(1, Ordering::Relaxed);
            self.counters.live_bytes.fetch_sub(size, Ordering::Relaxed);
            self.counters.refcount_freed.fetch_add(1, Ordering::Relaxed);
            freed.push(object);
        }
        self.allocator.write().deallocate_batch(&freed);
    }

    /// Drain the deferred queue. Every entry reached refcount zero, so its
    /// children are decremented and the block is freed; entries the sweep
    /// got to first lose their claim and are skipped. New entries pushed by
    /// the cascade are drained in the same pass.
    pub fn process_deferred(&self) {
        loop {
            let Some(addr) = self.deferred.lock().pop_front() else {
                return;
            };
            self.release_object(addr as *mut GcHeader, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AllocatorConfig;
    use crate::gc::GcConfig;

    #[test]
    fn inc_dec_round_trip() {
        let gc = GcManager::new(AllocatorConfig::default(), GcConfig::default());
        let s = gc.alloc_string(b"hello world, long").unwrap();
        let header = s.object_ptr();
        unsafe {
            assert_eq!((*header).ref_count(), 1);
        }
        gc.inc_ref(header);
        unsafe {
            assert_eq!((*header).ref_count(), 2);
        }
        gc.dec_ref(header);
        unsafe {
            assert_eq!((*header).ref_count(), 1);
        }
        gc.release_value(s);
        assert_eq!(gc.gc_stats().refcount_freed, 1);
    }

    #[test]
    fn nil_hooks_are_noops() {
        let gc = GcManager::new(AllocatorConfig::default(), GcConfig::default());
        gc.inc_ref(std::ptr::null_mut());
        gc.dec_ref(std::ptr::null_mut());
        gc.retain_value(Value::nil());
        gc.release_value(Value::small_int(3));
    }

    #[test]
    fn array_death_cascades_to_elements() {
        let gc = GcManager::new(AllocatorConfig::default(), GcConfig::default());
        let s = gc.alloc_string(b"not an inline string").unwrap();
        let a = gc.alloc_array(1, 1).unwrap();
        unsafe {
            let slots = crate::object::array_elements(a.object_ptr());
            gc.retain_value(s);
            slots.write(s);
        }
        // drop our own handle to the string; the array keeps it alive
        gc.release_value(s);
        unsafe {
            assert_eq!((*s.object_ptr()).ref_count(), 1);
        }
        // killing the array queues it (maybe-cyclic); the drain frees both
        gc.release_value(a);
        gc.process_deferred();
        let stats = gc.gc_stats();
        assert_eq!(stats.refcount_freed, 2);
        assert_eq!(stats.live_objects, 0);
    }

    #[test]
    fn write_value_swaps_counts() {
        let gc = GcManager::new(AllocatorConfig::default(), GcConfig::default());
        let a = gc.alloc_string(b"aaaaaaaaaaaaaaaa").unwrap();
        let b = gc.alloc_string(b"bbbbbbbbbbbbbbbb").unwrap();
        let mut slot = Value::nil();
        gc.write_value(&mut slot, a);
        unsafe { assert_eq!((*a.object_ptr()).ref_count(), 2) };
        gc.write_value(&mut slot, b);
        unsafe {
            assert_eq!((*a.object_ptr()).ref_count(), 1);
            assert_eq!((*b.object_ptr()).ref_count(), 2);
        }
        gc.write_value(&mut slot, Value::nil());
        unsafe { assert_eq!((*b.object_ptr()).ref_count(), 1) };
        gc.release_value(a);
        gc.release_value(b);
    }
}
