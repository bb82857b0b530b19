//! The tracing path: stop-the-world mark-sweep over the tracked set.
//!
//! Tracked objects are those created with MAYBE_CYCLIC. A cycle clears
//! their mark bits, marks everything reachable from the root set plus the
//! caller-supplied extra roots, then frees whatever stayed unmarked. Child
//! refcounts are deliberately not decremented during the sweep; a swept
//! object's survivors are reachable from a mark of their own.

use std::time::Instant;

use atomic::Ordering;
use rustc_hash::FxHashSet;

use crate::gc::GcManager;
use crate::header::{BaseType, GcHeader};
use crate::object::{array_live, callable_upvalues, upvalue_payload, UPVALUE_CLOSED};
use crate::value::Value;

pub struct TraceState {
    /// Objects flagged MAYBE_CYCLIC, by header address.
    pub tracked: FxHashSet<usize>,
    /// Explicitly registered roots (globals, constants, closed upvalues).
    pub roots: FxHashSet<usize>,
}

impl TraceState {
    pub fn new() -> Self {
        Self {
            tracked: FxHashSet::default(),
            roots: FxHashSet::default(),
        }
    }
}

impl Default for TraceState {
    fn default() -> Self {
        Self::new()
    }
}

/// Enumerate the outgoing edges of an object. Arrays walk their live
/// element slots, callables their upvalue cells, closed upvalues their
/// owned value; strings and functions are leaves.
///
/// # Safety
/// `header` must point at a live, initialized object.
pub unsafe fn for_each_child(header: *mut GcHeader, mut f: impl FnMut(*mut GcHeader)) {
    match (*header).base_type() {
        BaseType::Array => {
            for value in array_live(header) {
                if value.is_gc_managed() {
                    f(value.object_ptr());
                }
            }
        }
        BaseType::Callable => {
            for &cell in callable_upvalues(header).iter() {
                if !cell.is_null() {
                    f(cell);
                }
            }
        }
        BaseType::Upvalue => {
            let payload = upvalue_payload(header);
            if payload.state == UPVALUE_CLOSED && payload.value.is_gc_managed() {
                f(payload.value.object_ptr());
            }
        }
        _ => {}
    }
}

impl GcManager {
    /// One stop-the-world mark-sweep cycle. Re-entrant calls (the worker
    /// racing a forced collection) are dropped.
    pub(crate) fn collect_cycle(&self, extra_roots: &[Value]) {
        if self.collecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let started = Instant::now();
        let mut trace = self.trace.lock();

        for &addr in trace.tracked.iter() {
            unsafe { (*(addr as *mut GcHeader)).set_marked(false) };
        }

        let mut stack: Vec<*mut GcHeader> = Vec::new();
        if stack
            .try_reserve(trace.roots.len() + extra_roots.len())
            .is_err()
        {
            self.abort_cycle();
            return;
        }
        stack.extend(trace.roots.iter().map(|&addr| addr as *mut GcHeader));
        stack.extend(
            extra_roots
                .iter()
                .filter(|v| v.is_gc_managed())
                .map(|v| v.object_ptr()),
        );

        let mut overflow = false;
        while let Some(object) = stack.pop() {
            unsafe {
                if (*object).is_marked() {
                    continue;
                }
                (*object).set_marked(true);
                for_each_child(object, |child| {
                    if stack.try_reserve(1).is_err() {
                        overflow = true;
                        return;
                    }
                    stack.push(child);
                });
            }
            if overflow {
                self.abort_cycle();
                return;
            }
        }

        let tracked_before = trace.tracked.len();
        let mut swept: Vec<*mut GcHeader> = Vec::new();
        trace.tracked.retain(|&addr| {
            let header = addr as *mut GcHeader;
            unsafe {
                if !(*header).is_marked() && !(*header).is_pinned() {
                    swept.push(header);
                    false
                } else {
                    // universal invariant: no tracked object stays marked
                    // once the cycle completes
                    (*header).set_marked(false);
                    true
                }
            }
        });
        drop(trace);

        if !swept.is_empty() {
            // an entry can sit in the deferred queue and the tracked set at
            // once; the sweep must win exactly once
            let swept_set: FxHashSet<usize> = swept.iter().map(|&p| p as usize).collect();
            self.deferred.lock().retain(|addr| !swept_set.contains(addr));

            for &header in &swept {
                let size = unsafe { (*header).size() };
                self.counters.live_objects.fetch_sub(1, Ordering::Relaxed);
                self.counters.live_bytes.fetch_sub(size, Ordering::Relaxed);
                self.counters.traced_freed.fetch_add(1, Ordering::Relaxed);
            }
            self.allocator.write().deallocate_batch(&swept);
        }

        if tracked_before > 0
            && swept.len() as f64 / tracked_before as f64 >= self.config.compaction_threshold
        {
            self.allocator.write().compact();
        }

        let pause = started.elapsed();
        self.counters
            .last_pause_us
            .store(pause.as_micros() as u64, Ordering::Relaxed);
        self.counters.cycles.fetch_add(1, Ordering::Relaxed);
        self.retune(pause);
        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            swept = swept.len(),
            tracked_before,
            pause_us = pause.as_micros() as u64,
            "mark-sweep cycle"
        );
        self.collecting.store(false, Ordering::Release);
    }

    fn abort_cycle(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        self.collecting.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AllocatorConfig;
    use crate::gc::GcConfig;
    use crate::object::array_elements;

    fn gc() -> std::sync::Arc<GcManager> {
        GcManager::new(AllocatorConfig::default(), GcConfig::default())
    }

    #[test]
    fn cycle_is_untouched_by_refcounts_but_dies_under_trace() {
        let gc = gc();
        let a = gc.alloc_array(1, 1).unwrap();
        let b = gc.alloc_array(1, 1).unwrap();
        unsafe {
            // a[0] = b, b[0] = a
            gc.retain_value(b);
            array_elements(a.object_ptr()).write(b);
            gc.retain_value(a);
            array_elements(b.object_ptr()).write(a);
        }
        // drop the external references; the pair keeps itself at refcount 1
        gc.release_value(a);
        gc.release_value(b);
        gc.process_deferred();
        unsafe {
            assert_eq!((*a.object_ptr()).ref_count(), 1);
            assert_eq!((*b.object_ptr()).ref_count(), 1);
        }
        assert_eq!(gc.gc_stats().tracked, 2);

        gc.force_gc(&[]);
        let stats = gc.gc_stats();
        assert_eq!(stats.tracked, 0);
        assert_eq!(stats.traced_freed, 2);
        assert_eq!(stats.live_objects, 0);
    }

    #[test]
    fn roots_survive_tracing() {
        let gc = gc();
        let a = gc.alloc_array(0, 4).unwrap();
        gc.root_value(a);
        gc.force_gc(&[]);
        assert_eq!(gc.gc_stats().tracked, 1);
        gc.remove_root(a.object_ptr());
        gc.force_gc(&[]);
        assert_eq!(gc.gc_stats().tracked, 0);
    }

    #[test]
    fn extra_roots_protect_register_contents() {
        let gc = gc();
        let a = gc.alloc_array(0, 2).unwrap();
        gc.force_gc(&[a]);
        assert_eq!(gc.gc_stats().tracked, 1);
        gc.force_gc(&[]);
        assert_eq!(gc.gc_stats().tracked, 0);
    }

    #[test]
    fn no_tracked_object_stays_marked() {
        let gc = gc();
        let a = gc.alloc_array(0, 2).unwrap();
        gc.root_value(a);
        gc.force_gc(&[]);
        unsafe { assert!(!(*a.object_ptr()).is_marked()) };
    }

    #[test]
    fn pinned_objects_are_not_swept() {
        let gc = gc();
        let a = gc.alloc_array(0, 2).unwrap();
        unsafe { (*a.object_ptr()).set_pinned(true) };
        gc.force_gc(&[]);
        assert_eq!(gc.gc_stats().tracked, 1);
        unsafe { (*a.object_ptr()).set_pinned(false) };
        gc.force_gc(&[]);
        assert_eq!(gc.gc_stats().tracked, 0);
    }
}
