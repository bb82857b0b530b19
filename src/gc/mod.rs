//! The garbage collector: a reference-counting fast path fused with a
//! mark-sweep backstop for possibly-cyclic objects.
//!
//! The manager is the only layer that initializes object headers and the
//! only one (besides the allocator) that traffics in raw header pointers.
//! Everything above moves [`Value`]s and calls the reference hooks.

pub mod refcount;
pub mod trace;

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use atomic::Ordering;
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;

use crate::allocator::{Allocator, AllocatorConfig};
use crate::error::VmError;
use crate::header::{BaseType, GcHeader, HEADER_SIZE};
use crate::object::{
    array_allocation_size, array_elements, array_payload_mut, callable_allocation_size,
    callable_upvalues, string_allocation_size, string_init, upvalue_allocation_size,
    upvalue_payload, UPVALUE_CLOSED,
};
use crate::stats::{AllocationStats, GcStats};
use crate::value::{Value, ValueKind};

use trace::TraceState;

/// Write-barrier strategy knob. The barrier opcode itself is reserved (see
/// DESIGN.md); the mode is configuration surface for a future generational
/// or concurrent collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBarrierMode {
    Dijkstra,
    Yuasa,
    Hybrid,
    None,
}

#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Default batch size for the interpreter-side refcount buffer.
    pub refcount_batch_size: usize,
    /// Capacity of the deferred-cleanup queue for maybe-cyclic objects.
    pub deferred_queue_size: usize,
    /// Live-byte limit above which a collection is considered needed.
    pub memory_pressure_limit: usize,
    /// Tracked-object limit above which a collection is considered needed.
    pub object_count_limit: usize,
    /// Wall-clock interval after which a collection is considered needed.
    pub gc_interval: Duration,
    /// Reserved; parallel marking is a future extension.
    pub concurrent_marking: bool,
    /// Reserved; parallel sweeping is a future extension.
    pub concurrent_sweeping: bool,
    pub write_barrier_mode: WriteBarrierMode,
    /// When at least this fraction of the tracked set dies in one cycle,
    /// the sweep is followed by an allocator compaction.
    pub compaction_threshold: f64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            refcount_batch_size: 64,
            deferred_queue_size: 256,
            memory_pressure_limit: 64 * 1024 * 1024,
            object_count_limit: 10_000,
            gc_interval: Duration::from_secs(1),
            concurrent_marking: false,
            concurrent_sweeping: false,
            write_barrier_mode: WriteBarrierMode::None,
            compaction_threshold: 0.5,
        }
    }
}

const SOFT_PAUSE_LIMIT: Duration = Duration::from_millis(5);
const BRIEF_PAUSE: Duration = Duration::from_millis(1);
const MIN_OBJECT_LIMIT: usize = 1_000;
const MAX_OBJECT_LIMIT: usize = 10_000_000;
const MIN_INTERVAL: Duration = Duration::from_millis(10);
const MAX_INTERVAL: Duration = Duration::from_secs(60);

pub(crate) struct Tunables {
    pub object_count_limit: usize,
    pub interval: Duration,
    pub last_cycle: Instant,
}

#[derive(Default)]
pub(crate) struct GcCounters {
    pub cycles: AtomicU64,
    pub refcount_freed: AtomicU64,
    pub traced_freed: AtomicU64,
    pub deferred: AtomicU64,
    pub deferred_overflows: AtomicU64,
    pub errors: AtomicU64,
    pub last_pause_us: AtomicU64,
    pub live_objects: AtomicUsize,
    pub live_bytes: AtomicUsize,
}

enum WorkerMsg {
    Collect,
    Shutdown,
}

struct Worker {
    sender: Sender<WorkerMsg>,
    handle: JoinHandle<()>,
}

/// Unified façade over the refcount and tracing paths.
pub struct GcManager {
    pub(crate) allocator: RwLock<Allocator>,
    pub(crate) trace: Mutex<TraceState>,
    pub(crate) deferred: Mutex<VecDeque<usize>>,
    pub(crate) config: GcConfig,
    pub(crate) tunables: Mutex<Tunables>,
    pub(crate) counters: GcCounters,
    worker: Mutex<Option<Worker>>,
    /// Set by the worker when a trace was requested while the mutator was
    /// running; consumed by the interpreter at its next safe point.
    pub(crate) gc_pending: AtomicBool,
    pub(crate) mutator_active: AtomicBool,
    pub(crate) collecting: AtomicBool,
}

impl GcManager {
    pub fn new(alloc_config: AllocatorConfig, config: GcConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            allocator: RwLock::new(Allocator::new(alloc_config)),
            trace: Mutex::new(TraceState::new()),
            deferred: Mutex::new(VecDeque::with_capacity(config.deferred_queue_size)),
            tunables: Mutex::new(Tunables {
                object_count_limit: config.object_count_limit,
                interval: config.gc_interval,
                last_cycle: Instant::now(),
            }),
            config,
            counters: GcCounters::default(),
            worker: Mutex::new(None),
            gc_pending: AtomicBool::new(false),
            mutator_active: AtomicBool::new(false),
            collecting: AtomicBool::new(false),
        });
        Self::spawn_worker(&manager);
        manager
    }

    /// The worker is an optimization, not a correctness requirement: if the
    /// OS refuses a thread, the manager stays in synchronous-only mode and
    /// `trigger_gc` services requests inline.
    fn spawn_worker(this: &Arc<Self>) {
        let (sender, receiver) = bounded::<WorkerMsg>(16);
        let weak: Weak<Self> = Arc::downgrade(this);
        let spawned = std::thread::Builder::new()
            .name("lyra-gc".into())
            .spawn(move || {
                while let Ok(msg) = receiver.recv() {
                    match msg {
                        WorkerMsg::Shutdown => break,
                        WorkerMsg::Collect => {
                            let Some(manager) = weak.upgrade() else { break };
                            manager.service_collect_request();
                        }
                    }
                }
            });
        if let Ok(handle) = spawned {
            *this.worker.lock() = Some(Worker { sender, handle });
        }
    }

    /// One consumed trigger: drain the deferred queue, then either run the
    /// cycle or, while the mutator is running (it owns the roots), flag it
    /// for the next safe point.
    fn service_collect_request(&self) {
        self.process_deferred();
        if self.mutator_active.load(Ordering::Acquire) {
            self.gc_pending.store(true, Ordering::Release);
        } else {
            self.collect_cycle(&[]);
        }
    }

    /// Collection request. With a worker thread this is non-blocking (a
    /// full queue means a collection is already pending and the request is
    /// dropped); without one the request is serviced inline.
    pub fn trigger_gc(&self) {
        {
            let worker = self.worker.lock();
            if let Some(worker) = worker.as_ref() {
                let _: Result<(), TrySendError<WorkerMsg>> =
                    worker.sender.try_send(WorkerMsg::Collect);
                return;
            }
        }
        self.service_collect_request();
    }

    /// Run both paths synchronously: drain the deferred queue, then a full
    /// stop-the-world mark-sweep over the tracked set.
    pub fn force_gc(&self, extra_roots: &[Value]) {
        self.process_deferred();
        self.collect_cycle(extra_roots);
    }

    pub fn shutdown(&self) {
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.sender.send(WorkerMsg::Shutdown);
            let _ = worker.handle.join();
        }
    }

    /// Trigger policy: memory pressure, tracked-set growth or elapsed time.
    pub fn needs_gc(&self) -> bool {
        if self.counters.live_bytes.load(Ordering::Relaxed) > self.config.memory_pressure_limit {
            return true;
        }
        let tunables = self.tunables.lock();
        self.trace.lock().tracked.len() > tunables.object_count_limit
            || tunables.last_cycle.elapsed() > tunables.interval
    }

    /// Widen the thresholds after a long pause, narrow them after a brief
    /// one; both clamped to safe ranges.
    pub(crate) fn retune(&self, pause: Duration) {
        let mut tunables = self.tunables.lock();
        if pause > SOFT_PAUSE_LIMIT {
            tunables.object_count_limit =
                (tunables.object_count_limit * 6 / 5).min(MAX_OBJECT_LIMIT);
            tunables.interval = tunables.interval.mul_f64(1.2).min(MAX_INTERVAL);
        } else if pause < BRIEF_PAUSE {
            tunables.object_count_limit =
                (tunables.object_count_limit * 9 / 10).max(MIN_OBJECT_LIMIT);
            tunables.interval = tunables.interval.mul_f64(0.9).max(MIN_INTERVAL);
        }
        tunables.last_cycle = Instant::now();
    }

    // ---- object construction -------------------------------------------

    /// Allocate and initialize an object: header reset, refcount 1,
    /// MAYBE_CYCLIC set when the type can participate in a cycle, tracking
    /// registration. Returns `None` on allocation failure.
    pub fn allocate_object(
        &self,
        base_type: BaseType,
        extended_type: u16,
        payload_size: usize,
        isolated: bool,
    ) -> Option<NonNull<GcHeader>> {
        let total = HEADER_SIZE + payload_size;
        let (ptr, is_large) = {
            let mut allocator = self.allocator.write();
            let ptr = if isolated {
                allocator.allocate_isolated(total, base_type)
            } else {
                allocator.allocate(total, base_type)
            };
            (ptr, allocator.is_large_size(total))
        };
        let header = NonNull::new(ptr)?;
        unsafe {
            GcHeader::init(ptr, total, base_type, extended_type);
            if is_large {
                (*ptr).set_large(true);
            }
        }
        self.on_object_allocated(ptr);
        Some(header)
    }

    /// Bookkeeping for a freshly initialized object.
    pub fn on_object_allocated(&self, header: *mut GcHeader) {
        if header.is_null() {
            return;
        }
        unsafe {
            self.counters.live_objects.fetch_add(1, Ordering::Relaxed);
            self.counters
                .live_bytes
                .fetch_add((*header).size(), Ordering::Relaxed);
            if (*header).is_maybe_cyclic() {
                self.trace.lock().tracked.insert(header as usize);
            }
        }
    }

    /// Remove a dying object from tracking. Called on every free path. The
    /// root set is scrubbed too so a stale registration can never leave a
    /// dangling pointer for the next mark.
    pub fn on_object_freed(&self, header: *mut GcHeader) {
        if header.is_null() {
            return;
        }
        unsafe {
            let mut trace = self.trace.lock();
            trace.roots.remove(&(header as usize));
            if (*header).is_maybe_cyclic() {
                trace.tracked.remove(&(header as usize));
            }
        }
    }

    pub fn add_root(&self, header: *mut GcHeader) {
        if !header.is_null() {
            self.trace.lock().roots.insert(header as usize);
        }
    }

    pub fn remove_root(&self, header: *mut GcHeader) {
        if !header.is_null() {
            self.trace.lock().roots.remove(&(header as usize));
        }
    }

    /// Root registration for values; inline values are no-ops.
    pub fn root_value(&self, value: Value) {
        if value.is_gc_managed() {
            self.add_root(value.object_ptr());
        }
    }

    // ---- typed allocation helpers --------------------------------------

    /// Heap string. Short strings should use the inline form instead; this
    /// always allocates.
    pub fn alloc_string(&self, bytes: &[u8]) -> Result<Value, VmError> {
        let payload = string_allocation_size(bytes.len()) - HEADER_SIZE;
        let header = self
            .allocate_object(BaseType::String, 0, payload, false)
            .ok_or(VmError::AllocationFailure(payload + HEADER_SIZE))?;
        unsafe { string_init(header.as_ptr(), bytes) };
        Ok(Value::gc_object(ValueKind::String, header.as_ptr()))
    }

    /// Fresh array of `length` live nil slots with room for `capacity`.
    /// Array storage is always an isolated allocation so a rebuilt array can
    /// never alias a previously freed one.
    pub fn alloc_array(&self, length: u32, capacity: u32) -> Result<Value, VmError> {
        debug_assert!(length <= capacity);
        let payload = array_allocation_size(capacity as usize) - HEADER_SIZE;
        let header = self
            .allocate_object(BaseType::Array, 0, payload, true)
            .ok_or(VmError::AllocationFailure(payload + HEADER_SIZE))?;
        unsafe {
            let p = array_payload_mut(header.as_ptr());
            p.length = length;
            p.capacity = capacity;
            let slots = array_elements(header.as_ptr());
            for i in 0..capacity as usize {
                slots.add(i).write(Value::nil());
            }
        }
        Ok(Value::gc_object(ValueKind::Array, header.as_ptr()))
    }

    /// A callable takes ownership of the given upvalue cells.
    pub fn alloc_callable(
        &self,
        function_id: u32,
        cells: &[*mut GcHeader],
    ) -> Result<Value, VmError> {
        let payload = callable_allocation_size(cells.len()) - HEADER_SIZE;
        let header = self
            .allocate_object(BaseType::Callable, 0, payload, false)
            .ok_or(VmError::AllocationFailure(payload + HEADER_SIZE))?;
        unsafe {
            let p = (*header.as_ptr()).payload() as *mut crate::object::CallablePayload;
            (*p).function_id = function_id;
            (*p).upvalue_count = cells.len() as u32;
            callable_upvalues(header.as_ptr()).copy_from_slice(cells);
        }
        Ok(Value::gc_object(ValueKind::Callable, header.as_ptr()))
    }

    /// Fresh upvalue cell, open over `register` until closed.
    pub fn alloc_upvalue(&self, register: u32) -> Result<*mut GcHeader, VmError> {
        let payload = upvalue_allocation_size() - HEADER_SIZE;
        let header = self
            .allocate_object(BaseType::Upvalue, 0, payload, false)
            .ok_or(VmError::AllocationFailure(payload + HEADER_SIZE))?;
        unsafe {
            let p = upvalue_payload(header.as_ptr());
            p.state = crate::object::UPVALUE_OPEN;
            p.register = register;
            p.value = Value::nil();
        }
        Ok(header.as_ptr())
    }

    /// Closed upvalue cell owning `value` (the cell takes a reference).
    pub fn alloc_closed_upvalue(&self, value: Value) -> Result<*mut GcHeader, VmError> {
        let cell = self.alloc_upvalue(0)?;
        unsafe {
            let p = upvalue_payload(cell);
            p.state = UPVALUE_CLOSED;
            self.retain_value(value);
            p.value = value;
        }
        Ok(cell)
    }

    // ---- safe copy ------------------------------------------------------

    /// Bounded-depth deep copy that preserves the no-cycles invariant of
    /// the refcount path. Arrays are rebuilt through isolated allocations;
    /// a cycle or depth overflow substitutes nil. Non-array values are
    /// shared (with a reference taken).
    pub fn deep_copy(&self, value: Value) -> Result<Value, VmError> {
        let mut visited = FxHashSet::default();
        self.deep_copy_inner(value, 0, &mut visited)
    }

    fn deep_copy_inner(
        &self,
        value: Value,
        depth: usize,
        visited: &mut FxHashSet<usize>,
    ) -> Result<Value, VmError> {
        const MAX_DEPTH: usize = 10;
        if value.kind() != ValueKind::Array || !value.is_gc_managed() {
            self.retain_value(value);
            return Ok(value);
        }
        let addr = value.object_addr();
        if depth >= MAX_DEPTH || !visited.insert(addr) {
            return Ok(Value::nil());
        }
        let header = value.object_ptr();
        let (length, capacity) = unsafe {
            let p = crate::object::array_payload(header);
            (p.length, p.capacity)
        };
        let copy = self.alloc_array(length, capacity)?;
        unsafe {
            let src = array_elements(header);
            let dst = array_elements(copy.object_ptr());
            for i in 0..length as usize {
                let element = self.deep_copy_inner(src.add(i).read(), depth + 1, visited)?;
                dst.add(i).write(element);
            }
        }
        visited.remove(&addr);
        Ok(copy)
    }

    // ---- diagnostics ----------------------------------------------------

    pub fn allocation_stats(&self) -> AllocationStats {
        self.allocator.read().stats()
    }

    pub fn gc_stats(&self) -> GcStats {
        GcStats {
            cycles: self.counters.cycles.load(Ordering::Relaxed),
            refcount_freed: self.counters.refcount_freed.load(Ordering::Relaxed),
            traced_freed: self.counters.traced_freed.load(Ordering::Relaxed),
            deferred: self.counters.deferred.load(Ordering::Relaxed),
            deferred_overflows: self.counters.deferred_overflows.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            last_pause_us: self.counters.last_pause_us.load(Ordering::Relaxed),
            tracked: self.trace.lock().tracked.len(),
            live_objects: self.counters.live_objects.load(Ordering::Relaxed),
            live_bytes: self.counters.live_bytes.load(Ordering::Relaxed),
        }
    }

    /// Release empty pages and chunks back to the OS.
    pub fn compact(&self) -> usize {
        self.allocator.write().compact()
    }

    pub(crate) fn mark_mutator(&self, active: bool) {
        self.mutator_active.store(active, Ordering::Release);
    }

    pub(crate) fn take_pending(&self) -> bool {
        self.gc_pending.swap(false, Ordering::AcqRel)
    }
}

impl Drop for GcManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// The façade is shared between the mutator and the worker thread; interior
// raw pointers are guarded by the allocator and trace locks.
unsafe impl Send for GcManager {}
unsafe impl Sync for GcManager {}
