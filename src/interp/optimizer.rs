//! The GC optimizer: batches the interpreter's reference-count traffic.
//!
//! Register writes and frame events enqueue operations instead of touching
//! header words one by one; the buffer drains in order on saturation, on
//! any allocation, on frame push/pop and on GC triggers, so a buffered
//! increment is never overtaken by its matching decrement. When the
//! trigger policy says a collection is due, the optimizer files a request
//! with the background worker rather than pausing the mutator itself.

use std::time::{Duration, Instant};

use crate::gc::refcount::RefOp;
use crate::gc::GcManager;
use crate::stats::OptimizerStats;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub enabled: bool,
    /// Buffer saturation point.
    pub batch_size: usize,
    /// Drain at least this often.
    pub flush_interval: Duration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 64,
            flush_interval: Duration::from_millis(10),
        }
    }
}

pub struct GcOptimizer {
    buffer: Vec<RefOp>,
    batch_size: usize,
    flush_interval: Duration,
    last_flush: Instant,
    stats: OptimizerStats,
}

impl GcOptimizer {
    pub fn new(config: &OptimizerConfig) -> Self {
        Self {
            buffer: Vec::with_capacity(config.batch_size),
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval,
            last_flush: Instant::now(),
            stats: OptimizerStats::default(),
        }
    }

    /// Record that `value` gained a referencing slot.
    #[inline]
    pub fn retain(&mut self, gc: &GcManager, value: Value) {
        if value.is_gc_managed() {
            self.push(gc, RefOp::Inc(value.object_addr()));
        }
    }

    /// Record that `value` lost a referencing slot.
    #[inline]
    pub fn release(&mut self, gc: &GcManager, value: Value) {
        if value.is_gc_managed() {
            self.push(gc, RefOp::Dec(value.object_addr()));
        }
    }

    #[inline]
    fn push(&mut self, gc: &GcManager, op: RefOp) {
        self.buffer.push(op);
        self.stats.buffered_ops += 1;
        if self.buffer.len() >= self.batch_size
            || self.last_flush.elapsed() >= self.flush_interval
        {
            self.flush(gc);
        }
    }

    /// Drain the buffer in order and consult the trigger policy.
    pub fn flush(&mut self, gc: &GcManager) {
        if !self.buffer.is_empty() {
            for op in self.buffer.drain(..) {
                gc.apply_ref_op(op);
            }
            self.stats.flushes += 1;
        }
        self.last_flush = Instant::now();
        if gc.needs_gc() {
            gc.trigger_gc();
            self.stats.gc_requests += 1;
        }
    }

    /// The reserved barrier opcode lands here: counted, otherwise inert.
    pub fn note_write_barrier(&mut self) {
        self.stats.write_barriers += 1;
    }

    pub fn stats(&self) -> &OptimizerStats {
        &self.stats
    }
}
