//! Diagnostic counters for the allocator, the collector and the
//! interpreter's GC optimizer.

/// Counters kept by each allocator tier. `pages` counts 4 KiB pages for the
/// small tier, 64 KiB chunks for the slab tier and OS pages for the large
/// tier; `class_allocations` is only populated by the small tier.
#[derive(Debug, Default, Clone)]
pub struct TierStats {
    pub allocations: u64,
    pub deallocations: u64,
    pub bytes_in_use: usize,
    pub pages: usize,
    pub class_allocations: [u64; 8],
}

#[derive(Debug, Default, Clone)]
pub struct AllocationStats {
    pub small: TierStats,
    pub medium: TierStats,
    pub large: TierStats,
    pub invalid_deallocations: u64,
}

impl AllocationStats {
    pub fn total_bytes_in_use(&self) -> usize {
        self.small.bytes_in_use + self.medium.bytes_in_use + self.large.bytes_in_use
    }

    pub fn total_allocations(&self) -> u64 {
        self.small.allocations + self.medium.allocations + self.large.allocations
    }
}

#[derive(Debug, Default, Clone)]
pub struct GcStats {
    /// Completed mark-sweep cycles.
    pub cycles: u64,
    /// Objects freed by the refcount path.
    pub refcount_freed: u64,
    /// Objects freed by the tracing path.
    pub traced_freed: u64,
    /// Objects routed through the deferred-cleanup queue.
    pub deferred: u64,
    /// Deferred-queue overflows that fell back to immediate cleanup.
    pub deferred_overflows: u64,
    /// Aborted cycles (allocation failure inside mark/sweep).
    pub errors: u64,
    /// Pause of the most recent full cycle, in microseconds.
    pub last_pause_us: u64,
    /// Objects currently in the tracked (maybe-cyclic) set.
    pub tracked: usize,
    /// Live allocator-owned objects.
    pub live_objects: usize,
    /// Live allocator-owned bytes.
    pub live_bytes: usize,
}

#[derive(Debug, Default, Clone)]
pub struct OptimizerStats {
    pub buffered_ops: u64,
    pub flushes: u64,
    pub gc_requests: u64,
    /// GC_WRITE_BARRIER executions (the opcode is reserved; see DESIGN.md).
    pub write_barriers: u64,
}

/// Byte counts scaled to the largest binary unit that keeps the number
/// readable.
fn human_bytes(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut scaled = bytes as f64;
    let mut unit = 0;
    while scaled >= 1024.0 && unit < UNITS.len() - 1 {
        scaled /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{scaled:.1}{}", UNITS[unit])
    }
}

impl std::fmt::Display for AllocationStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Allocator statistics:")?;
        for (name, tier) in [
            ("small", &self.small),
            ("medium", &self.medium),
            ("large", &self.large),
        ] {
            writeln!(
                f,
                "  {} tier: {} in use, {} allocations, {} frees, {} pages",
                name,
                human_bytes(tier.bytes_in_use),
                tier.allocations,
                tier.deallocations,
                tier.pages
            )?;
        }
        writeln!(
            f,
            "  Invalid deallocations: {}",
            self.invalid_deallocations
        )?;
        Ok(())
    }
}

impl std::fmt::Display for GcStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "GC statistics:")?;
        writeln!(f, "  Full cycles: {}", self.cycles)?;
        writeln!(
            f,
            "  Freed: {} by refcount, {} by tracing",
            self.refcount_freed, self.traced_freed
        )?;
        writeln!(
            f,
            "  Deferred: {} ({} overflows)",
            self.deferred, self.deferred_overflows
        )?;
        writeln!(f, "  Last pause: {}us", self.last_pause_us)?;
        writeln!(
            f,
            "  Live: {} objects, {} ({} tracked)",
            self.live_objects,
            human_bytes(self.live_bytes),
            self.tracked
        )?;
        if self.errors > 0 {
            writeln!(f, "  Aborted cycles: {}", self.errors)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_rendering_scales() {
        assert_eq!(human_bytes(0), "0B");
        assert_eq!(human_bytes(512), "512B");
        assert_eq!(human_bytes(2048), "2.0KiB");
        assert_eq!(human_bytes(3 * 1024 * 1024 / 2), "1.5MiB");
        assert_eq!(human_bytes(5 * 1024 * 1024 * 1024), "5.0GiB");
    }

    #[test]
    fn stats_render_without_panicking() {
        let mut stats = AllocationStats::default();
        stats.small.bytes_in_use = 4096;
        stats.invalid_deallocations = 1;
        let report = stats.to_string();
        assert!(report.contains("4.0KiB"));
        assert!(report.contains("Invalid deallocations: 1"));
    }
}
