use std::sync::atomic::{AtomicUsize, Ordering};

use crate::base::{
    formatted_size,
    utils::{read_bool_from_env, read_float_from_env, read_uint_from_env},
};

/// Collector tuning knobs.
#[derive(Clone, Debug)]
pub struct GcConfig {
    /// Regular safepoints a thread passes before it checks the heap size.
    pub safepoint_threshold: usize,
    /// Bytes a thread allocates before it checks the heap size.
    pub allocation_threshold_bytes: usize,
    /// Recompute the target heap size from the survivors of every collection.
    pub auto_tune: bool,
    /// Heap size at which a collection gets scheduled.
    pub target_heap_bytes: usize,
    /// Share of the target heap that survivors should occupy after auto-tuning.
    pub target_heap_utilization: f64,
    pub min_heap_bytes: usize,
    pub max_heap_bytes: usize,
    /// Hard cap on the bytes held by the allocator. `None` means unlimited.
    pub max_heap_size: Option<usize>,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            safepoint_threshold: 100_000,
            allocation_threshold_bytes: 10 * 1024,
            auto_tune: true,
            target_heap_bytes: 10 * 1024 * 1024,
            target_heap_utilization: 0.5,
            min_heap_bytes: 1024 * 1024,
            max_heap_bytes: usize::MAX,
            max_heap_size: None,
        }
    }
}

impl GcConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(threshold) = read_uint_from_env("GC_THRESHOLD") {
            config.safepoint_threshold = threshold.max(1);
        }

        if let Some(threshold) = read_uint_from_env("GC_ALLOCATION_THRESHOLD") {
            config.allocation_threshold_bytes = threshold.max(1);
        }

        if let Some(auto_tune) = read_bool_from_env("GC_AUTO_TUNE") {
            config.auto_tune = auto_tune;
        }

        if let Some(target) = read_uint_from_env("GC_TARGET_HEAP") {
            config.target_heap_bytes = target;
        }

        config.target_heap_utilization = match read_float_from_env("GC_TARGET_UTILIZATION") {
            Some(utilization) if utilization > 0.0 && utilization <= 1.0 => utilization,
            _ => config.target_heap_utilization,
        };

        if let Some(min) = read_uint_from_env("GC_MIN_HEAP") {
            config.min_heap_bytes = min;
        }

        config.max_heap_bytes = match read_uint_from_env("GC_MAX_HEAP") {
            Some(max) if max >= config.min_heap_bytes => max,
            _ => config.max_heap_bytes,
        };

        config.max_heap_size = read_uint_from_env("MAX_HEAP_SIZE").filter(|size| *size > 0);

        config
    }
}

/// Decides when the heap is large enough to collect.
pub struct GcScheduler {
    config: GcConfig,
    target_heap_bytes: AtomicUsize,
}

impl GcScheduler {
    pub fn new(config: GcConfig) -> Self {
        Self {
            target_heap_bytes: AtomicUsize::new(config.target_heap_bytes),
            config,
        }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn target_heap_bytes(&self) -> usize {
        self.target_heap_bytes.load(Ordering::Relaxed)
    }

    pub fn thread_data(&self) -> ThreadSchedulerData {
        ThreadSchedulerData {
            safepoint_threshold: self.config.safepoint_threshold,
            allocation_threshold_bytes: self.config.allocation_threshold_bytes,
            safepoints: 0,
            allocated_bytes: 0,
        }
    }

    pub fn should_collect(&self, heap_bytes: usize) -> bool {
        heap_bytes >= self.target_heap_bytes()
    }

    pub fn compute_target_heap_bytes(&self, alive_bytes: usize) -> usize {
        let target = alive_bytes as f64 / self.config.target_heap_utilization;
        (target as usize).clamp(self.config.min_heap_bytes, self.config.max_heap_bytes)
    }

    pub fn on_gc_finished(&self, alive_bytes: usize) {
        if !self.config.auto_tune {
            return;
        }

        let target = self.compute_target_heap_bytes(alive_bytes);
        self.target_heap_bytes.store(target, Ordering::Relaxed);
        log::debug!(
            target: "gc",
            "alive {}, next target heap {}",
            formatted_size(alive_bytes),
            formatted_size(target)
        );
    }
}

/// Per-mutator counters. Each `on_*` call returns `true` when a threshold was reached and the
/// slow path (a heap size check) has to run; the counters are reset at that point.
#[derive(Debug)]
pub struct ThreadSchedulerData {
    safepoint_threshold: usize,
    allocation_threshold_bytes: usize,
    safepoints: usize,
    allocated_bytes: usize,
}

impl ThreadSchedulerData {
    pub fn on_safepoint_regular(&mut self, weight: usize) -> bool {
        self.safepoints += weight;
        self.check()
    }

    pub fn on_safepoint_allocation(&mut self, size: usize) -> bool {
        self.allocated_bytes += size;
        self.check()
    }

    pub fn on_stopped_for_gc(&mut self) {
        self.reset();
    }

    pub fn safepoints(&self) -> usize {
        self.safepoints
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    fn check(&mut self) -> bool {
        if self.safepoints >= self.safepoint_threshold
            || self.allocated_bytes >= self.allocation_threshold_bytes
        {
            self.reset();
            return true;
        }
        false
    }

    fn reset(&mut self) {
        self.safepoints = 0;
        self.allocated_bytes = 0;
    }
}
