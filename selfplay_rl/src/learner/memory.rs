//! Scratch storage for one training step with memory accounting.
//!
//! Intermediate values of a step (batch, model outputs, losses) are parked in
//! a keyed scratch map. Every insert records high-water marks of reserved
//! and allocated memory; `release_all` drops everything, asks the probe to
//! reclaim, and reports how much came back.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use sysinfo::System;

/// Source of memory usage figures, in bytes.
pub trait MemoryProbe {
    /// Memory held by the allocator, used or cached.
    fn reserved(&mut self) -> u64;

    /// Memory backing live values.
    fn allocated(&mut self) -> u64;

    /// Total device memory.
    fn total(&mut self) -> u64;

    /// Give cached memory back to the system.
    fn collect(&mut self);
}

impl<P: MemoryProbe + ?Sized> MemoryProbe for Box<P> {
    fn reserved(&mut self) -> u64 {
        (**self).reserved()
    }

    fn allocated(&mut self) -> u64 {
        (**self).allocated()
    }

    fn total(&mut self) -> u64 {
        (**self).total()
    }

    fn collect(&mut self) {
        (**self).collect()
    }
}

/// Host memory figures from `sysinfo`.
///
/// Reserved is everything not available to new allocations; allocated is
/// what the OS reports as used.
pub struct HostMemoryProbe {
    system: System,
}

impl HostMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for HostMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for HostMemoryProbe {
    fn reserved(&mut self) -> u64 {
        self.system.refresh_memory();
        self.system
            .total_memory()
            .saturating_sub(self.system.available_memory())
    }

    fn allocated(&mut self) -> u64 {
        self.system.refresh_memory();
        self.system.used_memory()
    }

    fn total(&mut self) -> u64 {
        self.system.refresh_memory();
        self.system.total_memory()
    }

    fn collect(&mut self) {
        // Dropped host values are returned to the allocator immediately
    }
}

/// Probe that reports zero everywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProbe;

impl MemoryProbe for NullProbe {
    fn reserved(&mut self) -> u64 {
        0
    }

    fn allocated(&mut self) -> u64 {
        0
    }

    fn total(&mut self) -> u64 {
        0
    }

    fn collect(&mut self) {}
}

/// Memory returned by one `release_all`, in bytes.
///
/// Positive values mean memory was freed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryDelta {
    pub reserved_freed: i64,
    pub allocated_freed: i64,
    pub free_gained: i64,
    /// Scratch values dropped
    pub released: usize,
}

/// Point-in-time memory summary, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryReport {
    pub reserved: u64,
    pub allocated: u64,
    pub total: u64,
    pub free: u64,
    pub max_reserved: u64,
    pub max_allocated: u64,
}

fn signed_diff(before: u64, after: u64) -> i64 {
    (before as i128 - after as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Keyed scratch values plus memory accounting.
pub struct MemoryMonitor<T, P> {
    probe: P,
    scratch: HashMap<String, T>,
    max_reserved: u64,
    max_allocated: u64,
}

impl<T, P: MemoryProbe> MemoryMonitor<T, P> {
    pub fn new(probe: P) -> Self {
        Self {
            probe,
            scratch: HashMap::new(),
            max_reserved: 0,
            max_allocated: 0,
        }
    }

    /// Store a scratch value, returning the one it replaced.
    pub fn insert(&mut self, key: impl Into<String>, value: T) -> Option<T> {
        let previous = self.scratch.insert(key.into(), value);
        self.observe();
        previous
    }

    /// Store a scratch value and borrow it back.
    pub fn stash(&mut self, key: impl Into<String>, value: T) -> &T {
        let key = key.into();
        self.scratch.insert(key.clone(), value);
        self.observe();
        &self.scratch[&key]
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.scratch.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<T> {
        self.scratch.remove(key)
    }

    /// Number of scratch values held.
    pub fn len(&self) -> usize {
        self.scratch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scratch.is_empty()
    }

    fn observe(&mut self) {
        self.max_reserved = self.max_reserved.max(self.probe.reserved());
        self.max_allocated = self.max_allocated.max(self.probe.allocated());
    }

    /// Drop every scratch value and reclaim memory.
    pub fn release_all(&mut self) -> MemoryDelta {
        let reserved_before = self.probe.reserved();
        let allocated_before = self.probe.allocated();
        let total = self.probe.total();

        let released = self.scratch.len();
        self.scratch.clear();
        self.probe.collect();

        let reserved_after = self.probe.reserved();
        let allocated_after = self.probe.allocated();
        let free_before = total.saturating_sub(reserved_before);
        let free_after = total.saturating_sub(reserved_after);

        let delta = MemoryDelta {
            reserved_freed: signed_diff(reserved_before, reserved_after),
            allocated_freed: signed_diff(allocated_before, allocated_after),
            free_gained: signed_diff(free_after, free_before),
            released,
        };
        log::debug!(
            "released {} scratch values: reserved -{}B, allocated -{}B, free +{}B",
            delta.released,
            delta.reserved_freed,
            delta.allocated_freed,
            delta.free_gained
        );
        delta
    }

    /// Borrow the monitor for one step; scratch is released when the guard
    /// drops, on every exit path.
    pub fn scope(&mut self) -> ScratchScope<'_, T, P> {
        ScratchScope { monitor: self }
    }

    /// Current usage plus high-water marks.
    pub fn report(&mut self) -> MemoryReport {
        let reserved = self.probe.reserved();
        let allocated = self.probe.allocated();
        let total = self.probe.total();
        let report = MemoryReport {
            reserved,
            allocated,
            total,
            free: total.saturating_sub(reserved),
            max_reserved: self.max_reserved.max(reserved),
            max_allocated: self.max_allocated.max(allocated),
        };
        log::debug!(
            "memory: reserved {}B (max {}B), allocated {}B (max {}B), free {}B of {}B",
            report.reserved,
            report.max_reserved,
            report.allocated,
            report.max_allocated,
            report.free,
            report.total
        );
        report
    }

    /// Forget the high-water marks.
    pub fn reset_peaks(&mut self) {
        self.max_reserved = 0;
        self.max_allocated = 0;
    }

    pub fn probe_mut(&mut self) -> &mut P {
        &mut self.probe
    }
}

/// Drop guard around a `MemoryMonitor`; releases scratch on drop.
pub struct ScratchScope<'a, T, P: MemoryProbe> {
    monitor: &'a mut MemoryMonitor<T, P>,
}

impl<T, P: MemoryProbe> Deref for ScratchScope<'_, T, P> {
    type Target = MemoryMonitor<T, P>;

    fn deref(&self) -> &Self::Target {
        self.monitor
    }
}

impl<T, P: MemoryProbe> DerefMut for ScratchScope<'_, T, P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.monitor
    }
}

impl<T, P: MemoryProbe> Drop for ScratchScope<'_, T, P> {
    fn drop(&mut self) {
        self.monitor.release_all();
    }
}
