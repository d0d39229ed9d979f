//! Per-vCPU counters updated inline by the host runtime

use crate::vcpu::{VcpuIndex, VcpuTable};
use std::sync::atomic::{AtomicU64, Ordering};

/// One `u64` counter per vCPU
///
/// Plugins hand a scoreboard to the runtime at translation time together
/// with an [`InlineOp`](crate::api::InlineOp); the runtime then updates the
/// counter on every execution without calling back into the plugin.
/// Conditional callbacks compare the same counter against an immediate.
///
/// Each counter is only ever written by its own vCPU's thread, so relaxed
/// atomics are sufficient.
#[derive(Debug, Default)]
pub struct Scoreboard {
    counters: VcpuTable<AtomicU64>,
}

impl Scoreboard {
    /// Create an empty scoreboard
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value for `vcpu` (zero if never touched)
    pub fn get(&self, vcpu: VcpuIndex) -> u64 {
        self.counters
            .lookup(vcpu)
            .map_or(0, |counter| counter.load(Ordering::Relaxed))
    }

    /// Add `value` to the counter of `vcpu` and return the new value
    pub fn add(&self, vcpu: VcpuIndex, value: u64) -> u64 {
        let counter = self.counters.ensure(vcpu, || AtomicU64::new(0));
        counter.fetch_add(value, Ordering::Relaxed).wrapping_add(value)
    }

    /// Overwrite the counter of `vcpu`
    pub fn store(&self, vcpu: VcpuIndex, value: u64) {
        self.counters
            .ensure(vcpu, || AtomicU64::new(0))
            .store(value, Ordering::Relaxed);
    }

    /// Sum over all vCPUs
    pub fn sum(&self) -> u64 {
        self.counters
            .entries()
            .iter()
            .map(|(_, counter)| counter.load(Ordering::Relaxed))
            .sum()
    }
}
