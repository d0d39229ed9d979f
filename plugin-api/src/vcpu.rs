//! Per-vCPU state table
//!
//! Maps a vCPU index to plugin-owned state. The set of vCPUs is not known
//! up front in user-mode emulation, so the table grows on demand as new
//! indices are observed.

use parking_lot::RwLock;
use std::sync::Arc;

/// Index of a virtual CPU as reported by the host runtime
pub type VcpuIndex = u32;

/// Growable table of per-vCPU state
///
/// Growth and construction of an entry happen under the write side of a
/// single reader/writer lock, so every entry is constructed exactly once.
/// Lookups only take the read side. Once constructed, an entry belongs to
/// the thread driving that vCPU; shared mutation inside `T` is the
/// caller's business (usually a `Mutex` that is never contended).
///
/// The table never shrinks.
#[derive(Debug)]
pub struct VcpuTable<T> {
    slots: RwLock<Vec<Option<Arc<T>>>>,
}

impl<T> VcpuTable<T> {
    /// Create an empty table
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create an empty table with room for `capacity` vCPUs
    ///
    /// In system emulation the host knows the maximum vCPU count, which
    /// avoids any growth at runtime.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: RwLock::new(Vec::with_capacity(capacity)),
        }
    }

    /// Return the entry for `index`, constructing it with `init` if absent
    ///
    /// Slots between the old length and `index` are left empty. Calling
    /// this with an index that already has an entry never reconstructs it,
    /// and `init` is not called.
    pub fn ensure(&self, index: VcpuIndex, init: impl FnOnce() -> T) -> Arc<T> {
        if let Some(entry) = self.lookup(index) {
            return entry;
        }

        let slot = index as usize;
        let mut slots = self.slots.write();
        if slot >= slots.len() {
            tracing::debug!("Growing vCPU table from {} to {} slots", slots.len(), slot + 1);
            slots.resize_with(slot + 1, || None);
        }

        slots[slot].get_or_insert_with(|| Arc::new(init())).clone()
    }

    /// Read-only fast path
    ///
    /// Returns `None` when `index` was never passed to `ensure`.
    pub fn lookup(&self, index: VcpuIndex) -> Option<Arc<T>> {
        self.slots.read().get(index as usize).and_then(|slot| slot.clone())
    }

    /// Number of slots, constructed or not
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// True when no slot has been allocated yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Constructed entries with their index, in index order
    pub fn entries(&self) -> Vec<(VcpuIndex, Arc<T>)> {
        self.slots
            .read()
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.clone().map(|entry| (index as VcpuIndex, entry)))
            .collect()
    }
}

impl<T> Default for VcpuTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
