//! Instruction records shared between translation and execution

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Static description of one guest instruction
///
/// There is one record per distinct instruction address, not per
/// execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InsnRecord {
    /// Guest virtual address of the instruction
    pub vaddr: u64,
    /// Instruction length in bytes
    pub size: usize,
}

impl InsnRecord {
    /// Address of the instruction that follows this one in memory
    pub fn next_vaddr(&self) -> u64 {
        self.vaddr.wrapping_add(self.size as u64)
    }
}

/// Address-keyed map of instruction records
///
/// Written at translation time, possibly from several vCPU threads at once,
/// and read-mostly afterwards.
#[derive(Debug, Default)]
pub struct InsnTable {
    records: RwLock<HashMap<u64, Arc<InsnRecord>>>,
}

impl InsnTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the record for `vaddr`, inserting a new one if needed
    ///
    /// A record that already exists is returned unchanged even if `size`
    /// differs; the first translation wins.
    pub fn get_or_insert(&self, vaddr: u64, size: usize) -> Arc<InsnRecord> {
        if let Some(record) = self.get(vaddr) {
            return record;
        }

        self.records
            .write()
            .entry(vaddr)
            .or_insert_with(|| Arc::new(InsnRecord { vaddr, size }))
            .clone()
    }

    /// Record for `vaddr`, if it was ever translated
    pub fn get(&self, vaddr: u64) -> Option<Arc<InsnRecord>> {
        self.records.read().get(&vaddr).cloned()
    }

    /// Number of distinct instructions seen
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True when no instruction was recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_insert_dedups_by_address() {
        let table = InsnTable::new();
        let first = table.get_or_insert(0x1000, 4);
        let again = table.get_or_insert(0x1000, 2);

        assert!(Arc::ptr_eq(&first, &again), "Same address should share one record");
        assert_eq!(again.size, 4, "First translation should win");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_next_vaddr() {
        let record = InsnRecord { vaddr: 0x1000, size: 4 };
        assert_eq!(record.next_vaddr(), 0x1004);
    }

    #[test]
    fn test_get_unknown_address() {
        let table = InsnTable::new();
        assert!(table.is_empty());
        assert!(table.get(0xdead).is_none());
    }
}
