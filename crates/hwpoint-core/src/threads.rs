//! Per-thread mirrors of the debug register banks.

use std::fmt;

use crate::capability::CapabilitySet;
use crate::point::RegisterBank;
use crate::slots::SlotTable;
use crate::types::ThreadId;

/// Debug register state of one thread
///
/// Holds both banks plus, for register-array kernels, a bitmap per bank of
/// slots changed since the bank was last written to the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPointSet
{
    tid: ThreadId,
    breakpoints: SlotTable,
    watchpoints: SlotTable,
    dirty_breakpoints: u64,
    dirty_watchpoints: u64,
}

impl ThreadPointSet
{
    /// Empty set sized by the capability set.
    #[must_use]
    pub fn new(tid: ThreadId, caps: &CapabilitySet) -> Self
    {
        Self {
            tid,
            breakpoints: SlotTable::new(RegisterBank::Breakpoints, caps.breakpoint_slots),
            watchpoints: SlotTable::new(RegisterBank::Watchpoints, caps.watchpoint_slots),
            dirty_breakpoints: 0,
            dirty_watchpoints: 0,
        }
    }

    /// Copy of `other`'s slots for a different thread. Kernel handles are
    /// kept; they belong to `other` until replaced.
    #[must_use]
    pub fn inherit(tid: ThreadId, other: &ThreadPointSet) -> Self
    {
        Self {
            tid,
            dirty_breakpoints: 0,
            dirty_watchpoints: 0,
            ..other.clone()
        }
    }

    /// Thread the set belongs to.
    #[must_use]
    pub fn tid(&self) -> ThreadId
    {
        self.tid
    }

    /// Slot table of a bank.
    #[must_use]
    pub fn table(&self, bank: RegisterBank) -> &SlotTable
    {
        match bank {
            RegisterBank::Breakpoints => &self.breakpoints,
            RegisterBank::Watchpoints => &self.watchpoints,
        }
    }

    /// Mutable slot table of a bank.
    pub fn table_mut(&mut self, bank: RegisterBank) -> &mut SlotTable
    {
        match bank {
            RegisterBank::Breakpoints => &mut self.breakpoints,
            RegisterBank::Watchpoints => &mut self.watchpoints,
        }
    }

    /// Whether any slot of either bank is occupied.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.breakpoints.is_empty() && self.watchpoints.is_empty()
    }

    /// Record that slot `index` of `bank` must be rewritten.
    pub fn mark_dirty(&mut self, bank: RegisterBank, index: usize)
    {
        let bit = 1u64.checked_shl(u32::try_from(index).unwrap_or(u32::MAX)).unwrap_or(0);
        match bank {
            RegisterBank::Breakpoints => self.dirty_breakpoints |= bit,
            RegisterBank::Watchpoints => self.dirty_watchpoints |= bit,
        }
    }

    /// Record that every slot of both banks must be rewritten.
    pub fn mark_all_dirty(&mut self)
    {
        self.dirty_breakpoints = low_bits(self.breakpoints.capacity());
        self.dirty_watchpoints = low_bits(self.watchpoints.capacity());
    }

    /// Dirty bitmap of a bank.
    #[must_use]
    pub fn dirty(&self, bank: RegisterBank) -> u64
    {
        match bank {
            RegisterBank::Breakpoints => self.dirty_breakpoints,
            RegisterBank::Watchpoints => self.dirty_watchpoints,
        }
    }

    /// Forget pending changes of a bank (after a successful write).
    pub fn clear_dirty(&mut self, bank: RegisterBank)
    {
        match bank {
            RegisterBank::Breakpoints => self.dirty_breakpoints = 0,
            RegisterBank::Watchpoints => self.dirty_watchpoints = 0,
        }
    }
}

fn low_bits(count: usize) -> u64
{
    if count >= 64 { u64::MAX } else { (1u64 << count) - 1 }
}

impl fmt::Display for ThreadPointSet
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        writeln!(
            f,
            "thread {} (dirty bp=0x{:x}, wp=0x{:x}):",
            self.tid, self.dirty_breakpoints, self.dirty_watchpoints
        )?;
        write!(f, "{}{}", self.breakpoints, self.watchpoints)
    }
}

/// Ordered collection of thread point sets
///
/// Sets are kept in creation order; the last one is the most recently
/// created and serves as the template for new threads.
#[derive(Debug, Clone, Default)]
pub struct ThreadSets
{
    sets: Vec<ThreadPointSet>,
}

impl ThreadSets
{
    /// Empty collection.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Set of `tid`, if one exists.
    #[must_use]
    pub fn get(&self, tid: ThreadId) -> Option<&ThreadPointSet>
    {
        self.sets.iter().find(|set| set.tid == tid)
    }

    /// Mutable set of `tid`, if one exists.
    pub fn get_mut(&mut self, tid: ThreadId) -> Option<&mut ThreadPointSet>
    {
        self.sets.iter_mut().find(|set| set.tid == tid)
    }

    /// Set of `tid`, created empty on first use.
    pub fn get_or_create(&mut self, tid: ThreadId, caps: &CapabilitySet) -> &mut ThreadPointSet
    {
        let index = match self.sets.iter().position(|set| set.tid == tid) {
            Some(index) => index,
            None => {
                self.sets.push(ThreadPointSet::new(tid, caps));
                self.sets.len() - 1
            }
        };
        &mut self.sets[index]
    }

    /// The most recently created set.
    #[must_use]
    pub fn last(&self) -> Option<&ThreadPointSet>
    {
        self.sets.last()
    }

    /// Add a fully built set, replacing any previous set of the same thread.
    pub fn insert(&mut self, set: ThreadPointSet)
    {
        self.sets.retain(|existing| existing.tid != set.tid);
        self.sets.push(set);
    }

    /// Remove and return the set of `tid`.
    pub fn remove(&mut self, tid: ThreadId) -> Option<ThreadPointSet>
    {
        let index = self.sets.iter().position(|set| set.tid == tid)?;
        Some(self.sets.remove(index))
    }

    /// All sets, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ThreadPointSet>
    {
        self.sets.iter()
    }

    /// All sets, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ThreadPointSet>
    {
        self.sets.iter_mut()
    }

    /// Number of sets.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.sets.len()
    }

    /// Whether there are no sets.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.sets.is_empty()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::types::Architecture;

    #[test]
    fn test_get_or_create_is_lazy_and_ordered()
    {
        let caps = CapabilitySet::aarch64(Architecture::AArch64, Some(0x0602), Some(0x0604));
        let mut sets = ThreadSets::new();
        assert!(sets.get(ThreadId(1)).is_none());
        sets.get_or_create(ThreadId(1), &caps);
        sets.get_or_create(ThreadId(2), &caps);
        sets.get_or_create(ThreadId(1), &caps);
        assert_eq!(sets.len(), 2);
        assert_eq!(sets.last().map(ThreadPointSet::tid), Some(ThreadId(2)));
    }

    #[test]
    fn test_mark_all_dirty_covers_capacity()
    {
        let caps = CapabilitySet::aarch64(Architecture::AArch64, Some(0x0602), Some(0x0604));
        let mut set = ThreadPointSet::new(ThreadId(1), &caps);
        set.mark_all_dirty();
        assert_eq!(set.dirty(RegisterBank::Breakpoints), 0b11);
        assert_eq!(set.dirty(RegisterBank::Watchpoints), 0b1111);
        set.clear_dirty(RegisterBank::Watchpoints);
        assert_eq!(set.dirty(RegisterBank::Watchpoints), 0);
    }
}
