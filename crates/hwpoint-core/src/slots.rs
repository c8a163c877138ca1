//! # Slot Allocation
//!
//! In-memory mirror of one thread's bank of debug register slots. The table
//! deduplicates structurally equal points into one slot with a reference
//! count, enforces the bank capacity and remembers kernel slot handles.
//!
//! Kernel interaction is injected as closures so the same table serves
//! handle-based kernels (register immediately), legacy kernels (write the
//! single register) and register-array kernels (no call, flush later).

use std::fmt;

use crate::arch::aarch64;
use crate::error::{HwPointError, Result};
use crate::kernel::{RegisterBlock, RegisterPair, SlotHandle};
use crate::point::{EncodedPoint, RegisterBank, Span};

/// One hardware slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Slot
{
    point: Option<EncodedPoint>,
    ref_count: u32,
    handle: Option<SlotHandle>,
}

impl Slot
{
    /// Whether the slot holds a point.
    #[must_use]
    pub fn is_occupied(&self) -> bool
    {
        self.point.is_some()
    }

    /// The installed point.
    #[must_use]
    pub fn point(&self) -> Option<&EncodedPoint>
    {
        self.point.as_ref()
    }

    /// Number of logical points sharing the slot (0 when free).
    #[must_use]
    pub fn ref_count(&self) -> u32
    {
        self.ref_count
    }

    /// Kernel handle of a handle-based registration.
    #[must_use]
    pub fn handle(&self) -> Option<SlotHandle>
    {
        self.handle
    }

    fn clear(&mut self)
    {
        *self = Slot::default();
    }
}

/// Outcome of [`SlotTable::insert_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insertion
{
    /// Slot index.
    pub index: usize,
    /// `true` if the slot was free before (the kernel was called).
    pub fresh: bool,
}

/// Outcome of [`SlotTable::remove_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal
{
    /// Slot index.
    pub index: usize,
    /// `true` if the slot became free (the kernel was called).
    pub freed: bool,
}

/// Fixed-capacity table of slots for one register bank
///
/// ## Invariants
///
/// - A slot's reference count is non-zero exactly when it is occupied.
/// - No two occupied slots hold equal points.
/// - The summed register cost of occupied slots never exceeds the capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotTable
{
    bank: RegisterBank,
    capacity: usize,
    slots: Vec<Slot>,
}

impl SlotTable
{
    /// Empty table with `capacity` registers.
    #[must_use]
    pub fn new(bank: RegisterBank, capacity: usize) -> Self
    {
        Self {
            bank,
            capacity,
            slots: vec![Slot::default(); capacity],
        }
    }

    /// Bank this table mirrors.
    #[must_use]
    pub fn bank(&self) -> RegisterBank
    {
        self.bank
    }

    /// Number of hardware registers.
    #[must_use]
    pub fn capacity(&self) -> usize
    {
        self.capacity
    }

    /// Registers consumed by occupied slots.
    #[must_use]
    pub fn used(&self) -> usize
    {
        self.occupied().map(|(_, slot)| slot.point.map_or(0, |p| p.cost())).sum()
    }

    /// Registers still free.
    #[must_use]
    pub fn free(&self) -> usize
    {
        self.capacity.saturating_sub(self.used())
    }

    /// Whether no slot is occupied.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.occupied().next().is_none()
    }

    /// Slot at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Slot>
    {
        self.slots.get(index)
    }

    /// Occupied slots with their index.
    pub fn occupied(&self) -> impl Iterator<Item = (usize, &Slot)>
    {
        self.slots.iter().enumerate().filter(|(_, slot)| slot.is_occupied())
    }

    /// Index of the slot holding `point`.
    #[must_use]
    pub fn find(&self, point: &EncodedPoint) -> Option<usize>
    {
        self.slots.iter().position(|slot| slot.point.as_ref() == Some(point))
    }

    /// Index of the occupied slot registered under `handle`.
    #[must_use]
    pub fn find_handle(&self, handle: SlotHandle) -> Option<usize>
    {
        self.slots.iter().position(|slot| slot.is_occupied() && slot.handle == Some(handle))
    }

    /// Number of occupied slots using a hardware comparator.
    #[must_use]
    pub fn conditions_in_use(&self) -> usize
    {
        self.occupied()
            .filter(|(_, slot)| slot.point.is_some_and(|p| p.condition.is_some()))
            .count()
    }

    /// Check that all of `points` fit at once.
    ///
    /// Points already installed cost nothing (they only gain a reference).
    ///
    /// ## Errors
    ///
    /// - `HwPointError::CapacityExceeded`: not enough free registers
    pub fn can_accept(&self, points: &[EncodedPoint]) -> Result<()>
    {
        let needed: usize = points
            .iter()
            .filter(|point| self.find(point).is_none())
            .map(EncodedPoint::cost)
            .sum();
        let available = self.free();
        if needed > available {
            let kind = points.first().map_or(crate::point::PointKind::Execute, |p| p.kind);
            return Err(HwPointError::CapacityExceeded {
                kind,
                needed,
                available,
            });
        }
        Ok(())
    }

    /// Install `point`, sharing an existing equal slot when possible.
    ///
    /// `register` runs only when a free slot is taken; it performs the
    /// kernel side of the insertion and returns the kernel handle, if any.
    /// If it fails the table is left unchanged.
    ///
    /// ## Errors
    ///
    /// - `HwPointError::CapacityExceeded`: no free slot
    /// - any error returned by `register`
    pub fn insert_with<F>(&mut self, point: &EncodedPoint, register: F) -> Result<Insertion>
    where
        F: FnOnce(&EncodedPoint) -> Result<Option<SlotHandle>>,
    {
        if let Some(index) = self.find(point) {
            self.slots[index].ref_count += 1;
            return Ok(Insertion { index, fresh: false });
        }

        let available = self.free();
        let index = self.slots.iter().position(|slot| !slot.is_occupied());
        let Some(index) = index.filter(|_| point.cost() <= available) else {
            return Err(HwPointError::CapacityExceeded {
                kind: point.kind,
                needed: point.cost(),
                available,
            });
        };

        let handle = register(point)?;
        self.slots[index] = Slot {
            point: Some(*point),
            ref_count: 1,
            handle,
        };
        Ok(Insertion { index, fresh: true })
    }

    /// Drop one reference to `point`.
    ///
    /// When the last reference goes, `deregister` receives the slot's kernel
    /// handle and performs the kernel side of the removal. If it fails the
    /// table is left unchanged.
    ///
    /// ## Errors
    ///
    /// - `HwPointError::PointNotFound`: no slot holds `point`
    /// - any error returned by `deregister`
    pub fn remove_with<F>(&mut self, point: &EncodedPoint, deregister: F) -> Result<Removal>
    where
        F: FnOnce(Option<SlotHandle>) -> Result<()>,
    {
        let Some(index) = self.find(point) else {
            return Err(HwPointError::PointNotFound {
                kind: point.kind,
                address: point.watched.start,
            });
        };

        let slot = &mut self.slots[index];
        if slot.ref_count > 1 {
            slot.ref_count -= 1;
            return Ok(Removal { index, freed: false });
        }

        deregister(slot.handle)?;
        slot.clear();
        Ok(Removal { index, freed: true })
    }

    /// Replace the kernel handle of slot `index`.
    pub fn set_handle(&mut self, index: usize, handle: Option<SlotHandle>)
    {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.handle = handle;
        }
    }

    /// Rewrite every occupied point with `rewrite` and merge entries that
    /// became equal.
    ///
    /// A merged entry adds its reference count to the earlier slot and frees
    /// its own. Returns the indices whose hardware contents changed.
    pub fn rewrite<F>(&mut self, mut rewrite: F) -> Vec<usize>
    where
        F: FnMut(&EncodedPoint) -> EncodedPoint,
    {
        let mut changed = Vec::new();
        for i in 0..self.slots.len() {
            let Some(current) = self.slots[i].point else {
                continue;
            };
            let updated = rewrite(&current);
            if updated == current {
                continue;
            }
            self.slots[i].point = Some(updated);

            let duplicate = (0..i).find(|j| self.slots[*j].point == Some(updated));
            if let Some(j) = duplicate {
                let refs = self.slots[i].ref_count;
                self.slots[j].ref_count += refs;
                self.slots[i].clear();
            }
            changed.push(i);
        }
        changed
    }

    /// Free every slot and hand back the kernel handles that were in use.
    pub fn release_all(&mut self) -> Vec<SlotHandle>
    {
        let handles = self.slots.iter().filter_map(|slot| slot.handle).collect();
        self.slots.iter_mut().for_each(Slot::clear);
        handles
    }

    /// Register contents for a register-array kernel.
    #[must_use]
    pub fn register_block(&self) -> RegisterBlock
    {
        RegisterBlock {
            info: 0,
            pairs: self.slots.iter().map(register_pair).collect(),
        }
    }
}

fn register_pair(slot: &Slot) -> RegisterPair
{
    match slot.point {
        Some(EncodedPoint {
            kind,
            address,
            span: Span::Bytes(mask),
            ..
        }) => RegisterPair {
            address: address.value(),
            control: aarch64::control_word(kind, mask),
        },
        _ => RegisterPair::default(),
    }
}

impl fmt::Display for SlotTable
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let prefix = match self.bank {
            RegisterBank::Breakpoints => "BP",
            RegisterBank::Watchpoints => "WP",
        };
        writeln!(f, "\t{}:", self.bank.to_string().to_uppercase())?;
        for (i, slot) in self.slots.iter().enumerate() {
            let pair = register_pair(slot);
            match slot.point {
                Some(point) => {
                    write!(
                        f,
                        "\t{prefix}{i}: addr={} (orig={}), ctrl=0x{:08x}, ref.count={}",
                        point.address, point.watched.start, pair.control, slot.ref_count
                    )?;
                    if let Some(handle) = slot.handle {
                        write!(f, ", handle={handle}")?;
                    }
                    writeln!(f, " [{point}]")?;
                }
                None => writeln!(f, "\t{prefix}{i}: free")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::point::{ByteMask, PointKind};
    use crate::types::{AddrRange, Address};

    fn watch(base: u64, mask: u8, start: u64, len: u64) -> EncodedPoint
    {
        EncodedPoint {
            kind: PointKind::Write,
            address: Address::new(base),
            span: Span::Bytes(ByteMask::from_bits(mask)),
            condition: None,
            watched: AddrRange::from_len(Address::new(start), len),
            registers: 1,
        }
    }

    #[test]
    fn test_register_failure_leaves_table_untouched()
    {
        let mut table = SlotTable::new(RegisterBank::Watchpoints, 2);
        let point = watch(0x1000, 0x0f, 0x1000, 4);
        let err = table.insert_with(&point, |_| Err(HwPointError::Unsupported("boom".to_string())));
        assert!(err.is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_unknown_point()
    {
        let mut table = SlotTable::new(RegisterBank::Watchpoints, 2);
        let point = watch(0x1000, 0x0f, 0x1000, 4);
        assert!(matches!(
            table.remove_with(&point, |_| Ok(())),
            Err(HwPointError::PointNotFound { .. })
        ));
    }

    #[test]
    fn test_rewrite_merges_duplicates()
    {
        let mut table = SlotTable::new(RegisterBank::Watchpoints, 4);
        let a = watch(0x1000, 0x03, 0x1000, 2);
        let b = watch(0x1000, 0x01, 0x1000, 2);
        table.insert_with(&a, |_| Ok(None)).unwrap();
        table.insert_with(&a, |_| Ok(None)).unwrap();
        table.insert_with(&b, |_| Ok(None)).unwrap();

        let changed = table.rewrite(|p| EncodedPoint {
            span: Span::Bytes(ByteMask::from_bits(0x03)),
            ..*p
        });
        assert_eq!(changed, vec![1]);
        assert_eq!(table.get(0).map(Slot::ref_count), Some(3));
        assert!(!table.get(1).is_some_and(Slot::is_occupied));
    }

    #[test]
    fn test_register_block_layout()
    {
        let mut table = SlotTable::new(RegisterBank::Watchpoints, 2);
        table.insert_with(&watch(0x1000, 0x0f, 0x1000, 4), |_| Ok(None)).unwrap();
        let block = table.register_block();
        assert_eq!(block.pairs.len(), 2);
        assert_eq!(block.pairs[0].address, 0x1000);
        assert_eq!(block.pairs[0].control, 0x1f5);
        assert_eq!(block.pairs[1], RegisterPair::default());
    }
}
