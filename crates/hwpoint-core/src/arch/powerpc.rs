//! # PowerPC Debug Facilities
//!
//! Kernel ABI structures of the PowerPC `PPC_PTRACE_*HWDEBUG` interface and
//! the legacy single-register (`DABR`) interface.
//!
//! The hwdebug interface is handle based: each `SETHWDEBUG` request hands the
//! kernel a [`PpcHwBreakpoint`] descriptor and gets back an opaque slot
//! number, which is later passed to `DELHWDEBUG`. The kernel picks the actual
//! registers (IAC/DAC/DVC on BookE, DAWR on server processors).

use crate::point::{Comparator, EncodedPoint, PointKind, Span};
use crate::types::Address;

/// Descriptor version understood by every kernel with the interface.
pub const DEBUG_CURRENT_VERSION: u32 = 1;

/// `features` bit: instruction breakpoints can cover a range.
pub const FEATURE_INSN_BP_RANGE: u64 = 0x1;
/// `features` bit: instruction breakpoints can use a mask.
pub const FEATURE_INSN_BP_MASK: u64 = 0x2;
/// `features` bit: data breakpoints can cover a range.
pub const FEATURE_DATA_BP_RANGE: u64 = 0x4;
/// `features` bit: data breakpoints can use a mask.
pub const FEATURE_DATA_BP_MASK: u64 = 0x8;
/// `features` bit: the DAWR register (512-byte windows) is available.
pub const FEATURE_DATA_BP_DAWR: u64 = 0x10;

/// Trigger on instruction execution.
pub const TRIGGER_EXECUTE: u32 = 0x1;
/// Trigger on data reads.
pub const TRIGGER_READ: u32 = 0x2;
/// Trigger on data writes.
pub const TRIGGER_WRITE: u32 = 0x4;
/// Trigger on reads and writes.
pub const TRIGGER_RW: u32 = TRIGGER_READ | TRIGGER_WRITE;

/// Match exactly `addr`.
pub const MODE_EXACT: u32 = 0x0;
/// Match `addr <= a < addr2`.
pub const MODE_RANGE_INCLUSIVE: u32 = 0x1;
/// Match `a & addr2 == addr`.
pub const MODE_MASK: u32 = 0x3;

/// No data value condition.
pub const CONDITION_NONE: u32 = 0x0;
/// All enabled comparator bytes must match.
pub const CONDITION_AND: u32 = 0x1;

/// Maximum number of comparator bytes (the DVC register is 64 bits wide).
pub const MAX_CONDITION_BYTES: u64 = 8;

/// Condition-mode bit enabling comparison of byte `n` (counted from the
/// right).
#[must_use]
pub const fn condition_byte_enable(n: u32) -> u32
{
    1 << (n + 16)
}

/// Kernel reply to `PPC_PTRACE_GETHWDBGINFO`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PpcDebugInfo
{
    /// Interface version.
    pub version: u32,
    /// Number of instruction breakpoint registers.
    pub num_instruction_bps: u32,
    /// Number of data breakpoint registers.
    pub num_data_bps: u32,
    /// Number of data value compare registers.
    pub num_condition_regs: u32,
    /// Required data breakpoint alignment (0 = none).
    pub data_bp_alignment: u32,
    /// Width of a data value compare register in bytes.
    pub sizeof_condition: u32,
    /// `FEATURE_*` bits.
    pub features: u64,
}

/// Descriptor passed to `PPC_PTRACE_SETHWDEBUG`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PpcHwBreakpoint
{
    /// Always [`DEBUG_CURRENT_VERSION`].
    pub version: u32,
    /// `TRIGGER_*` value.
    pub trigger_type: u32,
    /// `MODE_*` value.
    pub addr_mode: u32,
    /// `CONDITION_*` value plus byte enables.
    pub condition_mode: u32,
    /// Start address.
    pub addr: u64,
    /// Range end (exclusive) or address mask.
    pub addr2: u64,
    /// Data value compare contents.
    pub condition_value: u64,
}

/// `TRIGGER_*` value for a point kind.
#[must_use]
pub const fn trigger_type(kind: PointKind) -> u32
{
    match kind {
        PointKind::Execute => TRIGGER_EXECUTE,
        PointKind::Read => TRIGGER_READ,
        PointKind::Write => TRIGGER_WRITE,
        PointKind::Access => TRIGGER_RW,
    }
}

impl From<&EncodedPoint> for PpcHwBreakpoint
{
    fn from(point: &EncodedPoint) -> Self
    {
        let (addr_mode, addr2) = match point.span {
            Span::Range { end } => (MODE_RANGE_INCLUSIVE, end.value()),
            Span::Masked { mask } => (MODE_MASK, mask),
            Span::Exact | Span::Bytes(_) => (MODE_EXACT, 0),
        };
        let (condition_mode, condition_value) = match point.condition {
            Some(cmp) => (condition_mode(cmp.byte_enables), cmp.value),
            None => (CONDITION_NONE, 0),
        };
        Self {
            version: DEBUG_CURRENT_VERSION,
            trigger_type: trigger_type(point.kind),
            addr_mode,
            condition_mode,
            addr: point.address.value(),
            addr2,
            condition_value,
        }
    }
}

fn condition_mode(byte_enables: u8) -> u32
{
    (0..8u32)
        .filter(|bit| byte_enables & (1 << bit) != 0)
        .fold(CONDITION_AND, |mode, bit| mode | condition_byte_enable(bit))
}

/// Read/write flag encoding of the legacy `PTRACE_SET_DEBUGREG` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DabrFlags
{
    /// Flag for read accesses.
    pub read: u64,
    /// Flag for write accesses.
    pub write: u64,
}

impl DabrFlags
{
    /// Flags for the processor family. Server processors also need the
    /// breakpoint translation bit.
    #[must_use]
    pub const fn for_processor(booke: bool) -> Self
    {
        if booke {
            Self { read: 1, write: 2 }
        } else {
            Self { read: 5, write: 6 }
        }
    }
}

/// Legacy `DABR` register value watching `address` for `kind`.
///
/// ```rust
/// use hwpoint_core::arch::powerpc::dabr_value;
/// use hwpoint_core::point::PointKind;
/// use hwpoint_core::types::Address;
///
/// assert_eq!(dabr_value(Address::new(0x1000), PointKind::Write, false), 0x1006);
/// assert_eq!(dabr_value(Address::new(0x1000), PointKind::Access, true), 0x1003);
/// ```
#[must_use]
pub fn dabr_value(address: Address, kind: PointKind, booke: bool) -> u64
{
    let flags = DabrFlags::for_processor(booke);
    let base = address.value() & !(flags.read | flags.write);
    match kind {
        PointKind::Read => base | flags.read,
        PointKind::Write => base | flags.write,
        PointKind::Access => base | flags.read | flags.write,
        PointKind::Execute => base,
    }
}

/// Position a comparison value inside the data value compare register
///
/// The comparator looks at a `width`-byte window aligned to `width`. Only the
/// bytes of `[address, address + len)` that fall inside the window containing
/// `address` are enabled; bytes are numbered from the right.
///
/// ## Example
///
/// A 2-byte value at offset 2 of a 4-byte comparator lands in the low half:
///
/// ```rust
/// use hwpoint_core::arch::powerpc::calculate_dvc;
/// use hwpoint_core::types::Address;
///
/// let cmp = calculate_dvc(Address::new(0x1002), 2, 0xbeef, 4);
/// assert_eq!(cmp.byte_enables, 0b0011);
/// assert_eq!(cmp.value, 0xbeef);
/// ```
#[must_use]
pub fn calculate_dvc(address: Address, len: u64, data_value: u64, width: u64) -> Comparator
{
    let width = width.max(1);
    let align_offset = address.value() % width;
    let end_data = address.value().saturating_add(len);
    let end_dvc = address.value() - align_offset + width;

    let bytes_off_dvc = end_data.saturating_sub(end_dvc);
    let enabled = len - bytes_off_dvc;
    let rightmost = end_dvc.saturating_sub(end_data);

    let byte_enables = (0..enabled)
        .map(|i| i + rightmost)
        .filter(|bit| *bit < 8)
        .fold(0u8, |acc, bit| acc | (1 << bit));

    let value = data_value
        .checked_shr(u32::try_from(bytes_off_dvc * 8).unwrap_or(u32::MAX))
        .unwrap_or(0)
        .checked_shl(u32::try_from(rightmost * 8).unwrap_or(u32::MAX))
        .unwrap_or(0);

    Comparator { byte_enables, value }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::types::AddrRange;

    #[test]
    fn test_descriptor_for_range_watchpoint()
    {
        let point = EncodedPoint {
            kind: PointKind::Access,
            address: Address::new(0x2000),
            span: Span::Range {
                end: Address::new(0x2010),
            },
            condition: None,
            watched: AddrRange::from_len(Address::new(0x2000), 0x10),
            registers: 2,
        };
        let desc = PpcHwBreakpoint::from(&point);
        assert_eq!(desc.version, DEBUG_CURRENT_VERSION);
        assert_eq!(desc.trigger_type, TRIGGER_RW);
        assert_eq!(desc.addr_mode, MODE_RANGE_INCLUSIVE);
        assert_eq!(desc.addr, 0x2000);
        assert_eq!(desc.addr2, 0x2010);
        assert_eq!(desc.condition_mode, CONDITION_NONE);
    }

    #[test]
    fn test_descriptor_condition_bits()
    {
        let point = EncodedPoint {
            kind: PointKind::Write,
            address: Address::new(0x3004),
            span: Span::Exact,
            condition: Some(Comparator {
                byte_enables: 0b1111,
                value: 42,
            }),
            watched: AddrRange::from_len(Address::new(0x3004), 4),
            registers: 1,
        };
        let desc = PpcHwBreakpoint::from(&point);
        assert_eq!(desc.condition_mode, 0x000f_0001);
        assert_eq!(desc.condition_value, 42);
    }

    #[test]
    fn test_dvc_value_straddling_window()
    {
        // 4 bytes at offset 6 of an 8-byte comparator: only the first two
        // bytes fall inside the window.
        let cmp = calculate_dvc(Address::new(0x1006), 4, 0x1122_3344, 8);
        assert_eq!(cmp.byte_enables, 0b0000_0011);
        assert_eq!(cmp.value, 0x1122);
    }

    #[test]
    fn test_dvc_value_aligned_word()
    {
        let cmp = calculate_dvc(Address::new(0x1000), 4, 7, 8);
        assert_eq!(cmp.byte_enables, 0b1111_0000);
        assert_eq!(cmp.value, 7 << 32);
    }
}
