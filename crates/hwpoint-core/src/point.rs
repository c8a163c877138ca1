//! Logical requests and their hardware encodings.
//!
//! A [`HardwarePointRequest`] is what the debugger asks for. The encoder turns
//! it into one or more [`EncodedPoint`]s, each of which fits a single hardware
//! slot. Encoded points compare structurally: two equal points have the same
//! effect on the hardware, which is what lets the slot allocator share a slot
//! between them.

use std::fmt;

use crate::accel::Condition;
use crate::types::{AddrRange, Address};

/// What a hardware point traps on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointKind
{
    /// Instruction fetch (hardware breakpoint).
    Execute,
    /// Data read.
    Read,
    /// Data write.
    Write,
    /// Data read or write.
    Access,
}

impl PointKind
{
    /// Whether this kind occupies a watchpoint (data) slot.
    #[must_use]
    pub const fn is_watchpoint(self) -> bool
    {
        !matches!(self, PointKind::Execute)
    }

    /// The register bank points of this kind are installed in.
    #[must_use]
    pub const fn bank(self) -> RegisterBank
    {
        if self.is_watchpoint() {
            RegisterBank::Watchpoints
        } else {
            RegisterBank::Breakpoints
        }
    }
}

impl fmt::Display for PointKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            PointKind::Execute => "breakpoint",
            PointKind::Read => "read watchpoint",
            PointKind::Write => "write watchpoint",
            PointKind::Access => "access watchpoint",
        };
        f.write_str(name)
    }
}

/// The two disjoint slot pools every interface exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterBank
{
    /// Instruction breakpoint registers.
    Breakpoints,
    /// Data watchpoint registers.
    Watchpoints,
}

impl fmt::Display for RegisterBank
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            RegisterBank::Breakpoints => f.write_str("breakpoints"),
            RegisterBank::Watchpoints => f.write_str("watchpoints"),
        }
    }
}

/// A logical breakpoint/watchpoint request from the debugger
///
/// Created for a single insert or remove call and never stored. Removal must
/// pass a request equal to the one used for insertion.
///
/// ## Example
///
/// ```rust
/// use hwpoint_core::point::{HardwarePointRequest, PointKind};
/// use hwpoint_core::types::Address;
///
/// let request = HardwarePointRequest::watch(PointKind::Write, Address::new(0x1006), 4);
/// assert!(request.kind.is_watchpoint());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct HardwarePointRequest
{
    /// What to trap on.
    pub kind: PointKind,
    /// First address to trap on.
    pub address: Address,
    /// Number of bytes. For breakpoints, zero means "one instruction" and a
    /// non-zero length asks for a ranged breakpoint.
    pub length: u64,
    /// Size of the instruction a breakpoint traps on. Zero means the
    /// shortest instruction of the architecture.
    pub instruction_len: u64,
    /// Optional condition attached to a watchpoint.
    pub condition: Option<Condition>,
}

impl HardwarePointRequest
{
    /// Hardware breakpoint on a single instruction.
    #[must_use]
    pub fn breakpoint(address: Address) -> Self
    {
        Self {
            kind: PointKind::Execute,
            address,
            length: 0,
            instruction_len: 0,
            condition: None,
        }
    }

    /// Hardware breakpoint on an instruction of `instruction_len` bytes.
    ///
    /// AArch32 tracees use 4 for ARM instructions, 2 for Thumb and 3 for
    /// 32-bit Thumb-2 instructions.
    #[must_use]
    pub fn sized_breakpoint(address: Address, instruction_len: u64) -> Self
    {
        Self {
            instruction_len,
            ..Self::breakpoint(address)
        }
    }

    /// Hardware breakpoint covering `[address, address + length)`.
    #[must_use]
    pub fn ranged_breakpoint(address: Address, length: u64) -> Self
    {
        Self {
            kind: PointKind::Execute,
            address,
            length,
            instruction_len: 0,
            condition: None,
        }
    }

    /// Watchpoint covering `[address, address + length)`.
    #[must_use]
    pub fn watch(kind: PointKind, address: Address, length: u64) -> Self
    {
        Self {
            kind,
            address,
            length,
            instruction_len: 0,
            condition: None,
        }
    }

    /// Attach a condition (only used by the condition accelerator).
    #[must_use]
    pub fn with_condition(mut self, condition: Condition) -> Self
    {
        self.condition = Some(condition);
        self
    }

    /// The requested range.
    #[must_use]
    pub fn range(&self) -> AddrRange
    {
        AddrRange::from_len(self.address, self.length)
    }
}

/// AArch64 byte-address-select mask: which bytes of an 8-byte window trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteMask(u8);

impl ByteMask
{
    /// All eight bytes of the window.
    pub const FULL: Self = ByteMask(0xff);

    /// Wrap a raw mask value.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self
    {
        ByteMask(bits)
    }

    /// Mask selecting `len` bytes starting at byte `offset`.
    ///
    /// Returns `None` unless `1 <= len` and `offset + len <= 8`.
    ///
    /// ```rust
    /// use hwpoint_core::point::ByteMask;
    ///
    /// assert_eq!(ByteMask::new(6, 2).map(ByteMask::bits), Some(0xc0));
    /// assert!(ByteMask::new(7, 2).is_none());
    /// ```
    #[must_use]
    pub fn new(offset: u32, len: u32) -> Option<Self>
    {
        if len == 0 || offset + len > 8 {
            return None;
        }
        let ones = (1u16 << len) - 1;
        u8::try_from(ones << offset).ok().map(ByteMask)
    }

    /// The raw mask.
    #[must_use]
    pub const fn bits(self) -> u8
    {
        self.0
    }

    /// First selected byte (0..=7).
    #[must_use]
    pub const fn offset(self) -> u32
    {
        if self.0 == 0 {
            0
        } else {
            self.0.trailing_zeros()
        }
    }

    /// Number of selected bytes, or `None` if the selected bytes are not
    /// contiguous.
    #[must_use]
    pub const fn len(self) -> Option<u32>
    {
        let shifted = self.0 >> self.offset();
        let ones = shifted.trailing_ones();
        if ones < 8 && (shifted >> ones) != 0 {
            None
        } else {
            Some(ones)
        }
    }

    /// Whether no byte is selected.
    #[must_use]
    pub const fn is_empty(self) -> bool
    {
        self.0 == 0
    }
}

impl fmt::Display for ByteMask
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:02x}", self.0)
    }
}

/// How an encoded point matches addresses relative to its `address` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Span
{
    /// Selected bytes of the aligned window starting at `address`.
    Bytes(ByteMask),
    /// Exact match; the hardware watches the whole aligned window.
    Exact,
    /// `address <= a < end`.
    Range
    {
        /// Exclusive end of the range.
        end: Address
    },
    /// `a & mask == address & mask`.
    Masked
    {
        /// Address mask.
        mask: u64
    },
}

/// Contents of a hardware data value comparator (PowerPC DVC)
///
/// `byte_enables` selects which comparator bytes take part, numbered from the
/// least significant byte; `value` is positioned accordingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Comparator
{
    /// Bit `n` enables comparison of byte `n` (counting from the right).
    pub byte_enables: u8,
    /// Value loaded into the comparator register.
    pub value: u64,
}

/// One hardware slot's worth of a request
///
/// Every field takes part in equality, including `watched`: two requests
/// that round onto the same hardware window but cover different bytes keep
/// separate slots so trap addresses can be reported against the right one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodedPoint
{
    /// Trigger type.
    pub kind: PointKind,
    /// Address loaded into the value register (aligned where the hardware
    /// requires it).
    pub address: Address,
    /// How addresses are matched.
    pub span: Span,
    /// Hardware condition, if accelerated.
    pub condition: Option<Comparator>,
    /// Part of the original request this entry is responsible for.
    pub watched: AddrRange,
    /// Number of hardware registers the entry consumes (ranged and masked
    /// points take two on BookE).
    pub registers: u8,
}

impl EncodedPoint
{
    /// Number of slot units this point consumes.
    #[must_use]
    pub fn cost(&self) -> usize
    {
        usize::from(self.registers.max(1))
    }

    /// Addresses the hardware actually traps on, given the data window size.
    #[must_use]
    pub fn hardware_range(&self, window: u64) -> AddrRange
    {
        match self.span {
            Span::Bytes(mask) => {
                let start = self.address + u64::from(mask.offset());
                AddrRange::from_len(start, u64::from(mask.len().unwrap_or(8 - mask.offset())))
            }
            Span::Exact => AddrRange::from_len(self.address.align_down(window.max(1)), window.max(1)),
            Span::Range { end } => AddrRange {
                start: self.address,
                end,
            },
            Span::Masked { mask } => {
                let start = Address::new(self.address.value() & mask);
                AddrRange::from_len(start, (!mask).saturating_add(1))
            }
        }
    }
}

impl fmt::Display for EncodedPoint
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{} at {}", self.kind, self.address)?;
        match self.span {
            Span::Bytes(mask) => write!(f, " mask={mask}")?,
            Span::Exact => f.write_str(" exact")?,
            Span::Range { end } => write!(f, " range-end={end}")?,
            Span::Masked { mask } => write!(f, " addr-mask=0x{mask:x}")?,
        }
        if let Some(cmp) = self.condition {
            write!(f, " dvc=0x{:016x}/be=0x{:02x}", cmp.value, cmp.byte_enables)?;
        }
        write!(f, " (orig {})", self.watched)
    }
}
