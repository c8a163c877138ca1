//! # AArch64 Debug Registers
//!
//! Bit layouts for the AArch64 hardware breakpoint (`DBGBCR`/`DBGBVR`) and
//! watchpoint (`DBGWCR`/`DBGWVR`) register pairs as exposed by Linux through
//! the `NT_ARM_HW_BREAK` and `NT_ARM_HW_WATCH` register sets.
//!
//! ## Control Word Layout
//!
//! ```text
//!  12      5 4  3 2  1 0
//! +---------+----+----+-+
//! |   BAS   |LSC |PMC |E|
//! +---------+----+----+-+
//! ```
//!
//! - `E`: enable bit
//! - `PMC`: privilege, always `0b10` (EL0 only)
//! - `LSC`: trigger (load/store control); unused (0) for breakpoints
//! - `BAS`: byte address select, one bit per byte of the 8-byte window
//!
//! The value register always holds an aligned address: 8 bytes for
//! watchpoints, 4 bytes for breakpoints (2 bytes for 32-bit compat tasks).

use tracing::warn;

use crate::point::{ByteMask, PointKind};

/// Maximum number of breakpoint or watchpoint register pairs.
pub const MAX_SLOTS: usize = 16;

/// Alignment of addresses in watchpoint value registers.
pub const WATCH_ALIGNMENT: u64 = 8;

/// Maximum bytes a single watchpoint register pair can cover.
pub const MAX_WATCH_LEN: u64 = 8;

/// Debug architecture versions accepted in the `dbg_info` word.
pub const DEBUG_ARCH_V8: u8 = 0x6;
/// ARMv8.1 debug architecture.
pub const DEBUG_ARCH_V8_1: u8 = 0x7;
/// ARMv8.2 debug architecture.
pub const DEBUG_ARCH_V8_2: u8 = 0x8;
/// ARMv8.4 debug architecture.
pub const DEBUG_ARCH_V8_4: u8 = 0x9;

const ENABLE: u32 = 1;
const PRIVILEGE_EL0: u32 = 2 << 1;
const TRIGGER_SHIFT: u32 = 3;
const MASK_SHIFT: u32 = 5;

/// Smallest length the restricted (pre-4.10) kernels accept for a watch of
/// `offset + len` bytes from the window base, indexed by `offset + len - 1`.
pub const RESTRICTED_LENGTHS: [u64; 8] = [1, 2, 4, 4, 8, 8, 8, 8];

/// Decoded `dbg_info` word of one register bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugInfoWord
{
    /// Debug architecture version (bits 8..15).
    pub debug_arch: u8,
    /// Number of register pairs (bits 0..7).
    pub slots: usize,
}

impl DebugInfoWord
{
    /// Split a raw `dbg_info` word.
    #[must_use]
    pub const fn parse(info: u32) -> Self
    {
        Self {
            debug_arch: ((info >> 8) & 0xff) as u8,
            slots: (info & 0xff) as usize,
        }
    }

    /// Whether the debug architecture is one this crate knows how to drive.
    #[must_use]
    pub const fn is_known_arch(&self) -> bool
    {
        matches!(
            self.debug_arch,
            DEBUG_ARCH_V8 | DEBUG_ARCH_V8_1 | DEBUG_ARCH_V8_2 | DEBUG_ARCH_V8_4
        )
    }
}

/// Number of usable register pairs reported by one bank's `dbg_info` word.
///
/// A missing word (the query failed) or an unknown debug architecture gives
/// zero slots. Counts above [`MAX_SLOTS`] are clamped.
pub fn usable_slots(info: Option<u32>, bank: &str) -> usize
{
    let Some(info) = info else {
        warn!("Unable to determine the number of hardware {} available", bank);
        return 0;
    };
    let word = DebugInfoWord::parse(info);
    if !word.is_known_arch() {
        warn!(
            "Unknown debug architecture 0x{:x} for hardware {}; disabling them",
            word.debug_arch, bank
        );
        return 0;
    }
    if word.slots > MAX_SLOTS {
        warn!(
            "Unexpected number of hardware {} registers reported by ptrace, got {}, expected {}",
            bank, word.slots, MAX_SLOTS
        );
        return MAX_SLOTS;
    }
    word.slots
}

/// Trigger (LSC) field value for a point kind.
#[must_use]
pub const fn trigger_bits(kind: PointKind) -> u32
{
    match kind {
        PointKind::Execute => 0,
        PointKind::Read => 1,
        PointKind::Write => 2,
        PointKind::Access => 3,
    }
}

/// Build an enabled control word.
///
/// ```rust
/// use hwpoint_core::arch::aarch64::control_word;
/// use hwpoint_core::point::{ByteMask, PointKind};
///
/// // Write watchpoint on the low four bytes of the window.
/// assert_eq!(control_word(PointKind::Write, ByteMask::from_bits(0x0f)), 0x1f5);
/// ```
#[must_use]
pub const fn control_word(kind: PointKind, mask: ByteMask) -> u32
{
    ((mask.bits() as u32) << MASK_SHIFT) | (trigger_bits(kind) << TRIGGER_SHIFT) | PRIVILEGE_EL0 | ENABLE
}

/// Whether the enable bit of a control word is set.
#[must_use]
pub const fn is_enabled(ctrl: u32) -> bool
{
    ctrl & ENABLE != 0
}

/// Byte address select field of a control word.
#[must_use]
pub const fn control_mask(ctrl: u32) -> ByteMask
{
    ByteMask::from_bits(((ctrl >> MASK_SHIFT) & 0xff) as u8)
}

/// Trigger kind of an enabled control word.
///
/// `is_watchpoint` selects the bank the word came from; breakpoint words
/// always decode to [`PointKind::Execute`].
#[must_use]
pub const fn control_kind(ctrl: u32, is_watchpoint: bool) -> Option<PointKind>
{
    if !is_watchpoint {
        return Some(PointKind::Execute);
    }
    match (ctrl >> TRIGGER_SHIFT) & 0x3 {
        1 => Some(PointKind::Read),
        2 => Some(PointKind::Write),
        3 => Some(PointKind::Access),
        _ => None,
    }
}

/// Byte mask for a breakpoint on an instruction of `instruction_len` bytes.
///
/// A 32-bit Thumb-2 instruction (length 3) only needs its first halfword.
#[must_use]
pub fn breakpoint_mask(instruction_len: u64) -> ByteMask
{
    match instruction_len {
        2 | 3 => ByteMask::from_bits(0x03),
        _ => ByteMask::from_bits(0x0f),
    }
}
