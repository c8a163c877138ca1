//! Thread and architecture identifiers.

use std::fmt;

/// Kernel thread identifier (the LWP id ptrace operates on)
///
/// Hardware debug registers belong to threads, not processes, so every
/// kernel interaction in this crate is keyed by a `ThreadId`.
///
/// ## Example
///
/// ```rust
/// use hwpoint_core::types::ThreadId;
///
/// let thread = ThreadId::from(4242);
/// assert_eq!(thread.raw(), 4242);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub i32);

impl ThreadId
{
    /// Get the raw `pid_t` value.
    pub fn raw(&self) -> i32
    {
        self.0
    }
}

impl From<i32> for ThreadId
{
    fn from(value: i32) -> Self
    {
        Self(value)
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// CPU architecture of the debugged process
///
/// Only the register-constrained targets this crate manages are listed. The
/// variant decides which kernel interface the prober expects and which
/// alignment rules apply to breakpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture
{
    /// 64-bit ARM process (A64 instructions, 4-byte breakpoint alignment).
    AArch64,
    /// 32-bit ARM process on an AArch64 kernel (Thumb code may be 2-byte aligned).
    AArch32,
    /// Server-class PowerPC (DABR/DAWR based).
    PowerPc,
    /// Embedded PowerPC with the BookE debug facility (DAC/IAC/DVC registers).
    PowerPcBookE,
}

impl Architecture
{
    /// Whether the process runs on an ARM kernel (`NT_ARM_HW_*` register sets).
    #[must_use]
    pub const fn is_arm(self) -> bool
    {
        matches!(self, Architecture::AArch64 | Architecture::AArch32)
    }

    /// Whether the process runs on a PowerPC kernel.
    #[must_use]
    pub const fn is_powerpc(self) -> bool
    {
        matches!(self, Architecture::PowerPc | Architecture::PowerPcBookE)
    }

    /// Whether the processor advertises the BookE feature bit in its hwcaps.
    #[must_use]
    pub const fn is_booke(self) -> bool
    {
        matches!(self, Architecture::PowerPcBookE)
    }

    /// Required alignment of hardware breakpoint addresses.
    #[must_use]
    pub const fn breakpoint_alignment(self) -> u64
    {
        match self {
            Architecture::AArch32 => 2,
            _ => 4,
        }
    }
}

impl fmt::Display for Architecture
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            Architecture::AArch64 => "aarch64",
            Architecture::AArch32 => "aarch32",
            Architecture::PowerPc => "powerpc",
            Architecture::PowerPcBookE => "powerpc-booke",
        };
        f.write_str(name)
    }
}
