//! # Debug Register Syscall Boundary
//!
//! The [`DebugRegisterInterface`] trait is everything the manager needs from
//! the operating system. The Linux implementation wraps ptrace; the simulated
//! implementation keeps the registers in memory for tests and the CLI.
//!
//! Two kernel styles sit behind the same trait:
//!
//! - **Register arrays** (AArch64): the whole bank is read and written as one
//!   block of `(address, control)` pairs.
//! - **Handles** (PowerPC hwdebug): each point is registered individually and
//!   the kernel returns an opaque slot number used to delete it later.
//!
//! A backend only has to implement the methods its kernel style uses; the
//! others are never called once capability probing picked an interface.

use std::fmt;

use smallvec::SmallVec;

use crate::arch::aarch64;
use crate::arch::powerpc::PpcDebugInfo;
use crate::error::KernelError;
use crate::point::{EncodedPoint, RegisterBank};
use crate::types::{Address, Architecture, ThreadId};

/// Result type of every syscall boundary operation.
pub type KernelResult<T> = std::result::Result<T, KernelError>;

/// Opaque kernel-assigned slot number of a handle-based registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle(pub i64);

impl fmt::Display for SlotHandle
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "#{}", self.0)
    }
}

/// Raw capability reply from the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugInfo
{
    /// AArch64 `dbg_info` words of the breakpoint and watchpoint banks.
    /// `None` means the register set query for that bank failed.
    Arm
    {
        /// `NT_ARM_HW_BREAK` info word.
        breakpoints: Option<u32>,
        /// `NT_ARM_HW_WATCH` info word.
        watchpoints: Option<u32>,
    },
    /// PowerPC `GETHWDBGINFO` reply.
    PowerPc(PpcDebugInfo),
}

/// One `(value, control)` register pair.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegisterPair
{
    /// Value register (aligned address).
    pub address: u64,
    /// Control register.
    pub control: u32,
}

impl RegisterPair
{
    /// Whether the pair is enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool
    {
        aarch64::is_enabled(self.control)
    }
}

/// Contents of one register bank, as transferred by `GETREGSET`/`SETREGSET`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegisterBlock
{
    /// The bank's `dbg_info` word (ignored on writes).
    pub info: u32,
    /// Register pairs, one per slot.
    pub pairs: SmallVec<[RegisterPair; aarch64::MAX_SLOTS]>,
}

impl RegisterBlock
{
    /// Block of `count` disabled pairs.
    #[must_use]
    pub fn disabled(count: usize) -> Self
    {
        Self {
            info: 0,
            pairs: std::iter::repeat_n(RegisterPair::default(), count).collect(),
        }
    }

    /// Enabled pairs with their slot index.
    pub fn enabled(&self) -> impl Iterator<Item = (usize, &RegisterPair)>
    {
        self.pairs.iter().enumerate().filter(|(_, pair)| pair.is_enabled())
    }
}

/// Why the thread last stopped, as far as hardware debug is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapInfo
{
    /// `SIGTRAP` with `TRAP_HWBKPT`.
    pub hardware: bool,
    /// Faulting data address (`si_addr`).
    pub address: Address,
    /// Kernel slot number of the triggering point (`si_errno` on PowerPC).
    pub slot_hint: Option<i64>,
}

/// Kernel debug register access for one traced process
///
/// Every operation targets a single thread; the manager is responsible for
/// repeating it across threads.
///
/// ## Error Codes
///
/// Implementations must map failures onto [`KernelError`] so the manager can
/// tell a rejected encoding (degrade) from a vanished handle (tolerate) and a
/// vanished thread (tolerate on exit).
pub trait DebugRegisterInterface
{
    /// Get the architecture of the traced process.
    fn architecture(&self) -> Architecture;

    /// Query hardware debug capabilities.
    ///
    /// ## Errors
    ///
    /// - `KernelError::NotSupported`: no debug register interface at all
    fn debug_info(&mut self, thread: ThreadId) -> KernelResult<DebugInfo>;

    /// Read a whole register bank (register-array kernels).
    fn read_debug_registers(&mut self, thread: ThreadId, bank: RegisterBank) -> KernelResult<RegisterBlock>;

    /// Write a whole register bank (register-array kernels).
    ///
    /// ## Errors
    ///
    /// - `KernelError::Rejected`: the kernel refused one of the control words
    fn write_debug_registers(&mut self, thread: ThreadId, bank: RegisterBank, block: &RegisterBlock)
    -> KernelResult<()>;

    /// Register one point (handle-based kernels).
    ///
    /// ## Returns
    ///
    /// The kernel's slot handle, needed to deregister the point.
    fn register_point(&mut self, thread: ThreadId, point: &EncodedPoint) -> KernelResult<SlotHandle>;

    /// Delete a registration (handle-based kernels).
    ///
    /// ## Errors
    ///
    /// - `KernelError::NotFound`: the kernel already dropped the point
    fn deregister_point(&mut self, thread: ThreadId, handle: SlotHandle) -> KernelResult<()>;

    /// Write the legacy single data breakpoint register. Writing zero clears
    /// it and doubles as a probe for its presence.
    fn write_legacy_register(&mut self, thread: ThreadId, value: u64) -> KernelResult<()>;

    /// Signal information of the thread's last stop.
    fn last_trap(&mut self, thread: ThreadId) -> KernelResult<Option<TrapInfo>>;

    /// Make sure `thread` is stopped before its registers are touched.
    ///
    /// The default does nothing, which is right for backends whose threads
    /// are always stopped while the debugger holds control.
    fn pause_for_update(&mut self, _thread: ThreadId) -> KernelResult<()>
    {
        Ok(())
    }
}
