//! # Linux ptrace Backend
//!
//! [`DebugRegisterInterface`] on top of `ptrace(2)`.
//!
//! ## Requests Used
//!
//! - **AArch64**: `PTRACE_GETREGSET`/`PTRACE_SETREGSET` with the
//!   `NT_ARM_HW_BREAK` and `NT_ARM_HW_WATCH` register sets
//! - **PowerPC**: `PPC_PTRACE_GETHWDBGINFO`, `PPC_PTRACE_SETHWDEBUG`,
//!   `PPC_PTRACE_DELHWDEBUG`, and `PTRACE_SET_DEBUGREG` for the legacy DABR
//! - **Both**: `PTRACE_GETSIGINFO` to classify the last stop
//!
//! Threads must already be ptrace-stopped by the caller; the default
//! `pause_for_update` is kept.
//!
//! ## References
//!
//! - [ptrace(2) man page](https://man7.org/linux/man-pages/man2/ptrace.2.html)
//! - `Documentation/powerpc/ptrace.rst` in the Linux source tree

use std::io;
use std::mem::{self, MaybeUninit};
use std::ptr;

use libc::{c_long, c_uint, c_void, PTRACE_GETREGSET, PTRACE_GETSIGINFO, PTRACE_SETREGSET, TRAP_HWBKPT};
use tracing::trace;

use crate::arch::aarch64;
use crate::arch::powerpc::{PpcDebugInfo, PpcHwBreakpoint};
use crate::error::KernelError;
use crate::kernel::{DebugInfo, DebugRegisterInterface, KernelResult, RegisterBlock, RegisterPair, SlotHandle, TrapInfo};
use crate::point::{EncodedPoint, RegisterBank};
use crate::types::{Address, Architecture, ThreadId};

// Not exported by libc: asm/ptrace.h (powerpc) and linux/elf.h.
const PTRACE_SET_DEBUGREG: c_uint = 26;
const PPC_PTRACE_DELHWDEBUG: c_uint = 0x87;
const PPC_PTRACE_SETHWDEBUG: c_uint = 0x88;
const PPC_PTRACE_GETHWDBGINFO: c_uint = 0x89;

const NT_ARM_HW_BREAK: usize = 0x402;
const NT_ARM_HW_WATCH: usize = 0x403;

/// `struct user_hwdebug_state` register pair.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct UserHwdebugReg
{
    addr: u64,
    ctrl: u32,
    pad: u32,
}

/// `struct user_hwdebug_state`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct UserHwdebugState
{
    dbg_info: u32,
    pad: u32,
    dbg_regs: [UserHwdebugReg; aarch64::MAX_SLOTS],
}

const fn regset(bank: RegisterBank) -> usize
{
    match bank {
        RegisterBank::Breakpoints => NT_ARM_HW_BREAK,
        RegisterBank::Watchpoints => NT_ARM_HW_WATCH,
    }
}

/// Issue one ptrace request and map a failure to [`KernelError`].
///
/// ## Safety
///
/// `addr` and `data` must be valid for what `request` does with them.
unsafe fn ptrace(request: c_uint, tid: ThreadId, addr: *mut c_void, data: *mut c_void) -> KernelResult<c_long>
{
    *libc::__errno_location() = 0;
    let ret = libc::ptrace(request, tid.raw(), addr, data);
    if ret == -1 {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno != 0 {
            trace!("ptrace(0x{:x}) on thread {} failed: errno {}", request, tid, errno);
            return Err(KernelError::from_errno(errno));
        }
    }
    Ok(ret)
}

/// ptrace-based debug register access for the running architecture
///
/// ## Example
///
/// ```rust,no_run
/// use hwpoint_core::config::ManagerConfig;
/// use hwpoint_core::manager::HwPointManager;
/// use hwpoint_core::platform::linux::PtraceInterface;
/// use hwpoint_core::types::ThreadId;
///
/// let kernel = PtraceInterface::native();
/// let mut manager = HwPointManager::new(kernel, ThreadId(1234), ManagerConfig::default());
/// println!("{}", manager.capabilities());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct PtraceInterface
{
    architecture: Architecture,
}

impl PtraceInterface
{
    /// Interface for a tracee of the given architecture.
    #[must_use]
    pub fn new(architecture: Architecture) -> Self
    {
        Self { architecture }
    }

    /// Interface for a tracee of the debugger's own architecture.
    #[must_use]
    pub fn native() -> Self
    {
        #[cfg(target_arch = "aarch64")]
        let architecture = Architecture::AArch64;
        #[cfg(target_arch = "powerpc64")]
        let architecture = Architecture::PowerPc;
        Self { architecture }
    }

    fn read_state(tid: ThreadId, bank: RegisterBank) -> KernelResult<UserHwdebugState>
    {
        let mut state = UserHwdebugState::default();
        let mut iov = libc::iovec {
            iov_base: ptr::addr_of_mut!(state).cast(),
            iov_len: mem::size_of::<UserHwdebugState>(),
        };
        // SAFETY: iov describes a live, correctly sized user_hwdebug_state.
        unsafe {
            ptrace(
                PTRACE_GETREGSET,
                tid,
                regset(bank) as *mut c_void,
                ptr::addr_of_mut!(iov).cast(),
            )?;
        }
        Ok(state)
    }
}

impl DebugRegisterInterface for PtraceInterface
{
    fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    fn debug_info(&mut self, thread: ThreadId) -> KernelResult<DebugInfo>
    {
        if self.architecture.is_arm() {
            let breakpoints = Self::read_state(thread, RegisterBank::Breakpoints).ok().map(|s| s.dbg_info);
            let watchpoints = Self::read_state(thread, RegisterBank::Watchpoints).ok().map(|s| s.dbg_info);
            return Ok(DebugInfo::Arm {
                breakpoints,
                watchpoints,
            });
        }

        let mut info = PpcDebugInfo::default();
        // SAFETY: the kernel fills a struct ppc_debug_info, which PpcDebugInfo mirrors.
        unsafe {
            ptrace(
                PPC_PTRACE_GETHWDBGINFO,
                thread,
                ptr::null_mut(),
                ptr::addr_of_mut!(info).cast(),
            )?;
        }
        Ok(DebugInfo::PowerPc(info))
    }

    fn read_debug_registers(&mut self, thread: ThreadId, bank: RegisterBank) -> KernelResult<RegisterBlock>
    {
        let state = Self::read_state(thread, bank)?;
        let count = aarch64::DebugInfoWord::parse(state.dbg_info).slots.min(aarch64::MAX_SLOTS);
        Ok(RegisterBlock {
            info: state.dbg_info,
            pairs: state.dbg_regs[..count]
                .iter()
                .map(|reg| RegisterPair {
                    address: reg.addr,
                    control: reg.ctrl,
                })
                .collect(),
        })
    }

    fn write_debug_registers(&mut self, thread: ThreadId, bank: RegisterBank, block: &RegisterBlock)
    -> KernelResult<()>
    {
        let count = block.pairs.len().min(aarch64::MAX_SLOTS);
        let mut state = UserHwdebugState::default();
        for (reg, pair) in state.dbg_regs.iter_mut().zip(&block.pairs) {
            reg.addr = pair.address;
            reg.ctrl = pair.control;
        }
        let mut iov = libc::iovec {
            iov_base: ptr::addr_of_mut!(state).cast(),
            iov_len: mem::offset_of!(UserHwdebugState, dbg_regs) + count * mem::size_of::<UserHwdebugReg>(),
        };
        // SAFETY: iov covers the header plus `count` initialized register pairs.
        unsafe {
            ptrace(
                PTRACE_SETREGSET,
                thread,
                regset(bank) as *mut c_void,
                ptr::addr_of_mut!(iov).cast(),
            )?;
        }
        Ok(())
    }

    fn register_point(&mut self, thread: ThreadId, point: &EncodedPoint) -> KernelResult<SlotHandle>
    {
        let mut descriptor = PpcHwBreakpoint::from(point);
        // SAFETY: the kernel reads a struct ppc_hw_breakpoint, which PpcHwBreakpoint mirrors.
        let slot = unsafe {
            ptrace(
                PPC_PTRACE_SETHWDEBUG,
                thread,
                ptr::null_mut(),
                ptr::addr_of_mut!(descriptor).cast(),
            )?
        };
        Ok(SlotHandle(i64::from(slot)))
    }

    fn deregister_point(&mut self, thread: ThreadId, handle: SlotHandle) -> KernelResult<()>
    {
        // SAFETY: the slot number is passed by value in the data argument.
        unsafe {
            ptrace(PPC_PTRACE_DELHWDEBUG, thread, ptr::null_mut(), handle.0 as *mut c_void)?;
        }
        Ok(())
    }

    fn write_legacy_register(&mut self, thread: ThreadId, value: u64) -> KernelResult<()>
    {
        // SAFETY: the DABR value is passed by value in the data argument.
        unsafe {
            ptrace(PTRACE_SET_DEBUGREG, thread, ptr::null_mut(), value as *mut c_void)?;
        }
        Ok(())
    }

    fn last_trap(&mut self, thread: ThreadId) -> KernelResult<Option<TrapInfo>>
    {
        let mut info = MaybeUninit::<libc::siginfo_t>::zeroed();
        // SAFETY: the kernel fills a siginfo_t; zeroed memory is a valid siginfo_t.
        let info = unsafe {
            ptrace(PTRACE_GETSIGINFO, thread, ptr::null_mut(), info.as_mut_ptr().cast())?;
            info.assume_init()
        };
        if info.si_signo != libc::SIGTRAP {
            return Ok(None);
        }
        // SAFETY: si_addr is valid for SIGTRAP.
        let address = unsafe { info.si_addr() } as u64;
        Ok(Some(TrapInfo {
            hardware: (info.si_code & 0xffff) == TRAP_HWBKPT,
            address: Address::new(address),
            slot_hint: Some(i64::from(info.si_errno)),
        }))
    }
}
