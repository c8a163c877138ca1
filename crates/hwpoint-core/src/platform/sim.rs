//! # Simulated Kernel
//!
//! In-memory implementation of [`DebugRegisterInterface`] for tests and the
//! CLI. It behaves like the Linux interfaces closely enough to exercise every
//! manager path:
//!
//! - per-thread AArch64 register banks, PowerPC handle registrations and the
//!   legacy register
//! - restricted-mask mode (pre-4.10 AArch64 kernels rejecting most byte masks)
//! - one-shot handle points that vanish when they trigger
//! - threads that disappear (`NoSuchThread`)
//! - one-off error injection per operation
//!
//! Every call is appended to a log so tests can check what reached the
//! "kernel".

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::arch::aarch64;
use crate::arch::powerpc::{self, PpcDebugInfo, PpcHwBreakpoint};
use crate::degrade::MaskTable;
use crate::error::KernelError;
use crate::kernel::{DebugInfo, DebugRegisterInterface, KernelResult, RegisterBlock, SlotHandle, TrapInfo};
use crate::point::{EncodedPoint, RegisterBank};
use crate::types::{Address, Architecture, ThreadId};

/// Kernel operations, for logging and error injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation
{
    /// `debug_info`
    DebugInfo,
    /// `read_debug_registers`
    ReadRegisters,
    /// `write_debug_registers`
    WriteRegisters,
    /// `register_point`
    RegisterPoint,
    /// `deregister_point`
    DeregisterPoint,
    /// `write_legacy_register`
    WriteLegacy,
    /// `last_trap`
    LastTrap,
    /// `pause_for_update`
    Pause,
}

impl fmt::Display for Operation
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            Operation::DebugInfo => "debug_info",
            Operation::ReadRegisters => "read_debug_registers",
            Operation::WriteRegisters => "write_debug_registers",
            Operation::RegisterPoint => "register_point",
            Operation::DeregisterPoint => "deregister_point",
            Operation::WriteLegacy => "write_legacy_register",
            Operation::LastTrap => "last_trap",
            Operation::Pause => "pause_for_update",
        };
        f.write_str(name)
    }
}

/// One logged kernel call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Syscall
{
    /// What was called.
    pub operation: Operation,
    /// Target thread.
    pub thread: ThreadId,
    /// Error returned, if any.
    pub error: Option<KernelError>,
}

/// A successful bank write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankWrite
{
    /// Target thread.
    pub thread: ThreadId,
    /// Bank written.
    pub bank: RegisterBank,
    /// Contents written.
    pub block: RegisterBlock,
}

/// One handle registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration
{
    /// The point as the manager encoded it.
    pub point: EncodedPoint,
    /// The descriptor a real kernel would have received.
    pub descriptor: PpcHwBreakpoint,
}

#[derive(Debug, Clone, Default)]
struct SimThread
{
    breakpoints: Option<RegisterBlock>,
    watchpoints: Option<RegisterBlock>,
    registrations: BTreeMap<i64, Registration>,
    legacy: u64,
    trap: Option<TrapInfo>,
}

#[derive(Debug, Clone)]
enum Facility
{
    Arm
    {
        breakpoints: u32,
        watchpoints: u32,
    },
    Hwdebug(PpcDebugInfo),
    Legacy,
    Absent,
}

/// In-memory debug register kernel
///
/// ## Example
///
/// ```rust
/// use hwpoint_core::kernel::DebugRegisterInterface;
/// use hwpoint_core::platform::sim::SimulatedKernel;
/// use hwpoint_core::point::RegisterBank;
/// use hwpoint_core::types::ThreadId;
///
/// let mut kernel = SimulatedKernel::aarch64(6, 4);
/// let block = kernel.read_debug_registers(ThreadId(1), RegisterBank::Watchpoints).unwrap();
/// assert_eq!(block.pairs.len(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct SimulatedKernel
{
    architecture: Architecture,
    facility: Facility,
    restricted: Option<MaskTable>,
    one_shot: bool,
    threads: BTreeMap<ThreadId, SimThread>,
    vanished: BTreeSet<ThreadId>,
    next_handle: i64,
    failures: Vec<(Operation, Option<ThreadId>, KernelError)>,
    log: Vec<Syscall>,
    writes: Vec<BankWrite>,
}

impl SimulatedKernel
{
    fn with_facility(architecture: Architecture, facility: Facility) -> Self
    {
        Self {
            architecture,
            facility,
            restricted: None,
            one_shot: true,
            threads: BTreeMap::new(),
            vanished: BTreeSet::new(),
            next_handle: 1,
            failures: Vec::new(),
            log: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// AArch64 kernel with the given number of register pairs per bank.
    #[must_use]
    pub fn aarch64(breakpoints: u32, watchpoints: u32) -> Self
    {
        Self::with_facility(
            Architecture::AArch64,
            Facility::Arm {
                breakpoints: info_word(breakpoints),
                watchpoints: info_word(watchpoints),
            },
        )
    }

    /// PowerPC kernel with the hwdebug interface described by `info`.
    #[must_use]
    pub fn powerpc(booke: bool, info: PpcDebugInfo) -> Self
    {
        let architecture = if booke {
            Architecture::PowerPcBookE
        } else {
            Architecture::PowerPc
        };
        Self::with_facility(architecture, Facility::Hwdebug(info))
    }

    /// Embedded (440-style) PowerPC: 4 instruction and 2 data breakpoints,
    /// 2 value comparators, ranges and masks.
    #[must_use]
    pub fn powerpc_booke() -> Self
    {
        Self::powerpc(
            true,
            PpcDebugInfo {
                version: powerpc::DEBUG_CURRENT_VERSION,
                num_instruction_bps: 4,
                num_data_bps: 2,
                num_condition_regs: 2,
                data_bp_alignment: 4,
                sizeof_condition: 4,
                features: powerpc::FEATURE_INSN_BP_RANGE
                    | powerpc::FEATURE_INSN_BP_MASK
                    | powerpc::FEATURE_DATA_BP_RANGE
                    | powerpc::FEATURE_DATA_BP_MASK,
            },
        )
    }

    /// Server PowerPC with one DAWR watchpoint.
    #[must_use]
    pub fn powerpc_server() -> Self
    {
        Self::powerpc(
            false,
            PpcDebugInfo {
                version: powerpc::DEBUG_CURRENT_VERSION,
                num_instruction_bps: 0,
                num_data_bps: 1,
                num_condition_regs: 0,
                data_bp_alignment: 8,
                sizeof_condition: 0,
                features: powerpc::FEATURE_DATA_BP_RANGE | powerpc::FEATURE_DATA_BP_DAWR,
            },
        )
    }

    /// PowerPC kernel with only the legacy data breakpoint register.
    #[must_use]
    pub fn powerpc_legacy(booke: bool) -> Self
    {
        let architecture = if booke {
            Architecture::PowerPcBookE
        } else {
            Architecture::PowerPc
        };
        Self::with_facility(architecture, Facility::Legacy)
    }

    /// Kernel without any hardware debug interface.
    #[must_use]
    pub fn unsupported(architecture: Architecture) -> Self
    {
        Self::with_facility(architecture, Facility::Absent)
    }

    /// Report a different tracee architecture (e.g. an AArch32 process on an
    /// AArch64 kernel).
    #[must_use]
    pub fn with_architecture(mut self, architecture: Architecture) -> Self
    {
        self.architecture = architecture;
        self
    }

    /// Reject watchpoint control words whose byte mask is not in `table`,
    /// like AArch64 kernels before 4.10.
    #[must_use]
    pub fn with_restricted_masks(mut self, table: MaskTable) -> Self
    {
        self.restricted = Some(table);
        self
    }

    /// Whether triggered handle points are dropped by the kernel (default
    /// `true`, as on Linux).
    #[must_use]
    pub fn with_one_shot(mut self, one_shot: bool) -> Self
    {
        self.one_shot = one_shot;
        self
    }

    /// Make the next call of `operation` fail with `error`.
    pub fn fail_next(&mut self, operation: Operation, error: KernelError)
    {
        self.failures.push((operation, None, error));
    }

    /// Make the next call of `operation` on `tid` fail with `error`.
    pub fn fail_next_on(&mut self, operation: Operation, tid: ThreadId, error: KernelError)
    {
        self.failures.push((operation, Some(tid), error));
    }

    /// Make `tid` disappear: every later call on it reports `NoSuchThread`.
    pub fn remove_thread(&mut self, tid: ThreadId)
    {
        self.threads.remove(&tid);
        self.vanished.insert(tid);
    }

    /// Record a stop for `tid`, as reported by the next `last_trap`.
    pub fn inject_trap(&mut self, tid: ThreadId, trap: TrapInfo)
    {
        self.thread_mut(tid).trap = Some(trap);
    }

    /// Simulate registration `handle` of `tid` triggering on `address`.
    ///
    /// One-shot kernels drop the registration.
    pub fn trigger_handle(&mut self, tid: ThreadId, handle: SlotHandle, address: Address)
    {
        let one_shot = self.one_shot;
        let thread = self.thread_mut(tid);
        thread.trap = Some(TrapInfo {
            hardware: true,
            address,
            slot_hint: Some(handle.0),
        });
        if one_shot {
            thread.registrations.remove(&handle.0);
        }
    }

    /// Current contents of a register bank.
    #[must_use]
    pub fn registers(&self, tid: ThreadId, bank: RegisterBank) -> Option<&RegisterBlock>
    {
        let thread = self.threads.get(&tid)?;
        match bank {
            RegisterBank::Breakpoints => thread.breakpoints.as_ref(),
            RegisterBank::Watchpoints => thread.watchpoints.as_ref(),
        }
    }

    /// Live handle registrations of a thread, by handle.
    #[must_use]
    pub fn registrations(&self, tid: ThreadId) -> Vec<(SlotHandle, Registration)>
    {
        self.threads
            .get(&tid)
            .map(|thread| {
                thread
                    .registrations
                    .iter()
                    .map(|(handle, registration)| (SlotHandle(*handle), *registration))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Current legacy register value of a thread.
    #[must_use]
    pub fn legacy_value(&self, tid: ThreadId) -> u64
    {
        self.threads.get(&tid).map_or(0, |thread| thread.legacy)
    }

    /// Every call made so far.
    #[must_use]
    pub fn log(&self) -> &[Syscall]
    {
        &self.log
    }

    /// Number of calls of `operation` so far.
    #[must_use]
    pub fn count(&self, operation: Operation) -> usize
    {
        self.log.iter().filter(|call| call.operation == operation).count()
    }

    /// Successful bank writes so far.
    #[must_use]
    pub fn writes(&self) -> &[BankWrite]
    {
        &self.writes
    }

    /// Forget the call log and the write history.
    pub fn clear_log(&mut self)
    {
        self.log.clear();
        self.writes.clear();
    }

    fn thread_mut(&mut self, tid: ThreadId) -> &mut SimThread
    {
        self.threads.entry(tid).or_default()
    }

    /// Log the call and decide whether it fails before doing anything.
    fn enter(&mut self, operation: Operation, tid: ThreadId) -> KernelResult<()>
    {
        let injected = self
            .failures
            .iter()
            .position(|(op, thread, _)| *op == operation && thread.is_none_or(|thread| thread == tid))
            .map(|index| self.failures.remove(index).2);
        let error = injected.or_else(|| self.vanished.contains(&tid).then_some(KernelError::NoSuchThread));
        self.record(operation, tid, error)
    }

    fn record(&mut self, operation: Operation, thread: ThreadId, error: Option<KernelError>) -> KernelResult<()>
    {
        self.log.push(Syscall {
            operation,
            thread,
            error,
        });
        error.map_or(Ok(()), Err)
    }

    fn bank_size(&self, bank: RegisterBank) -> usize
    {
        match (&self.facility, bank) {
            (Facility::Arm { breakpoints, .. }, RegisterBank::Breakpoints) => {
                aarch64::DebugInfoWord::parse(*breakpoints).slots
            }
            (Facility::Arm { watchpoints, .. }, RegisterBank::Watchpoints) => {
                aarch64::DebugInfoWord::parse(*watchpoints).slots
            }
            (Facility::Hwdebug(info), RegisterBank::Breakpoints) => info.num_instruction_bps as usize,
            (Facility::Hwdebug(info), RegisterBank::Watchpoints) => info.num_data_bps as usize,
            _ => 0,
        }
    }

    fn rejects(&self, bank: RegisterBank, block: &RegisterBlock) -> bool
    {
        let Some(table) = &self.restricted else {
            return false;
        };
        bank == RegisterBank::Watchpoints
            && block
                .enabled()
                .any(|(_, pair)| !table.contains(aarch64::control_mask(pair.control)))
    }
}

fn info_word(slots: u32) -> u32
{
    (u32::from(aarch64::DEBUG_ARCH_V8) << 8) | slots
}

impl DebugRegisterInterface for SimulatedKernel
{
    fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    fn debug_info(&mut self, thread: ThreadId) -> KernelResult<DebugInfo>
    {
        self.enter(Operation::DebugInfo, thread)?;
        match &self.facility {
            Facility::Arm {
                breakpoints,
                watchpoints,
            } => Ok(DebugInfo::Arm {
                breakpoints: Some(*breakpoints),
                watchpoints: Some(*watchpoints),
            }),
            Facility::Hwdebug(info) => Ok(DebugInfo::PowerPc(*info)),
            Facility::Legacy | Facility::Absent => Err(KernelError::NotSupported),
        }
    }

    fn read_debug_registers(&mut self, thread: ThreadId, bank: RegisterBank) -> KernelResult<RegisterBlock>
    {
        self.enter(Operation::ReadRegisters, thread)?;
        let Facility::Arm {
            breakpoints,
            watchpoints,
        } = self.facility
        else {
            return Err(KernelError::NotSupported);
        };
        let size = self.bank_size(bank);
        let info = match bank {
            RegisterBank::Breakpoints => breakpoints,
            RegisterBank::Watchpoints => watchpoints,
        };
        let thread = self.thread_mut(thread);
        let stored = match bank {
            RegisterBank::Breakpoints => &thread.breakpoints,
            RegisterBank::Watchpoints => &thread.watchpoints,
        };
        let mut block = stored.clone().unwrap_or_else(|| RegisterBlock::disabled(size));
        block.info = info;
        Ok(block)
    }

    fn write_debug_registers(&mut self, thread: ThreadId, bank: RegisterBank, block: &RegisterBlock)
    -> KernelResult<()>
    {
        if !matches!(self.facility, Facility::Arm { .. }) {
            return self.record(Operation::WriteRegisters, thread, Some(KernelError::NotSupported));
        }
        if self.rejects(bank, block) {
            return self.record(Operation::WriteRegisters, thread, Some(KernelError::Rejected));
        }
        if block.pairs.len() > self.bank_size(bank) {
            return self.record(Operation::WriteRegisters, thread, Some(KernelError::Os(libc::ENOSPC)));
        }
        self.enter(Operation::WriteRegisters, thread)?;

        let stored = block.clone();
        let target = self.thread_mut(thread);
        match bank {
            RegisterBank::Breakpoints => target.breakpoints = Some(stored.clone()),
            RegisterBank::Watchpoints => target.watchpoints = Some(stored.clone()),
        }
        self.writes.push(BankWrite {
            thread,
            bank,
            block: stored,
        });
        Ok(())
    }

    fn register_point(&mut self, thread: ThreadId, point: &EncodedPoint) -> KernelResult<SlotHandle>
    {
        self.enter(Operation::RegisterPoint, thread)?;
        if !matches!(self.facility, Facility::Hwdebug(_)) {
            return Err(KernelError::NotSupported);
        }
        let bank = point.kind.bank();
        let capacity = self.bank_size(bank);
        let used: usize = self
            .threads
            .get(&thread)
            .map(|t| {
                t.registrations
                    .values()
                    .filter(|r| r.point.kind.bank() == bank)
                    .map(|r| r.point.cost())
                    .sum()
            })
            .unwrap_or(0);
        if used + point.cost() > capacity {
            return Err(KernelError::Os(libc::ENOSPC));
        }

        let handle = self.next_handle;
        self.next_handle += 1;
        self.thread_mut(thread).registrations.insert(
            handle,
            Registration {
                point: *point,
                descriptor: PpcHwBreakpoint::from(point),
            },
        );
        Ok(SlotHandle(handle))
    }

    fn deregister_point(&mut self, thread: ThreadId, handle: SlotHandle) -> KernelResult<()>
    {
        self.enter(Operation::DeregisterPoint, thread)?;
        match self.thread_mut(thread).registrations.remove(&handle.0) {
            Some(_) => Ok(()),
            None => {
                if let Some(last) = self.log.last_mut() {
                    last.error = Some(KernelError::NotFound);
                }
                Err(KernelError::NotFound)
            }
        }
    }

    fn write_legacy_register(&mut self, thread: ThreadId, value: u64) -> KernelResult<()>
    {
        if !matches!(self.facility, Facility::Legacy) {
            return self.record(Operation::WriteLegacy, thread, Some(KernelError::NotSupported));
        }
        self.enter(Operation::WriteLegacy, thread)?;
        self.thread_mut(thread).legacy = value;
        Ok(())
    }

    fn last_trap(&mut self, thread: ThreadId) -> KernelResult<Option<TrapInfo>>
    {
        self.enter(Operation::LastTrap, thread)?;
        Ok(self.threads.get(&thread).and_then(|t| t.trap))
    }

    fn pause_for_update(&mut self, thread: ThreadId) -> KernelResult<()>
    {
        self.enter(Operation::Pause, thread)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::point::{ByteMask, PointKind, Span};
    use crate::types::AddrRange;

    #[test]
    fn test_injected_failure_is_consumed()
    {
        let mut kernel = SimulatedKernel::aarch64(2, 2);
        kernel.fail_next(Operation::Pause, KernelError::Os(libc::EPERM));
        assert_eq!(kernel.pause_for_update(ThreadId(1)), Err(KernelError::Os(libc::EPERM)));
        assert_eq!(kernel.pause_for_update(ThreadId(1)), Ok(()));
        assert_eq!(kernel.count(Operation::Pause), 2);
    }

    #[test]
    fn test_restricted_masks_reject_odd_mask()
    {
        let mut kernel = SimulatedKernel::aarch64(2, 2).with_restricted_masks(MaskTable::default());
        let mut block = RegisterBlock::disabled(2);
        block.pairs[0].address = 0x1000;
        block.pairs[0].control = aarch64::control_word(PointKind::Write, ByteMask::from_bits(0x30));
        assert_eq!(
            kernel.write_debug_registers(ThreadId(1), RegisterBank::Watchpoints, &block),
            Err(KernelError::Rejected)
        );
        block.pairs[0].control = aarch64::control_word(PointKind::Write, ByteMask::FULL);
        assert!(kernel
            .write_debug_registers(ThreadId(1), RegisterBank::Watchpoints, &block)
            .is_ok());
    }

    #[test]
    fn test_vanished_thread()
    {
        let mut kernel = SimulatedKernel::powerpc_booke();
        kernel.remove_thread(ThreadId(7));
        let point = EncodedPoint {
            kind: PointKind::Write,
            address: Address::new(0x1000),
            span: Span::Exact,
            condition: None,
            watched: AddrRange::from_len(Address::new(0x1000), 1),
            registers: 1,
        };
        assert_eq!(kernel.register_point(ThreadId(7), &point), Err(KernelError::NoSuchThread));
    }

    #[test]
    fn test_one_shot_trigger_drops_registration()
    {
        let mut kernel = SimulatedKernel::powerpc_booke();
        let point = EncodedPoint {
            kind: PointKind::Execute,
            address: Address::new(0x4000),
            span: Span::Exact,
            condition: None,
            watched: AddrRange::from_len(Address::new(0x4000), 4),
            registers: 1,
        };
        let handle = kernel.register_point(ThreadId(1), &point).unwrap();
        kernel.trigger_handle(ThreadId(1), handle, Address::new(0x4000));
        assert!(kernel.registrations(ThreadId(1)).is_empty());
        assert_eq!(kernel.deregister_point(ThreadId(1), handle), Err(KernelError::NotFound));
    }
}
