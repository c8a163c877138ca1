//! # Capability Probing
//!
//! Figures out, once per session, what the kernel's hardware debug facility
//! can do: how many slots of each kind exist, which kernel interface drives
//! them, alignment and width limits and optional features.
//!
//! Probing never fails. A missing interface only reduces capability: PowerPC
//! falls back to the legacy single-register interface, AArch64 to zero slots.

use std::fmt;

use bitflags::bitflags;
use once_cell::unsync::OnceCell;
use tracing::{debug, warn};

use crate::arch::powerpc::PpcDebugInfo;
use crate::arch::{aarch64, powerpc};
use crate::error::KernelError;
use crate::kernel::{DebugInfo, DebugRegisterInterface};
use crate::point::RegisterBank;
use crate::types::{Architecture, ThreadId};

/// Width of a DAWR watch window; a range must not cross its boundary.
pub const DAWR_WINDOW: u64 = 512;

bitflags! {
    /// Optional hardware debug features.
    ///
    /// The low bits mirror the PowerPC `features` word so a kernel reply can
    /// be taken over unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u64
    {
        /// Instruction breakpoints can cover an address range.
        const INSN_RANGE = powerpc::FEATURE_INSN_BP_RANGE;
        /// Instruction breakpoints can use an address mask.
        const INSN_MASK = powerpc::FEATURE_INSN_BP_MASK;
        /// Watchpoints can cover an address range.
        const DATA_RANGE = powerpc::FEATURE_DATA_BP_RANGE;
        /// Watchpoints can use an address mask.
        const DATA_MASK = powerpc::FEATURE_DATA_BP_MASK;
        /// Wide (512-byte) watch windows.
        const DATA_DAWR = powerpc::FEATURE_DATA_BP_DAWR;
        /// Per-byte enables inside the aligned watch window.
        const BYTE_SELECT = 1 << 32;
    }
}

/// Which kernel interface drives the debug registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interface
{
    /// Whole-bank register writes, deferred until the thread resumes.
    RegisterArray,
    /// Per-point registration returning a kernel slot handle.
    Handles,
    /// Single legacy data breakpoint register.
    Legacy,
    /// No hardware debug support.
    Unavailable,
}

impl fmt::Display for Interface
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            Interface::RegisterArray => "register-array",
            Interface::Handles => "hwdebug-handles",
            Interface::Legacy => "legacy-dabr",
            Interface::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// Session-wide hardware debug limits
///
/// Immutable after probing. All encoder and allocator limits come from here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet
{
    /// Architecture of the traced process.
    pub architecture: Architecture,
    /// Kernel interface in use.
    pub interface: Interface,
    /// Breakpoint register count.
    pub breakpoint_slots: usize,
    /// Watchpoint register count.
    pub watchpoint_slots: usize,
    /// Data value compare register count.
    pub condition_registers: usize,
    /// Width of a data value compare register in bytes.
    pub condition_width: u64,
    /// Alignment of a single watch window in bytes.
    pub alignment: u64,
    /// Widest span a single fixed-window watchpoint slot covers.
    pub max_watch_len: u64,
    /// Window a single range watchpoint must stay inside (`None`: any range).
    pub range_window: Option<u64>,
    /// Optional features.
    pub features: Features,
}

impl CapabilitySet
{
    /// No hardware debug support.
    #[must_use]
    pub fn unavailable(architecture: Architecture) -> Self
    {
        Self {
            architecture,
            interface: Interface::Unavailable,
            breakpoint_slots: 0,
            watchpoint_slots: 0,
            condition_registers: 0,
            condition_width: 0,
            alignment: 8,
            max_watch_len: 8,
            range_window: None,
            features: Features::empty(),
        }
    }

    /// Capabilities described by the two AArch64 `dbg_info` words.
    #[must_use]
    pub fn aarch64(architecture: Architecture, breakpoints: Option<u32>, watchpoints: Option<u32>) -> Self
    {
        Self {
            architecture,
            interface: Interface::RegisterArray,
            breakpoint_slots: aarch64::usable_slots(breakpoints, "breakpoints"),
            watchpoint_slots: aarch64::usable_slots(watchpoints, "watchpoints"),
            condition_registers: 0,
            condition_width: 0,
            alignment: aarch64::WATCH_ALIGNMENT,
            max_watch_len: aarch64::MAX_WATCH_LEN,
            range_window: None,
            features: Features::BYTE_SELECT,
        }
    }

    /// Capabilities described by a PowerPC hwdebug reply.
    ///
    /// Returns `None` when the reply advertises no feature at all, which
    /// means the interface is present but useless.
    #[must_use]
    pub fn powerpc(architecture: Architecture, info: &PpcDebugInfo) -> Option<Self>
    {
        if info.features == 0 {
            return None;
        }
        let features = Features::from_bits_truncate(info.features);
        let window = match info.data_bp_alignment {
            0 => 8,
            alignment => u64::from(alignment),
        };
        let range_window = features.contains(Features::DATA_DAWR).then_some(DAWR_WINDOW);
        Some(Self {
            architecture,
            interface: Interface::Handles,
            breakpoint_slots: info.num_instruction_bps as usize,
            watchpoint_slots: info.num_data_bps as usize,
            condition_registers: info.num_condition_regs as usize,
            condition_width: u64::from(info.sizeof_condition).min(powerpc::MAX_CONDITION_BYTES),
            alignment: window,
            max_watch_len: window,
            range_window,
            features,
        })
    }

    /// The legacy single data breakpoint register.
    #[must_use]
    pub fn legacy(architecture: Architecture) -> Self
    {
        let window = if architecture.is_booke() { 4 } else { 8 };
        Self {
            architecture,
            interface: Interface::Legacy,
            breakpoint_slots: 0,
            watchpoint_slots: 1,
            condition_registers: 0,
            condition_width: 0,
            alignment: window,
            max_watch_len: window,
            range_window: None,
            features: Features::empty(),
        }
    }

    /// Slot count of a bank.
    #[must_use]
    pub fn slots(&self, bank: RegisterBank) -> usize
    {
        match bank {
            RegisterBank::Breakpoints => self.breakpoint_slots,
            RegisterBank::Watchpoints => self.watchpoint_slots,
        }
    }

    /// Whether every flag in `features` is supported.
    #[must_use]
    pub fn has(&self, features: Features) -> bool
    {
        self.features.contains(features)
    }

    /// Whether a watch of `length` bytes is installed as a kernel-side range
    /// rather than split into fixed windows.
    #[must_use]
    pub fn uses_ranges(&self, length: u64) -> bool
    {
        self.interface == Interface::Handles && length > 1 && self.has(Features::DATA_RANGE)
    }
}

impl fmt::Display for CapabilitySet
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(
            f,
            "{} via {}: {} breakpoints, {} watchpoints, {} condition registers, {}-byte windows, features {:?}",
            self.architecture,
            self.interface,
            self.breakpoint_slots,
            self.watchpoint_slots,
            self.condition_registers,
            self.alignment,
            self.features
        )
    }
}

/// Result of a single kernel query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome
{
    /// The primary interface is present.
    Supported(CapabilitySet),
    /// The primary interface is absent.
    Unsupported,
}

/// Query the kernel once and classify the reply
///
/// This is the raw probe. It does not apply fallbacks; see
/// [`CapabilityProber`] for the cached, fallback-aware version.
pub fn probe<K: DebugRegisterInterface + ?Sized>(kernel: &mut K, thread: ThreadId) -> ProbeOutcome
{
    let architecture = kernel.architecture();
    match kernel.debug_info(thread) {
        Ok(DebugInfo::Arm {
            breakpoints,
            watchpoints,
        }) if architecture.is_arm() => {
            if breakpoints.is_none() && watchpoints.is_none() {
                return ProbeOutcome::Unsupported;
            }
            ProbeOutcome::Supported(CapabilitySet::aarch64(architecture, breakpoints, watchpoints))
        }
        Ok(DebugInfo::PowerPc(info)) if architecture.is_powerpc() => {
            match CapabilitySet::powerpc(architecture, &info) {
                Some(caps) => ProbeOutcome::Supported(caps),
                None => ProbeOutcome::Unsupported,
            }
        }
        Ok(other) => {
            warn!("Debug info {:?} does not match architecture {}", other, architecture);
            ProbeOutcome::Unsupported
        }
        Err(KernelError::NotSupported) => ProbeOutcome::Unsupported,
        Err(err) => {
            warn!("Hardware debug capability query failed on thread {}: {}", thread, err);
            ProbeOutcome::Unsupported
        }
    }
}

/// Lazily probed, cached capability set
///
/// The first call to [`CapabilityProber::get`] queries the kernel; every
/// later call returns the same set without touching the kernel again.
#[derive(Debug, Default)]
pub struct CapabilityProber
{
    cache: OnceCell<CapabilitySet>,
}

impl CapabilityProber
{
    /// Create an empty prober.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Prober that never queries the kernel.
    #[must_use]
    pub fn preset(caps: CapabilitySet) -> Self
    {
        Self {
            cache: OnceCell::with_value(caps),
        }
    }

    /// Cached capabilities, if probing already happened.
    #[must_use]
    pub fn cached(&self) -> Option<&CapabilitySet>
    {
        self.cache.get()
    }

    /// Capabilities of the session, probing on first use.
    pub fn get<K: DebugRegisterInterface + ?Sized>(&self, kernel: &mut K, thread: ThreadId) -> &CapabilitySet
    {
        self.cache.get_or_init(|| {
            let caps = match probe(kernel, thread) {
                ProbeOutcome::Supported(caps) => caps,
                ProbeOutcome::Unsupported => fallback(kernel, thread),
            };
            debug!("Hardware debug capabilities: {}", caps);
            caps
        })
    }
}

fn fallback<K: DebugRegisterInterface + ?Sized>(kernel: &mut K, thread: ThreadId) -> CapabilitySet
{
    let architecture = kernel.architecture();
    if !architecture.is_powerpc() {
        return CapabilitySet::unavailable(architecture);
    }
    match kernel.write_legacy_register(thread, 0) {
        Ok(()) => CapabilitySet::legacy(architecture),
        Err(err) => {
            debug!("Legacy debug register not available on thread {}: {}", thread, err);
            CapabilitySet::unavailable(architecture)
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_powerpc_zero_features_is_absent()
    {
        let info = PpcDebugInfo {
            version: 1,
            num_instruction_bps: 2,
            num_data_bps: 2,
            ..PpcDebugInfo::default()
        };
        assert!(CapabilitySet::powerpc(Architecture::PowerPcBookE, &info).is_none());
    }

    #[test]
    fn test_powerpc_dawr_window()
    {
        let info = PpcDebugInfo {
            version: 1,
            num_instruction_bps: 0,
            num_data_bps: 1,
            num_condition_regs: 0,
            data_bp_alignment: 8,
            sizeof_condition: 0,
            features: powerpc::FEATURE_DATA_BP_RANGE | powerpc::FEATURE_DATA_BP_DAWR,
        };
        let caps = CapabilitySet::powerpc(Architecture::PowerPc, &info).unwrap();
        assert_eq!(caps.alignment, 8);
        assert_eq!(caps.range_window, Some(512));
        assert!(caps.has(Features::DATA_DAWR));
        assert!(caps.uses_ranges(16));
        assert!(!caps.uses_ranges(1));
    }

    #[test]
    fn test_legacy_windows()
    {
        assert_eq!(CapabilitySet::legacy(Architecture::PowerPcBookE).alignment, 4);
        assert_eq!(CapabilitySet::legacy(Architecture::PowerPc).alignment, 8);
        assert_eq!(CapabilitySet::legacy(Architecture::PowerPc).watchpoint_slots, 1);
    }
}
