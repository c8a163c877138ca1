//! # Hardware Point Manager
//!
//! [`HwPointManager`] is the per-session context the debugger core talks to.
//! It owns the kernel interface, the cached capabilities, the degradation
//! state and one [`ThreadPointSet`] per traced thread, and it keeps all of
//! them consistent:
//!
//! - **Insert** applies a logical point to every live thread or to none. For
//!   handle-based and legacy kernels every registration is journaled and a
//!   failure rolls back what was already done. Register-array kernels only
//!   change memory, after verifying capacity on every thread; the kernel
//!   write happens in [`HwPointManager::prepare_to_resume`].
//! - **Remove** drops one reference on every thread. A kernel that already
//!   forgot the registration (one-shot points) is not an error.
//! - **Resume** flushes dirty register banks and handles the one-time
//!   switch to restricted byte masks.
//!
//! ## Example
//!
//! ```rust
//! use hwpoint_core::config::ManagerConfig;
//! use hwpoint_core::manager::HwPointManager;
//! use hwpoint_core::platform::sim::SimulatedKernel;
//! use hwpoint_core::point::{HardwarePointRequest, PointKind};
//! use hwpoint_core::types::{Address, ThreadId};
//!
//! let kernel = SimulatedKernel::aarch64(2, 2);
//! let mut manager = HwPointManager::new(kernel, ThreadId(100), ManagerConfig::default());
//!
//! let request = HardwarePointRequest::watch(PointKind::Write, Address::new(0x1000), 4);
//! manager.insert_point(&request).unwrap();
//! manager.prepare_to_resume(ThreadId(100)).unwrap();
//! manager.remove_point(&request).unwrap();
//! ```

use tracing::{debug, trace, warn};

use crate::accel::{self, Condition, ConditionAccelerator};
use crate::arch::powerpc;
use crate::capability::{CapabilityProber, CapabilitySet, Features, Interface};
use crate::config::ManagerConfig;
use crate::degrade::{DegradationCoordinator, DegradationState, MaskTable};
use crate::encode::{self, EncodeOptions, Fragments};
use crate::error::{HwPointError, KernelError, Result};
use crate::kernel::{DebugRegisterInterface, SlotHandle};
use crate::point::{Comparator, EncodedPoint, HardwarePointRequest, PointKind, RegisterBank};
use crate::slots::Removal;
use crate::threads::{ThreadPointSet, ThreadSets};
use crate::types::{Address, ThreadId};

const BANKS: [RegisterBank; 2] = [RegisterBank::Breakpoints, RegisterBank::Watchpoints];

/// Answer to "can the hardware take this many points of this kind?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareAvailability
{
    /// Hardware points of this kind can be used.
    Available,
    /// The hardware has no slots of this kind at all.
    Unsupported,
    /// The requested number of points does not fit.
    Exhausted,
}

/// Session context for hardware breakpoints and watchpoints
///
/// Created when the debugger attaches to a process and dropped on detach.
/// All methods take `&mut self`; the manager is driven from the debugger's
/// single control thread.
#[derive(Debug)]
pub struct HwPointManager<K: DebugRegisterInterface>
{
    kernel: K,
    config: ManagerConfig,
    prober: CapabilityProber,
    degradation: DegradationCoordinator,
    leader: ThreadId,
    threads: Vec<ThreadId>,
    sets: ThreadSets,
    legacy_value: u64,
}

impl<K: DebugRegisterInterface> HwPointManager<K>
{
    /// Manager for a process whose first thread is `leader`.
    ///
    /// Capabilities are probed on `leader` the first time they are needed.
    pub fn new(kernel: K, leader: ThreadId, config: ManagerConfig) -> Self
    {
        Self::with_prober(kernel, leader, config, CapabilityProber::new())
    }

    /// Manager using fixed capabilities instead of probing the kernel.
    pub fn with_capabilities(kernel: K, leader: ThreadId, config: ManagerConfig, caps: CapabilitySet) -> Self
    {
        Self::with_prober(kernel, leader, config, CapabilityProber::preset(caps))
    }

    fn with_prober(kernel: K, leader: ThreadId, config: ManagerConfig, prober: CapabilityProber) -> Self
    {
        let degradation = DegradationCoordinator::new(config.initial_state(), config.mask_table.clone());
        Self {
            kernel,
            config,
            prober,
            degradation,
            leader,
            threads: vec![leader],
            sets: ThreadSets::new(),
            legacy_value: 0,
        }
    }

    /// The kernel interface.
    #[must_use]
    pub fn kernel(&self) -> &K
    {
        &self.kernel
    }

    /// Mutable access to the kernel interface.
    pub fn kernel_mut(&mut self) -> &mut K
    {
        &mut self.kernel
    }

    /// Session capabilities, probing the kernel on first use.
    pub fn capabilities(&mut self) -> &CapabilitySet
    {
        self.prober.get(&mut self.kernel, self.leader)
    }

    /// Current degradation state.
    #[must_use]
    pub fn degradation(&self) -> DegradationState
    {
        self.degradation.state()
    }

    /// Mask table new watchpoints are encoded with, once degraded.
    #[must_use]
    pub fn restriction(&self) -> Option<&MaskTable>
    {
        self.degradation.restriction()
    }

    /// The manager configuration.
    #[must_use]
    pub fn config(&self) -> &ManagerConfig
    {
        &self.config
    }

    /// Live threads, in the order they were reported.
    #[must_use]
    pub fn threads(&self) -> &[ThreadId]
    {
        &self.threads
    }

    /// Point set of one thread, if any point was ever installed on it.
    #[must_use]
    pub fn thread_points(&self, tid: ThreadId) -> Option<&ThreadPointSet>
    {
        self.sets.get(tid)
    }

    /// Run `f` on the point set of every live thread.
    pub fn for_each_thread<F>(&self, f: F)
    where
        F: FnMut(&ThreadPointSet),
    {
        self.threads.iter().filter_map(|tid| self.sets.get(*tid)).for_each(f);
    }

    /// Whether `tid` has any occupied slot in `bank`.
    #[must_use]
    pub fn has_active_points(&self, tid: ThreadId, bank: RegisterBank) -> bool
    {
        self.sets.get(tid).is_some_and(|set| !set.table(bank).is_empty())
    }

    fn caps(&mut self) -> CapabilitySet
    {
        self.capabilities().clone()
    }

    /// Whether `count` points of `kind` can be used while `other_count`
    /// other hardware watchpoints are in use.
    ///
    /// Register-array kernels cannot tell overlapping watches apart up
    /// front, so they only report whether the kind exists at all.
    pub fn can_use_hardware_point(&mut self, kind: PointKind, count: usize, other_count: usize)
    -> HardwareAvailability
    {
        let caps = self.caps();
        let total = caps.slots(kind.bank());
        if total == 0 || caps.interface == Interface::Unavailable {
            return HardwareAvailability::Unsupported;
        }
        let needed = if kind.is_watchpoint() { count + other_count } else { count };
        match caps.interface {
            Interface::Handles | Interface::Legacy if needed > total => HardwareAvailability::Exhausted,
            _ => HardwareAvailability::Available,
        }
    }

    /// Pre-flight check: can `[address, address + length)` be watched at all?
    pub fn region_ok_for_watchpoint(&mut self, address: Address, length: u64) -> bool
    {
        if length == 0 {
            return false;
        }
        let caps = self.caps();
        match caps.interface {
            Interface::Unavailable => false,
            Interface::RegisterArray => {
                let slots = caps.watchpoint_slots as u64;
                if slots == 0 {
                    return false;
                }
                let reach = slots.saturating_mul(caps.max_watch_len);
                address.align_down(caps.alignment).value().saturating_add(reach)
                    >= address.value().saturating_add(length)
            }
            Interface::Handles => {
                if caps.uses_ranges(length) && caps.range_window.is_none() {
                    return true;
                }
                fits_window(address, length, caps.range_window.unwrap_or(caps.alignment))
            }
            Interface::Legacy => fits_window(address, length, caps.alignment),
        }
    }

    /// Registers needed by a ranged breakpoint, or `None` without support.
    pub fn ranged_break_num_registers(&mut self) -> Option<usize>
    {
        let caps = self.caps();
        (caps.interface == Interface::Handles && caps.has(Features::INSN_RANGE)).then_some(2)
    }

    /// Registers needed by a masked watchpoint, or `None` without support.
    ///
    /// ## Errors
    ///
    /// - `HwPointError::InvalidArgument`: the mask would cover kernel space
    pub fn masked_watch_num_registers(&mut self, address: Address, mask: u64) -> Result<Option<usize>>
    {
        let caps = self.caps();
        if caps.interface != Interface::Handles || !caps.has(Features::DATA_MASK) {
            return Ok(None);
        }
        if mask & encode::USER_MASK_BITS != encode::USER_MASK_BITS {
            warn!(
                "The mask 0x{:x} for a watchpoint at {} covers kernel address space and cannot be used",
                mask, address
            );
            return Err(HwPointError::InvalidArgument(format!(
                "mask 0x{mask:x} covers kernel address space"
            )));
        }
        Ok(Some(2))
    }

    /// Whether the hardware can evaluate `condition` for a watch at
    /// `address` by itself.
    pub fn can_accelerate_condition(&mut self, address: Address, _length: u64, condition: &Condition) -> bool
    {
        let caps = self.caps();
        caps.interface == Interface::Handles
            && caps.condition_registers > 0
            && accel::check_condition(address, condition).is_some()
    }

    /// Whether a trap at `address` belongs to the watch
    /// `[start, start + length)`.
    ///
    /// PowerPC reports trap addresses with the low bits dropped, so outside
    /// BookE range mode the check is done at window granularity.
    pub fn watchpoint_addr_within_range(&mut self, address: Address, start: Address, length: u64) -> bool
    {
        let caps = self.caps();
        let (addr, start) = (address.value(), start.value());
        let booke = caps.architecture.is_booke();
        if caps.interface == Interface::Handles && booke {
            return start <= addr && start.wrapping_add(length) >= addr;
        }
        if caps.architecture.is_powerpc() {
            let mask = if booke { 3 } else { 7 };
            let addr = addr & !mask;
            return start <= addr.wrapping_add(mask) && start.wrapping_add(length).wrapping_sub(1) >= addr;
        }
        start <= addr && addr < start.wrapping_add(length)
    }

    /// Install a breakpoint or watchpoint on every thread.
    ///
    /// ## Errors
    ///
    /// - `HwPointError::Unsupported`, `HwPointError::AlignmentError`: from
    ///   the encoder
    /// - `HwPointError::CapacityExceeded`: some thread has too few free slots
    ///   (nothing was changed)
    /// - `HwPointError::Kernel`: a registration failed (everything done so
    ///   far was rolled back)
    pub fn insert_point(&mut self, request: &HardwarePointRequest) -> Result<()>
    {
        let caps = self.caps();
        let comparator = self.insert_comparator(request, &caps);
        let fragments = self.encode_request(request, &caps, comparator)?;
        debug!(
            "Inserting {} at {} (length {}) as {} fragment(s)",
            request.kind,
            request.address,
            request.length,
            fragments.len()
        );
        self.insert_fragments(&fragments, &caps)
    }

    /// Remove one reference to a breakpoint or watchpoint from every thread.
    ///
    /// `request` must equal the request used for insertion.
    ///
    /// ## Errors
    ///
    /// - `HwPointError::PointNotFound`: no thread holds the point
    /// - `HwPointError::Kernel`: a deregistration failed for a reason other
    ///   than the kernel having already dropped it
    pub fn remove_point(&mut self, request: &HardwarePointRequest) -> Result<()>
    {
        let caps = self.caps();
        let comparator = self.remove_comparator(request, &caps);
        let mut fragments = self.encode_request(request, &caps, comparator)?;
        if comparator.is_some() && !self.is_installed(&fragments) {
            fragments = self.encode_request(request, &caps, None)?;
        }
        if !self.is_installed(&fragments) {
            return Err(HwPointError::PointNotFound {
                kind: request.kind,
                address: request.address,
            });
        }
        debug!("Removing {} at {}", request.kind, request.address);
        self.remove_fragments(&fragments, &caps)
    }

    /// Install a masked watchpoint on every thread.
    ///
    /// ## Errors
    ///
    /// - `HwPointError::Unsupported`: no masked watchpoint support
    /// - `HwPointError::InvalidArgument`: the mask covers kernel space
    /// - any error of [`HwPointManager::insert_point`]
    pub fn insert_mask_watchpoint(&mut self, kind: PointKind, address: Address, mask: u64) -> Result<()>
    {
        let caps = self.caps();
        let point = encode::encode_masked(kind, address, mask, &caps)?;
        debug!("Inserting masked {} at {} (mask 0x{:x})", kind, address, mask);
        self.insert_fragments(&[point], &caps)
    }

    /// Remove a masked watchpoint from every thread.
    ///
    /// ## Errors
    ///
    /// - `HwPointError::PointNotFound`: no thread holds the point
    /// - any error of [`HwPointManager::remove_point`]
    pub fn remove_mask_watchpoint(&mut self, kind: PointKind, address: Address, mask: u64) -> Result<()>
    {
        let caps = self.caps();
        let point = encode::encode_masked(kind, address, mask, &caps)?;
        if !self.is_installed(&[point]) {
            return Err(HwPointError::PointNotFound { kind, address });
        }
        debug!("Removing masked {} at {} (mask 0x{:x})", kind, address, mask);
        self.remove_fragments(&[point], &caps)
    }

    fn encode_request(
        &self,
        request: &HardwarePointRequest,
        caps: &CapabilitySet,
        comparator: Option<Comparator>,
    ) -> Result<Fragments>
    {
        let options = EncodeOptions {
            restricted: self.degradation.restriction(),
            comparator,
        };
        encode::encode(request, caps, &options)
    }

    fn insert_comparator(&self, request: &HardwarePointRequest, caps: &CapabilitySet) -> Option<Comparator>
    {
        let in_use = self
            .sets
            .iter()
            .map(|set| set.table(RegisterBank::Watchpoints).conditions_in_use())
            .max()
            .unwrap_or(0);
        if in_use >= caps.condition_registers {
            return None;
        }
        accelerate(request, caps)
    }

    fn remove_comparator(&self, request: &HardwarePointRequest, caps: &CapabilitySet) -> Option<Comparator>
    {
        if caps.condition_registers == 0 {
            return None;
        }
        accelerate(request, caps)
    }

    fn is_installed(&self, fragments: &[EncodedPoint]) -> bool
    {
        let Some(first) = fragments.first() else {
            return false;
        };
        let bank = first.kind.bank();
        self.sets
            .iter()
            .any(|set| fragments.iter().all(|point| set.table(bank).find(point).is_some()))
    }

    fn insert_fragments(&mut self, fragments: &[EncodedPoint], caps: &CapabilitySet) -> Result<()>
    {
        let Some(first) = fragments.first() else {
            return Ok(());
        };
        let bank = first.kind.bank();
        let threads = self.threads.clone();
        for tid in &threads {
            self.sets.get_or_create(*tid, caps).table(bank).can_accept(fragments)?;
        }

        let mut journal: Vec<(ThreadId, EncodedPoint)> = Vec::new();
        for tid in threads {
            for point in fragments {
                if let Err(err) = self.install(tid, point, caps) {
                    warn!("Inserting {} failed on thread {}, rolling back: {}", point, tid, err);
                    self.rollback(&journal, caps);
                    return Err(err);
                }
                journal.push((tid, *point));
            }
        }
        self.dump_state("insert");
        Ok(())
    }

    fn rollback(&mut self, journal: &[(ThreadId, EncodedPoint)], caps: &CapabilitySet)
    {
        for (tid, point) in journal.iter().rev() {
            if let Err(err) = self.uninstall(*tid, point, caps) {
                warn!("Rollback of {} on thread {} failed: {}", point, tid, err);
            }
        }
    }

    fn remove_fragments(&mut self, fragments: &[EncodedPoint], caps: &CapabilitySet) -> Result<()>
    {
        let threads = self.threads.clone();
        let mut journal: Vec<(ThreadId, EncodedPoint)> = Vec::new();
        for tid in threads {
            for point in fragments {
                match self.uninstall(tid, point, caps) {
                    Ok(Some(_)) => journal.push((tid, *point)),
                    Ok(None) => {}
                    Err(err) => {
                        warn!("Removing {} failed on thread {}, restoring: {}", point, tid, err);
                        self.restore(&journal, caps);
                        return Err(err);
                    }
                }
            }
        }
        self.dump_state("remove");
        Ok(())
    }

    fn restore(&mut self, journal: &[(ThreadId, EncodedPoint)], caps: &CapabilitySet)
    {
        for (tid, point) in journal.iter().rev() {
            if let Err(err) = self.install(*tid, point, caps) {
                warn!("Restoring {} on thread {} failed: {}", point, tid, err);
            }
        }
    }

    fn install(&mut self, tid: ThreadId, point: &EncodedPoint, caps: &CapabilitySet) -> Result<()>
    {
        self.kernel
            .pause_for_update(tid)
            .map_err(|err| HwPointError::kernel("pause_for_update", tid, err))?;

        let interface = caps.interface;
        let booke = caps.architecture.is_booke();
        let bank = point.kind.bank();
        let Self {
            kernel,
            sets,
            legacy_value,
            ..
        } = self;
        let set = sets.get_or_create(tid, caps);
        let insertion = set.table_mut(bank).insert_with(point, |point| match interface {
            Interface::Handles => kernel
                .register_point(tid, point)
                .map(Some)
                .map_err(|err| HwPointError::kernel("register_point", tid, err)),
            Interface::Legacy => {
                let value = powerpc::dabr_value(point.address, point.kind, booke);
                kernel
                    .write_legacy_register(tid, value)
                    .map_err(|err| HwPointError::kernel("write_legacy_register", tid, err))?;
                *legacy_value = value;
                Ok(None)
            }
            Interface::RegisterArray | Interface::Unavailable => Ok(None),
        })?;

        if insertion.fresh && interface == Interface::RegisterArray {
            set.mark_dirty(bank, insertion.index);
        }
        debug!(
            "Thread {}: {} slot {} holds {} (fresh: {})",
            tid, bank, insertion.index, point, insertion.fresh
        );
        Ok(())
    }

    /// Drop one reference on `tid`. Threads that never got the point are
    /// skipped.
    fn uninstall(&mut self, tid: ThreadId, point: &EncodedPoint, caps: &CapabilitySet) -> Result<Option<Removal>>
    {
        let interface = caps.interface;
        let bank = point.kind.bank();
        let Self {
            kernel,
            sets,
            legacy_value,
            ..
        } = self;
        let Some(set) = sets.get_mut(tid) else {
            return Ok(None);
        };
        if set.table(bank).find(point).is_none() {
            return Ok(None);
        }

        let removal = set.table_mut(bank).remove_with(point, |handle| match (interface, handle) {
            (Interface::Handles, Some(handle)) => deregister_tolerant(kernel, tid, handle),
            (Interface::Legacy, _) => {
                kernel
                    .write_legacy_register(tid, 0)
                    .map_err(|err| HwPointError::kernel("write_legacy_register", tid, err))?;
                *legacy_value = 0;
                Ok(())
            }
            _ => Ok(()),
        })?;

        if removal.freed && interface == Interface::RegisterArray {
            set.mark_dirty(bank, removal.index);
        }
        debug!(
            "Thread {}: {} slot {} released {} (freed: {})",
            tid, bank, removal.index, point, removal.freed
        );
        Ok(Some(removal))
    }

    /// Write pending register changes of `tid` before it resumes.
    ///
    /// Only register-array kernels defer writes; for the others this does
    /// nothing. The first rejection of a watchpoint bank switches the session
    /// to restricted masks, re-encodes every installed watchpoint and retries.
    ///
    /// ## Errors
    ///
    /// - `HwPointError::KernelRejected`: the kernel rejected the bank again
    ///   after degrading
    /// - `HwPointError::Kernel`: any other write failure
    pub fn prepare_to_resume(&mut self, tid: ThreadId) -> Result<()>
    {
        let caps = self.caps();
        if caps.interface != Interface::RegisterArray {
            return Ok(());
        }
        for bank in BANKS {
            self.flush_bank(tid, bank)?;
        }
        Ok(())
    }

    fn flush_bank(&mut self, tid: ThreadId, bank: RegisterBank) -> Result<()>
    {
        let Some(block) = self
            .sets
            .get(tid)
            .filter(|set| set.dirty(bank) != 0)
            .map(|set| set.table(bank).register_block())
        else {
            return Ok(());
        };

        match self.kernel.write_debug_registers(tid, bank, &block) {
            Ok(()) => {}
            Err(KernelError::Rejected)
                if bank == RegisterBank::Watchpoints && self.degradation.state() == DegradationState::Capable =>
            {
                self.degradation.degrade();
                self.apply_restriction();
                let block = self
                    .sets
                    .get(tid)
                    .map(|set| set.table(bank).register_block())
                    .unwrap_or_default();
                match self.kernel.write_debug_registers(tid, bank, &block) {
                    Ok(()) => {}
                    Err(KernelError::Rejected) => return Err(HwPointError::KernelRejected { thread: tid }),
                    Err(err) => return Err(HwPointError::kernel("write_debug_registers", tid, err)),
                }
            }
            Err(KernelError::Rejected) if bank == RegisterBank::Watchpoints => {
                return Err(HwPointError::KernelRejected { thread: tid });
            }
            Err(err) => return Err(HwPointError::kernel("write_debug_registers", tid, err)),
        }

        if let Some(set) = self.sets.get_mut(tid) {
            set.clear_dirty(bank);
        }
        trace!("Thread {}: wrote {} bank", tid, bank);
        Ok(())
    }

    /// Re-encode every installed watchpoint for the restricted mask table.
    fn apply_restriction(&mut self)
    {
        let Self { sets, degradation, .. } = self;
        for set in sets.iter_mut() {
            let changed = set
                .table_mut(RegisterBank::Watchpoints)
                .rewrite(|point| degradation.restrict(point));
            for index in changed {
                set.mark_dirty(RegisterBank::Watchpoints, index);
            }
        }
        self.dump_state("degrade");
    }

    /// Address of the data access that stopped `tid`, if it stopped on a
    /// hardware watchpoint.
    ///
    /// ## Errors
    ///
    /// - `HwPointError::Kernel`: the signal information could not be read
    pub fn stopped_by_hardware_point(&mut self, tid: ThreadId) -> Result<Option<Address>>
    {
        let caps = self.caps();
        let trap = self
            .kernel
            .last_trap(tid)
            .map_err(|err| HwPointError::kernel("last_trap", tid, err))?;
        let Some(trap) = trap.filter(|trap| trap.hardware) else {
            return Ok(None);
        };

        match caps.interface {
            Interface::RegisterArray => {
                let Some(set) = self.sets.get(tid) else {
                    return Ok(None);
                };
                let table = set.table(RegisterBank::Watchpoints);
                let hit = table
                    .occupied()
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .filter_map(|(_, slot)| slot.point())
                    .find(|point| {
                        let lowest = point.address.align_down(caps.alignment);
                        let end = point.hardware_range(caps.alignment).end;
                        lowest <= trap.address && trap.address < end
                    });
                Ok(hit.map(|point| point.watched.clamp_address(trap.address)))
            }
            Interface::Handles => {
                let breakpoint_hit = trap.slot_hint.is_some_and(|hint| {
                    self.sets.get(tid).is_some_and(|set| {
                        set.table(RegisterBank::Breakpoints)
                            .find_handle(SlotHandle(hint))
                            .is_some()
                    })
                });
                Ok((!breakpoint_hit).then_some(trap.address))
            }
            Interface::Legacy => Ok(Some(trap.address)),
            Interface::Unavailable => Ok(None),
        }
    }

    /// Start tracking a new thread and replicate the installed points to it.
    ///
    /// Handle-based kernels get every point registered again (stale
    /// inherited handles are deleted first); register-array kernels get a
    /// copy of the slots written on the next resume; the legacy register is
    /// rewritten with the current value.
    ///
    /// ## Errors
    ///
    /// - `HwPointError::Kernel`: registering a point on the new thread
    ///   failed (registrations made for it were undone and the thread is
    ///   not tracked)
    pub fn on_new_thread(&mut self, tid: ThreadId) -> Result<()>
    {
        let caps = self.caps();
        let template = self.sets.last().filter(|set| set.tid() != tid).cloned();
        debug!("New thread {} (template: {:?})", tid, template.as_ref().map(ThreadPointSet::tid));

        match caps.interface {
            Interface::Handles => {
                if let Some(template) = template {
                    let set = self.replicate_handles(tid, &template)?;
                    self.sets.insert(set);
                }
            }
            Interface::RegisterArray => {
                if let Some(template) = template {
                    let mut set = ThreadPointSet::inherit(tid, &template);
                    set.mark_all_dirty();
                    self.sets.insert(set);
                }
            }
            Interface::Legacy => {
                if let Err(err) = self.kernel.write_legacy_register(tid, self.legacy_value) {
                    warn!("Could not copy the legacy debug register to thread {}: {}", tid, err);
                }
                if let Some(template) = template {
                    self.sets.insert(ThreadPointSet::inherit(tid, &template));
                }
            }
            Interface::Unavailable => {}
        }
        if !self.threads.contains(&tid) {
            self.threads.push(tid);
        }
        self.dump_state("new thread");
        Ok(())
    }

    fn replicate_handles(&mut self, tid: ThreadId, template: &ThreadPointSet) -> Result<ThreadPointSet>
    {
        self.kernel
            .pause_for_update(tid)
            .map_err(|err| HwPointError::kernel("pause_for_update", tid, err))?;

        let mut set = ThreadPointSet::inherit(tid, template);
        let mut registered = Vec::new();
        for bank in BANKS {
            let entries: Vec<(usize, EncodedPoint, Option<SlotHandle>)> = set
                .table(bank)
                .occupied()
                .filter_map(|(index, slot)| slot.point().map(|point| (index, *point, slot.handle())))
                .collect();
            for (index, point, stale) in entries {
                if let Some(stale) = stale {
                    if let Err(err) = self.kernel.deregister_point(tid, stale) {
                        trace!("Thread {}: stale handle {} not released: {}", tid, stale, err);
                    }
                }
                match self.kernel.register_point(tid, &point) {
                    Ok(handle) => {
                        set.table_mut(bank).set_handle(index, Some(handle));
                        registered.push(handle);
                    }
                    Err(err) => {
                        for handle in registered {
                            if let Err(err) = self.kernel.deregister_point(tid, handle) {
                                warn!("Thread {}: could not undo registration {}: {}", tid, handle, err);
                            }
                        }
                        return Err(HwPointError::kernel("register_point", tid, err));
                    }
                }
            }
        }
        Ok(set)
    }

    /// Forget a thread that exited. Never fails: kernel handles are released
    /// on a best-effort basis since the thread may already be gone.
    pub fn on_thread_exit(&mut self, tid: ThreadId)
    {
        self.threads.retain(|thread| *thread != tid);
        let Some(mut set) = self.sets.remove(tid) else {
            return;
        };
        for bank in BANKS {
            for handle in set.table_mut(bank).release_all() {
                if let Err(err) = self.kernel.deregister_point(tid, handle) {
                    trace!("Thread {} exited; handle {} not released: {}", tid, handle, err);
                }
            }
        }
        debug!("Thread {} exited, point set released", tid);
    }

    fn dump_state(&self, operation: &str)
    {
        if !self.config.show_debug_regs {
            return;
        }
        self.for_each_thread(|set| trace!("{}: {}", operation, set));
    }
}

fn accelerate(request: &HardwarePointRequest, caps: &CapabilitySet) -> Option<Comparator>
{
    let condition = request.condition.as_ref()?;
    if caps.interface != Interface::Handles || caps.uses_ranges(request.length) {
        return None;
    }
    ConditionAccelerator::new(caps.condition_width).try_accelerate(request.address, request.length, condition)
}

fn deregister_tolerant<K: DebugRegisterInterface + ?Sized>(kernel: &mut K, tid: ThreadId, handle: SlotHandle)
-> Result<()>
{
    match kernel.deregister_point(tid, handle) {
        Ok(()) => Ok(()),
        Err(err @ (KernelError::NotFound | KernelError::NoSuchThread)) => {
            warn!("Thread {}: registration {} already gone ({}), freeing slot", tid, handle, err);
            Ok(())
        }
        Err(err) => Err(HwPointError::kernel("deregister_point", tid, err)),
    }
}

fn fits_window(address: Address, length: u64, window: u64) -> bool
{
    if window == 0 {
        return true;
    }
    address.value().saturating_add(length) <= address.align_down(window).value().saturating_add(window)
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::platform::sim::SimulatedKernel;

    #[test]
    fn test_fits_window()
    {
        assert!(fits_window(Address::new(0x1004), 4, 8));
        assert!(!fits_window(Address::new(0x1006), 4, 8));
        assert!(fits_window(Address::new(0x1006), 4, 0));
    }

    #[test]
    fn test_array_insert_is_deferred()
    {
        let mut manager = HwPointManager::new(SimulatedKernel::aarch64(2, 2), ThreadId(1), ManagerConfig::default());
        let request = HardwarePointRequest::watch(PointKind::Write, Address::new(0x1000), 4);
        manager.insert_point(&request).unwrap();
        assert!(manager.has_active_points(ThreadId(1), RegisterBank::Watchpoints));
        assert!(manager.kernel().writes().is_empty());

        manager.prepare_to_resume(ThreadId(1)).unwrap();
        assert_eq!(manager.kernel().writes().len(), 1);
    }

    #[test]
    fn test_watchpoint_addr_within_range_server()
    {
        let mut manager = HwPointManager::new(SimulatedKernel::powerpc_legacy(false), ThreadId(1), ManagerConfig::default());
        // Trap addresses are reported at doubleword granularity.
        assert!(manager.watchpoint_addr_within_range(Address::new(0x1003), Address::new(0x1006), 2));
        assert!(!manager.watchpoint_addr_within_range(Address::new(0x1008), Address::new(0x1000), 8));
    }
}
