//! Tests for the manager on register-array (AArch64) kernels
//!
//! These drive [`HwPointManager`] against the simulated kernel and check what
//! ends up in each thread's debug registers.

use hwpoint_core::arch::aarch64;
use hwpoint_core::config::ManagerConfig;
use hwpoint_core::degrade::{DegradationState, MaskTable};
use hwpoint_core::error::{HwPointError, KernelError};
use hwpoint_core::kernel::{DebugRegisterInterface, TrapInfo};
use hwpoint_core::manager::{HardwareAvailability, HwPointManager};
use hwpoint_core::platform::sim::{Operation, SimulatedKernel};
use hwpoint_core::point::{ByteMask, HardwarePointRequest, PointKind, RegisterBank};
use hwpoint_core::types::{Address, ThreadId};

const LEADER: ThreadId = ThreadId(100);

fn manager(kernel: SimulatedKernel) -> HwPointManager<SimulatedKernel>
{
    HwPointManager::new(kernel, LEADER, ManagerConfig::default())
}

fn write(address: u64, length: u64) -> HardwarePointRequest
{
    HardwarePointRequest::watch(PointKind::Write, Address::new(address), length)
}

fn used(manager: &HwPointManager<SimulatedKernel>, tid: ThreadId, bank: RegisterBank) -> usize
{
    manager.thread_points(tid).map_or(0, |set| set.table(bank).used())
}

#[test]
fn test_split_watch_does_not_fit_last_slot()
{
    let mut manager = manager(SimulatedKernel::aarch64(2, 2));
    manager.insert_point(&write(0x1000, 4)).unwrap();
    assert_eq!(used(&manager, LEADER, RegisterBank::Watchpoints), 1);

    match manager.insert_point(&write(0x1006, 4)) {
        Err(HwPointError::CapacityExceeded { needed, available, .. }) => {
            assert_eq!(needed, 2);
            assert_eq!(available, 1);
        }
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }
    // Nothing from the failed request was kept
    assert_eq!(used(&manager, LEADER, RegisterBank::Watchpoints), 1);
}

#[test]
fn test_identical_requests_share_a_slot()
{
    let mut manager = manager(SimulatedKernel::aarch64(2, 2));
    let request = write(0x2000, 8);

    manager.insert_point(&request).unwrap();
    manager.insert_point(&request).unwrap();
    let set = manager.thread_points(LEADER).unwrap();
    let table = set.table(RegisterBank::Watchpoints);
    assert_eq!(table.used(), 1);
    assert_eq!(table.get(0).unwrap().ref_count(), 2);

    manager.remove_point(&request).unwrap();
    assert!(manager.has_active_points(LEADER, RegisterBank::Watchpoints));

    manager.remove_point(&request).unwrap();
    assert!(!manager.has_active_points(LEADER, RegisterBank::Watchpoints));

    assert!(matches!(
        manager.remove_point(&request),
        Err(HwPointError::PointNotFound { .. })
    ));
}

#[test]
fn test_resume_writes_control_words()
{
    let mut manager = manager(SimulatedKernel::aarch64(2, 2));
    manager.insert_point(&write(0x1006, 4)).unwrap();
    manager
        .insert_point(&HardwarePointRequest::breakpoint(Address::new(0x4000)))
        .unwrap();
    manager.prepare_to_resume(LEADER).unwrap();

    let watch = manager.kernel().registers(LEADER, RegisterBank::Watchpoints).unwrap();
    assert_eq!(watch.pairs[0].address, 0x1000);
    assert_eq!(
        watch.pairs[0].control,
        aarch64::control_word(PointKind::Write, ByteMask::from_bits(0xc0))
    );
    assert_eq!(watch.pairs[1].address, 0x1008);
    assert_eq!(
        watch.pairs[1].control,
        aarch64::control_word(PointKind::Write, ByteMask::from_bits(0x03))
    );

    let breaks = manager.kernel().registers(LEADER, RegisterBank::Breakpoints).unwrap();
    assert_eq!(breaks.pairs[0].address, 0x4000);
    assert!(breaks.pairs[0].is_enabled());

    // Clean banks are not written again
    let writes = manager.kernel().writes().len();
    manager.prepare_to_resume(LEADER).unwrap();
    assert_eq!(manager.kernel().writes().len(), writes);
}

#[test]
fn test_new_thread_gets_identical_registers()
{
    let mut manager = manager(SimulatedKernel::aarch64(4, 4));
    manager.insert_point(&write(0x1000, 4)).unwrap();
    manager.insert_point(&write(0x3003, 2)).unwrap();
    manager
        .insert_point(&HardwarePointRequest::breakpoint(Address::new(0x4000)))
        .unwrap();
    manager.prepare_to_resume(LEADER).unwrap();

    let child = ThreadId(101);
    manager.on_new_thread(child).unwrap();
    assert_eq!(manager.threads(), &[LEADER, child]);
    manager.prepare_to_resume(child).unwrap();

    for bank in [RegisterBank::Breakpoints, RegisterBank::Watchpoints] {
        let parent = manager.kernel_mut().read_debug_registers(LEADER, bank).unwrap();
        let copy = manager.kernel_mut().read_debug_registers(child, bank).unwrap();
        assert_eq!(parent, copy, "{bank} differ");
    }
}

#[test]
fn test_insert_after_new_thread_reaches_both()
{
    let mut manager = manager(SimulatedKernel::aarch64(2, 2));
    let child = ThreadId(101);
    manager.on_new_thread(child).unwrap();
    manager.insert_point(&write(0x1000, 8)).unwrap();

    assert_eq!(used(&manager, LEADER, RegisterBank::Watchpoints), 1);
    assert_eq!(used(&manager, child, RegisterBank::Watchpoints), 1);

    manager.on_thread_exit(child);
    assert!(manager.thread_points(child).is_none());
    assert_eq!(manager.threads(), &[LEADER]);
}

#[test]
fn test_rejection_degrades_and_retries()
{
    let kernel = SimulatedKernel::aarch64(2, 4).with_restricted_masks(MaskTable::default());
    let mut manager = manager(kernel);
    let request = write(0x1001, 2);

    manager.insert_point(&request).unwrap();
    assert_eq!(manager.degradation(), DegradationState::Capable);

    manager.prepare_to_resume(LEADER).unwrap();
    assert_eq!(manager.degradation(), DegradationState::Degraded);
    assert_eq!(manager.kernel().count(Operation::WriteRegisters), 2);

    let block = manager.kernel().registers(LEADER, RegisterBank::Watchpoints).unwrap();
    assert_eq!(block.pairs[0].address, 0x1000);
    assert_eq!(aarch64::control_mask(block.pairs[0].control), ByteMask::from_bits(0x0f));

    // Removal re-encodes with the restricted table and still finds the slot
    manager.remove_point(&request).unwrap();
    manager.prepare_to_resume(LEADER).unwrap();
    let block = manager.kernel().registers(LEADER, RegisterBank::Watchpoints).unwrap();
    assert_eq!(block.enabled().count(), 0);
}

#[test]
fn test_second_rejection_is_an_error()
{
    let mut kernel = SimulatedKernel::aarch64(2, 2);
    kernel.fail_next(Operation::WriteRegisters, KernelError::Rejected);
    kernel.fail_next(Operation::WriteRegisters, KernelError::Rejected);
    let mut manager = manager(kernel);

    manager.insert_point(&write(0x1000, 4)).unwrap();
    match manager.prepare_to_resume(LEADER) {
        Err(HwPointError::KernelRejected { thread }) => assert_eq!(thread, LEADER),
        other => panic!("expected KernelRejected, got {other:?}"),
    }
    assert_eq!(manager.degradation(), DegradationState::Degraded);
}

#[test]
fn test_other_write_errors_do_not_degrade()
{
    let mut kernel = SimulatedKernel::aarch64(2, 2);
    kernel.fail_next(Operation::WriteRegisters, KernelError::Os(libc::EPERM));
    let mut manager = manager(kernel);

    manager.insert_point(&write(0x1000, 4)).unwrap();
    match manager.prepare_to_resume(LEADER) {
        Err(HwPointError::Kernel { operation, source, .. }) => {
            assert_eq!(operation, "write_debug_registers");
            assert_eq!(source, KernelError::Os(libc::EPERM));
        }
        other => panic!("expected Kernel error, got {other:?}"),
    }
    assert_eq!(manager.degradation(), DegradationState::Capable);

    // Still dirty, so the next resume retries
    manager.prepare_to_resume(LEADER).unwrap();
    assert_eq!(manager.kernel().writes().len(), 1);
}

#[test]
fn test_assume_restricted_masks_from_config()
{
    let kernel = SimulatedKernel::aarch64(2, 2).with_restricted_masks(MaskTable::default());
    let config = ManagerConfig::default().with_assume_restricted_masks(true);
    let mut manager = HwPointManager::new(kernel, LEADER, config);
    assert_eq!(manager.degradation(), DegradationState::Degraded);

    manager.insert_point(&write(0x1001, 2)).unwrap();
    manager.prepare_to_resume(LEADER).unwrap();
    assert_eq!(manager.kernel().count(Operation::WriteRegisters), 1);
}

#[test]
fn test_stopped_data_address_is_clamped_to_request()
{
    let mut manager = manager(SimulatedKernel::aarch64(2, 2));
    manager.insert_point(&write(0x1006, 2)).unwrap();
    manager.prepare_to_resume(LEADER).unwrap();

    // An 8-byte store at 0x1000 touches the watched bytes
    manager.kernel_mut().inject_trap(
        LEADER,
        TrapInfo {
            hardware: true,
            address: Address::new(0x1000),
            slot_hint: None,
        },
    );
    assert_eq!(
        manager.stopped_by_hardware_point(LEADER).unwrap(),
        Some(Address::new(0x1006))
    );

    manager.kernel_mut().inject_trap(
        LEADER,
        TrapInfo {
            hardware: true,
            address: Address::new(0x2000),
            slot_hint: None,
        },
    );
    assert_eq!(manager.stopped_by_hardware_point(LEADER).unwrap(), None);

    manager.kernel_mut().inject_trap(
        LEADER,
        TrapInfo {
            hardware: false,
            address: Address::new(0x1006),
            slot_hint: None,
        },
    );
    assert_eq!(manager.stopped_by_hardware_point(LEADER).unwrap(), None);
}

#[test]
fn test_stopped_data_address_in_second_fragment()
{
    let mut manager = manager(SimulatedKernel::aarch64(2, 2));
    manager.insert_point(&write(0x1006, 4)).unwrap();
    manager.prepare_to_resume(LEADER).unwrap();

    for (trap, reported) in [(0x1004, 0x1006), (0x1009, 0x1009)] {
        manager.kernel_mut().inject_trap(
            LEADER,
            TrapInfo {
                hardware: true,
                address: Address::new(trap),
                slot_hint: None,
            },
        );
        assert_eq!(
            manager.stopped_by_hardware_point(LEADER).unwrap(),
            Some(Address::new(reported))
        );
    }
}

#[test]
fn test_capabilities_are_probed_once()
{
    let mut manager = manager(SimulatedKernel::aarch64(2, 2));
    assert_eq!(manager.kernel().count(Operation::DebugInfo), 0);

    let slots = manager.capabilities().watchpoint_slots;
    assert_eq!(slots, 2);
    manager.insert_point(&write(0x1000, 4)).unwrap();
    manager.insert_point(&write(0x2000, 8)).unwrap();
    manager.remove_point(&write(0x1000, 4)).unwrap();
    assert!(manager.region_ok_for_watchpoint(Address::new(0x3000), 8));
    manager.on_new_thread(ThreadId(101)).unwrap();
    assert_eq!(manager.capabilities().watchpoint_slots, slots);

    assert_eq!(manager.kernel().count(Operation::DebugInfo), 1);
}

#[test]
fn test_availability_and_region_checks()
{
    let mut manager = manager(SimulatedKernel::aarch64(2, 4));
    assert_eq!(
        manager.can_use_hardware_point(PointKind::Write, 10, 10),
        HardwareAvailability::Available
    );
    assert!(manager.region_ok_for_watchpoint(Address::new(0x1000), 32));
    assert!(!manager.region_ok_for_watchpoint(Address::new(0x1004), 32));
    assert!(!manager.region_ok_for_watchpoint(Address::new(0x1000), 0));
    assert_eq!(manager.ranged_break_num_registers(), None);
    assert_eq!(
        manager
            .masked_watch_num_registers(Address::new(0x1000), 0xffff_ffff_ffff_fff0)
            .unwrap(),
        None
    );

    let mut no_watch = HwPointManager::new(SimulatedKernel::aarch64(2, 0), LEADER, ManagerConfig::default());
    assert_eq!(
        no_watch.can_use_hardware_point(PointKind::Read, 1, 0),
        HardwareAvailability::Unsupported
    );
    assert_eq!(
        no_watch.can_use_hardware_point(PointKind::Execute, 1, 0),
        HardwareAvailability::Available
    );
}
