//! Tests for request encoding

use hwpoint_core::arch::powerpc::{self, PpcDebugInfo};
use hwpoint_core::capability::CapabilitySet;
use hwpoint_core::degrade::MaskTable;
use hwpoint_core::encode::{encode, encode_masked, EncodeOptions};
use hwpoint_core::error::HwPointError;
use hwpoint_core::point::{ByteMask, Comparator, HardwarePointRequest, PointKind, Span};
use hwpoint_core::types::{AddrRange, Address, Architecture};

fn arm(breakpoints: u32, watchpoints: u32) -> CapabilitySet
{
    CapabilitySet::aarch64(Architecture::AArch64, Some(0x0600 | breakpoints), Some(0x0600 | watchpoints))
}

fn booke() -> CapabilitySet
{
    let info = PpcDebugInfo {
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
    };
    CapabilitySet::powerpc(Architecture::PowerPcBookE, &info).unwrap()
}

fn server() -> CapabilitySet
{
    let info = PpcDebugInfo {
        version: powerpc::DEBUG_CURRENT_VERSION,
        num_instruction_bps: 0,
        num_data_bps: 1,
        num_condition_regs: 0,
        data_bp_alignment: 8,
        sizeof_condition: 0,
        features: powerpc::FEATURE_DATA_BP_RANGE | powerpc::FEATURE_DATA_BP_DAWR,
    };
    CapabilitySet::powerpc(Architecture::PowerPc, &info).unwrap()
}

fn write(address: u64, length: u64) -> HardwarePointRequest
{
    HardwarePointRequest::watch(PointKind::Write, Address::new(address), length)
}

#[test]
fn test_aligned_word_uses_one_slot()
{
    let fragments = encode(&write(0x1000, 4), &arm(2, 2), &EncodeOptions::default()).unwrap();
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].address, Address::new(0x1000));
    assert_eq!(fragments[0].span, Span::Bytes(ByteMask::from_bits(0x0f)));
    assert_eq!(fragments[0].watched, AddrRange::from_len(Address::new(0x1000), 4));
}

#[test]
fn test_unaligned_word_splits_at_window()
{
    let fragments = encode(&write(0x1006, 4), &arm(2, 2), &EncodeOptions::default()).unwrap();
    assert_eq!(fragments.len(), 2);

    assert_eq!(fragments[0].address, Address::new(0x1000));
    assert_eq!(fragments[0].span, Span::Bytes(ByteMask::from_bits(0xc0)));
    assert_eq!(fragments[0].watched, AddrRange::from_len(Address::new(0x1006), 2));

    assert_eq!(fragments[1].address, Address::new(0x1008));
    assert_eq!(fragments[1].span, Span::Bytes(ByteMask::from_bits(0x03)));
    assert_eq!(fragments[1].watched, AddrRange::from_len(Address::new(0x1008), 2));
}

#[test]
fn test_fragments_cover_request_exactly()
{
    let caps = arm(2, 16);
    for start in 0x1000..0x1010u64 {
        for length in 1..=24u64 {
            let fragments = encode(&write(start, length), &caps, &EncodeOptions::default()).unwrap();
            let mut next = Address::new(start);
            for fragment in &fragments {
                assert_eq!(fragment.watched.start, next, "gap at {next} for {start:#x}+{length}");
                assert!(!fragment.watched.is_empty());
                let hardware = fragment.hardware_range(8);
                assert!(hardware.start <= fragment.watched.start && fragment.watched.end <= hardware.end);
                next = fragment.watched.end;
            }
            assert_eq!(next, Address::new(start + length));
        }
    }
}

#[test]
fn test_restricted_table_rounds_masks_up()
{
    let table = MaskTable::default();
    let options = EncodeOptions {
        restricted: Some(&table),
        comparator: None,
    };

    let fragments = encode(&write(0x1001, 2), &arm(2, 2), &options).unwrap();
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].span, Span::Bytes(ByteMask::from_bits(0x0f)));
    assert_eq!(fragments[0].watched, AddrRange::from_len(Address::new(0x1001), 2));

    let fragments = encode(&write(0x1006, 4), &arm(2, 2), &options).unwrap();
    let masks: Vec<Span> = fragments.iter().map(|f| f.span).collect();
    assert_eq!(
        masks,
        vec![
            Span::Bytes(ByteMask::FULL),
            Span::Bytes(ByteMask::from_bits(0x03))
        ]
    );
    for fragment in &fragments {
        if let Span::Bytes(mask) = fragment.span {
            assert!(table.contains(mask));
        }
    }
}

#[test]
fn test_capacity_exceeded_reports_windows()
{
    let result = encode(&write(0x1000, 64), &arm(2, 2), &EncodeOptions::default());
    match result {
        Err(HwPointError::CapacityExceeded { needed, available, .. }) => {
            assert_eq!(needed, 8);
            assert_eq!(available, 2);
        }
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }
}

#[test]
fn test_huge_unaligned_length_exceeds_capacity()
{
    let result = encode(&write(0x1001, u64::MAX), &arm(2, 4), &EncodeOptions::default());
    match result {
        Err(HwPointError::CapacityExceeded { needed, available, .. }) => {
            assert_eq!(available, 4);
            assert!(needed > 4);
        }
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }

    let restricted = MaskTable::default();
    let options = EncodeOptions {
        restricted: Some(&restricted),
        comparator: None,
    };
    assert!(matches!(
        encode(&write(0x1007, u64::MAX - 0x1007), &arm(2, 2), &options),
        Err(HwPointError::CapacityExceeded { available: 2, .. })
    ));
}

#[test]
fn test_zero_length_watch_is_rejected()
{
    assert!(matches!(
        encode(&write(0x1000, 0), &arm(2, 2), &EncodeOptions::default()),
        Err(HwPointError::AlignmentError { .. })
    ));
}

#[test]
fn test_no_slots_is_unsupported()
{
    let caps = CapabilitySet::unavailable(Architecture::AArch64);
    assert!(matches!(
        encode(&write(0x1000, 4), &caps, &EncodeOptions::default()),
        Err(HwPointError::Unsupported(_))
    ));
    assert!(matches!(
        encode(&write(0x1000, 4), &arm(2, 0), &EncodeOptions::default()),
        Err(HwPointError::Unsupported(_))
    ));
}

#[test]
fn test_arm_breakpoint_encoding()
{
    let request = HardwarePointRequest::breakpoint(Address::new(0x4000));
    let fragments = encode(&request, &arm(2, 2), &EncodeOptions::default()).unwrap();
    assert_eq!(fragments[0].kind, PointKind::Execute);
    assert_eq!(fragments[0].span, Span::Bytes(ByteMask::from_bits(0x0f)));
    assert_eq!(fragments[0].watched, AddrRange::from_len(Address::new(0x4000), 4));

    let ranged = HardwarePointRequest::ranged_breakpoint(Address::new(0x4000), 0x40);
    assert!(matches!(
        encode(&ranged, &arm(2, 2), &EncodeOptions::default()),
        Err(HwPointError::Unsupported(_))
    ));
}

#[test]
fn test_arm32_breakpoint_halfword()
{
    let caps = CapabilitySet::aarch64(Architecture::AArch32, Some(0x0602), Some(0x0602));
    let request = HardwarePointRequest::breakpoint(Address::new(0x4002));
    let fragments = encode(&request, &caps, &EncodeOptions::default()).unwrap();
    assert_eq!(fragments[0].span, Span::Bytes(ByteMask::from_bits(0x03)));
}

#[test]
fn test_arm32_breakpoint_instruction_sizes()
{
    let caps = CapabilitySet::aarch64(Architecture::AArch32, Some(0x0602), Some(0x0602));

    let arm_insn = HardwarePointRequest::sized_breakpoint(Address::new(0x4000), 4);
    let fragments = encode(&arm_insn, &caps, &EncodeOptions::default()).unwrap();
    assert_eq!(fragments[0].span, Span::Bytes(ByteMask::from_bits(0x0f)));
    assert_eq!(fragments[0].watched, AddrRange::from_len(Address::new(0x4000), 4));

    let thumb = HardwarePointRequest::sized_breakpoint(Address::new(0x4002), 2);
    let fragments = encode(&thumb, &caps, &EncodeOptions::default()).unwrap();
    assert_eq!(fragments[0].span, Span::Bytes(ByteMask::from_bits(0x03)));
    assert_eq!(fragments[0].watched, AddrRange::from_len(Address::new(0x4002), 2));

    // A 32-bit Thumb-2 instruction still traps on its first halfword
    let thumb2 = HardwarePointRequest::sized_breakpoint(Address::new(0x4002), 3);
    let fragments = encode(&thumb2, &caps, &EncodeOptions::default()).unwrap();
    assert_eq!(fragments[0].span, Span::Bytes(ByteMask::from_bits(0x03)));
    assert_eq!(fragments[0].watched, AddrRange::from_len(Address::new(0x4002), 4));

    let halfword = HardwarePointRequest::sized_breakpoint(Address::new(0x4000), 2);
    assert!(matches!(
        encode(&halfword, &arm(2, 2), &EncodeOptions::default()),
        Err(HwPointError::InvalidArgument(_))
    ));
}

#[test]
fn test_booke_range_takes_two_registers()
{
    let fragments = encode(&write(0x1001, 100), &booke(), &EncodeOptions::default()).unwrap();
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].registers, 2);
    assert_eq!(fragments[0].address, Address::new(0x1001));
    assert_eq!(
        fragments[0].span,
        Span::Range {
            end: Address::new(0x1001 + 100)
        }
    );

    let ranged = HardwarePointRequest::ranged_breakpoint(Address::new(0x4000), 0x40);
    let fragments = encode(&ranged, &booke(), &EncodeOptions::default()).unwrap();
    assert_eq!(
        fragments[0].span,
        Span::Range {
            end: Address::new(0x4040)
        }
    );
}

#[test]
fn test_comparator_only_on_single_exact_fragment()
{
    let comparator = Comparator {
        byte_enables: 0x0f,
        value: 7,
    };
    let options = EncodeOptions {
        restricted: None,
        comparator: Some(comparator),
    };

    let fragments = encode(&write(0x1000, 1), &booke(), &options).unwrap();
    assert_eq!(fragments[0].span, Span::Exact);
    assert_eq!(fragments[0].condition, Some(comparator));

    let fragments = encode(&write(0x1000, 4), &booke(), &options).unwrap();
    assert_eq!(fragments[0].condition, None);
}

#[test]
fn test_dawr_ranges_split_at_512_bytes()
{
    let fragments = encode(&write(0x10f8, 16), &server(), &EncodeOptions::default()).unwrap();
    assert_eq!(fragments.len(), 1);
    assert_eq!(
        fragments[0].span,
        Span::Range {
            end: Address::new(0x1108)
        }
    );

    match encode(&write(0x11f8, 16), &server(), &EncodeOptions::default()) {
        Err(HwPointError::CapacityExceeded { needed, available, .. }) => {
            assert_eq!(needed, 2);
            assert_eq!(available, 1);
        }
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }
}

#[test]
fn test_masked_watchpoint()
{
    let mask = 0xffff_ffff_ffff_fff0;
    let point = encode_masked(PointKind::Access, Address::new(0x1000), mask, &booke()).unwrap();
    assert_eq!(point.registers, 2);
    assert_eq!(point.span, Span::Masked { mask });
    assert_eq!(point.watched, AddrRange::from_len(Address::new(0x1000), 16));

    assert!(matches!(
        encode_masked(PointKind::Access, Address::new(0x1000), 0x0000_fff0, &booke()),
        Err(HwPointError::InvalidArgument(_))
    ));
    assert!(matches!(
        encode_masked(PointKind::Access, Address::new(0x1000), mask, &arm(2, 2)),
        Err(HwPointError::Unsupported(_))
    ));
}
