//! # Point Encoder
//!
//! Pure translation of a [`HardwarePointRequest`] into the hardware entries
//! that implement it. Nothing here touches slots or the kernel.
//!
//! ## Watchpoint Splitting
//!
//! Hardware watches a fixed-size, aligned window per slot. A request that
//! crosses a window boundary (or is wider than one window) is split at every
//! boundary:
//!
//! ```text
//! request  0x1006 .. 0x100a
//! windows  |0x1000 ....... 0x1008|0x1008 ....... 0x1010|
//! entries          [1006,1008)    [1008,100a)
//! ```
//!
//! Each entry remembers the part of the request it covers; the union of those
//! parts is the request again. With byte-granular enables the entry watches
//! exactly its part; without them (or on a restricted kernel) the watched
//! bytes are rounded up, which can cause false positives for read and access
//! watchpoints but never hides a write.

use smallvec::{SmallVec, smallvec};

use crate::arch::aarch64;
use crate::capability::{CapabilitySet, Features, Interface};
use crate::degrade::MaskTable;
use crate::error::{HwPointError, Result};
use crate::point::{ByteMask, Comparator, EncodedPoint, HardwarePointRequest, PointKind, Span};
use crate::types::{AddrRange, Address, Architecture};

/// Encoded entries of one request. Almost always one, sometimes two.
pub type Fragments = SmallVec<[EncodedPoint; 2]>;

/// Top address bits a PowerPC masked watchpoint must keep, so the mask never
/// covers kernel space.
pub const USER_MASK_BITS: u64 = 0xC000_0000;

/// Session state the encoder depends on besides the capability set.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeOptions<'a>
{
    /// Restricted mask table, set once the kernel proved it only accepts
    /// those masks.
    pub restricted: Option<&'a MaskTable>,
    /// Hardware comparator computed by the condition accelerator.
    pub comparator: Option<Comparator>,
}

/// One aligned piece of a watch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchFragment
{
    /// Window base.
    pub base: Address,
    /// First watched byte inside the window.
    pub offset: u64,
    /// Number of watched bytes starting at `offset`.
    pub len: u64,
    /// Part of the request this piece is responsible for.
    pub watched: AddrRange,
}

/// Lazy iterator splitting `[address, address + length)` at window boundaries
///
/// ## Example
///
/// ```rust
/// use hwpoint_core::encode::WatchFragments;
/// use hwpoint_core::types::Address;
///
/// let pieces: Vec<_> = WatchFragments::new(Address::new(0x1006), 4, 8, None).collect();
/// assert_eq!(pieces.len(), 2);
/// assert_eq!(pieces[0].watched.end, Address::new(0x1008));
/// assert_eq!(pieces[1].base, Address::new(0x1008));
/// ```
#[derive(Debug, Clone)]
pub struct WatchFragments<'a>
{
    next: Address,
    remaining: u64,
    window: u64,
    restricted: Option<&'a MaskTable>,
}

impl<'a> WatchFragments<'a>
{
    /// Split a range into `window`-sized aligned pieces.
    ///
    /// With a restricted table, every piece starts at its window base and
    /// its length is rounded up to an accepted mask length.
    #[must_use]
    pub fn new(address: Address, length: u64, window: u64, restricted: Option<&'a MaskTable>) -> Self
    {
        Self {
            next: address,
            remaining: length,
            window: window.max(1),
            restricted,
        }
    }
}

impl Iterator for WatchFragments<'_>
{
    type Item = WatchFragment;

    fn next(&mut self) -> Option<Self::Item>
    {
        if self.remaining == 0 {
            return None;
        }
        let offset = self.next.offset_in(self.window);
        let base = self.next.align_down(self.window);
        let hw_offset = if self.restricted.is_some() { 0 } else { offset };

        let (len, consumed) = if self.remaining >= self.window - offset {
            (self.window - hw_offset, self.window - offset)
        } else {
            let len = match self.restricted {
                Some(table) => table.min_length(offset + self.remaining),
                None => self.remaining,
            };
            (len, self.remaining)
        };

        let watched = AddrRange::from_len(self.next, consumed);
        self.next = self.next.saturating_add(consumed);
        self.remaining -= consumed;

        Some(WatchFragment {
            base,
            offset: hw_offset,
            len,
            watched,
        })
    }
}

/// Encode a breakpoint or watchpoint request
///
/// ## Errors
///
/// - `HwPointError::Unsupported`: no slots of this kind, or a ranged
///   breakpoint without range support
/// - `HwPointError::AlignmentError`: zero-length watch or misaligned
///   breakpoint
/// - `HwPointError::CapacityExceeded`: more entries than the bank has slots
pub fn encode(request: &HardwarePointRequest, caps: &CapabilitySet, options: &EncodeOptions<'_>) -> Result<Fragments>
{
    let available = caps.slots(request.kind.bank());
    if caps.interface == Interface::Unavailable || available == 0 {
        return Err(HwPointError::Unsupported(format!(
            "no hardware {} slots on {}",
            request.kind, caps.architecture
        )));
    }

    if request.kind.is_watchpoint() {
        encode_watchpoint(request, caps, options, available)
    } else {
        encode_breakpoint(request, caps).map(|point| smallvec![point])
    }
}

fn encode_breakpoint(request: &HardwarePointRequest, caps: &CapabilitySet) -> Result<EncodedPoint>
{
    let alignment = caps.architecture.breakpoint_alignment();
    if !request.address.is_aligned(alignment) {
        return Err(HwPointError::AlignmentError {
            address: request.address,
            length: request.length,
            reason: "breakpoint address is not instruction aligned",
        });
    }

    if request.length > 0 {
        if caps.interface != Interface::Handles || !caps.has(Features::INSN_RANGE) {
            return Err(HwPointError::Unsupported(
                "ranged hardware breakpoints are not available".to_string(),
            ));
        }
        let end = request.address.saturating_add(request.length);
        return Ok(EncodedPoint {
            kind: PointKind::Execute,
            address: request.address,
            span: Span::Range { end },
            condition: None,
            watched: request.range(),
            registers: 2,
        });
    }

    let instruction_len = match (request.instruction_len, caps.architecture) {
        (0, _) => alignment,
        (len @ (2 | 3 | 4), Architecture::AArch32) => len,
        (4, _) => 4,
        (len, architecture) => {
            return Err(HwPointError::InvalidArgument(format!(
                "no {len}-byte instructions on {architecture}"
            )));
        }
    };
    let span = match caps.interface {
        Interface::RegisterArray => Span::Bytes(aarch64::breakpoint_mask(instruction_len)),
        _ => Span::Exact,
    };
    Ok(EncodedPoint {
        kind: PointKind::Execute,
        address: request.address,
        span,
        condition: None,
        // Thumb-2 instructions are four bytes wide.
        watched: AddrRange::from_len(request.address, instruction_len.max(alignment).next_power_of_two()),
        registers: 1,
    })
}

fn encode_watchpoint(
    request: &HardwarePointRequest,
    caps: &CapabilitySet,
    options: &EncodeOptions<'_>,
    available: usize,
) -> Result<Fragments>
{
    if request.length == 0 {
        return Err(HwPointError::AlignmentError {
            address: request.address,
            length: request.length,
            reason: "watchpoint length must be positive",
        });
    }

    let ranged = caps.uses_ranges(request.length);
    if ranged && caps.range_window.is_none() {
        // One BookE range takes both data address compare registers.
        if available < 2 {
            return Err(HwPointError::CapacityExceeded {
                kind: request.kind,
                needed: 2,
                available,
            });
        }
        let point = EncodedPoint {
            kind: request.kind,
            address: request.address,
            span: Span::Range {
                end: request.range().end,
            },
            condition: None,
            watched: request.range(),
            registers: 2,
        };
        return Ok(smallvec![point]);
    }

    let (window, restricted) = match caps.range_window {
        Some(window) if ranged => (window, None),
        _ if caps.has(Features::BYTE_SELECT) => (caps.alignment, options.restricted),
        _ => (caps.alignment, None),
    };

    let mut fragments = Fragments::new();
    for piece in WatchFragments::new(request.address, request.length, window, restricted) {
        if fragments.len() == available {
            return Err(HwPointError::CapacityExceeded {
                kind: request.kind,
                needed: windows_spanned(request.range(), window),
                available,
            });
        }
        fragments.push(fragment_point(request.kind, &piece, caps, ranged)?);
    }

    if fragments.len() == 1 && !ranged {
        fragments[0].condition = options.comparator;
    }
    Ok(fragments)
}

/// Number of `window`-aligned windows `range` touches.
fn windows_spanned(range: AddrRange, window: u64) -> usize
{
    let window = window.max(1);
    let first = range.start.align_down(window);
    let last = (range.end - 1).align_down(window);
    usize::try_from((last - first) / window + 1).unwrap_or(usize::MAX)
}

fn fragment_point(kind: PointKind, piece: &WatchFragment, caps: &CapabilitySet, ranged: bool) -> Result<EncodedPoint>
{
    let (address, span) = if ranged {
        (piece.watched.start, Span::Range { end: piece.watched.end })
    } else if caps.has(Features::BYTE_SELECT) {
        let mask = u32::try_from(piece.offset)
            .ok()
            .zip(u32::try_from(piece.len).ok())
            .and_then(|(offset, len)| ByteMask::new(offset, len))
            .ok_or(HwPointError::AlignmentError {
                address: piece.watched.start,
                length: piece.watched.len(),
                reason: "fragment does not fit the byte address select window",
            })?;
        (piece.base, Span::Bytes(mask))
    } else {
        (piece.watched.start, Span::Exact)
    };

    Ok(EncodedPoint {
        kind,
        address,
        span,
        condition: None,
        watched: piece.watched,
        registers: 1,
    })
}

/// Encode a masked watchpoint (`a & mask == address & mask`).
///
/// ## Errors
///
/// - `HwPointError::Unsupported`: the kernel has no masked data breakpoints
/// - `HwPointError::InvalidArgument`: the mask would cover kernel space
pub fn encode_masked(kind: PointKind, address: Address, mask: u64, caps: &CapabilitySet) -> Result<EncodedPoint>
{
    if caps.interface != Interface::Handles || !caps.has(Features::DATA_MASK) {
        return Err(HwPointError::Unsupported(
            "masked hardware watchpoints are not available".to_string(),
        ));
    }
    if mask & USER_MASK_BITS != USER_MASK_BITS {
        return Err(HwPointError::InvalidArgument(format!(
            "mask 0x{mask:x} covers kernel address space"
        )));
    }
    let mut point = EncodedPoint {
        kind,
        address,
        span: Span::Masked { mask },
        condition: None,
        watched: AddrRange::default(),
        registers: 2,
    };
    point.watched = point.hardware_range(caps.alignment);
    Ok(point)
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::types::Architecture;

    fn arm(watchpoints: u32) -> CapabilitySet
    {
        CapabilitySet::aarch64(Architecture::AArch64, Some(0x0604), Some(0x0600 | watchpoints))
    }

    #[test]
    fn test_split_restricted_rounds_lengths()
    {
        let table = MaskTable::default();
        let pieces: Vec<_> = WatchFragments::new(Address::new(0x1001), 2, 8, Some(&table)).collect();
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].offset, 0);
        assert_eq!(pieces[0].len, 4);
        assert_eq!(pieces[0].watched, AddrRange::from_len(Address::new(0x1001), 2));
    }

    #[test]
    fn test_split_long_range()
    {
        let pieces: Vec<_> = WatchFragments::new(Address::new(0x1004), 20, 8, None).collect();
        let starts: Vec<u64> = pieces.iter().map(|p| p.watched.start.value()).collect();
        assert_eq!(starts, vec![0x1004, 0x1008, 0x1010]);
        assert_eq!(pieces[2].len, 8);
        assert_eq!(pieces[2].watched.end, Address::new(0x1018));
    }

    #[test]
    fn test_aligned_word_single_mask()
    {
        let caps = arm(2);
        let request = HardwarePointRequest::watch(PointKind::Write, Address::new(0x1000), 4);
        let fragments = encode(&request, &caps, &EncodeOptions::default()).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].span, Span::Bytes(ByteMask::from_bits(0x0f)));
    }

    #[test]
    fn test_capacity_counts_all_windows()
    {
        let caps = arm(2);
        let request = HardwarePointRequest::watch(PointKind::Read, Address::new(0x1000), 64);
        match encode(&request, &caps, &EncodeOptions::default()) {
            Err(HwPointError::CapacityExceeded { needed, available, .. }) => {
                assert_eq!(needed, 8);
                assert_eq!(available, 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_breakpoint_alignment()
    {
        let caps = arm(2);
        let request = HardwarePointRequest::breakpoint(Address::new(0x4002));
        assert!(matches!(
            encode(&request, &caps, &EncodeOptions::default()),
            Err(HwPointError::AlignmentError { .. })
        ));
    }
}
