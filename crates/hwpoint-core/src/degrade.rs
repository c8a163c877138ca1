//! # Degradation
//!
//! Linux kernels before 4.10 only accept four AArch64 byte-address-select
//! masks (0x01, 0x03, 0x0f, 0xff) and reject every other contiguous mask with
//! `EINVAL`. There is no way to ask the kernel up front, so the manager starts
//! out assuming precise masks work and switches to the restricted table the
//! first time a watchpoint bank write is rejected.
//!
//! The switch is one-way: once [`DegradationState::Degraded`], the session
//! stays there, and a second rejection is a hard error.

use std::fmt;
use std::str::FromStr;

use smallvec::SmallVec;
use tracing::info;

use crate::error::HwPointError;
use crate::point::{ByteMask, EncodedPoint, Span};

/// Byte-enable masks the restricted kernel accepts, in increasing order.
pub const DEFAULT_RESTRICTED_MASKS: [u8; 4] = [0x01, 0x03, 0x0f, 0xff];

/// Ordered set of byte-enable masks a restricted kernel accepts
///
/// Every entry selects the low `n` bytes of the window (`0x01`, `0x03`,
/// `0x07`, ...) and the last entry must be `0xff`, so every mask has a
/// covering entry.
///
/// ## Example
///
/// ```rust
/// use hwpoint_core::degrade::MaskTable;
/// use hwpoint_core::point::ByteMask;
///
/// let table = MaskTable::default();
/// assert_eq!(table.round_up(ByteMask::from_bits(0x06)).bits(), 0x0f);
/// assert_eq!(table.min_length(3), 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskTable
{
    masks: SmallVec<[u8; 8]>,
}

impl MaskTable
{
    /// Build a table from its masks.
    ///
    /// ## Errors
    ///
    /// - `HwPointError::Config`: a mask does not select the low bytes of the
    ///   window, or `0xff` is missing
    pub fn new(masks: impl IntoIterator<Item = u8>) -> Result<Self, HwPointError>
    {
        let mut masks: SmallVec<[u8; 8]> = masks.into_iter().collect();
        masks.sort_unstable();
        masks.dedup();
        if let Some(bad) = masks.iter().find(|mask| **mask == 0 || (u16::from(**mask) + 1).count_ones() != 1) {
            return Err(HwPointError::Config(format!(
                "mask 0x{bad:02x} does not select the low bytes of the window"
            )));
        }
        if masks.last() != Some(&0xff) {
            return Err(HwPointError::Config("mask table must end with 0xff".to_string()));
        }
        Ok(Self { masks })
    }

    /// The masks, smallest first.
    #[must_use]
    pub fn masks(&self) -> &[u8]
    {
        &self.masks
    }

    /// Whether the kernel accepts `mask` as is.
    #[must_use]
    pub fn contains(&self, mask: ByteMask) -> bool
    {
        self.masks.contains(&mask.bits())
    }

    /// Smallest accepted mask covering every byte of `mask`.
    #[must_use]
    pub fn round_up(&self, mask: ByteMask) -> ByteMask
    {
        self.masks
            .iter()
            .copied()
            .find(|candidate| mask.bits() <= *candidate)
            .map_or(ByteMask::FULL, ByteMask::from_bits)
    }

    /// Smallest accepted length covering `bytes` bytes from the window base.
    #[must_use]
    pub fn min_length(&self, bytes: u64) -> u64
    {
        self.masks
            .iter()
            .map(|mask| u64::from(mask.count_ones()))
            .find(|len| *len >= bytes)
            .unwrap_or(8)
    }
}

impl Default for MaskTable
{
    fn default() -> Self
    {
        Self {
            masks: SmallVec::from_slice(&DEFAULT_RESTRICTED_MASKS),
        }
    }
}

impl FromStr for MaskTable
{
    type Err = HwPointError;

    /// Parse a comma separated list of hex masks, e.g. `0x01,0x03,0x0f,0xff`.
    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        let masks = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                let digits = part.trim_start_matches("0x").trim_start_matches("0X");
                u8::from_str_radix(digits, 16)
                    .map_err(|err| HwPointError::Config(format!("invalid mask '{part}': {err}")))
            })
            .collect::<Result<SmallVec<[u8; 8]>, _>>()?;
        Self::new(masks)
    }
}

impl fmt::Display for MaskTable
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let parts: Vec<String> = self.masks.iter().map(|mask| format!("0x{mask:02x}")).collect();
        f.write_str(&parts.join(","))
    }
}

/// Whether the kernel accepts arbitrary contiguous byte masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DegradationState
{
    /// Any contiguous mask is accepted.
    #[default]
    Capable,
    /// Only masks from the restricted table are accepted.
    Degraded,
}

impl fmt::Display for DegradationState
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            DegradationState::Capable => f.write_str("capable"),
            DegradationState::Degraded => f.write_str("degraded"),
        }
    }
}

/// Owns the degradation state and the restricted mask table.
#[derive(Debug, Clone, Default)]
pub struct DegradationCoordinator
{
    state: DegradationState,
    table: MaskTable,
}

impl DegradationCoordinator
{
    /// Start in `state` with the given restricted table.
    #[must_use]
    pub fn new(state: DegradationState, table: MaskTable) -> Self
    {
        Self { state, table }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> DegradationState
    {
        self.state
    }

    /// The restricted table.
    #[must_use]
    pub fn table(&self) -> &MaskTable
    {
        &self.table
    }

    /// Table the encoder must honor right now, if any.
    #[must_use]
    pub fn restriction(&self) -> Option<&MaskTable>
    {
        match self.state {
            DegradationState::Capable => None,
            DegradationState::Degraded => Some(&self.table),
        }
    }

    /// Switch to `Degraded`.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn degrade(&mut self) -> bool
    {
        if self.state == DegradationState::Degraded {
            return false;
        }
        info!(
            "Kernel rejected a byte-address-select mask; restricting watchpoints to {}",
            self.table
        );
        self.state = DegradationState::Degraded;
        true
    }

    /// Re-encode an installed point for the restricted table.
    ///
    /// Byte masks outside the table grow to the smallest covering entry and
    /// the value register keeps the window base. Other spans pass through.
    #[must_use]
    pub fn restrict(&self, point: &EncodedPoint) -> EncodedPoint
    {
        match point.span {
            Span::Bytes(mask) if !self.table.contains(mask) => EncodedPoint {
                span: Span::Bytes(self.table.round_up(mask)),
                ..*point
            },
            _ => *point,
        }
    }
}
