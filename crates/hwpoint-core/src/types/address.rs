//! Memory address and address range types.

use std::fmt;
use std::ops::{Add, Sub};

/// Strongly typed memory address
///
/// Wrapper around `u64` so addresses are never confused with lengths, masks
/// or raw register contents. Debug register code juggles all four, often in
/// the same expression.
///
/// ## Example
///
/// ```rust
/// use hwpoint_core::types::Address;
///
/// let addr = Address::from(0x1006);
/// assert_eq!(addr.align_down(8), Address::new(0x1000));
/// assert_eq!(addr.offset_in(8), 6);
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u64);

impl Address
{
    /// The null address (0x0)
    pub const ZERO: Self = Address(0);

    /// Create a new address from a `u64` value (usable in const contexts).
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Get the raw `u64` value of this address.
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Round down to a multiple of `alignment` (a power of two).
    ///
    /// ```rust
    /// use hwpoint_core::types::Address;
    ///
    /// assert_eq!(Address::new(0x100f).align_down(8), Address::new(0x1008));
    /// ```
    #[must_use]
    pub const fn align_down(self, alignment: u64) -> Self
    {
        Address(self.0 & !(alignment - 1))
    }

    /// Byte offset of this address inside its `alignment`-sized window.
    #[must_use]
    pub const fn offset_in(self, alignment: u64) -> u64
    {
        self.0 & (alignment - 1)
    }

    /// Whether the address is a multiple of `alignment` (a power of two).
    #[must_use]
    pub const fn is_aligned(self, alignment: u64) -> bool
    {
        self.offset_in(alignment) == 0
    }

    /// Add an offset to this address, checking for overflow
    ///
    /// ```rust
    /// use hwpoint_core::types::Address;
    ///
    /// let addr = Address::from(0x1000);
    /// assert_eq!(addr.checked_add(0x100), Some(Address::from(0x1100)));
    /// assert_eq!(addr.checked_add(u64::MAX), None);
    /// ```
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }

    /// Add an offset to this address, saturating at the maximum value.
    pub fn saturating_add(self, offset: u64) -> Self
    {
        Address(self.0.saturating_add(offset))
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Address
{
    type Output = Address;

    fn sub(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_sub(rhs))
    }
}

impl Sub<Address> for Address
{
    type Output = u64;

    fn sub(self, rhs: Address) -> Self::Output
    {
        self.0.wrapping_sub(rhs.0)
    }
}

/// Half-open address interval `[start, end)`
///
/// Used to remember which part of the originally requested range a hardware
/// entry is responsible for, after the request was split and aligned.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddrRange
{
    /// First address in the range.
    pub start: Address,
    /// One past the last address in the range.
    pub end: Address,
}

impl AddrRange
{
    /// Create a range from a start address and a length in bytes.
    #[must_use]
    pub fn from_len(start: Address, len: u64) -> Self
    {
        Self {
            start,
            end: start.saturating_add(len),
        }
    }

    /// Length of the range in bytes.
    #[must_use]
    pub fn len(&self) -> u64
    {
        self.end - self.start
    }

    /// Whether the range covers no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.end <= self.start
    }

    /// Whether `address` lies inside the range.
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        self.start <= address && address < self.end
    }

    /// Move `address` into the range, picking the nearest covered byte.
    ///
    /// ```rust
    /// use hwpoint_core::types::{AddrRange, Address};
    ///
    /// let range = AddrRange::from_len(Address::new(0x1006), 2);
    /// assert_eq!(range.clamp_address(Address::new(0x1000)), Address::new(0x1006));
    /// assert_eq!(range.clamp_address(Address::new(0x1010)), Address::new(0x1007));
    /// ```
    #[must_use]
    pub fn clamp_address(&self, address: Address) -> Address
    {
        if self.is_empty() {
            return self.start;
        }
        address.max(self.start).min(self.end - 1)
    }
}

impl fmt::Display for AddrRange
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
