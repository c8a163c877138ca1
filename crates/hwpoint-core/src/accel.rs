//! # Condition Acceleration
//!
//! BookE PowerPC processors have data value compare (DVC) registers: a
//! watchpoint with a DVC only traps when the watched memory also equals a
//! stored value. A watchpoint condition like `*p == 42` can therefore be
//! evaluated by the hardware instead of stopping on every write.
//!
//! The expression evaluator lives outside this crate. It hands over a
//! [`Condition`]: the operator plus, for each operand, a summary of its final
//! value and of every intermediate value produced while evaluating it. That
//! is enough to decide, conservatively, whether the condition compares the
//! watched memory to a constant.

use crate::arch::powerpc;
use crate::point::Comparator;
use crate::types::Address;

/// Top-level operator of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOp
{
    /// `left == right`.
    Equal,
    /// Anything else.
    Other,
}

/// Where an evaluated value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueOrigin
{
    /// A constant or other non-lvalue.
    NotLvalue,
    /// A value from the history (not modifiable).
    History,
    /// Target memory. `lazy` values were never fetched (only their address
    /// was used).
    Memory
    {
        /// Address of the memory lvalue.
        address: Address,
        /// Whether the contents were never read.
        lazy: bool,
    },
    /// A CPU register.
    Register,
    /// A computed lvalue (e.g. bitfield or convenience function).
    Computed,
    /// A debugger internal variable.
    InternalVar,
}

/// Final value of an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueSummary
{
    /// Where the value came from.
    pub origin: ValueOrigin,
    /// The value converted to an integer.
    pub as_long: u64,
    /// Size of the value's type in bytes.
    pub type_len: u64,
}

/// One evaluated operand of a condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subexpression
{
    /// Final value, or `None` if evaluation failed.
    pub value: Option<ValueSummary>,
    /// Every value produced while evaluating the operand.
    pub chain: Vec<ValueOrigin>,
}

impl Subexpression
{
    /// Operand that is a plain constant.
    #[must_use]
    pub fn constant(value: u64, type_len: u64) -> Self
    {
        Self {
            value: Some(ValueSummary {
                origin: ValueOrigin::NotLvalue,
                as_long: value,
                type_len,
            }),
            chain: vec![ValueOrigin::NotLvalue],
        }
    }

    /// Operand that reads `type_len` bytes of memory at `address`.
    #[must_use]
    pub fn memory(address: Address, type_len: u64) -> Self
    {
        let origin = ValueOrigin::Memory { address, lazy: false };
        Self {
            value: Some(ValueSummary {
                origin,
                as_long: 0,
                type_len,
            }),
            chain: vec![origin],
        }
    }

    /// Number of memory reads needed to evaluate the operand, or `None` if
    /// evaluation touches registers or other values hardware cannot see.
    #[must_use]
    pub fn memory_accesses(&self) -> Option<usize>
    {
        let mut found = 0;
        for origin in &self.chain {
            match origin {
                ValueOrigin::NotLvalue | ValueOrigin::History => {}
                ValueOrigin::Memory { lazy, .. } => {
                    if !lazy {
                        found += 1;
                    }
                }
                ValueOrigin::Register | ValueOrigin::Computed | ValueOrigin::InternalVar => return None,
            }
        }
        Some(found)
    }

    fn reads_exactly(&self, address: Address) -> bool
    {
        self.memory_accesses() == Some(1)
            && matches!(
                self.value,
                Some(ValueSummary {
                    origin: ValueOrigin::Memory { address: at, .. },
                    ..
                }) if at == address
            )
    }

    fn is_constant(&self) -> bool
    {
        self.value.is_some() && self.memory_accesses() == Some(0)
    }
}

/// A watchpoint condition, as summarized by the expression evaluator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition
{
    /// Top-level operator.
    pub op: ConditionOp,
    /// Left operand.
    pub left: Subexpression,
    /// Right operand.
    pub right: Subexpression,
}

impl Condition
{
    /// `*address == value` with a `type_len`-byte memory operand.
    #[must_use]
    pub fn memory_equals(address: Address, type_len: u64, value: u64) -> Self
    {
        Self {
            op: ConditionOp::Equal,
            left: Subexpression::memory(address, type_len),
            right: Subexpression::constant(value, type_len),
        }
    }
}

/// Constant and width a condition compares the watched memory against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantComparison
{
    /// The constant.
    pub value: u64,
    /// Width of the memory operand in bytes.
    pub len: u64,
}

/// Decide whether `condition` compares the memory at `watch_addr` to a
/// constant, and if so return the constant and the operand width.
#[must_use]
pub fn check_condition(watch_addr: Address, condition: &Condition) -> Option<ConstantComparison>
{
    if condition.op != ConditionOp::Equal {
        return None;
    }
    let (memory, constant) = if condition.left.reads_exactly(watch_addr) && condition.right.is_constant() {
        (&condition.left, &condition.right)
    } else if condition.right.reads_exactly(watch_addr) && condition.left.is_constant() {
        (&condition.right, &condition.left)
    } else {
        return None;
    };

    let len = memory.value?.type_len;
    if len == 0 || len > powerpc::MAX_CONDITION_BYTES {
        return None;
    }
    Some(ConstantComparison {
        value: constant.value?.as_long,
        len,
    })
}

/// Computes hardware comparator contents for eligible conditions
///
/// ## Example
///
/// ```rust
/// use hwpoint_core::accel::{Condition, ConditionAccelerator};
/// use hwpoint_core::types::Address;
///
/// let accel = ConditionAccelerator::new(8);
/// let cond = Condition::memory_equals(Address::new(0x1000), 4, 7);
/// let cmp = accel.try_accelerate(Address::new(0x1000), 4, &cond).unwrap();
/// assert_eq!(cmp.byte_enables, 0xf0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionAccelerator
{
    width: u64,
}

impl ConditionAccelerator
{
    /// Accelerator for comparators `width` bytes wide.
    #[must_use]
    pub fn new(width: u64) -> Self
    {
        Self { width }
    }

    /// Comparator implementing `condition` for a watch at `address`, or
    /// `None` if the condition is not a plain memory-equals-constant test.
    ///
    /// The width of the compared memory operand takes precedence over
    /// `_length`, the watch length.
    #[must_use]
    pub fn try_accelerate(&self, address: Address, _length: u64, condition: &Condition) -> Option<Comparator>
    {
        if self.width == 0 {
            return None;
        }
        let comparison = check_condition(address, condition)?;
        Some(powerpc::calculate_dvc(
            address,
            comparison.len,
            comparison.value,
            self.width,
        ))
    }
}
