//! # Error Types
//!
//! Error handling for hardware breakpoint/watchpoint management.
//!
//! Errors live on two levels:
//!
//! 1. [`KernelError`]: what the debug register syscall boundary reports. The
//!    variants are deliberately coarse because each one drives a different
//!    reaction in the manager (degrade, tolerate, or fail).
//! 2. [`HwPointError`]: what the debugger core sees when it asks for a point
//!    to be inserted or removed.
//!
//! We use `thiserror` to derive `Error` implementations and messages.

use thiserror::Error;

use crate::point::PointKind;
use crate::types::{Address, ThreadId};

/// Error codes coming back from the debug register interface
///
/// ## Reactions
///
/// | Variant        | Reaction                                                |
/// |----------------|---------------------------------------------------------|
/// | `NotSupported` | Interface absent, capability drops to the fallback      |
/// | `Rejected`     | First time on a watchpoint write: degrade the encoding  |
/// | `NotFound`     | Expected on removal (kernel auto-disabled the point)    |
/// | `NoSuchThread` | Expected on thread exit, fatal anywhere else            |
/// | `Os`           | Anything else, surfaced as a hard error                 |
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError
{
    /// The kernel has no debug register interface of the requested kind
    /// (`EIO`, `ENODEV`, `EOPNOTSUPP` from ptrace).
    #[error("debug register interface not supported by the kernel")]
    NotSupported,

    /// The kernel refused the encoding (`EINVAL`).
    ///
    /// Linux kernels before 4.10 only accept the byte-address-select masks
    /// 0x01, 0x03, 0x0f and 0xff on AArch64 and report everything else this way.
    #[error("kernel rejected the debug register encoding")]
    Rejected,

    /// The kernel does not know the slot handle (`ENOENT`).
    ///
    /// PowerPC hardware points are one-shot: the kernel deletes them when they
    /// trigger, so removing them afterwards reports this.
    #[error("kernel has no registration for this slot")]
    NotFound,

    /// The thread is gone (`ESRCH`).
    #[error("thread no longer exists")]
    NoSuchThread,

    /// Any other errno value.
    #[error("ptrace failed with errno {0}")]
    Os(i32),
}

impl KernelError
{
    /// Classify a raw `errno` value returned by a ptrace request.
    #[must_use]
    pub fn from_errno(errno: i32) -> Self
    {
        match errno {
            libc::EINVAL => KernelError::Rejected,
            libc::ENOENT => KernelError::NotFound,
            libc::ESRCH => KernelError::NoSuchThread,
            libc::EIO | libc::ENODEV | libc::EOPNOTSUPP => KernelError::NotSupported,
            other => KernelError::Os(other),
        }
    }
}

/// Main error type for hardware point operations
///
/// ## Error Categories
///
/// 1. **Permanent**: `Unsupported` (use a software fallback instead)
/// 2. **Resource**: `CapacityExceeded` (report to the user, do not retry)
/// 3. **Caller bugs**: `AlignmentError`, `InvalidArgument`, `PointNotFound`
/// 4. **Kernel**: `KernelRejected`, `Kernel`
/// 5. **Setup**: `Config`
#[derive(Error, Debug)]
pub enum HwPointError
{
    /// The feature is absent on this kernel or architecture.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Not enough free hardware slots for the request
    ///
    /// Requests that split into several fragments are admitted all-or-nothing,
    /// so seeing this error means no slot was touched.
    #[error("No free hardware {kind} slots: need {needed}, {available} available")]
    CapacityExceeded
    {
        /// The kind of point that did not fit.
        kind: PointKind,
        /// Number of register slots the request needs.
        needed: usize,
        /// Number of register slots still free.
        available: usize,
    },

    /// The request cannot be expressed with aligned hardware entries.
    ///
    /// Pre-flight checks (`region_ok_for_watchpoint`) should make this
    /// unreachable; seeing it means the caller skipped them.
    #[error("Misaligned hardware point at {address} (length {length}): {reason}")]
    AlignmentError
    {
        /// Requested address.
        address: Address,
        /// Requested length in bytes.
        length: u64,
        /// Which constraint was violated.
        reason: &'static str,
    },

    /// The kernel rejected an encoding even after degrading to the restricted
    /// mask table.
    #[error("Kernel rejected debug registers for thread {thread} in restricted mode")]
    KernelRejected
    {
        /// Thread whose register write failed.
        thread: ThreadId,
    },

    /// No installed slot matches the point being removed.
    #[error("No hardware {kind} installed at {address}")]
    PointNotFound
    {
        /// Kind of the point being removed.
        kind: PointKind,
        /// Address of the point being removed.
        address: Address,
    },

    /// A debug register syscall failed.
    #[error("{operation} failed for thread {thread}: {source}")]
    Kernel
    {
        /// Name of the failing operation (for logs).
        operation: &'static str,
        /// Thread the syscall targeted.
        thread: ThreadId,
        /// Underlying kernel error.
        #[source]
        source: KernelError,
    },

    /// A malformed argument (e.g. a mask covering kernel space).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl HwPointError
{
    pub(crate) fn kernel(operation: &'static str, thread: ThreadId, source: KernelError) -> Self
    {
        HwPointError::Kernel {
            operation,
            thread,
            source,
        }
    }
}

/// Convenience type alias for `Result<T, HwPointError>`
///
/// ```rust
/// use hwpoint_core::error::Result;
/// fn foo() -> Result<()>
/// {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, HwPointError>;
