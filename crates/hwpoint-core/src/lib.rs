//! # hwpoint-core
//!
//! Hardware breakpoint and watchpoint management for debuggers on AArch64 and
//! PowerPC Linux.
//!
//! CPUs offer only a handful of debug register slots, each watching one
//! aligned window. This crate turns the debugger's logical requests into
//! hardware entries and keeps every thread's registers in sync:
//!
//! - **Capability probing** ([`capability`]): what the kernel offers, once
//!   per session
//! - **Encoding** ([`encode`]): request to slot-sized entries, split at
//!   window boundaries
//! - **Slot allocation** ([`slots`]): reference-counted, deduplicated slots
//!   per bank
//! - **Thread propagation** ([`manager`], [`threads`]): all-or-nothing
//!   updates across threads, new-thread replication
//! - **Degradation** ([`degrade`]): fallback to the masks old kernels accept
//! - **Condition acceleration** ([`accel`]): hardware value compare on BookE
//!
//! ## Platform Support
//!
//! - **Linux AArch64**: `NT_ARM_HW_BREAK`/`NT_ARM_HW_WATCH` register sets
//! - **Linux PowerPC**: hwdebug interface, or the legacy DABR register
//! - **Everywhere**: [`platform::sim::SimulatedKernel`] for tests
//!
//! ## Why unsafe code is needed
//!
//! The Linux backend calls `ptrace(2)` with raw pointers to kernel ABI
//! structures. Everything above the [`kernel::DebugRegisterInterface`] trait
//! is safe code.

#![allow(unsafe_code)] // Required for ptrace in platform::linux

pub mod accel;
pub mod arch;
pub mod capability;
pub mod config;
pub mod degrade;
pub mod encode;
pub mod error;
pub mod kernel;
pub mod manager;
pub mod platform;
pub mod point;
pub mod slots;
pub mod threads;
pub mod types;

pub use capability::{CapabilitySet, Interface};
pub use config::ManagerConfig;
pub use degrade::{DegradationState, MaskTable};
// Re-export commonly used types
pub use error::{HwPointError, KernelError, Result};
pub use kernel::DebugRegisterInterface;
pub use manager::{HardwareAvailability, HwPointManager};
pub use point::{EncodedPoint, HardwarePointRequest, PointKind, RegisterBank};
pub use types::{AddrRange, Address, Architecture, ThreadId};
