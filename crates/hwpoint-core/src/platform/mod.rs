//! # Kernel Backends
//!
//! Implementations of [`DebugRegisterInterface`](crate::kernel::DebugRegisterInterface):
//!
//! - **linux**: `ptrace(2)` on AArch64 and 64-bit PowerPC hosts
//!   - See: [ptrace(2) man page](https://man7.org/linux/man-pages/man2/ptrace.2.html)
//! - **sim**: an in-memory kernel for tests and the CLI, available everywhere

#[cfg(all(target_os = "linux", any(target_arch = "aarch64", target_arch = "powerpc64")))]
pub mod linux;

pub mod sim;

/// Comma separated names of the backends compiled into this build.
pub const BACKENDS: &str = env!("HWPOINT_BACKENDS");
