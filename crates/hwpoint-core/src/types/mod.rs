//! # Types
//!
//! Plain value types shared by every component: addresses, address ranges,
//! thread ids and the target architecture.

pub mod address;
pub mod process;

// Re-export all public types
pub use address::{AddrRange, Address};
pub use process::{Architecture, ThreadId};
