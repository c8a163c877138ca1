//! Architecture-specific register layouts and kernel ABI structures.
//!
//! Nothing here talks to the kernel. These are the bit-level encodings the
//! encoder produces and the platform backends serialize.

pub mod aarch64;
pub mod powerpc;
