//! # hwpoint Utilities
//!
//! Shared helpers for the hwpoint workspace, currently the `tracing` setup
//! used by the command-line tool.

pub mod logging;

// Re-export commonly used logging items for convenience
pub use logging::{default_log_path, init_logging, LogFormat, LogLevel, LoggingConfig, LoggingError, LoggingGuard};
pub use tracing::{debug, error, info, trace, warn};
