//! # Manager Configuration
//!
//! Session knobs for [`HwPointManager`](crate::manager::HwPointManager).
//!
//! ## Environment Variables
//!
//! - `HWPOINT_SHOW_DEBUG_REGS`: dump the slot tables at `trace` level after
//!   every change (`1`, `true`, `yes`, `on`)
//! - `HWPOINT_ASSUME_RESTRICTED_MASKS`: start out degraded, as if the kernel
//!   had already rejected a byte mask
//! - `HWPOINT_MASK_TABLE`: restricted mask table as comma separated hex,
//!   e.g. `0x01,0x03,0x0f,0xff`

use std::env;

use crate::degrade::{DegradationState, MaskTable};
use crate::error::{HwPointError, Result};

/// Environment variable enabling register dumps.
pub const ENV_SHOW_DEBUG_REGS: &str = "HWPOINT_SHOW_DEBUG_REGS";
/// Environment variable forcing restricted masks from the start.
pub const ENV_ASSUME_RESTRICTED_MASKS: &str = "HWPOINT_ASSUME_RESTRICTED_MASKS";
/// Environment variable overriding the restricted mask table.
pub const ENV_MASK_TABLE: &str = "HWPOINT_MASK_TABLE";

/// Configuration of a hardware point manager
///
/// ## Example
///
/// ```rust
/// use hwpoint_core::config::ManagerConfig;
///
/// let config = ManagerConfig::default().with_show_debug_regs(true);
/// assert!(config.show_debug_regs);
/// assert!(!config.assume_restricted_masks);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerConfig
{
    /// Dump slot tables after every change.
    pub show_debug_regs: bool,
    /// Start in the degraded state.
    pub assume_restricted_masks: bool,
    /// Masks a restricted kernel accepts.
    pub mask_table: MaskTable,
}

impl ManagerConfig
{
    /// Defaults overridden by the `HWPOINT_*` environment variables.
    ///
    /// ## Errors
    ///
    /// - `HwPointError::Config`: a variable is set to an unparsable value
    pub fn from_env() -> Result<Self>
    {
        let mut config = Self::default();
        if let Some(value) = read_var(ENV_SHOW_DEBUG_REGS) {
            config.show_debug_regs = parse_flag(ENV_SHOW_DEBUG_REGS, &value)?;
        }
        if let Some(value) = read_var(ENV_ASSUME_RESTRICTED_MASKS) {
            config.assume_restricted_masks = parse_flag(ENV_ASSUME_RESTRICTED_MASKS, &value)?;
        }
        if let Some(value) = read_var(ENV_MASK_TABLE) {
            config.mask_table = value.parse()?;
        }
        Ok(config)
    }

    /// Set `show_debug_regs`.
    #[must_use]
    pub fn with_show_debug_regs(mut self, enabled: bool) -> Self
    {
        self.show_debug_regs = enabled;
        self
    }

    /// Set `assume_restricted_masks`.
    #[must_use]
    pub fn with_assume_restricted_masks(mut self, enabled: bool) -> Self
    {
        self.assume_restricted_masks = enabled;
        self
    }

    /// Replace the restricted mask table.
    #[must_use]
    pub fn with_mask_table(mut self, table: MaskTable) -> Self
    {
        self.mask_table = table;
        self
    }

    /// Degradation state a new session starts in.
    #[must_use]
    pub fn initial_state(&self) -> DegradationState
    {
        if self.assume_restricted_masks {
            DegradationState::Degraded
        } else {
            DegradationState::Capable
        }
    }
}

fn read_var(name: &str) -> Option<String>
{
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Parse a boolean flag value.
///
/// ## Errors
///
/// - `HwPointError::Config`: not one of the accepted spellings
pub fn parse_flag(name: &str, value: &str) -> Result<bool>
{
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(HwPointError::Config(format!("{name}: expected a boolean, got '{other}'"))),
    }
}
