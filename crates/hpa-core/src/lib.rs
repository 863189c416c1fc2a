//! hpa-core — shared data model for the horizontal autoscaler.
//!
//! Holds everything the decision pipeline and the controller agree on:
//!
//! - [`types`]: autoscaler spec/status, scaling behavior and policies,
//!   history records, decision outcomes.
//! - [`condition`]: the `AbleToScale` / `ScalingActive` / `ScalingLimited`
//!   condition model and the reasons the engine reports.
//! - [`config`]: the controller configuration object (TOML) and the
//!   resolution of per-direction defaults.
//! - [`duration`]: `"30s"` / `"5m"` style duration strings.
//!
//! No I/O beyond reading a config file lives here.

pub mod condition;
pub mod config;
pub mod duration;
pub mod error;
pub mod types;

pub use condition::{Condition, ConditionStatus, ConditionType};
pub use config::{ControllerConfig, ResolvedRules};
pub use error::{ConfigError, ValidationError};
pub use types::*;
