//! Error types for configuration loading and spec validation.

use thiserror::Error;

/// Errors raised while loading or validating a [`ControllerConfig`](crate::ControllerConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration {0:?}")]
    Duration(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Reasons an autoscaler spec is rejected before any metric is evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("maxReplicas must be at least 1, got {0}")]
    MaxReplicasTooLow(u32),

    #[error("minReplicas ({min}) must not exceed maxReplicas ({max})")]
    MinAboveMax { min: u32, max: u32 },

    #[error("at least one metric must be specified")]
    NoMetrics,

    #[error("{direction} policy #{index}: value must be at least 1")]
    PolicyValue { direction: String, index: usize },

    #[error("{direction} policy #{index}: periodSeconds must be in 1..={max}, got {got}")]
    PolicyPeriod {
        direction: String,
        index: usize,
        got: u32,
        max: u32,
    },

    #[error("{direction} stabilizationWindowSeconds must be at most {max}, got {got}")]
    StabilizationWindow {
        direction: String,
        got: u32,
        max: u32,
    },

    #[error("invalid workload key {0:?}: expected namespace/name")]
    Key(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
