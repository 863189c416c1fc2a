//! Status conditions reported on an autoscaler.
//!
//! Each pipeline stage returns the conditions it decided on as plain
//! values; the reconciler merges them into the status once per cycle so a
//! failing later stage never leaves a half-updated status behind.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    /// Whether the controller can read and update the target's scale.
    AbleToScale,
    /// Whether metrics are producing usable proposals.
    ScalingActive,
    /// Whether the desired count was cut short by a rate policy.
    ScalingLimited,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AbleToScale => "AbleToScale",
            Self::ScalingActive => "ScalingActive",
            Self::ScalingLimited => "ScalingLimited",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    /// Filled in when the condition is merged into a status.
    #[serde(default)]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn new(
        kind: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: None,
        }
    }

    pub fn able_to_scale(
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ConditionType::AbleToScale, status, reason, message)
    }

    pub fn scaling_active(
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ConditionType::ScalingActive, status, reason, message)
    }

    pub fn scaling_limited(
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ConditionType::ScalingLimited, status, reason, message)
    }
}

/// Reason strings the engine reports.
pub mod reasons {
    // AbleToScale
    pub const READY_FOR_NEW_SCALE: &str = "ReadyForNewScale";
    pub const SCALE_UP_STABILIZED: &str = "ScaleUpStabilized";
    pub const SCALE_DOWN_STABILIZED: &str = "ScaleDownStabilized";
    pub const SUCCEEDED_RESCALE: &str = "SucceededRescale";
    pub const FAILED_UPDATE_SCALE: &str = "FailedUpdateScale";
    pub const FAILED_GET_SCALE: &str = "FailedGetScale";
    pub const FAILED_COMPUTE_METRICS_REPLICAS: &str = "FailedComputeMetricsReplicas";
    pub const INVALID_SPEC: &str = "InvalidSpec";

    // ScalingActive
    pub const VALID_METRIC_FOUND: &str = "ValidMetricFound";
    pub const PARTIAL_METRICS_FAILURE: &str = "PartialMetricsFailure";
    pub const SCALING_DISABLED: &str = "ScalingDisabled";

    // ScalingLimited
    pub const DESIRED_WITHIN_RANGE: &str = "DesiredWithinRange";
    pub const SCALE_UP_LIMIT: &str = "ScaleUpLimit";
    pub const SCALE_DOWN_LIMIT: &str = "ScaleDownLimit";

    // Events
    pub const SUCCESSFUL_RESCALE: &str = "SuccessfulRescale";
    pub const FAILED_RESCALE: &str = "FailedRescale";
}
