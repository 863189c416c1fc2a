//! Error types for the decision pipeline and its collaborators.

use hpa_core::condition::reasons;
use hpa_core::{Condition, ConditionStatus, ValidationError, WorkloadKey};
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// A single metric that could not be turned into a replica proposal.
///
/// Carries the `ScalingActive` condition the metric source wants reported
/// if this turns out to be the failure that gets surfaced.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("metric {metric}: {message}")]
pub struct MetricFailure {
    pub metric: String,
    pub message: String,
    pub condition: Condition,
}

impl MetricFailure {
    pub fn new(metric: impl Into<String>, reason: &str, message: impl Into<String>) -> Self {
        let metric = metric.into();
        let message = message.into();
        let condition = Condition::scaling_active(
            ConditionStatus::False,
            reason,
            format!(
                "the controller was unable to compute the replica count for {metric}: {message}"
            ),
        );
        Self {
            metric,
            message,
            condition,
        }
    }
}

/// Errors returned by the scale subresource client.
#[derive(Debug, Clone, Error)]
pub enum ScaleError {
    #[error("scale target not found: {0}")]
    NotFound(String),

    #[error("scale update rejected: {0}")]
    Rejected(String),

    #[error("control plane unavailable: {0}")]
    Unavailable(String),
}

/// Errors returned by the autoscaler object store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("conflict writing {key}: expected version {expected}, found {actual}")]
    Conflict {
        key: WorkloadKey,
        expected: u64,
        actual: u64,
    },

    #[error("autoscaler not found: {0}")]
    NotFound(WorkloadKey),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors that end a reconciliation early.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid metrics ({invalid} of {total} failed), first error: {first}")]
    AllMetricsInvalid {
        invalid: usize,
        total: usize,
        first: MetricFailure,
    },

    #[error("failed to get scale of {target}: {source}")]
    GetScale {
        target: String,
        #[source]
        source: ScaleError,
    },

    #[error("failed to rescale {target}: {source}")]
    ScaleUpdate {
        target: String,
        #[source]
        source: ScaleError,
    },

    #[error("invalid autoscaler spec: {0}")]
    InvalidSpec(#[from] ValidationError),

    #[error("reconciliation of {0} cancelled")]
    Cancelled(WorkloadKey),

    #[error("status update conflict: {0}")]
    StatusConflict(#[source] StoreError),

    #[error("failed to read autoscaler: {0}")]
    Store(#[source] StoreError),
}

impl EngineError {
    /// `AbleToScale` condition that reports this error on the autoscaler,
    /// for the errors that have one.
    pub fn able_to_scale_condition(&self) -> Option<Condition> {
        let (reason, message) = match self {
            Self::AllMetricsInvalid { first, .. } => (
                reasons::FAILED_COMPUTE_METRICS_REPLICAS,
                format!("the controller was unable to compute a replica count: {first}"),
            ),
            Self::GetScale { source, .. } => (
                reasons::FAILED_GET_SCALE,
                format!("the controller was unable to get the target's current scale: {source}"),
            ),
            Self::ScaleUpdate { source, .. } => (
                reasons::FAILED_UPDATE_SCALE,
                format!("the controller was unable to update the target scale: {source}"),
            ),
            Self::InvalidSpec(e) => (
                reasons::INVALID_SPEC,
                format!("the autoscaler spec is invalid: {e}"),
            ),
            Self::Cancelled(_) | Self::StatusConflict(_) | Self::Store(_) => return None,
        };
        Some(Condition::able_to_scale(ConditionStatus::False, reason, message))
    }
}
