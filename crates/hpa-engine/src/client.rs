//! Capabilities the pipeline needs from the outside world.
//!
//! Each collaborator is a narrow trait so the pipeline can run against the
//! in-memory implementations in [`crate::memory`] or a real control plane.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use hpa_core::{
    AutoscalerStatus, HorizontalAutoscaler, MetricSpec, MetricStatus, ScaleTargetRef, WorkloadKey,
};

use crate::error::{MetricFailure, ScaleError, StoreError};

// ── Metrics ───────────────────────────────────────────────────────

/// A replica count proposed by one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricProposal {
    pub replicas: u32,
    pub metric_name: String,
    pub timestamp: DateTime<Utc>,
    /// Observed value behind the proposal, when the source has one.
    pub current_value: Option<f64>,
}

/// Evaluates one metric spec into a replica proposal.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// `previous` is this metric's result from the last cycle, if any.
    async fn evaluate(
        &self,
        key: &WorkloadKey,
        spec: &MetricSpec,
        target: &ScaleTargetRef,
        current_replicas: u32,
        previous: Option<&MetricStatus>,
    ) -> Result<MetricProposal, MetricFailure>;
}

// ── Scale subresource ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scale {
    pub replicas: u32,
    /// Label selector of the target's pods; passed through untouched.
    pub selector: Option<String>,
}

#[async_trait]
pub trait ScaleClient: Send + Sync {
    async fn get_scale(
        &self,
        namespace: &str,
        target: &ScaleTargetRef,
    ) -> Result<Scale, ScaleError>;

    async fn update_scale(
        &self,
        namespace: &str,
        target: &ScaleTargetRef,
        replicas: u32,
    ) -> Result<(), ScaleError>;
}

// ── Autoscaler objects ────────────────────────────────────────────

#[async_trait]
pub trait AutoscalerStore: Send + Sync {
    async fn get(&self, key: &WorkloadKey) -> Result<Option<HorizontalAutoscaler>, StoreError>;

    async fn list_keys(&self) -> Result<Vec<WorkloadKey>, StoreError>;

    /// Conditional write: fails with [`StoreError::Conflict`] unless the
    /// stored object is still at `resource_version`. Returns the new version.
    async fn update_status(
        &self,
        key: &WorkloadKey,
        resource_version: u64,
        status: AutoscalerStatus,
    ) -> Result<u64, StoreError>;
}

// ── Events ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// Fire-and-forget event sink. Implementations must not block.
pub trait EventRecorder: Send + Sync {
    fn record(&self, key: &WorkloadKey, kind: EventType, reason: &str, message: &str);
}

/// Event sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEvents;

impl EventRecorder for LogEvents {
    fn record(&self, key: &WorkloadKey, kind: EventType, reason: &str, message: &str) {
        match kind {
            EventType::Normal => tracing::info!(autoscaler = %key, reason, message, "event"),
            EventType::Warning => tracing::warn!(autoscaler = %key, reason, message, "event"),
        }
    }
}

// ── Time ──────────────────────────────────────────────────────────

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
