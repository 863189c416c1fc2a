//! In-memory collaborators.
//!
//! Used by the tests and by `hpad simulate`. The control plane keeps
//! autoscaler objects and scale subresources in maps behind async mutexes,
//! honours resource versions on status writes, and can be told to fail
//! the next scale read or update.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex as AsyncMutex;

use hpa_core::{
    AutoscalerStatus, HorizontalAutoscaler, MetricSourceKind, MetricSpec, MetricStatus,
    ScaleTargetRef, WorkloadKey,
};

use crate::calculator::replicas_for_usage;
use crate::client::{
    AutoscalerStore, Clock, EventRecorder, EventType, MetricProposal, MetricSource, Scale,
    ScaleClient,
};
use crate::error::{MetricFailure, ScaleError, StoreError};

// ── Control plane ─────────────────────────────────────────────────

type ScaleKey = (String, ScaleTargetRef);

#[derive(Default)]
struct PlaneState {
    autoscalers: HashMap<WorkloadKey, HorizontalAutoscaler>,
    scales: HashMap<ScaleKey, u32>,
    fail_get: Option<String>,
    fail_update: Option<String>,
    update_calls: usize,
    status_writes: usize,
}

/// Autoscaler objects plus scale subresources.
#[derive(Default)]
pub struct InMemoryControlPlane {
    state: AsyncMutex<PlaneState>,
}

impl InMemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_autoscaler(&self, autoscaler: HorizontalAutoscaler) {
        let mut state = self.state.lock().await;
        state.autoscalers.insert(autoscaler.key.clone(), autoscaler);
    }

    pub async fn remove_autoscaler(&self, key: &WorkloadKey) -> Option<HorizontalAutoscaler> {
        self.state.lock().await.autoscalers.remove(key)
    }

    pub async fn autoscaler(&self, key: &WorkloadKey) -> Option<HorizontalAutoscaler> {
        self.state.lock().await.autoscalers.get(key).cloned()
    }

    /// Simulate a concurrent writer: the next status write with the old
    /// version will conflict.
    pub async fn bump_version(&self, key: &WorkloadKey) {
        if let Some(a) = self.state.lock().await.autoscalers.get_mut(key) {
            a.resource_version += 1;
        }
    }

    pub async fn set_scale(&self, namespace: &str, target: &ScaleTargetRef, replicas: u32) {
        let mut state = self.state.lock().await;
        state
            .scales
            .insert((namespace.to_string(), target.clone()), replicas);
    }

    pub async fn scale_of(&self, namespace: &str, target: &ScaleTargetRef) -> Option<u32> {
        let state = self.state.lock().await;
        state
            .scales
            .get(&(namespace.to_string(), target.clone()))
            .copied()
    }

    pub async fn fail_next_get_scale(&self, message: impl Into<String>) {
        self.state.lock().await.fail_get = Some(message.into());
    }

    pub async fn fail_next_update(&self, message: impl Into<String>) {
        self.state.lock().await.fail_update = Some(message.into());
    }

    /// Scale updates attempted, failed ones included.
    pub async fn update_calls(&self) -> usize {
        self.state.lock().await.update_calls
    }

    /// Successful status writes.
    pub async fn status_writes(&self) -> usize {
        self.state.lock().await.status_writes
    }
}

#[async_trait]
impl AutoscalerStore for InMemoryControlPlane {
    async fn get(&self, key: &WorkloadKey) -> Result<Option<HorizontalAutoscaler>, StoreError> {
        Ok(self.state.lock().await.autoscalers.get(key).cloned())
    }

    async fn list_keys(&self) -> Result<Vec<WorkloadKey>, StoreError> {
        let state = self.state.lock().await;
        let mut keys: Vec<_> = state.autoscalers.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn update_status(
        &self,
        key: &WorkloadKey,
        resource_version: u64,
        status: AutoscalerStatus,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let stored = state
            .autoscalers
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if stored.resource_version != resource_version {
            return Err(StoreError::Conflict {
                key: key.clone(),
                expected: resource_version,
                actual: stored.resource_version,
            });
        }
        stored.status = status;
        stored.resource_version += 1;
        let version = stored.resource_version;
        state.status_writes += 1;
        Ok(version)
    }
}

#[async_trait]
impl ScaleClient for InMemoryControlPlane {
    async fn get_scale(
        &self,
        namespace: &str,
        target: &ScaleTargetRef,
    ) -> Result<Scale, ScaleError> {
        let mut state = self.state.lock().await;
        if let Some(message) = state.fail_get.take() {
            return Err(ScaleError::Unavailable(message));
        }
        state
            .scales
            .get(&(namespace.to_string(), target.clone()))
            .map(|&replicas| Scale {
                replicas,
                selector: None,
            })
            .ok_or_else(|| ScaleError::NotFound(format!("{namespace}/{target}")))
    }

    async fn update_scale(
        &self,
        namespace: &str,
        target: &ScaleTargetRef,
        replicas: u32,
    ) -> Result<(), ScaleError> {
        let mut state = self.state.lock().await;
        state.update_calls += 1;
        if let Some(message) = state.fail_update.take() {
            return Err(ScaleError::Rejected(message));
        }
        match state.scales.get_mut(&(namespace.to_string(), target.clone())) {
            Some(current) => {
                *current = replicas;
                Ok(())
            }
            None => Err(ScaleError::NotFound(format!("{namespace}/{target}"))),
        }
    }
}

// ── Metrics ───────────────────────────────────────────────────────

/// A scripted metric reading.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    /// Propose this replica count directly.
    Replicas(u32),
    /// Observed value, turned into a proposal against the metric's target.
    Usage(f64),
    Failure { reason: String, message: String },
}

type MetricKey = (WorkloadKey, String);

/// Metric source answering from a table of scripted readings.
pub struct ScriptedMetricSource {
    clock: Arc<dyn Clock>,
    tolerance: f64,
    delay: Option<Duration>,
    readings: AsyncMutex<HashMap<MetricKey, Reading>>,
    hints: AsyncMutex<HashMap<MetricKey, MetricStatus>>,
}

impl ScriptedMetricSource {
    pub fn new(clock: Arc<dyn Clock>, tolerance: f64) -> Self {
        Self {
            clock,
            tolerance,
            delay: None,
            readings: AsyncMutex::new(HashMap::new()),
            hints: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Sleep this long before answering each evaluation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn set(&self, key: &WorkloadKey, metric: &str, reading: Reading) {
        self.readings
            .lock()
            .await
            .insert((key.clone(), metric.to_string()), reading);
    }

    /// Proposed replicas of the last hint passed for this metric.
    pub async fn last_hint(&self, key: &WorkloadKey, metric: &str) -> Option<u32> {
        self.hints
            .lock()
            .await
            .get(&(key.clone(), metric.to_string()))
            .map(|s| s.proposed_replicas)
    }
}

fn missing_reason(source: MetricSourceKind) -> &'static str {
    match source {
        MetricSourceKind::Resource => "FailedGetResourceMetric",
        MetricSourceKind::Pods => "FailedGetPodsMetric",
        MetricSourceKind::Object => "FailedGetObjectMetric",
        MetricSourceKind::External => "FailedGetExternalMetric",
    }
}

#[async_trait]
impl MetricSource for ScriptedMetricSource {
    async fn evaluate(
        &self,
        key: &WorkloadKey,
        spec: &MetricSpec,
        _target: &ScaleTargetRef,
        current_replicas: u32,
        previous: Option<&MetricStatus>,
    ) -> Result<MetricProposal, MetricFailure> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let metric_key = (key.clone(), spec.name.clone());
        if let Some(previous) = previous {
            self.hints
                .lock()
                .await
                .insert(metric_key.clone(), previous.clone());
        }
        let reading = self.readings.lock().await.get(&metric_key).cloned();

        let (replicas, current_value) = match reading {
            Some(Reading::Replicas(n)) => (n, None),
            Some(Reading::Usage(v)) => (
                replicas_for_usage(
                    spec.target.kind,
                    current_replicas,
                    v,
                    spec.target.value,
                    self.tolerance,
                ),
                Some(v),
            ),
            Some(Reading::Failure { reason, message }) => {
                return Err(MetricFailure::new(spec.name.clone(), &reason, message));
            }
            None => {
                return Err(MetricFailure::new(
                    spec.name.clone(),
                    missing_reason(spec.source),
                    "no reading available",
                ));
            }
        };

        Ok(MetricProposal {
            replicas,
            metric_name: spec.name.clone(),
            timestamp: self.clock.now(),
            current_value,
        })
    }
}

// ── Events ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub key: WorkloadKey,
    pub kind: EventType,
    pub reason: String,
    pub message: String,
}

/// Event sink that keeps everything it is given.
#[derive(Debug, Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventRecorder for RecordingEvents {
    fn record(&self, key: &WorkloadKey, kind: EventType, reason: &str, message: &str) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedEvent {
                key: key.clone(),
                kind,
                reason: reason.to_string(),
                message: message.to_string(),
            });
    }
}

// ── Time ──────────────────────────────────────────────────────────

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Clock at `secs` past the Unix epoch. Out-of-range values clamp to
    /// the epoch.
    pub fn at_secs(secs: i64) -> Self {
        Self::new(DateTime::from_timestamp(secs, 0).unwrap_or_default())
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(next) = TimeDelta::from_std(by)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
        {
            *now = next;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
