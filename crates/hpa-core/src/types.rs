//! Domain types for the horizontal autoscaler.
//!
//! These mirror the autoscaler object as the control plane stores it
//! (spec + status + resource version) plus the in-memory history records
//! the decision pipeline keeps per workload.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::{Condition, ConditionType};
use crate::error::ValidationError;

/// Upper bound on a policy's `period_seconds` (30 minutes).
pub const MAX_POLICY_PERIOD_SECONDS: u32 = 1800;

/// Upper bound on a stabilization window (one hour).
pub const MAX_STABILIZATION_WINDOW_SECONDS: u32 = 3600;

/// Replica floor applied when `min_replicas` is unset.
pub const DEFAULT_MIN_REPLICAS: u32 = 1;

// ── Identity ──────────────────────────────────────────────────────

/// Stable `namespace/name` identity of an autoscaler object.
///
/// This is the unit the work queue deduplicates on and the key every
/// per-workload history is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkloadKey {
    namespace: String,
    name: String,
}

impl WorkloadKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse `namespace/name`.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(ValidationError::Key(s.to_string())),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl TryFrom<String> for WorkloadKey {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<WorkloadKey> for String {
    fn from(key: WorkloadKey) -> Self {
        key.to_string()
    }
}

/// Reference to the scalable workload an autoscaler drives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScaleTargetRef {
    /// API group of the target, empty for the core group.
    #[serde(default)]
    pub group: String,
    pub kind: String,
    pub name: String,
}

impl fmt::Display for ScaleTargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}.{}/{}", self.kind, self.group, self.name)
        }
    }
}

// ── Metrics ───────────────────────────────────────────────────────

/// Where a metric comes from. Opaque to the engine; the metric source
/// interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricSourceKind {
    #[default]
    Resource,
    Pods,
    Object,
    External,
}

/// How the metric's target value is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricTargetKind {
    #[default]
    Utilization,
    Value,
    AverageValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricTarget {
    #[serde(default)]
    pub kind: MetricTargetKind,
    pub value: f64,
}

/// One metric an autoscaler scales on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub name: String,
    #[serde(default)]
    pub source: MetricSourceKind,
    pub target: MetricTarget,
}

/// Result of the last successful evaluation of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricStatus {
    pub name: String,
    /// Observed value, when the source reports one.
    #[serde(default)]
    pub current_value: Option<f64>,
    pub proposed_replicas: u32,
    pub timestamp: DateTime<Utc>,
}

// ── Behavior ──────────────────────────────────────────────────────

/// Direction of a replica change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Up,
    Down,
}

impl ScaleDirection {
    /// Direction implied by moving from `current` to `proposed`, if any.
    pub fn between(current: u32, proposed: u32) -> Option<Self> {
        match proposed.cmp(&current) {
            std::cmp::Ordering::Greater => Some(Self::Up),
            std::cmp::Ordering::Less => Some(Self::Down),
            std::cmp::Ordering::Equal => None,
        }
    }
}

impl fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => f.write_str("scaleUp"),
            Self::Down => f.write_str("scaleDown"),
        }
    }
}

/// How a rate policy measures change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Absolute number of replicas.
    Pods,
    /// Percentage of the replica count at the start of the period.
    Percent,
}

/// How multiple rate policies for one direction combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectPolicy {
    /// Least restrictive policy wins.
    Max,
    /// Most restrictive policy wins.
    Min,
    /// Rate policies are not applied.
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub kind: PolicyKind,
    pub value: u32,
    pub period_seconds: u32,
}

impl fmt::Display for ScalingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            PolicyKind::Pods => write!(f, "Pods={} per {}s", self.value, self.period_seconds),
            PolicyKind::Percent => {
                write!(f, "Percent={}% per {}s", self.value, self.period_seconds)
            }
        }
    }
}

/// Damping and rate limits for one direction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScalingRules {
    /// Unset falls back to the controller's per-direction default.
    #[serde(default)]
    pub stabilization_window_seconds: Option<u32>,
    /// Unset falls back to the controller's per-direction default.
    #[serde(default)]
    pub select_policy: Option<SelectPolicy>,
    #[serde(default)]
    pub policies: Vec<ScalingPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScalingBehavior {
    #[serde(default)]
    pub scale_up: Option<ScalingRules>,
    #[serde(default)]
    pub scale_down: Option<ScalingRules>,
}

// ── Autoscaler ────────────────────────────────────────────────────

/// Desired autoscaling configuration for one workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscalerSpec {
    pub scale_target_ref: ScaleTargetRef,
    #[serde(default)]
    pub min_replicas: Option<u32>,
    pub max_replicas: u32,
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
    #[serde(default)]
    pub behavior: Option<ScalingBehavior>,
}

impl AutoscalerSpec {
    pub fn min_replicas(&self) -> u32 {
        self.min_replicas.unwrap_or(DEFAULT_MIN_REPLICAS)
    }

    /// User-supplied rules for a direction, if any.
    pub fn rules(&self, direction: ScaleDirection) -> Option<&ScalingRules> {
        let behavior = self.behavior.as_ref()?;
        match direction {
            ScaleDirection::Up => behavior.scale_up.as_ref(),
            ScaleDirection::Down => behavior.scale_down.as_ref(),
        }
    }

    /// Reject specs the pipeline cannot reason about.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_replicas < 1 {
            return Err(ValidationError::MaxReplicasTooLow(self.max_replicas));
        }
        let min = self.min_replicas();
        if min > self.max_replicas {
            return Err(ValidationError::MinAboveMax {
                min,
                max: self.max_replicas,
            });
        }
        if self.metrics.is_empty() {
            return Err(ValidationError::NoMetrics);
        }
        for direction in [ScaleDirection::Up, ScaleDirection::Down] {
            if let Some(rules) = self.rules(direction) {
                validate_rules(direction, rules)?;
            }
        }
        Ok(())
    }
}

fn validate_rules(direction: ScaleDirection, rules: &ScalingRules) -> Result<(), ValidationError> {
    if let Some(window) = rules.stabilization_window_seconds {
        if window > MAX_STABILIZATION_WINDOW_SECONDS {
            return Err(ValidationError::StabilizationWindow {
                direction: direction.to_string(),
                got: window,
                max: MAX_STABILIZATION_WINDOW_SECONDS,
            });
        }
    }
    for (index, policy) in rules.policies.iter().enumerate() {
        if policy.value < 1 {
            return Err(ValidationError::PolicyValue {
                direction: direction.to_string(),
                index,
            });
        }
        if policy.period_seconds < 1 || policy.period_seconds > MAX_POLICY_PERIOD_SECONDS {
            return Err(ValidationError::PolicyPeriod {
                direction: direction.to_string(),
                index,
                got: policy.period_seconds,
                max: MAX_POLICY_PERIOD_SECONDS,
            });
        }
    }
    Ok(())
}

/// Observed state the controller reports back on the autoscaler object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AutoscalerStatus {
    pub current_replicas: u32,
    pub desired_replicas: u32,
    #[serde(default)]
    pub last_scale_time: Option<DateTime<Utc>>,
    /// Per-metric results from the last cycle, in spec order.
    #[serde(default)]
    pub current_metrics: Vec<MetricStatus>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl AutoscalerStatus {
    pub fn condition(&self, kind: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    /// Merge a condition, keeping the previous transition time when the
    /// status itself did not change.
    pub fn set_condition(&mut self, mut condition: Condition, now: DateTime<Utc>) {
        match self.conditions.iter_mut().find(|c| c.kind == condition.kind) {
            Some(existing) => {
                condition.last_transition_time = if existing.status == condition.status {
                    existing.last_transition_time.or(Some(now))
                } else {
                    Some(now)
                };
                *existing = condition;
            }
            None => {
                condition.last_transition_time = Some(now);
                self.conditions.push(condition);
            }
        }
    }
}

/// An autoscaler object as read from the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizontalAutoscaler {
    pub key: WorkloadKey,
    pub spec: AutoscalerSpec,
    #[serde(default)]
    pub status: AutoscalerStatus,
    /// Optimistic concurrency token; bumped on every status write.
    #[serde(default)]
    pub resource_version: u64,
}

// ── History records ───────────────────────────────────────────────

/// One recommendation produced by a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendationRecord {
    pub timestamp: DateTime<Utc>,
    pub replicas: u32,
}

/// One applied replica change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescaleEvent {
    pub timestamp: DateTime<Utc>,
    pub previous_replicas: u32,
    pub new_replicas: u32,
}

impl RescaleEvent {
    pub fn added(&self) -> u32 {
        self.new_replicas.saturating_sub(self.previous_replicas)
    }

    pub fn removed(&self) -> u32 {
        self.previous_replicas.saturating_sub(self.new_replicas)
    }
}

// ── Outcome ───────────────────────────────────────────────────────

/// What one reconciliation decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub desired_replicas: u32,
    pub rescaled: bool,
    pub conditions: Vec<Condition>,
}
