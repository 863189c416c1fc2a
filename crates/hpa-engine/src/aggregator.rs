//! Metric aggregator — reduces every metric's proposal to one candidate.
//!
//! Metrics are evaluated in spec order. The largest proposal wins; ties go
//! to the metric that came first. The first failure is the one reported,
//! later failures are only counted. If every metric fails there is no
//! proposal and the cycle ends.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use hpa_core::condition::reasons;
use hpa_core::{AutoscalerSpec, Condition, ConditionStatus, MetricStatus, WorkloadKey};

use crate::client::{MetricProposal, MetricSource};
use crate::error::{EngineError, EngineResult, MetricFailure};

/// Outcome of evaluating all metrics of one autoscaler.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub replicas: u32,
    /// Metric the winning proposal is attributed to.
    pub metric_name: String,
    pub timestamp: DateTime<Utc>,
    /// Successful per-metric results, in spec order.
    pub statuses: Vec<MetricStatus>,
    pub invalid: usize,
    pub total: usize,
    pub first_failure: Option<MetricFailure>,
}

impl Aggregation {
    /// Some metrics failed but a proposal was still produced.
    pub fn is_partial(&self) -> bool {
        self.invalid > 0
    }

    pub fn scaling_active_condition(&self) -> Condition {
        match &self.first_failure {
            Some(first) => Condition::scaling_active(
                ConditionStatus::True,
                reasons::PARTIAL_METRICS_FAILURE,
                format!(
                    "the controller computed the replica count from {} of {} metrics; \
                     first error: {}",
                    self.total - self.invalid,
                    self.total,
                    first
                ),
            ),
            None => Condition::scaling_active(
                ConditionStatus::True,
                reasons::VALID_METRIC_FOUND,
                format!(
                    "the controller was able to compute the replica count from {}",
                    self.metric_name
                ),
            ),
        }
    }
}

pub struct Aggregator {
    source: Arc<dyn MetricSource>,
}

impl Aggregator {
    pub fn new(source: Arc<dyn MetricSource>) -> Self {
        Self { source }
    }

    /// Evaluate every metric of `spec` against `current` replicas.
    ///
    /// `previous` holds last cycle's per-metric results, looked up by name
    /// and handed to the source as a hint.
    pub async fn aggregate(
        &self,
        key: &WorkloadKey,
        spec: &AutoscalerSpec,
        previous: &[MetricStatus],
        current: u32,
        cancel: &CancellationToken,
    ) -> EngineResult<Aggregation> {
        let total = spec.metrics.len();
        let mut best: Option<MetricProposal> = None;
        let mut statuses = Vec::with_capacity(total);
        let mut invalid = 0usize;
        let mut first_failure: Option<MetricFailure> = None;

        for metric in &spec.metrics {
            let hint = previous.iter().find(|s| s.name == metric.name);
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled(key.clone())),
                r = self.source.evaluate(key, metric, &spec.scale_target_ref, current, hint) => r,
            };

            match result {
                Err(failure) => {
                    debug!(
                        autoscaler = %key,
                        metric = %metric.name,
                        error = %failure,
                        "metric evaluation failed"
                    );
                    if first_failure.is_none() {
                        first_failure = Some(failure);
                    }
                    invalid += 1;
                }
                Ok(proposal) => {
                    statuses.push(MetricStatus {
                        name: proposal.metric_name.clone(),
                        current_value: proposal.current_value,
                        proposed_replicas: proposal.replicas,
                        timestamp: proposal.timestamp,
                    });
                    let replace = match &best {
                        None => true,
                        Some(b) => b.replicas == 0 || proposal.replicas > b.replicas,
                    };
                    if replace {
                        best = Some(proposal);
                    }
                }
            }
        }

        let Some(best) = best else {
            // Every metric failed; with no metrics at all validation would
            // have rejected the spec already.
            let first = first_failure.unwrap_or_else(|| {
                MetricFailure::new(
                    "<none>",
                    reasons::FAILED_COMPUTE_METRICS_REPLICAS,
                    "no metrics evaluated",
                )
            });
            return Err(EngineError::AllMetricsInvalid {
                invalid,
                total,
                first,
            });
        };

        debug!(
            autoscaler = %key,
            replicas = best.replicas,
            metric = %best.metric_name,
            invalid,
            total,
            "metrics aggregated"
        );

        Ok(Aggregation {
            replicas: best.replicas,
            metric_name: best.metric_name,
            timestamp: best.timestamp,
            statuses,
            invalid,
            total,
            first_failure,
        })
    }
}
