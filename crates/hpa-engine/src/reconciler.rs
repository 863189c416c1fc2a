//! Reconciler — one decision cycle for one autoscaler.
//!
//! ```text
//! store.get ─► validate ─► get_scale ─► Aggregator ─► Stabilizer ─► Normalizer ─► Executor
//!                                                                                   │
//!                        status (conditions merged once) ◄── commit recommendation ◄┘
//! ```
//!
//! Metric queries and the scale update are the cancellation points. A
//! cycle cancelled at either returns [`EngineError::Cancelled`] without
//! writing status or recording a recommendation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use hpa_core::condition::reasons;
use hpa_core::{
    AutoscalerStatus, Condition, ConditionStatus, ControllerConfig, DecisionOutcome,
    HorizontalAutoscaler, ScaleDirection, WorkloadKey,
};

use crate::aggregator::Aggregator;
use crate::client::{AutoscalerStore, Clock, EventRecorder, EventType, MetricSource, ScaleClient};
use crate::error::{EngineError, EngineResult, StoreError};
use crate::executor::Executor;
use crate::history::{RecommendationHistory, RescaleHistory};
use crate::normalizer::{Bounds, Normalizer};
use crate::stabilizer::Stabilizer;

/// Everything the pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub metrics: Arc<dyn MetricSource>,
    pub scale: Arc<dyn ScaleClient>,
    pub store: Arc<dyn AutoscalerStore>,
    pub events: Arc<dyn EventRecorder>,
    pub clock: Arc<dyn Clock>,
}

pub struct Reconciler {
    config: Arc<ControllerConfig>,
    store: Arc<dyn AutoscalerStore>,
    scale: Arc<dyn ScaleClient>,
    events: Arc<dyn EventRecorder>,
    clock: Arc<dyn Clock>,
    recommendations: Arc<RecommendationHistory>,
    rescales: Arc<RescaleHistory>,
    aggregator: Aggregator,
    stabilizer: Stabilizer,
    normalizer: Normalizer,
    executor: Executor,
}

impl Reconciler {
    /// Build a reconciler with fresh, empty histories.
    pub fn new(config: Arc<ControllerConfig>, collaborators: Collaborators) -> Self {
        Self::with_histories(
            config,
            collaborators,
            Arc::new(RecommendationHistory::new()),
            Arc::new(RescaleHistory::new()),
        )
    }

    /// Build a reconciler around existing history stores.
    pub fn with_histories(
        config: Arc<ControllerConfig>,
        collaborators: Collaborators,
        recommendations: Arc<RecommendationHistory>,
        rescales: Arc<RescaleHistory>,
    ) -> Self {
        let Collaborators {
            metrics,
            scale,
            store,
            events,
            clock,
        } = collaborators;
        Self {
            aggregator: Aggregator::new(metrics),
            stabilizer: Stabilizer::new(recommendations.clone()),
            normalizer: Normalizer::new(rescales.clone()),
            executor: Executor::new(scale.clone(), events.clone(), rescales.clone()),
            config,
            store,
            scale,
            events,
            clock,
            recommendations,
            rescales,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn recommendations(&self) -> &Arc<RecommendationHistory> {
        &self.recommendations
    }

    pub fn rescales(&self) -> &Arc<RescaleHistory> {
        &self.rescales
    }

    /// Run one decision cycle for `key`.
    ///
    /// Returns `Ok(None)` when the autoscaler no longer exists; its
    /// histories are dropped.
    pub async fn reconcile(
        &self,
        key: &WorkloadKey,
        cancel: &CancellationToken,
    ) -> EngineResult<Option<DecisionOutcome>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled(key.clone()));
        }

        let Some(autoscaler) = self.store.get(key).await.map_err(EngineError::Store)? else {
            let dropped = self.recommendations.forget(key).await | self.rescales.forget(key).await;
            if dropped {
                debug!(autoscaler = %key, "autoscaler deleted, histories dropped");
            }
            return Ok(None);
        };

        let now = self.clock.now();
        let mut status = autoscaler.status.clone();

        match self.decide(key, &autoscaler, &mut status, now, cancel).await {
            Ok(outcome) => {
                self.persist(key, &autoscaler, status.clone()).await?;
                Ok(Some(DecisionOutcome {
                    conditions: status.conditions,
                    ..outcome
                }))
            }
            Err(err @ EngineError::Cancelled(_)) => Err(err),
            Err(err) => {
                self.report_failure(key, &err, &mut status, now);
                if let Err(persist_err) = self.persist(key, &autoscaler, status).await {
                    debug!(
                        autoscaler = %key,
                        error = %persist_err,
                        "status not written after failed cycle"
                    );
                }
                Err(err)
            }
        }
    }

    async fn decide(
        &self,
        key: &WorkloadKey,
        autoscaler: &HorizontalAutoscaler,
        status: &mut AutoscalerStatus,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> EngineResult<DecisionOutcome> {
        let spec = &autoscaler.spec;
        spec.validate()?;

        let target = &spec.scale_target_ref;
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled(key.clone())),
            r = self.scale.get_scale(key.namespace(), target) => r,
        };
        let scale = fetched.map_err(|source| EngineError::GetScale {
            target: target.to_string(),
            source,
        })?;

        let current = scale.replicas;
        let min = spec.min_replicas();
        let max = spec.max_replicas;
        status.current_replicas = current;

        if current == 0 && min > 0 {
            debug!(autoscaler = %key, "target scaled to zero, autoscaling disabled");
            status.desired_replicas = 0;
            status.set_condition(
                Condition::scaling_active(
                    ConditionStatus::False,
                    reasons::SCALING_DISABLED,
                    "scaling is disabled since the replica count of the target is zero",
                ),
                now,
            );
            return Ok(outcome(0, false));
        }

        let up = self
            .config
            .resolve_rules(ScaleDirection::Up, spec.rules(ScaleDirection::Up));
        let down = self
            .config
            .resolve_rules(ScaleDirection::Down, spec.rules(ScaleDirection::Down));

        let aggregation = match self
            .aggregator
            .aggregate(key, spec, &autoscaler.status.current_metrics, current, cancel)
            .await
        {
            Ok(aggregation) => aggregation,
            Err(err) => {
                if matches!(err, EngineError::AllMetricsInvalid { .. }) {
                    status.current_metrics.clear();
                }
                return Err(err);
            }
        };
        status.current_metrics = aggregation.statuses.clone();
        status.set_condition(aggregation.scaling_active_condition(), now);

        let stabilization = self
            .stabilizer
            .stabilize(key, aggregation.replicas, current, &up, &down, now)
            .await;
        let normalization = self
            .normalizer
            .normalize(
                key,
                stabilization.recommendation,
                Bounds {
                    current,
                    min,
                    max,
                    up: &up,
                    down: &down,
                },
                now,
            )
            .await;
        status.set_condition(normalization.condition.clone(), now);

        debug!(
            autoscaler = %key,
            current,
            proposed = aggregation.replicas,
            metric = %aggregation.metric_name,
            stabilized = stabilization.recommendation,
            desired = normalization.desired,
            "replica count decided"
        );

        let reason = match ScaleDirection::between(current, normalization.desired) {
            Some(ScaleDirection::Up) => format!("{} above target", aggregation.metric_name),
            _ => "All metrics below target".to_string(),
        };

        let execution = self
            .executor
            .execute(key, target, normalization.desired, current, &reason, now, cancel)
            .await;

        // Past the scale update there is nothing left to cancel.
        if !matches!(execution, Err(EngineError::Cancelled(_))) {
            self.stabilizer.commit(key, stabilization.pending).await;
        }

        match execution {
            Ok(execution) => {
                status.desired_replicas = execution.desired_replicas;
                if execution.rescaled {
                    status.last_scale_time = Some(now);
                }
                let able = execution.condition.unwrap_or(stabilization.condition);
                status.set_condition(able, now);
                Ok(outcome(execution.desired_replicas, execution.rescaled))
            }
            Err(err) => {
                if matches!(err, EngineError::ScaleUpdate { .. }) {
                    status.desired_replicas = current;
                }
                Err(err)
            }
        }
    }

    /// Put a failed cycle's conditions on the status and emit its event.
    fn report_failure(
        &self,
        key: &WorkloadKey,
        err: &EngineError,
        status: &mut AutoscalerStatus,
        now: DateTime<Utc>,
    ) {
        if let EngineError::AllMetricsInvalid { first, .. } = err {
            status.set_condition(first.condition.clone(), now);
        }
        let Some(condition) = err.able_to_scale_condition() else {
            return;
        };
        // The executor already reported failed updates.
        if !matches!(err, EngineError::ScaleUpdate { .. }) {
            warn!(autoscaler = %key, reason = %condition.reason, error = %err, "reconcile failed");
            self.events
                .record(key, EventType::Warning, &condition.reason, &err.to_string());
        }
        status.set_condition(condition, now);
    }

    /// Write `status` back if it changed. Conflicts fail the cycle; other
    /// store errors are logged and dropped.
    async fn persist(
        &self,
        key: &WorkloadKey,
        autoscaler: &HorizontalAutoscaler,
        status: AutoscalerStatus,
    ) -> EngineResult<()> {
        if status == autoscaler.status {
            return Ok(());
        }
        match self
            .store
            .update_status(key, autoscaler.resource_version, status)
            .await
        {
            Ok(version) => {
                debug!(autoscaler = %key, version, "status updated");
                Ok(())
            }
            Err(err @ StoreError::Conflict { .. }) => Err(EngineError::StatusConflict(err)),
            Err(err) => {
                warn!(autoscaler = %key, error = %err, "failed to update status");
                Ok(())
            }
        }
    }
}

fn outcome(desired_replicas: u32, rescaled: bool) -> DecisionOutcome {
    DecisionOutcome {
        desired_replicas,
        rescaled,
        conditions: Vec::new(),
    }
}
