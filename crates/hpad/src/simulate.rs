//! Scenario replay.
//!
//! Runs a [`Scenario`] through the real reconciler against the in-memory
//! control plane. Time comes from a manual clock that jumps to each step's
//! offset; at every step all autoscalers are reconciled once.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use hpa_core::duration::format_duration;
use hpa_core::{Condition, ControllerConfig, WorkloadKey};
use hpa_engine::memory::{InMemoryControlPlane, ManualClock, ScriptedMetricSource};
use hpa_engine::{Clock, Collaborators, LogEvents, Reconciler};

use crate::scenario::Scenario;

/// Scenario time zero.
const EPOCH_SECS: i64 = 1_700_000_000;

/// One reconciliation of one autoscaler at one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub at: String,
    pub time: DateTime<Utc>,
    pub autoscaler: WorkloadKey,
    /// Replica count after the cycle.
    pub replicas: Option<u32>,
    pub desired: Option<u32>,
    pub rescaled: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// In-memory world a scenario runs against. Events go to the log.
pub struct World {
    pub plane: Arc<InMemoryControlPlane>,
    pub metrics: Arc<ScriptedMetricSource>,
    pub reconciler: Arc<Reconciler>,
}

impl World {
    /// Seed a control plane with the scenario's autoscalers.
    pub async fn seed(
        config: Arc<ControllerConfig>,
        scenario: &Scenario,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let plane = Arc::new(InMemoryControlPlane::new());
        for a in &scenario.autoscalers {
            plane.insert_autoscaler(a.to_object()).await;
            plane
                .set_scale(a.key.namespace(), &a.spec.scale_target_ref, a.replicas)
                .await;
        }
        let metrics = Arc::new(ScriptedMetricSource::new(clock.clone(), config.tolerance));
        let reconciler = Arc::new(Reconciler::new(
            config,
            Collaborators {
                metrics: metrics.clone(),
                scale: plane.clone(),
                store: plane.clone(),
                events: Arc::new(LogEvents),
                clock,
            },
        ));
        Self {
            plane,
            metrics,
            reconciler,
        }
    }
}

/// Replay `scenario`, reconciling up to `workers` autoscalers at a time.
pub async fn simulate(
    config: ControllerConfig,
    scenario: &Scenario,
    workers: usize,
) -> anyhow::Result<Vec<Decision>> {
    let start = DateTime::from_timestamp(EPOCH_SECS, 0).unwrap_or_default();
    let clock = Arc::new(ManualClock::new(start));
    let world = World::seed(Arc::new(config), scenario, clock.clone()).await;
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let mut decisions = Vec::new();

    for step in &scenario.steps {
        let now = TimeDelta::from_std(step.at)
            .ok()
            .and_then(|d| start.checked_add_signed(d))
            .ok_or_else(|| anyhow::anyhow!("step offset {:?} out of range", step.at))?;
        clock.set(now);
        for reading in &step.readings {
            world
                .metrics
                .set(&reading.autoscaler, &reading.metric, reading.to_reading()?)
                .await;
        }

        let at = format_duration(step.at);
        debug!(%at, readings = step.readings.len(), "replaying step");

        let mut cycles = JoinSet::new();
        for a in &scenario.autoscalers {
            let key = a.key.clone();
            let reconciler = world.reconciler.clone();
            let permits = permits.clone();
            cycles.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = reconciler.reconcile(&key, &CancellationToken::new()).await;
                (key, result)
            });
        }

        let mut step_decisions = Vec::with_capacity(scenario.autoscalers.len());
        while let Some(joined) = cycles.join_next().await {
            let (key, result) = joined?;
            let target = scenario
                .autoscalers
                .iter()
                .find(|a| a.key == key)
                .map(|a| &a.spec.scale_target_ref);
            let replicas = match target {
                Some(target) => world.plane.scale_of(key.namespace(), target).await,
                None => None,
            };
            let decision = match result {
                Ok(Some(outcome)) => Decision {
                    at: at.clone(),
                    time: now,
                    autoscaler: key,
                    replicas,
                    desired: Some(outcome.desired_replicas),
                    rescaled: outcome.rescaled,
                    conditions: outcome.conditions,
                    error: None,
                },
                Ok(None) => Decision {
                    at: at.clone(),
                    time: now,
                    autoscaler: key,
                    replicas,
                    desired: None,
                    rescaled: false,
                    conditions: Vec::new(),
                    error: Some("autoscaler not found".to_string()),
                },
                Err(e) => {
                    let conditions = world
                        .plane
                        .autoscaler(&key)
                        .await
                        .map(|a| a.status.conditions)
                        .unwrap_or_default();
                    Decision {
                        at: at.clone(),
                        time: now,
                        autoscaler: key,
                        replicas,
                        desired: None,
                        rescaled: false,
                        conditions,
                        error: Some(e.to_string()),
                    }
                }
            };
            step_decisions.push(decision);
        }
        step_decisions.sort_by(|a, b| a.autoscaler.cmp(&b.autoscaler));
        decisions.extend(step_decisions);
    }

    Ok(decisions)
}
