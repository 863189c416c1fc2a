//! Rescale executor — applies a decided replica count to the scale target.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hpa_core::condition::reasons;
use hpa_core::{Condition, ConditionStatus, RescaleEvent, ScaleTargetRef, WorkloadKey};

use crate::client::{EventRecorder, EventType, ScaleClient};
use crate::error::{EngineError, EngineResult};
use crate::history::RescaleHistory;

/// What the executor did with a decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub desired_replicas: u32,
    pub rescaled: bool,
    /// `AbleToScale` after a rescale attempt; `None` when nothing was sent.
    pub condition: Option<Condition>,
}

pub struct Executor {
    scale: Arc<dyn ScaleClient>,
    events: Arc<dyn EventRecorder>,
    history: Arc<RescaleHistory>,
}

impl Executor {
    pub fn new(
        scale: Arc<dyn ScaleClient>,
        events: Arc<dyn EventRecorder>,
        history: Arc<RescaleHistory>,
    ) -> Self {
        Self {
            scale,
            events,
            history,
        }
    }

    /// Move `target` from `current` to `desired` replicas.
    ///
    /// `reason` names the metric or limit that drove the decision and ends
    /// up in the emitted event. A failed update is returned as
    /// [`EngineError::ScaleUpdate`] after the warning event is recorded.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        key: &WorkloadKey,
        target: &ScaleTargetRef,
        desired: u32,
        current: u32,
        reason: &str,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> EngineResult<Execution> {
        if desired == current {
            return Ok(Execution {
                desired_replicas: current,
                rescaled: false,
                condition: None,
            });
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled(key.clone())),
            r = self.scale.update_scale(key.namespace(), target, desired) => r,
        };

        if let Err(source) = result {
            warn!(
                autoscaler = %key,
                scale_target = %target,
                from = current,
                to = desired,
                error = %source,
                "rescale failed"
            );
            self.events.record(
                key,
                EventType::Warning,
                reasons::FAILED_RESCALE,
                &format!("New size: {desired}; reason: {reason}; error: {source}"),
            );
            return Err(EngineError::ScaleUpdate {
                target: target.to_string(),
                source,
            });
        }

        self.history
            .record(
                key,
                RescaleEvent {
                    timestamp: now,
                    previous_replicas: current,
                    new_replicas: desired,
                },
            )
            .await;

        info!(
            autoscaler = %key,
            scale_target = %target,
            from = current,
            to = desired,
            reason,
            "rescaled"
        );
        self.events.record(
            key,
            EventType::Normal,
            reasons::SUCCESSFUL_RESCALE,
            &format!("New size: {desired}; reason: {reason}"),
        );

        Ok(Execution {
            desired_replicas: desired,
            rescaled: true,
            condition: Some(Condition::able_to_scale(
                ConditionStatus::True,
                reasons::SUCCEEDED_RESCALE,
                format!("the autoscaler was able to update the target scale to {desired}"),
            )),
        })
    }
}
