//! Stabilizer — damps the raw proposal against recent recommendations.
//!
//! For a scale-down the stabilized value is the highest recommendation in
//! the scale-down window; for a scale-up it is the lowest recommendation in
//! the scale-up window. The raw proposal counts as part of the window. The
//! result never crosses the current replica count, and a zero-length
//! window lets the raw proposal through unchanged.
//!
//! Stabilizing is read-only. The raw proposal is written to history with
//! [`Stabilizer::commit`] once the cycle can no longer be cancelled.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

use hpa_core::condition::reasons;
use hpa_core::{
    Condition, ConditionStatus, RecommendationRecord, ResolvedRules, ScaleDirection, WorkloadKey,
};

use crate::history::RecommendationHistory;

#[derive(Debug, Clone, PartialEq)]
pub struct Stabilization {
    pub recommendation: u32,
    /// `AbleToScale=True` with the reason the value was (or was not) damped.
    pub condition: Condition,
    /// The raw proposal, to be committed to history.
    pub pending: RecommendationRecord,
}

pub struct Stabilizer {
    history: Arc<RecommendationHistory>,
}

impl Stabilizer {
    pub fn new(history: Arc<RecommendationHistory>) -> Self {
        Self { history }
    }

    pub async fn stabilize(
        &self,
        key: &WorkloadKey,
        raw: u32,
        current: u32,
        up: &ResolvedRules,
        down: &ResolvedRules,
        now: DateTime<Utc>,
    ) -> Stabilization {
        let horizon = up.stabilization_window.max(down.stabilization_window);
        self.history.prune(key, now, horizon).await;

        let pending = RecommendationRecord {
            timestamp: now,
            replicas: raw,
        };

        let Some(direction) = ScaleDirection::between(current, raw) else {
            return Stabilization {
                recommendation: raw,
                condition: ready(),
                pending,
            };
        };
        let rules = match direction {
            ScaleDirection::Up => up,
            ScaleDirection::Down => down,
        };
        if rules.stabilization_window.is_zero() {
            return Stabilization {
                recommendation: raw,
                condition: ready(),
                pending,
            };
        }

        let mut window = self
            .history
            .recent(key, now, rules.stabilization_window)
            .await;
        window.push(pending);

        let recommendation = match direction {
            ScaleDirection::Up => window
                .iter()
                .map(|r| r.replicas)
                .min()
                .unwrap_or(raw)
                .max(current),
            ScaleDirection::Down => window
                .iter()
                .map(|r| r.replicas)
                .max()
                .unwrap_or(raw)
                .min(current),
        };

        if recommendation == raw {
            return Stabilization {
                recommendation,
                condition: ready(),
                pending,
            };
        }

        let wait = time_until_allowed(&window, direction, raw, rules.stabilization_window, now);
        debug!(
            autoscaler = %key,
            %direction,
            raw,
            stabilized = recommendation,
            wait_secs = wait.as_secs(),
            "recommendation stabilized"
        );

        let (reason, message) = match direction {
            ScaleDirection::Up => (
                reasons::SCALE_UP_STABILIZED,
                format!(
                    "recent recommendations were lower than current one, applying the lowest \
                     recent recommendation ({recommendation}); {raw} replicas allowed in {}s",
                    wait.as_secs()
                ),
            ),
            ScaleDirection::Down => (
                reasons::SCALE_DOWN_STABILIZED,
                format!(
                    "recent recommendations were higher than current one, applying the highest \
                     recent recommendation ({recommendation}); {raw} replicas allowed in {}s",
                    wait.as_secs()
                ),
            ),
        };

        Stabilization {
            recommendation,
            condition: Condition::able_to_scale(ConditionStatus::True, reason, message),
            pending,
        }
    }

    /// Record a raw proposal produced by [`stabilize`](Self::stabilize).
    pub async fn commit(&self, key: &WorkloadKey, record: RecommendationRecord) {
        self.history.record(key, record).await;
    }
}

fn ready() -> Condition {
    Condition::able_to_scale(
        ConditionStatus::True,
        reasons::READY_FOR_NEW_SCALE,
        "recommended size matches current size",
    )
}

/// Time until every recommendation holding the value back has left the window.
fn time_until_allowed(
    window: &[RecommendationRecord],
    direction: ScaleDirection,
    raw: u32,
    length: Duration,
    now: DateTime<Utc>,
) -> Duration {
    let blocking = window.iter().filter(|r| match direction {
        ScaleDirection::Up => r.replicas < raw,
        ScaleDirection::Down => r.replicas > raw,
    });
    let Some(latest) = blocking.map(|r| r.timestamp).max() else {
        return Duration::ZERO;
    };
    let expires = TimeDelta::from_std(length)
        .ok()
        .and_then(|d| latest.checked_add_signed(d));
    match expires {
        Some(at) if at > now => (at - now).to_std().unwrap_or_default(),
        Some(_) => Duration::ZERO,
        None => length,
    }
}
