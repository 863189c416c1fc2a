//! Behavior normalizer — bounds and rate-limits the stabilized value.
//!
//! 1. Clamp into `[min_replicas, max_replicas]`.
//! 2. Drop rescale events older than the longest policy period.
//! 3. Without policies for the active direction (or with `Disabled`), stop.
//! 4. For each policy, work out the replica count at the start of its
//!    period from the rescale events inside that period, and the furthest
//!    the policy lets the count move from there.
//! 5. Combine the per-policy limits with the select policy and apply the
//!    result. Hard bounds still win over rate limits.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use hpa_core::condition::reasons;
use hpa_core::{
    Condition, ConditionStatus, PolicyKind, RescaleEvent, ResolvedRules, ScaleDirection,
    ScalingPolicy, SelectPolicy, WorkloadKey,
};

use crate::history::{RescaleHistory, cutoff};

#[derive(Debug, Clone, PartialEq)]
pub struct Normalization {
    pub desired: u32,
    /// `ScalingLimited`, true when a rate policy cut the value short.
    pub condition: Condition,
}

/// Inputs that bound one normalization.
#[derive(Debug, Clone, Copy)]
pub struct Bounds<'a> {
    pub current: u32,
    pub min: u32,
    pub max: u32,
    pub up: &'a ResolvedRules,
    pub down: &'a ResolvedRules,
}

pub struct Normalizer {
    events: Arc<RescaleHistory>,
}

impl Normalizer {
    pub fn new(events: Arc<RescaleHistory>) -> Self {
        Self { events }
    }

    pub async fn normalize(
        &self,
        key: &WorkloadKey,
        stabilized: u32,
        bounds: Bounds<'_>,
        now: DateTime<Utc>,
    ) -> Normalization {
        let Bounds {
            current,
            min,
            max,
            up,
            down,
        } = bounds;
        let clamped = stabilized.clamp(min, max);

        // Drop events past every policy period. Without policies nothing is kept.
        let horizon = up.longest_period().max(down.longest_period());
        self.events.prune(key, now, horizon).await;

        let Some(direction) = ScaleDirection::between(current, clamped) else {
            return within_range(clamped);
        };
        let rules = match direction {
            ScaleDirection::Up => up,
            ScaleDirection::Down => down,
        };
        if rules.policies.is_empty() || rules.select_policy == SelectPolicy::Disabled {
            return within_range(clamped);
        }

        let events = self.events.recent(key, now, horizon).await;

        let Some((limit, policy)) = select_limit(rules, current, &events, now) else {
            return within_range(clamped);
        };

        let desired = match direction {
            ScaleDirection::Up => clamped.min(limit.max(current)),
            ScaleDirection::Down => clamped.max(limit.min(current)),
        }
        .clamp(min, max);

        if desired == clamped {
            return within_range(clamped);
        }

        debug!(
            autoscaler = %key,
            %direction,
            current,
            clamped,
            desired,
            %policy,
            "replica change rate-limited"
        );

        let (reason, verb) = match direction {
            ScaleDirection::Up => (reasons::SCALE_UP_LIMIT, "increasing"),
            ScaleDirection::Down => (reasons::SCALE_DOWN_LIMIT, "decreasing"),
        };
        Normalization {
            desired,
            condition: Condition::scaling_limited(
                ConditionStatus::True,
                reason,
                format!(
                    "the desired replica count is {verb} faster than the maximum scale rate \
                     ({policy}); limited from {clamped} to {desired}"
                ),
            ),
        }
    }
}

fn within_range(desired: u32) -> Normalization {
    Normalization {
        desired,
        condition: Condition::scaling_limited(
            ConditionStatus::False,
            reasons::DESIRED_WITHIN_RANGE,
            "the desired count is within the acceptable range",
        ),
    }
}

/// Replica limit each policy allows, combined per the select policy.
/// Returns the limit and the policy that produced it.
fn select_limit<'r>(
    rules: &'r ResolvedRules,
    current: u32,
    events: &[RescaleEvent],
    now: DateTime<Utc>,
) -> Option<(u32, &'r ScalingPolicy)> {
    let limits = rules
        .policies
        .iter()
        .map(|policy| (policy_limit(rules.direction, policy, current, events, now), policy));

    // Max going up and Min going down both pick the higher limit.
    let prefer_higher = matches!(
        (rules.select_policy, rules.direction),
        (SelectPolicy::Max, ScaleDirection::Up) | (SelectPolicy::Min, ScaleDirection::Down)
    );
    let mut best: Option<(u32, &ScalingPolicy)> = None;
    for (limit, policy) in limits {
        let better = match best {
            None => true,
            Some((b, _)) if prefer_higher => limit > b,
            Some((b, _)) => limit < b,
        };
        if better {
            best = Some((limit, policy));
        }
    }
    best
}

fn policy_limit(
    direction: ScaleDirection,
    policy: &ScalingPolicy,
    current: u32,
    events: &[RescaleEvent],
    now: DateTime<Utc>,
) -> u32 {
    let period = Duration::from_secs(u64::from(policy.period_seconds));
    let since = cutoff(now, period);
    let (added, removed) = events
        .iter()
        .filter(|e| since.is_none_or(|c| e.timestamp >= c))
        .fold((0u64, 0u64), |(a, r), e| {
            (a + u64::from(e.added()), r + u64::from(e.removed()))
        });

    let period_start = (u64::from(current) + removed).saturating_sub(added);
    let change = match policy.kind {
        PolicyKind::Pods => u64::from(policy.value),
        PolicyKind::Percent => (period_start * u64::from(policy.value)).div_ceil(100),
    };
    let limit = match direction {
        ScaleDirection::Up => period_start + change,
        ScaleDirection::Down => period_start.saturating_sub(change),
    };
    u32::try_from(limit).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn key() -> WorkloadKey {
        WorkloadKey::new("default", "api")
    }

    fn pods(value: u32, period_seconds: u32) -> ScalingPolicy {
        ScalingPolicy {
            kind: PolicyKind::Pods,
            value,
            period_seconds,
        }
    }

    fn percent(value: u32, period_seconds: u32) -> ScalingPolicy {
        ScalingPolicy {
            kind: PolicyKind::Percent,
            value,
            period_seconds,
        }
    }

    fn rules(
        direction: ScaleDirection,
        select: SelectPolicy,
        policies: Vec<ScalingPolicy>,
    ) -> ResolvedRules {
        ResolvedRules {
            direction,
            stabilization_window: Duration::ZERO,
            select_policy: select,
            policies,
        }
    }

    fn no_rules(direction: ScaleDirection) -> ResolvedRules {
        rules(direction, SelectPolicy::Max, Vec::new())
    }

    async fn normalizer(events: &[(i64, u32, u32)]) -> Normalizer {
        let history = Arc::new(RescaleHistory::new());
        for &(secs, previous_replicas, new_replicas) in events {
            let event = RescaleEvent {
                timestamp: ts(secs),
                previous_replicas,
                new_replicas,
            };
            history.record(&key(), event).await;
        }
        Normalizer::new(history)
    }

    fn bounds<'a>(
        current: u32,
        min: u32,
        max: u32,
        up: &'a ResolvedRules,
        down: &'a ResolvedRules,
    ) -> Bounds<'a> {
        Bounds {
            current,
            min,
            max,
            up,
            down,
        }
    }

    #[tokio::test]
    async fn pods_policy_limits_scale_up() {
        let n = normalizer(&[]).await;
        let up = rules(ScaleDirection::Up, SelectPolicy::Max, vec![pods(4, 60)]);
        let down = no_rules(ScaleDirection::Down);
        let b = bounds(10, 1, 30, &up, &down);
        let result = n.normalize(&key(), 20, b, ts(1_000)).await;

        assert_eq!(result.desired, 14);
        assert_eq!(result.condition.status, ConditionStatus::True);
        assert_eq!(result.condition.reason, reasons::SCALE_UP_LIMIT);
        assert!(result.condition.message.contains("Pods=4 per 60s"));
    }

    #[tokio::test]
    async fn no_policies_passes_clamped_value() {
        let n = normalizer(&[]).await;
        let up = no_rules(ScaleDirection::Up);
        let down = no_rules(ScaleDirection::Down);
        let b = bounds(10, 2, 25, &up, &down);
        let result = n.normalize(&key(), 50, b, ts(1_000)).await;
        assert_eq!(result.desired, 25);
        assert_eq!(result.condition.status, ConditionStatus::False);
        assert_eq!(result.condition.reason, reasons::DESIRED_WITHIN_RANGE);
    }

    #[tokio::test]
    async fn disabled_select_policy_passes_through() {
        let n = normalizer(&[]).await;
        let up = no_rules(ScaleDirection::Up);
        let down = rules(ScaleDirection::Down, SelectPolicy::Disabled, vec![pods(1, 60)]);
        let b = bounds(10, 1, 20, &up, &down);
        let result = n.normalize(&key(), 3, b, ts(1_000)).await;
        assert_eq!(result.desired, 3);
        assert_eq!(result.condition.reason, reasons::DESIRED_WITHIN_RANGE);
    }

    #[tokio::test]
    async fn prior_events_consume_budget() {
        // 3 replicas were added 30s ago; a 4-per-minute budget leaves 1.
        let n = normalizer(&[(970, 7, 10)]).await;
        let up = rules(ScaleDirection::Up, SelectPolicy::Max, vec![pods(4, 60)]);
        let down = no_rules(ScaleDirection::Down);
        let b = bounds(10, 1, 30, &up, &down);
        let result = n.normalize(&key(), 20, b, ts(1_000)).await;
        assert_eq!(result.desired, 11);
    }

    #[tokio::test]
    async fn events_outside_period_do_not_count() {
        let n = normalizer(&[(900, 7, 10)]).await;
        let up = rules(ScaleDirection::Up, SelectPolicy::Max, vec![pods(4, 60)]);
        let down = no_rules(ScaleDirection::Down);
        let b = bounds(10, 1, 30, &up, &down);
        let result = n.normalize(&key(), 20, b, ts(1_000)).await;
        assert_eq!(result.desired, 14);
    }

    #[tokio::test]
    async fn exhausted_budget_holds_current() {
        let n = normalizer(&[(990, 6, 10)]).await;
        let up = rules(ScaleDirection::Up, SelectPolicy::Max, vec![pods(4, 60)]);
        let down = no_rules(ScaleDirection::Down);
        let b = bounds(10, 1, 30, &up, &down);
        let result = n.normalize(&key(), 20, b, ts(1_000)).await;
        assert_eq!(result.desired, 10);
        assert_eq!(result.condition.status, ConditionStatus::True);
    }

    #[tokio::test]
    async fn select_max_takes_least_restrictive() {
        let n = normalizer(&[]).await;
        // Pods allows +4 (14), Percent 100% allows +10 (20).
        let policies = vec![pods(4, 60), percent(100, 60)];
        let up = rules(ScaleDirection::Up, SelectPolicy::Max, policies);
        let down = no_rules(ScaleDirection::Down);
        let b = bounds(10, 1, 50, &up, &down);
        let result = n.normalize(&key(), 40, b, ts(1_000)).await;
        assert_eq!(result.desired, 20);
        assert!(result.condition.message.contains("Percent=100%"));
    }

    #[tokio::test]
    async fn select_min_takes_most_restrictive() {
        let n = normalizer(&[]).await;
        let policies = vec![pods(4, 60), percent(100, 60)];
        let up = rules(ScaleDirection::Up, SelectPolicy::Min, policies);
        let down = no_rules(ScaleDirection::Down);
        let b = bounds(10, 1, 50, &up, &down);
        let result = n.normalize(&key(), 40, b, ts(1_000)).await;
        assert_eq!(result.desired, 14);
    }

    #[tokio::test]
    async fn percent_policy_limits_scale_down() {
        let n = normalizer(&[]).await;
        // 10% of 20 is 2 per minute.
        let up = no_rules(ScaleDirection::Up);
        let down = rules(ScaleDirection::Down, SelectPolicy::Max, vec![percent(10, 60)]);
        let b = bounds(20, 1, 30, &up, &down);
        let result = n.normalize(&key(), 5, b, ts(1_000)).await;
        assert_eq!(result.desired, 18);
        assert_eq!(result.condition.reason, reasons::SCALE_DOWN_LIMIT);
    }

    #[tokio::test]
    async fn scale_down_select_max_is_lowest_limit() {
        let n = normalizer(&[]).await;
        // Pods allows -2 (18), Percent 50% allows -10 (10); Max picks 10.
        let up = no_rules(ScaleDirection::Up);
        let policies = vec![pods(2, 60), percent(50, 60)];
        let down = rules(ScaleDirection::Down, SelectPolicy::Max, policies.clone());
        let b = bounds(20, 1, 30, &up, &down);
        let result = n.normalize(&key(), 1, b, ts(1_000)).await;
        assert_eq!(result.desired, 10);

        let down = rules(ScaleDirection::Down, SelectPolicy::Min, policies);
        let b = bounds(20, 1, 30, &up, &down);
        let result = n.normalize(&key(), 1, b, ts(1_000)).await;
        assert_eq!(result.desired, 18);
    }

    #[tokio::test]
    async fn hard_bounds_win_over_rate_limits() {
        let n = normalizer(&[]).await;
        // Running 2 with min 8: the +1 policy cannot keep us below min.
        let up = rules(ScaleDirection::Up, SelectPolicy::Max, vec![pods(1, 60)]);
        let down = rules(ScaleDirection::Down, SelectPolicy::Max, vec![pods(1, 60)]);
        let b = bounds(2, 8, 12, &up, &down);
        let result = n.normalize(&key(), 3, b, ts(1_000)).await;
        assert_eq!(result.desired, 8);

        // Running 40 with max 12: the -1 policy cannot keep us above max.
        let b = bounds(40, 8, 12, &up, &down);
        let result = n.normalize(&key(), 30, b, ts(1_000)).await;
        assert_eq!(result.desired, 12);
    }

    #[tokio::test]
    async fn history_is_pruned_without_policies() {
        let n = normalizer(&[(100, 2, 4), (200, 4, 6), (990, 6, 10)]).await;
        let up = no_rules(ScaleDirection::Up);
        let down = no_rules(ScaleDirection::Down);

        // Unchanged count returns early; stale events still go.
        let b = bounds(10, 1, 30, &up, &down);
        let result = n.normalize(&key(), 10, b, ts(1_000)).await;
        assert_eq!(result.desired, 10);
        assert_eq!(n.events.len(&key()).await, 0);
    }

    #[tokio::test]
    async fn history_is_pruned_when_direction_disabled() {
        let n = normalizer(&[(100, 2, 4), (930, 4, 6), (990, 6, 10)]).await;
        let up = rules(ScaleDirection::Up, SelectPolicy::Disabled, vec![pods(1, 60)]);
        let down = no_rules(ScaleDirection::Down);

        let b = bounds(10, 1, 30, &up, &down);

        let result = n.normalize(&key(), 20, b, ts(1_000)).await;
        assert_eq!(result.desired, 20);
        // Only events inside the 60s period survive.
        let hour = Duration::from_secs(3_600);
        let kept = n.events.recent(&key(), ts(1_000), hour).await;
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].timestamp, ts(990));
    }

    #[tokio::test]
    async fn output_always_within_bounds() {
        let n = normalizer(&[(980, 3, 9), (990, 9, 4)]).await;
        let policy_sets = [
            vec![pods(1, 30)],
            vec![percent(10, 60), pods(3, 15)],
            vec![percent(200, 120)],
        ];
        for policies in &policy_sets {
            for select in [SelectPolicy::Max, SelectPolicy::Min, SelectPolicy::Disabled] {
                let up = rules(ScaleDirection::Up, select, policies.clone());
                let down = rules(ScaleDirection::Down, select, policies.clone());
                for (min, max) in [(0, 1), (1, 5), (3, 3), (2, 40)] {
                    for current in [0, 1, 4, 10, 50] {
                        for stabilized in [0, 1, 3, 7, 25, 100] {
                            let b = bounds(current, min, max, &up, &down);
                            let result = n.normalize(&key(), stabilized, b, ts(1_000)).await;
                            assert!(
                                (min..=max).contains(&result.desired),
                                "bounds {min}..={max}, current {current}, input {stabilized} -> {}",
                                result.desired
                            );
                        }
                    }
                }
            }
        }
    }
}
