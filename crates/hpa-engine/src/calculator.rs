//! Usage-ratio replica calculator.
//!
//! Metric sources that observe a raw value (rather than proposing a replica
//! count directly) turn it into a proposal here:
//!
//! ```text
//! ratio    = observed / target
//! if |ratio - 1| <= tolerance: keep current
//! replicas = ceil(current * ratio)
//! ```
//!
//! For `AverageValue` targets the observed value is the total across all
//! replicas and the proposal is `ceil(total / target)`.

use hpa_core::MetricTargetKind;

/// Replica count that would bring `observed` back to `target`.
pub fn replicas_for_usage(
    kind: MetricTargetKind,
    current: u32,
    observed: f64,
    target: f64,
    tolerance: f64,
) -> u32 {
    if !(target > 0.0) || !observed.is_finite() || observed < 0.0 {
        return current;
    }

    match kind {
        MetricTargetKind::Utilization | MetricTargetKind::Value => {
            let ratio = observed / target;
            if (ratio - 1.0).abs() <= tolerance {
                return current;
            }
            saturating_ceil(f64::from(current) * ratio)
        }
        MetricTargetKind::AverageValue => {
            if current > 0 {
                let ratio = observed / (target * f64::from(current));
                if (ratio - 1.0).abs() <= tolerance {
                    return current;
                }
            }
            saturating_ceil(observed / target)
        }
    }
}

fn saturating_ceil(v: f64) -> u32 {
    let c = v.ceil();
    if c >= f64::from(u32::MAX) {
        u32::MAX
    } else if c <= 0.0 {
        0
    } else {
        c as u32
    }
}
