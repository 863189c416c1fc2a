//! Controller configuration.
//!
//! Loaded from TOML; every key is optional:
//!
//! ```toml
//! sync_period = "15s"
//! default_scale_up_stabilization_window = "0s"
//! default_scale_down_stabilization_window = "5m"
//! default_scale_up_select_policy = "max"
//! default_scale_down_select_policy = "max"
//! tolerance = 0.1
//! workers = 5
//! reconcile_timeout = "30s"
//! backoff_base = "5ms"
//! backoff_max = "1000s"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::serde_str;
use crate::error::{ConfigError, ConfigResult};
use crate::types::{ScaleDirection, ScalingPolicy, ScalingRules, SelectPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// How often every autoscaler is re-enqueued.
    #[serde(with = "serde_str")]
    pub sync_period: Duration,
    #[serde(with = "serde_str")]
    pub default_scale_up_stabilization_window: Duration,
    #[serde(with = "serde_str")]
    pub default_scale_down_stabilization_window: Duration,
    pub default_scale_up_select_policy: SelectPolicy,
    pub default_scale_down_select_policy: SelectPolicy,
    /// Usage ratio band around 1.0 inside which no change is proposed.
    pub tolerance: f64,
    /// Concurrent reconciliations.
    pub workers: usize,
    /// Upper bound on one reconciliation, including external calls.
    #[serde(with = "serde_str")]
    pub reconcile_timeout: Duration,
    #[serde(with = "serde_str")]
    pub backoff_base: Duration,
    #[serde(with = "serde_str")]
    pub backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sync_period: Duration::from_secs(15),
            default_scale_up_stabilization_window: Duration::ZERO,
            default_scale_down_stabilization_window: Duration::from_secs(300),
            default_scale_up_select_policy: SelectPolicy::Max,
            default_scale_down_select_policy: SelectPolicy::Max,
            tolerance: 0.1,
            workers: 5,
            reconcile_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
        }
    }
}

/// Rules for one direction after defaults have been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRules {
    pub direction: ScaleDirection,
    pub stabilization_window: Duration,
    pub select_policy: SelectPolicy,
    pub policies: Vec<ScalingPolicy>,
}

impl ControllerConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> ConfigResult<Self> {
        let config: ControllerConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.sync_period.is_zero() {
            return Err(ConfigError::Invalid("sync_period must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.tolerance) {
            return Err(ConfigError::Invalid(format!(
                "tolerance must be in [0, 1), got {}",
                self.tolerance
            )));
        }
        if self.backoff_base > self.backoff_max {
            return Err(ConfigError::Invalid(
                "backoff_base must not exceed backoff_max".into(),
            ));
        }
        Ok(())
    }

    /// Apply per-direction defaults to user-supplied rules.
    pub fn resolve_rules(
        &self,
        direction: ScaleDirection,
        rules: Option<&ScalingRules>,
    ) -> ResolvedRules {
        let (default_window, default_select) = match direction {
            ScaleDirection::Up => (
                self.default_scale_up_stabilization_window,
                self.default_scale_up_select_policy,
            ),
            ScaleDirection::Down => (
                self.default_scale_down_stabilization_window,
                self.default_scale_down_select_policy,
            ),
        };
        ResolvedRules {
            direction,
            stabilization_window: rules
                .and_then(|r| r.stabilization_window_seconds)
                .map(|secs| Duration::from_secs(u64::from(secs)))
                .unwrap_or(default_window),
            select_policy: rules
                .and_then(|r| r.select_policy)
                .unwrap_or(default_select),
            policies: rules.map(|r| r.policies.clone()).unwrap_or_default(),
        }
    }
}

impl ResolvedRules {
    /// Longest policy period, i.e. how long rescale events must be retained.
    pub fn longest_period(&self) -> Duration {
        self.policies
            .iter()
            .map(|p| Duration::from_secs(u64::from(p.period_seconds)))
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::types::PolicyKind;

    #[test]
    fn defaults_when_empty() {
        let config = ControllerConfig::from_toml_str("").unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.default_scale_down_stabilization_window, Duration::from_secs(300));
        assert_eq!(config.default_scale_up_stabilization_window, Duration::ZERO);
        assert_eq!(config.default_scale_up_select_policy, SelectPolicy::Max);
    }

    #[test]
    fn parse_overrides() {
        let toml_str = r#"
sync_period = "30s"
default_scale_down_stabilization_window = "2m"
default_scale_up_stabilization_window = 10
default_scale_down_select_policy = "min"
workers = 2
"#;
        let config = ControllerConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.sync_period, Duration::from_secs(30));
        assert_eq!(config.default_scale_down_stabilization_window, Duration::from_secs(120));
        assert_eq!(config.default_scale_up_stabilization_window, Duration::from_secs(10));
        assert_eq!(config.default_scale_down_select_policy, SelectPolicy::Min);
        assert_eq!(config.workers, 2);
        assert_eq!(config.tolerance, 0.1);
    }

    #[test]
    fn rejects_zero_workers() {
        assert!(matches!(
            ControllerConfig::from_toml_str("workers = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_bad_duration() {
        assert!(matches!(
            ControllerConfig::from_toml_str("sync_period = \"fast\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = ControllerConfig::default();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("default_scale_down_stabilization_window = \"5m\""));
        assert_eq!(ControllerConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn from_file_reads_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "workers = 8").unwrap();
        let config = ControllerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.workers, 8);

        let missing = ControllerConfig::from_file(Path::new("/nonexistent/hpa.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn resolve_rules_applies_defaults() {
        let config = ControllerConfig::default();
        let down = config.resolve_rules(ScaleDirection::Down, None);
        assert_eq!(down.stabilization_window, Duration::from_secs(300));
        assert_eq!(down.select_policy, SelectPolicy::Max);
        assert!(down.policies.is_empty());

        let rules = ScalingRules {
            stabilization_window_seconds: Some(60),
            select_policy: Some(SelectPolicy::Min),
            policies: vec![
                ScalingPolicy {
                    kind: PolicyKind::Pods,
                    value: 4,
                    period_seconds: 15,
                },
                ScalingPolicy {
                    kind: PolicyKind::Percent,
                    value: 100,
                    period_seconds: 60,
                },
            ],
        };
        let up = config.resolve_rules(ScaleDirection::Up, Some(&rules));
        assert_eq!(up.stabilization_window, Duration::from_secs(60));
        assert_eq!(up.select_policy, SelectPolicy::Min);
        assert_eq!(up.longest_period(), Duration::from_secs(60));
    }
}
