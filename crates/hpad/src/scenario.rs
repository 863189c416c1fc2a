//! Scenario files.
//!
//! A scenario seeds an in-memory control plane with autoscalers and then
//! feeds metric readings on a timeline:
//!
//! ```toml
//! [[autoscalers]]
//! key = "shop/web"
//! replicas = 2
//!
//! [autoscalers.spec]
//! max_replicas = 10
//! scale_target_ref = { group = "apps", kind = "Deployment", name = "web" }
//! metrics = [{ name = "cpu", source = "resource", target = { kind = "utilization", value = 60.0 } }]
//!
//! [[steps]]
//! at = "30s"
//! readings = [{ autoscaler = "shop/web", metric = "cpu", usage = 90.0 }]
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

use hpa_core::{AutoscalerSpec, AutoscalerStatus, HorizontalAutoscaler, WorkloadKey};
use hpa_engine::memory::Reading;

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub autoscalers: Vec<ScenarioAutoscaler>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioAutoscaler {
    pub key: WorkloadKey,
    /// Replica count the scale target starts at.
    pub replicas: u32,
    pub spec: AutoscalerSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    /// Offset from the start of the scenario.
    #[serde(with = "hpa_core::duration::serde_str")]
    pub at: Duration,
    #[serde(default)]
    pub readings: Vec<StepReading>,
}

/// One metric reading; exactly one of `usage`, `replicas` or `error`.
#[derive(Debug, Clone, Deserialize)]
pub struct StepReading {
    pub autoscaler: WorkloadKey,
    pub metric: String,
    #[serde(default)]
    pub usage: Option<f64>,
    #[serde(default)]
    pub replicas: Option<u32>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StepReading {
    pub fn to_reading(&self) -> anyhow::Result<Reading> {
        match (self.usage, self.replicas, &self.error) {
            (Some(v), None, None) => Ok(Reading::Usage(v)),
            (None, Some(n), None) => Ok(Reading::Replicas(n)),
            (None, None, Some(message)) => Ok(Reading::Failure {
                reason: "FailedGetMetric".to_string(),
                message: message.clone(),
            }),
            _ => bail!(
                "reading for {} metric {} must set exactly one of usage, replicas, error",
                self.autoscaler,
                self.metric
            ),
        }
    }
}

impl ScenarioAutoscaler {
    pub fn to_object(&self) -> HorizontalAutoscaler {
        HorizontalAutoscaler {
            key: self.key.clone(),
            spec: self.spec.clone(),
            status: AutoscalerStatus::default(),
            resource_version: 1,
        }
    }
}

impl Scenario {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("invalid scenario {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let scenario: Scenario = toml::from_str(s)?;
        scenario.validate()?;
        Ok(scenario)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.autoscalers.is_empty() {
            bail!("scenario declares no autoscalers");
        }
        for (i, a) in self.autoscalers.iter().enumerate() {
            if self.autoscalers[..i].iter().any(|b| b.key == a.key) {
                bail!("autoscaler {} declared twice", a.key);
            }
        }
        let mut last = Duration::ZERO;
        for step in &self.steps {
            if step.at < last {
                bail!("steps must be in time order ({:?} after {:?})", step.at, last);
            }
            last = step.at;
            for reading in &step.readings {
                if !self.autoscalers.iter().any(|a| a.key == reading.autoscaler) {
                    bail!("reading for unknown autoscaler {}", reading.autoscaler);
                }
                reading.to_reading()?;
            }
        }
        Ok(())
    }
}
