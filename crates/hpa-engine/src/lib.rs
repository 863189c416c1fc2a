//! hpa-engine — the replica decision pipeline.
//!
//! One reconciliation runs four stages in order:
//!
//! 1. [`aggregator`] evaluates every metric and keeps the largest proposal.
//! 2. [`stabilizer`] damps it against recent recommendations.
//! 3. [`normalizer`] clamps it to the replica bounds and applies the
//!    scale-up / scale-down rate policies.
//! 4. [`executor`] issues the scale update and reports the outcome.
//!
//! [`reconciler::Reconciler`] wires the stages to the collaborators in
//! [`client`] and owns the per-workload [`history`] stores. In-memory
//! collaborators live in [`memory`].

pub mod aggregator;
pub mod calculator;
pub mod client;
pub mod error;
pub mod executor;
pub mod history;
pub mod memory;
pub mod normalizer;
pub mod reconciler;
pub mod stabilizer;

pub use client::{
    AutoscalerStore, Clock, EventRecorder, EventType, LogEvents, MetricProposal, MetricSource,
    Scale, ScaleClient, SystemClock,
};
pub use error::{EngineError, EngineResult, MetricFailure, ScaleError, StoreError};
pub use history::{KeyedHistory, RecommendationHistory, RescaleHistory};
pub use reconciler::{Collaborators, Reconciler};
