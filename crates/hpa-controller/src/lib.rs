//! hpa-controller — drives the reconciler from a keyed work queue.
//!
//! [`WorkQueue`] guarantees one in-flight reconcile per autoscaler and
//! coalesces duplicate requests; [`Controller`] runs the worker pool and
//! the periodic resync on top of it.

pub mod controller;
pub mod queue;

pub use controller::Controller;
pub use queue::{Backoff, WorkQueue};
