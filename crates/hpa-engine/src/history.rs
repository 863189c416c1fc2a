//! Per-workload history stores.
//!
//! A [`KeyedHistory`] maps each workload key to its own mutex-guarded,
//! time-ordered deque. The outer map is only write-locked to create or
//! drop a key's slot, so operations on different workloads never wait on
//! each other; operations on the same workload are serialized by the slot
//! mutex.
//!
//! Entries are never persisted. Pruning is lazy: callers prune on access.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use hpa_core::{RecommendationRecord, RescaleEvent, WorkloadKey};

/// Anything that can be kept in a [`KeyedHistory`].
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

impl Timestamped for RecommendationRecord {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Timestamped for RescaleEvent {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Recommendations the stabilizer damps against.
pub type RecommendationHistory = KeyedHistory<RecommendationRecord>;

/// Applied replica changes the normalizer rate-limits against.
pub type RescaleHistory = KeyedHistory<RescaleEvent>;

type Slot<T> = Arc<Mutex<VecDeque<T>>>;

pub struct KeyedHistory<T> {
    slots: RwLock<HashMap<WorkloadKey, Slot<T>>>,
}

impl<T> Default for KeyedHistory<T> {
    fn default() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Timestamped + Clone + Send> KeyedHistory<T> {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, key: &WorkloadKey) -> Slot<T> {
        if let Some(slot) = self.slots.read().await.get(key) {
            return slot.clone();
        }
        let mut slots = self.slots.write().await;
        slots.entry(key.clone()).or_default().clone()
    }

    async fn existing_slot(&self, key: &WorkloadKey) -> Option<Slot<T>> {
        self.slots.read().await.get(key).cloned()
    }

    /// Append an entry, keeping the deque ordered by timestamp.
    pub async fn record(&self, key: &WorkloadKey, entry: T) {
        let slot = self.slot(key).await;
        let mut entries = slot.lock().await;
        let ts = entry.timestamp();
        let at_end = entries.back().is_none_or(|last| last.timestamp() <= ts);
        if at_end {
            entries.push_back(entry);
        } else {
            let idx = entries.partition_point(|e| e.timestamp() <= ts);
            entries.insert(idx, entry);
        }
    }

    /// Entries with `timestamp >= now - window`, oldest first.
    pub async fn recent(&self, key: &WorkloadKey, now: DateTime<Utc>, window: Duration) -> Vec<T> {
        let Some(slot) = self.existing_slot(key).await else {
            return Vec::new();
        };
        let entries = slot.lock().await;
        match cutoff(now, window) {
            Some(cutoff) => entries
                .iter()
                .filter(|e| e.timestamp() >= cutoff)
                .cloned()
                .collect(),
            None => entries.iter().cloned().collect(),
        }
    }

    /// Drop entries older than `now - horizon`. Returns how many were removed.
    pub async fn prune(&self, key: &WorkloadKey, now: DateTime<Utc>, horizon: Duration) -> usize {
        let Some(cutoff) = cutoff(now, horizon) else {
            return 0;
        };
        let Some(slot) = self.existing_slot(key).await else {
            return 0;
        };
        let mut entries = slot.lock().await;
        let stale = entries.partition_point(|e| e.timestamp() < cutoff);
        entries.drain(..stale);
        if stale > 0 {
            debug!(autoscaler = %key, pruned = stale, remaining = entries.len(), "history pruned");
        }
        stale
    }

    /// Drop everything recorded for a workload.
    pub async fn forget(&self, key: &WorkloadKey) -> bool {
        self.slots.write().await.remove(key).is_some()
    }

    pub async fn len(&self, key: &WorkloadKey) -> usize {
        match self.existing_slot(key).await {
            Some(slot) => slot.lock().await.len(),
            None => 0,
        }
    }

    pub async fn is_empty(&self, key: &WorkloadKey) -> bool {
        self.len(key).await == 0
    }

    /// Keys with a slot, in no particular order.
    pub async fn keys(&self) -> Vec<WorkloadKey> {
        self.slots.read().await.keys().cloned().collect()
    }
}

/// `now - window`, or `None` when the window reaches past the epoch of
/// representable time (i.e. everything is inside it).
pub(crate) fn cutoff(now: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
    let delta = TimeDelta::from_std(window).ok()?;
    now.checked_sub_signed(delta)
}
