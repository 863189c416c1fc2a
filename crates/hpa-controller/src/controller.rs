//! Controller loop.
//!
//! A resync task enqueues every known autoscaler each `sync_period`;
//! `workers` tasks pull keys from the [`WorkQueue`] and reconcile them,
//! each cycle bounded by `reconcile_timeout`. Failed cycles are re-queued
//! with backoff, successful ones reset it.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hpa_core::WorkloadKey;
use hpa_engine::{AutoscalerStore, EngineError, Reconciler, StoreError};

use crate::queue::{Backoff, WorkQueue};

pub struct Controller {
    reconciler: Arc<Reconciler>,
    store: Arc<dyn AutoscalerStore>,
    queue: Arc<WorkQueue<WorkloadKey>>,
}

impl Controller {
    pub fn new(reconciler: Arc<Reconciler>, store: Arc<dyn AutoscalerStore>) -> Self {
        let config = reconciler.config();
        let backoff = Backoff::new(config.backoff_base, config.backoff_max);
        Self {
            reconciler,
            store,
            queue: Arc::new(WorkQueue::new(backoff)),
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<WorkloadKey>> {
        &self.queue
    }

    /// Queue every autoscaler the store knows about, plus any key the
    /// histories still hold that the store has since dropped. Reconciling
    /// those finds nothing and releases their histories.
    pub async fn enqueue_all(&self) -> Result<usize, StoreError> {
        let listed: HashSet<WorkloadKey> = self.store.list_keys().await?.into_iter().collect();

        let mut stale = self.reconciler.recommendations().keys().await;
        stale.extend(self.reconciler.rescales().keys().await);
        stale.retain(|key| !listed.contains(key));
        stale.sort();
        stale.dedup();

        let count = listed.len() + stale.len();
        for key in listed {
            self.queue.add(key);
        }
        for key in stale {
            debug!(autoscaler = %key, "autoscaler gone, queued to drop its histories");
            self.queue.add(key);
        }
        Ok(count)
    }

    /// Run until `shutdown` is cancelled. In-flight cycles are cancelled
    /// through the same token and are not re-queued.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let config = self.reconciler.config();
        let workers = config.workers.max(1);
        info!(
            workers,
            sync_period_secs = config.sync_period.as_secs_f64(),
            "autoscaler controller starting"
        );

        let mut tasks = JoinSet::new();

        let resync = Arc::clone(&self);
        let resync_shutdown = shutdown.clone();
        tasks.spawn(async move { resync.resync_loop(resync_shutdown).await });

        for id in 0..workers {
            let worker = Arc::clone(&self);
            let worker_shutdown = shutdown.clone();
            tasks.spawn(async move { worker.worker_loop(id, worker_shutdown).await });
        }

        shutdown.cancelled().await;
        self.queue.shutdown();

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "controller task panicked");
            }
        }
        info!("autoscaler controller stopped");
    }

    async fn resync_loop(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.reconciler.config().sync_period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("resync loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.enqueue_all().await {
                        Ok(count) => debug!(count, "resync enqueued autoscalers"),
                        Err(e) => error!(error = %e, "failed to list autoscalers"),
                    }
                }
            }
        }
    }

    async fn worker_loop(&self, id: usize, shutdown: CancellationToken) {
        debug!(worker = id, "worker starting");
        while let Some(key) = self.queue.get().await {
            self.process(&key, &shutdown).await;
            self.queue.done(&key);
        }
        debug!(worker = id, "worker stopped");
    }

    async fn process(&self, key: &WorkloadKey, shutdown: &CancellationToken) {
        let cancel = shutdown.child_token();
        let timeout = self.reconciler.config().reconcile_timeout;

        let cycle = self.reconciler.reconcile(key, &cancel);
        tokio::pin!(cycle);
        let result = match tokio::time::timeout(timeout, &mut cycle).await {
            Ok(result) => result,
            Err(_) => {
                debug!(
                    autoscaler = %key,
                    timeout_secs = timeout.as_secs_f64(),
                    "reconcile timed out"
                );
                cancel.cancel();
                // Store calls are not cancellable; give up on a cycle that
                // stays stuck in one for another full timeout.
                match tokio::time::timeout(timeout, cycle).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(autoscaler = %key, "reconcile ignored cancellation, abandoning it");
                        Err(EngineError::Cancelled(key.clone()))
                    }
                }
            }
        };

        match result {
            Ok(Some(outcome)) => {
                self.queue.forget(key);
                debug!(
                    autoscaler = %key,
                    desired = outcome.desired_replicas,
                    rescaled = outcome.rescaled,
                    "reconciled"
                );
            }
            Ok(None) => {
                self.queue.forget(key);
                debug!(autoscaler = %key, "autoscaler no longer exists");
            }
            Err(EngineError::Cancelled(_)) if shutdown.is_cancelled() => {}
            Err(e) => {
                let delay = self.queue.add_rate_limited(key.clone());
                warn!(
                    autoscaler = %key,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "reconcile failed"
                );
            }
        }
    }
}
