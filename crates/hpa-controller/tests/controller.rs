//! Controller integration tests: the worker pool, resync, retries and
//! timeouts running against the in-memory control plane.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use hpa_controller::Controller;
use hpa_core::*;
use hpa_engine::memory::{InMemoryControlPlane, Reading, RecordingEvents, ScriptedMetricSource};
use hpa_engine::{AutoscalerStore, Collaborators, Reconciler, StoreError, SystemClock};

fn target(name: &str) -> ScaleTargetRef {
    ScaleTargetRef {
        group: "apps".to_string(),
        kind: "Deployment".to_string(),
        name: name.to_string(),
    }
}

fn autoscaler(name: &str) -> HorizontalAutoscaler {
    HorizontalAutoscaler {
        key: WorkloadKey::new("shop", name),
        spec: AutoscalerSpec {
            scale_target_ref: target(name),
            min_replicas: Some(1),
            max_replicas: 20,
            metrics: vec![MetricSpec {
                name: "rps".to_string(),
                source: MetricSourceKind::External,
                target: MetricTarget {
                    kind: MetricTargetKind::AverageValue,
                    value: 100.0,
                },
            }],
            behavior: None,
        },
        status: AutoscalerStatus::default(),
        resource_version: 1,
    }
}

fn config() -> ControllerConfig {
    ControllerConfig {
        sync_period: Duration::from_secs(3_600),
        workers: 2,
        reconcile_timeout: Duration::from_secs(5),
        backoff_base: Duration::from_millis(5),
        backoff_max: Duration::from_millis(100),
        ..ControllerConfig::default()
    }
}

struct Setup {
    plane: Arc<InMemoryControlPlane>,
    metrics: Arc<ScriptedMetricSource>,
    reconciler: Arc<Reconciler>,
    controller: Arc<Controller>,
}

async fn setup(config: ControllerConfig, delay: Option<Duration>, names: &[&str]) -> Setup {
    build(config, delay, names, |plane| plane as Arc<dyn AutoscalerStore>).await
}

/// Like [`setup`], with the reconciler reading autoscalers through
/// `store`. The controller still lists keys from the plane.
async fn build<S>(
    config: ControllerConfig,
    delay: Option<Duration>,
    names: &[&str],
    store: S,
) -> Setup
where
    S: FnOnce(Arc<InMemoryControlPlane>) -> Arc<dyn AutoscalerStore>,
{
    let plane = Arc::new(InMemoryControlPlane::new());
    for name in names {
        plane.insert_autoscaler(autoscaler(name)).await;
        plane.set_scale("shop", &target(name), 2).await;
    }

    let mut metrics = ScriptedMetricSource::new(Arc::new(SystemClock), config.tolerance);
    if let Some(delay) = delay {
        metrics = metrics.with_delay(delay);
    }
    let metrics = Arc::new(metrics);

    let reconciler = Arc::new(Reconciler::new(
        Arc::new(config),
        Collaborators {
            metrics: metrics.clone(),
            scale: plane.clone(),
            store: store(plane.clone()),
            events: Arc::new(RecordingEvents::new()),
            clock: Arc::new(SystemClock),
        },
    ));
    let controller = Arc::new(Controller::new(reconciler.clone(), plane.clone()));

    Setup {
        plane,
        metrics,
        reconciler,
        controller,
    }
}

async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn resync_reconciles_every_autoscaler() {
    let s = setup(config(), None, &["web", "api", "worker"]).await;
    for name in ["web", "api", "worker"] {
        // 800 rps total at 100 per replica.
        s.metrics
            .set(&WorkloadKey::new("shop", name), "rps", Reading::Usage(800.0))
            .await;
    }

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(s.controller.clone().run(shutdown.clone()));

    let plane = s.plane.clone();
    let scaled = wait_for(|| {
        let plane = plane.clone();
        async move {
            let mut all = true;
            for name in ["web", "api", "worker"] {
                all &= plane.scale_of("shop", &target(name)).await == Some(8);
            }
            all
        }
    })
    .await;
    assert!(scaled, "autoscalers did not converge");

    shutdown.cancel();
    handle.await.unwrap();
    assert!(s.controller.queue().is_shutting_down());
}

#[tokio::test]
async fn failed_update_is_retried_with_backoff() {
    let s = setup(config(), None, &["web"]).await;
    let key = WorkloadKey::new("shop", "web");
    s.metrics.set(&key, "rps", Reading::Usage(600.0)).await;
    s.plane.fail_next_update("webhook unavailable").await;

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(s.controller.clone().run(shutdown.clone()));

    let plane = s.plane.clone();
    let target = target("web");
    let scaled = wait_for(|| {
        let plane = plane.clone();
        let target = target.clone();
        async move { plane.scale_of("shop", &target).await == Some(6) }
    })
    .await;
    assert!(scaled, "retry never applied the scale");
    assert_eq!(s.plane.update_calls().await, 2);

    // Success resets the backoff.
    let queue = s.controller.queue().clone();
    let reset = wait_for(|| {
        let queue = queue.clone();
        let key = key.clone();
        async move { queue.num_requeues(&key) == 0 }
    })
    .await;
    assert!(reset);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn slow_metrics_time_out_and_requeue() {
    let config = ControllerConfig {
        reconcile_timeout: Duration::from_millis(20),
        ..config()
    };
    let s = setup(config, Some(Duration::from_secs(30)), &["web"]).await;
    let key = WorkloadKey::new("shop", "web");
    s.metrics.set(&key, "rps", Reading::Usage(600.0)).await;

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(s.controller.clone().run(shutdown.clone()));

    let queue = s.controller.queue().clone();
    let requeued = wait_for(|| {
        let queue = queue.clone();
        let key = key.clone();
        async move { queue.num_requeues(&key) >= 2 }
    })
    .await;
    assert!(requeued, "timed-out cycle was not re-queued");
    assert_eq!(s.plane.update_calls().await, 0);
    assert_eq!(s.plane.status_writes().await, 0);

    // Shutdown cancels the in-flight cycle instead of waiting it out.
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("controller did not stop")
        .unwrap();
}

#[tokio::test]
async fn enqueue_all_lists_the_store() {
    let s = setup(config(), None, &["a", "b"]).await;
    assert_eq!(s.controller.enqueue_all().await.unwrap(), 2);
    assert_eq!(s.controller.queue().len(), 2);
    // Coalesced on a second resync.
    s.controller.enqueue_all().await.unwrap();
    assert_eq!(s.controller.queue().len(), 2);
}

#[tokio::test]
async fn deleted_autoscaler_histories_are_released() {
    let config = ControllerConfig {
        sync_period: Duration::from_millis(20),
        ..config()
    };
    let s = setup(config, None, &["web", "api"]).await;
    let web = WorkloadKey::new("shop", "web");
    let api = WorkloadKey::new("shop", "api");
    s.metrics.set(&web, "rps", Reading::Usage(600.0)).await;
    s.metrics.set(&api, "rps", Reading::Usage(600.0)).await;

    let cancel = CancellationToken::new();
    s.reconciler.reconcile(&api, &cancel).await.unwrap();
    assert!(!s.reconciler.recommendations().is_empty(&api).await);
    assert!(!s.reconciler.rescales().is_empty(&api).await);

    // The store no longer lists it, but the histories still do.
    s.plane.remove_autoscaler(&api).await;
    assert_eq!(s.controller.enqueue_all().await.unwrap(), 2);
    assert_eq!(s.controller.queue().len(), 2);

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(s.controller.clone().run(shutdown.clone()));

    let reconciler = s.reconciler.clone();
    let api_key = api.clone();
    let released = wait_for(|| {
        let reconciler = reconciler.clone();
        let api = api_key.clone();
        async move {
            let mut keys = reconciler.recommendations().keys().await;
            keys.extend(reconciler.rescales().keys().await);
            !keys.contains(&api)
        }
    })
    .await;
    assert!(released, "histories of the deleted autoscaler were kept");

    // The live autoscaler keeps being reconciled.
    let plane = s.plane.clone();
    let scaled = wait_for(|| {
        let plane = plane.clone();
        async move { plane.scale_of("shop", &target("web")).await == Some(6) }
    })
    .await;
    assert!(scaled);
    assert!(!s.reconciler.recommendations().is_empty(&web).await);

    shutdown.cancel();
    handle.await.unwrap();
}

/// Store whose reads never complete and ignore cancellation.
struct StuckStore(Arc<InMemoryControlPlane>);

#[async_trait]
impl AutoscalerStore for StuckStore {
    async fn get(&self, _key: &WorkloadKey) -> Result<Option<HorizontalAutoscaler>, StoreError> {
        std::future::pending().await
    }

    async fn list_keys(&self) -> Result<Vec<WorkloadKey>, StoreError> {
        self.0.list_keys().await
    }

    async fn update_status(
        &self,
        key: &WorkloadKey,
        resource_version: u64,
        status: AutoscalerStatus,
    ) -> Result<u64, StoreError> {
        self.0.update_status(key, resource_version, status).await
    }
}

#[tokio::test]
async fn stuck_store_read_is_abandoned() {
    let config = ControllerConfig {
        reconcile_timeout: Duration::from_millis(20),
        ..config()
    };
    let stuck = |plane| Arc::new(StuckStore(plane)) as Arc<dyn AutoscalerStore>;
    let s = build(config, None, &["web"], stuck).await;
    let key = WorkloadKey::new("shop", "web");

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(s.controller.clone().run(shutdown.clone()));

    // Each attempt is given up on after twice the timeout and retried.
    let queue = s.controller.queue().clone();
    let requeued = wait_for(|| {
        let queue = queue.clone();
        let key = key.clone();
        async move { queue.num_requeues(&key) >= 2 }
    })
    .await;
    assert!(requeued, "stuck cycle held its worker");
    assert_eq!(s.plane.status_writes().await, 0);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("controller did not stop")
        .unwrap();
}
