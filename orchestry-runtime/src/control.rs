//! The leader's periodic control tick.
//!
//! Every tick joins the proxy's global counters with per-replica runtime
//! stats and prober state into one [`MetricSample`] per running app, feeds
//! the autoscaler, and applies any resulting decision through the manager.
//!
//! The stub-status interface exposes no per-upstream counters, so requests
//! and connections are attributed to apps by fair share of the global
//! replica count.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures::FutureExt;
use orchestry_core::MetricSample;
use orchestry_store::{AppStore, AuditStore, NewScalingAction};
use serde_json::json;
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    autoscaler::Autoscaler,
    coordinator::LeadershipState,
    driver::{ProxyDriver, ProxyStatus},
    manager::AppManager,
    Error,
};

/// Tick cadence of the control loop and the replica monitor.
pub const CONTROL_INTERVAL: Duration = Duration::from_secs(10);

struct RpsBaseline {
    at: Instant,
    requests: u64,
}

pub struct ControlLoop {
    store: Arc<dyn AppStore>,
    audit: Arc<dyn AuditStore>,
    manager: Arc<AppManager>,
    autoscaler: Arc<Autoscaler>,
    proxy: Arc<dyn ProxyDriver>,
    leadership: watch::Receiver<LeadershipState>,
    baseline: parking_lot::Mutex<Option<RpsBaseline>>,
}

impl ControlLoop {
    pub fn new(
        store: Arc<dyn AppStore>,
        audit: Arc<dyn AuditStore>,
        manager: Arc<AppManager>,
        autoscaler: Arc<Autoscaler>,
        proxy: Arc<dyn ProxyDriver>,
        leadership: watch::Receiver<LeadershipState>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            audit,
            manager,
            autoscaler,
            proxy,
            leadership,
            baseline: parking_lot::Mutex::new(None),
        })
    }

    /// Requests-per-second from the proxy's cumulative counter.
    ///
    /// The first reading and any counter regression (proxy restart) yield
    /// `0.0` and re-baseline.
    fn global_rps(&self, requests: u64) -> f64 {
        let now = Instant::now();
        let mut baseline = self.baseline.lock();
        let rps = match baseline.as_ref() {
            Some(prev) if requests >= prev.requests => {
                let elapsed = now.duration_since(prev.at).as_secs_f64();
                if elapsed > 0.0 {
                    (requests - prev.requests) as f64 / elapsed
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        *baseline = Some(RpsBaseline { at: now, requests });
        rps
    }

    /// One control tick. A store failure aborts the whole tick; the next
    /// tick retries.
    pub async fn tick(&self) -> Result<(), Error> {
        if !self.leadership.borrow().is_leader {
            *self.baseline.lock() = None;
            return Ok(());
        }

        let apps = self.store.list_running_apps().await?;
        if apps.is_empty() {
            return Ok(());
        }

        let status = match self.proxy.status().await {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!(error = %err, "proxy status unavailable, assuming zero traffic");
                ProxyStatus::default()
            }
        };
        let global_rps = self.global_rps(status.requests);

        let usage = self.manager.refresh_stats().await;
        let total_replicas: u32 = apps
            .iter()
            .map(|a| usage.get(&a.name).map_or(0, |u| u.total))
            .sum();

        for app in &apps {
            let app_usage = usage.get(&app.name).copied().unwrap_or_default();
            let share = if total_replicas > 0 {
                f64::from(app_usage.total) / f64::from(total_replicas)
            } else {
                0.0
            };
            let sample = MetricSample {
                timestamp: Utc::now(),
                rps: global_rps * share,
                p95_latency_ms: 0.0,
                active_conn: status.active_connections as f64 * share,
                cpu_pct: app_usage.avg_cpu_pct,
                mem_pct: app_usage.avg_mem_pct,
                healthy_replicas: app_usage.healthy,
                total_replicas: app_usage.total,
            };
            self.autoscaler.add_metrics(&app.name, sample.clone());

            let decision = self
                .autoscaler
                .evaluate(&app.name, app_usage.total, app.mode);
            if !decision.should_scale || decision.target == app_usage.total {
                continue;
            }

            tracing::info!(
                app = %app.name,
                from = app_usage.total,
                to = decision.target,
                reason = %decision.reason,
                "applying scaling decision"
            );
            match self.manager.scale(&app.name, decision.target).await {
                Ok((from, to)) => {
                    self.autoscaler.record_scaling_action(&app.name);
                    self.audit
                        .log_scaling_action(&NewScalingAction {
                            app: app.name.clone(),
                            from_replicas: from as i32,
                            to_replicas: to as i32,
                            reason: decision.reason.clone(),
                            triggered_by: "autoscaler".to_string(),
                            metrics: Some(json!({
                                "sample": sample,
                                "factors": decision.factors,
                                "triggers": decision.triggers,
                            })),
                        })
                        .await?;
                    self.audit
                        .log_event(
                            &app.name,
                            "scaled",
                            &format!("scaled {from} → {to}: {}", decision.reason),
                            None,
                        )
                        .await?;
                }
                Err(err) => {
                    tracing::warn!(app = %app.name, error = %err, "scaling failed");
                }
            }
        }
        Ok(())
    }

    /// Runs when this node becomes leader: reconcile every known app against
    /// the runtime and restore scaling policies from the persisted specs.
    pub async fn on_become_leader(&self) {
        *self.baseline.lock() = None;
        let apps = match self.store.list_apps().await {
            Ok(apps) => apps,
            Err(err) => {
                tracing::warn!(error = %err, "leader takeover: listing apps failed");
                return;
            }
        };
        for app in apps {
            if let Some(policy) = app.manifest.policy() {
                self.autoscaler.set_policy(&app.name, policy);
            }
            if app.status == orchestry_core::AppStatus::Running {
                match self.manager.reconcile(&app.name).await {
                    Ok(adopted) if adopted > 0 => {
                        tracing::info!(app = %app.name, adopted, "leader takeover reconcile");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(app = %app.name, error = %err, "leader takeover reconcile failed");
                    }
                }
            }
        }
    }

    /// Drive ticks until `cancel` fires. Leadership transitions trigger the
    /// takeover pass; losing the lease halts replica mutation on the next
    /// borrow of the watch channel (at most one tick away).
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut leadership = self.leadership.clone();
        let mut was_leader = leadership.borrow().is_leader;
        if was_leader {
            self.on_become_leader().await;
        }
        let mut tick = tokio::time::interval(CONTROL_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                changed = leadership.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let is_leader = leadership.borrow().is_leader;
                    if is_leader && !was_leader {
                        tracing::info!("became leader, reconciling all apps");
                        self.on_become_leader().await;
                    } else if !is_leader && was_leader {
                        tracing::info!("lost leadership, halting control activity");
                    }
                    was_leader = is_leader;
                }
                _ = tick.tick() => {
                    match std::panic::AssertUnwindSafe(self.tick()).catch_unwind().await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => tracing::warn!(error = %err, "control tick aborted"),
                        Err(_) => tracing::error!("control tick panicked"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        prober::HealthProber,
        publisher::UpstreamPublisher,
        testing::{MemAppStore, MemAuditStore, MockRuntime, OkProxy},
    };
    use orchestry_core::AppStatus;
    use serde_json::json;

    struct Harness {
        control: Arc<ControlLoop>,
        manager: Arc<AppManager>,
        store: Arc<MemAppStore>,
        audit: Arc<MemAuditStore>,
        autoscaler: Arc<Autoscaler>,
        _leadership: watch::Sender<LeadershipState>,
        _conf_dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let runtime = Arc::new(MockRuntime::default());
        let store = Arc::new(MemAppStore::default());
        let audit = Arc::new(MemAuditStore::default());
        let prober = Arc::new(HealthProber::new());
        let proxy = Arc::new(OkProxy::default());
        let conf_dir = tempfile::tempdir().unwrap();
        let publisher = Arc::new(UpstreamPublisher::new(conf_dir.path(), proxy.clone()));
        let (tx, rx) = watch::channel(LeadershipState {
            is_leader: true,
            leader_id: Some("node-a".to_string()),
            term: 1,
        });
        let manager = AppManager::new(
            store.clone(),
            audit.clone(),
            runtime,
            prober,
            publisher,
            rx.clone(),
            "orchestry".to_string(),
        );
        let autoscaler = Arc::new(Autoscaler::new());
        let control = ControlLoop::new(
            store.clone(),
            audit.clone(),
            manager.clone(),
            autoscaler.clone(),
            proxy,
            rx,
        );
        Harness {
            control,
            manager,
            store,
            audit,
            autoscaler,
            _leadership: tx,
            _conf_dir: conf_dir,
        }
    }

    fn manifest(name: &str) -> serde_json::Value {
        json!({
            "apiVersion": "orchestry/v1",
            "kind": "App",
            "metadata": { "name": name },
            "spec": {
                "type": "http",
                "image": "nginx:alpine",
                "ports": [ { "containerPort": 8080 } ]
            },
            "scaling": { "minReplicas": 2, "maxReplicas": 5 }
        })
    }

    #[tokio::test]
    async fn first_rps_reading_is_zero_then_deltas() {
        let h = harness();
        assert_eq!(h.control.global_rps(1000), 0.0);
        // Counter regression re-baselines instead of going negative.
        assert_eq!(h.control.global_rps(500), 0.0);
        let rps = h.control.global_rps(700);
        assert!(rps >= 0.0);
    }

    #[tokio::test]
    async fn tick_feeds_samples_and_applies_below_min() {
        let h = harness();
        h.manager.register(manifest("web")).await.unwrap();
        // Mark running without actually launching replicas: the sample will
        // carry zero replicas and evaluation scales to the minimum.
        h.store
            .set_app_status("web", AppStatus::Running, 0)
            .await
            .unwrap();
        h.autoscaler.set_policy(
            "web",
            orchestry_core::ScalingPolicy {
                min: 2,
                ..orchestry_core::ScalingPolicy::default()
            },
        );

        h.control.tick().await.unwrap();

        // Scaled up to min and recorded the action.
        assert_eq!(h.manager.snapshot("web").await.len(), 2);
        let actions = h.audit.actions.lock();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].to_replicas, 2);
        assert_eq!(actions[0].triggered_by, "autoscaler");
    }

    #[tokio::test]
    async fn takeover_restores_policies() {
        let h = harness();
        h.manager.register(manifest("web")).await.unwrap();
        h.control.on_become_leader().await;
        let policy = h.autoscaler.get_policy("web").unwrap();
        assert_eq!(policy.min, 2);
        assert_eq!(policy.max, 5);
    }
}
