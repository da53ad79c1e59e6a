//! Periodic HTTP liveness probing with hysteresis.
//!
//! One dispatch loop walks the registered targets, probes every target whose
//! interval has elapsed (concurrently, each bounded by its own timeout), and
//! applies the results. A target only flips state after enough *consecutive*
//! observations in the new direction; each flip fires the optional
//! health-change callback on its own task.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use orchestry_core::HealthSpec;
use serde::Serialize;
use tokio::{sync::RwLock, time::Instant};
use tokio_util::sync::CancellationToken;

/// Invoked with `(container_id, healthy)` whenever a target flips.
pub type HealthChange = Arc<dyn Fn(String, bool) + Send + Sync>;

const DISPATCH_TICK: Duration = Duration::from_secs(1);

/// Per-target probe state. Targets start unhealthy until they pass
/// `success_threshold` consecutive probes.
struct Target {
    url: String,
    spec: HealthSpec,
    healthy: bool,
    consecutive_ok: u32,
    consecutive_failures: u32,
    last_probe: Option<Instant>,
    last_success: Option<DateTime<Utc>>,
    last_response_ms: Option<u64>,
}

impl Target {
    fn new(url: String, spec: HealthSpec) -> Self {
        Self {
            url,
            spec,
            healthy: false,
            consecutive_ok: 0,
            consecutive_failures: 0,
            last_probe: None,
            last_success: None,
            last_response_ms: None,
        }
    }

    fn due(&self, now: Instant) -> bool {
        self.last_probe
            .is_none_or(|at| now.duration_since(at) >= Duration::from_secs(self.spec.interval))
    }

    /// Apply one probe result; returns the new health state on a flip.
    fn observe(&mut self, ok: bool) -> Option<bool> {
        if ok {
            self.consecutive_ok += 1;
            self.consecutive_failures = 0;
            if !self.healthy && self.consecutive_ok >= self.spec.success_threshold {
                self.healthy = true;
                return Some(true);
            }
        } else {
            self.consecutive_failures += 1;
            self.consecutive_ok = 0;
            if self.healthy && self.consecutive_failures >= self.spec.failure_threshold {
                self.healthy = false;
                return Some(false);
            }
        }
        None
    }
}

/// Counts and per-target detail for the metrics endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeSummary {
    pub healthy: usize,
    pub unhealthy: usize,
    pub targets: Vec<TargetSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetSummary {
    pub id: String,
    pub url: String,
    pub healthy: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_response_ms: Option<u64>,
}

pub struct HealthProber {
    targets: RwLock<HashMap<String, Target>>,
    http: reqwest::Client,
    on_change: parking_lot::RwLock<Option<HealthChange>>,
}

impl Default for HealthProber {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthProber {
    #[must_use]
    pub fn new() -> Self {
        Self {
            targets: RwLock::new(HashMap::new()),
            http: reqwest::Client::new(),
            on_change: parking_lot::RwLock::new(None),
        }
    }

    /// Install the health-change callback. Flips are delivered on a spawned
    /// task so a slow consumer cannot stall the dispatch loop.
    pub fn set_on_change(&self, callback: HealthChange) {
        *self.on_change.write() = Some(callback);
    }

    pub async fn register(&self, id: &str, url: String, spec: HealthSpec) {
        tracing::debug!(target = id, %url, "probe target registered");
        self.targets
            .write()
            .await
            .insert(id.to_string(), Target::new(url, spec));
    }

    pub async fn deregister(&self, id: &str) {
        self.targets.write().await.remove(id);
    }

    pub async fn is_healthy(&self, id: &str) -> bool {
        self.targets.read().await.get(id).is_some_and(|t| t.healthy)
    }

    pub async fn all_healthy(&self) -> bool {
        self.targets.read().await.values().all(|t| t.healthy)
    }

    pub async fn summary(&self) -> ProbeSummary {
        let targets = self.targets.read().await;
        let healthy = targets.values().filter(|t| t.healthy).count();
        ProbeSummary {
            healthy,
            unhealthy: targets.len() - healthy,
            targets: targets
                .iter()
                .map(|(id, t)| TargetSummary {
                    id: id.clone(),
                    url: t.url.clone(),
                    healthy: t.healthy,
                    last_success: t.last_success,
                    last_response_ms: t.last_response_ms,
                })
                .collect(),
        }
    }

    /// Dispatch loop; returns when `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(DISPATCH_TICK);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = tick.tick() => self.dispatch_due().await,
            }
        }
    }

    async fn dispatch_due(&self) {
        let now = Instant::now();
        // Claim due targets under the lock, probe without it.
        let due: Vec<(String, String, u64)> = {
            let mut targets = self.targets.write().await;
            targets
                .iter_mut()
                .filter(|(_, t)| t.due(now))
                .map(|(id, t)| {
                    t.last_probe = Some(now);
                    (id.clone(), t.url.clone(), t.spec.timeout)
                })
                .collect()
        };
        if due.is_empty() {
            return;
        }

        let probes = due.into_iter().map(|(id, url, timeout)| {
            let client = self.http.clone();
            async move {
                let started = Instant::now();
                let ok = match client
                    .get(&url)
                    .timeout(Duration::from_secs(timeout))
                    .send()
                    .await
                {
                    Ok(response) => {
                        let code = response.status().as_u16();
                        (200..400).contains(&code)
                    }
                    Err(_) => false,
                };
                let elapsed_ms = started.elapsed().as_millis() as u64;
                (id, ok, elapsed_ms)
            }
        });
        let results = futures::future::join_all(probes).await;

        let mut flips = Vec::new();
        {
            let mut targets = self.targets.write().await;
            for (id, ok, elapsed_ms) in results {
                let Some(target) = targets.get_mut(&id) else {
                    continue; // deregistered mid-probe
                };
                target.last_response_ms = Some(elapsed_ms);
                if ok {
                    target.last_success = Some(Utc::now());
                }
                if let Some(healthy) = target.observe(ok) {
                    tracing::info!(target = %id, healthy, "probe target changed state");
                    flips.push((id, healthy));
                }
            }
        }

        if !flips.is_empty() {
            if let Some(callback) = self.on_change.read().clone() {
                tokio::spawn(async move {
                    for (id, healthy) in flips {
                        callback(id, healthy);
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(fail: u32, ok: u32) -> HealthSpec {
        HealthSpec {
            failure_threshold: fail,
            success_threshold: ok,
            ..HealthSpec::default()
        }
    }

    #[test]
    fn flips_healthy_after_success_threshold() {
        let mut target = Target::new("http://10.0.0.2:8080/healthz".into(), spec(3, 2));
        assert_eq!(target.observe(true), None);
        assert_eq!(target.observe(true), Some(true));
        // Already healthy, further successes are quiet.
        assert_eq!(target.observe(true), None);
    }

    #[test]
    fn flips_unhealthy_only_after_consecutive_failures() {
        let mut target = Target::new("http://10.0.0.2:8080/healthz".into(), spec(3, 1));
        assert_eq!(target.observe(true), Some(true));
        assert_eq!(target.observe(false), None);
        assert_eq!(target.observe(false), None);
        // A success in between resets the failure streak.
        assert_eq!(target.observe(true), None);
        assert_eq!(target.observe(false), None);
        assert_eq!(target.observe(false), None);
        assert_eq!(target.observe(false), Some(false));
    }

    #[tokio::test]
    async fn registration_and_queries() {
        let prober = HealthProber::new();
        prober
            .register("c1", "http://10.0.0.2:80/healthz".into(), spec(3, 1))
            .await;
        assert!(!prober.is_healthy("c1").await);
        assert!(!prober.all_healthy().await);
        {
            let mut targets = prober.targets.write().await;
            targets.get_mut("c1").unwrap().observe(true);
        }
        assert!(prober.is_healthy("c1").await);
        assert!(prober.all_healthy().await);
        let summary = prober.summary().await;
        assert_eq!(summary.healthy, 1);
        prober.deregister("c1").await;
        assert!(prober.summary().await.targets.is_empty());
    }
}
