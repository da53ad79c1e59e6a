//! Multi-signal, windowed autoscaling decisions.
//!
//! The autoscaler never executes scaling. It ingests joined metric samples,
//! aggregates them over each app's trailing window, and returns a
//! [`Decision`] for the control loop to apply. Oscillation is damped two
//! ways: a per-app cooldown after any applied action, and scale-in
//! hysteresis requiring [`MIN_STABLE_PERIODS`] consecutive low-utilisation
//! evaluations.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Duration as TimeDelta, Utc};
use orchestry_core::{MetricSample, ScalingMode, ScalingPolicy};
use parking_lot::RwLock;
use serde::Serialize;

/// Consecutive qualifying evaluations required before a scale-in fires.
pub const MIN_STABLE_PERIODS: u32 = 3;

/// Utilisation factor reported when an app has zero healthy replicas.
const EMERGENCY_FACTOR: f64 = 10.0;

/// Outcome of one evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub should_scale: bool,
    pub target: u32,
    pub reason: String,
    /// Signals whose utilisation factor exceeded the scale-out threshold.
    pub triggers: Vec<String>,
    /// Per-signal utilisation factors (actual ÷ budget) from this evaluation.
    pub factors: BTreeMap<String, f64>,
}

impl Decision {
    fn hold(current: u32, reason: impl Into<String>) -> Self {
        Self {
            should_scale: false,
            target: current,
            reason: reason.into(),
            triggers: Vec::new(),
            factors: BTreeMap::new(),
        }
    }
}

/// Windowed aggregates the factors are computed from.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub window_seconds: u64,
    pub sample_count: usize,
    pub avg_rps: f64,
    pub p95_latency_ms: f64,
    pub avg_conn: f64,
    pub avg_cpu_pct: f64,
    pub avg_mem_pct: f64,
    pub avg_healthy: f64,
    pub avg_total: f64,
}

struct AppScaling {
    policy: Option<ScalingPolicy>,
    samples: VecDeque<MetricSample>,
    last_scale: Option<DateTime<Utc>>,
    last_factors: BTreeMap<String, f64>,
    stable_in_periods: u32,
}

impl AppScaling {
    fn new() -> Self {
        Self {
            policy: None,
            samples: VecDeque::new(),
            last_scale: None,
            last_factors: BTreeMap::new(),
            stable_in_periods: 0,
        }
    }

    fn window_seconds(&self) -> u64 {
        self.policy
            .as_ref()
            .map_or_else(|| ScalingPolicy::default().window_seconds, |p| p.window_seconds)
    }

    /// Samples older than twice the window are dropped.
    fn prune(&mut self, now: DateTime<Utc>) {
        let retain = TimeDelta::seconds(2 * self.window_seconds() as i64);
        while let Some(front) = self.samples.front() {
            if now - front.timestamp > retain {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn aggregate(&self, now: DateTime<Utc>, window_seconds: u64) -> Option<MetricsSummary> {
        let cutoff = now - TimeDelta::seconds(window_seconds as i64);
        let recent: Vec<&MetricSample> = self
            .samples
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .collect();
        if recent.is_empty() {
            return None;
        }
        let n = recent.len() as f64;
        let avg = |f: fn(&MetricSample) -> f64| recent.iter().map(|s| f(s)).sum::<f64>() / n;

        let mut latencies: Vec<f64> = recent.iter().map(|s| s.p95_latency_ms).collect();
        latencies.sort_by(f64::total_cmp);
        let p95_idx = ((0.95 * latencies.len() as f64).ceil() as usize).saturating_sub(1);

        Some(MetricsSummary {
            window_seconds,
            sample_count: recent.len(),
            avg_rps: avg(|s| s.rps),
            p95_latency_ms: latencies[p95_idx],
            avg_conn: avg(|s| s.active_conn),
            avg_cpu_pct: avg(|s| s.cpu_pct),
            avg_mem_pct: avg(|s| s.mem_pct),
            avg_healthy: avg(|s| f64::from(s.healthy_replicas)),
            avg_total: avg(|s| f64::from(s.total_replicas)),
        })
    }
}

/// Per-app metric windows and scaling state. Shared between the control loop
/// and the API; all access is short and synchronous.
#[derive(Default)]
pub struct Autoscaler {
    apps: RwLock<HashMap<String, AppScaling>>,
}

impl Autoscaler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_policy(&self, app: &str, policy: ScalingPolicy) {
        let mut apps = self.apps.write();
        apps.entry(app.to_string())
            .or_insert_with(AppScaling::new)
            .policy = Some(policy);
    }

    #[must_use]
    pub fn get_policy(&self, app: &str) -> Option<ScalingPolicy> {
        self.apps.read().get(app).and_then(|s| s.policy.clone())
    }

    pub fn remove_app(&self, app: &str) {
        self.apps.write().remove(app);
    }

    pub fn add_metrics(&self, app: &str, sample: MetricSample) {
        let mut apps = self.apps.write();
        let state = apps.entry(app.to_string()).or_insert_with(AppScaling::new);
        let now = sample.timestamp;
        state.samples.push_back(sample);
        state.prune(now);
    }

    /// Record that a scaling action was applied, starting the cooldown.
    pub fn record_scaling_action(&self, app: &str) {
        self.record_scaling_action_at(app, Utc::now());
    }

    pub fn record_scaling_action_at(&self, app: &str, now: DateTime<Utc>) {
        let mut apps = self.apps.write();
        let state = apps.entry(app.to_string()).or_insert_with(AppScaling::new);
        state.last_scale = Some(now);
        state.stable_in_periods = 0;
    }

    #[must_use]
    pub fn get_last_scale_factors(&self, app: &str) -> BTreeMap<String, f64> {
        self.apps
            .read()
            .get(app)
            .map(|s| s.last_factors.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn get_metrics_summary(&self, app: &str) -> Option<MetricsSummary> {
        let apps = self.apps.read();
        let state = apps.get(app)?;
        state.aggregate(Utc::now(), state.window_seconds())
    }

    /// Recent raw samples, oldest first.
    #[must_use]
    pub fn history(&self, app: &str) -> Vec<MetricSample> {
        self.apps
            .read()
            .get(app)
            .map(|s| s.samples.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn evaluate(&self, app: &str, current_replicas: u32, mode: ScalingMode) -> Decision {
        self.evaluate_at(app, current_replicas, mode, Utc::now())
    }

    /// The decision pipeline.
    ///
    /// Order matters: manual mode and a missing policy short-circuit
    /// everything, being below the minimum overrides cooldown, and the
    /// zero-healthy emergency path also ignores cooldown so a dead app is
    /// never left waiting for its own cooldown to expire.
    pub fn evaluate_at(
        &self,
        app: &str,
        current: u32,
        mode: ScalingMode,
        now: DateTime<Utc>,
    ) -> Decision {
        if mode == ScalingMode::Manual {
            return Decision::hold(current, "manual scaling mode");
        }
        let mut apps = self.apps.write();
        let Some(state) = apps.get_mut(app) else {
            return Decision::hold(current, "no scaling policy");
        };
        let Some(policy) = state.policy.clone() else {
            return Decision::hold(current, "no scaling policy");
        };

        if current < policy.min {
            state.stable_in_periods = 0;
            return Decision {
                should_scale: true,
                target: policy.min,
                reason: format!("below minimum replicas ({} < {})", current, policy.min),
                triggers: vec!["min".to_string()],
                factors: BTreeMap::new(),
            };
        }

        let in_cooldown = state
            .last_scale
            .is_some_and(|at| (now - at).num_seconds() < policy.cooldown_seconds as i64);

        let Some(window) = state.aggregate(now, policy.window_seconds) else {
            return Decision::hold(
                current,
                if in_cooldown { "cooldown" } else { "no metrics in window" },
            );
        };

        if window.avg_healthy == 0.0 {
            state.stable_in_periods = 0;
            let factors = BTreeMap::from([("healthy".to_string(), EMERGENCY_FACTOR)]);
            state.last_factors = factors.clone();
            let target = (current + 1).min(policy.max);
            return Decision {
                should_scale: target != current,
                target,
                reason: "no healthy replicas".to_string(),
                triggers: vec!["healthy".to_string()],
                factors,
            };
        }

        if in_cooldown {
            return Decision::hold(current, "cooldown");
        }

        let healthy = window.avg_healthy.max(1.0);
        let mut factors = BTreeMap::new();
        if policy.target_rps_per_replica > 0.0 {
            factors.insert(
                "rps".to_string(),
                (window.avg_rps / healthy) / policy.target_rps_per_replica,
            );
        }
        if policy.max_p95_latency_ms > 0.0 {
            factors.insert(
                "latency".to_string(),
                window.p95_latency_ms / policy.max_p95_latency_ms,
            );
        }
        if policy.max_conn_per_replica > 0.0 {
            factors.insert(
                "connections".to_string(),
                (window.avg_conn / healthy) / policy.max_conn_per_replica,
            );
        }
        if policy.max_cpu_pct > 0.0 {
            factors.insert("cpu".to_string(), window.avg_cpu_pct / policy.max_cpu_pct);
        }
        if policy.max_memory_pct > 0.0 {
            factors.insert(
                "memory".to_string(),
                window.avg_mem_pct / policy.max_memory_pct,
            );
        }
        state.last_factors = factors.clone();

        let max_factor = factors.values().copied().fold(0.0, f64::max);
        let scale_out = policy.scale_out_threshold_pct / 100.0;
        let scale_in = policy.scale_in_threshold_pct / 100.0;
        let triggers: Vec<String> = factors
            .iter()
            .filter(|(_, &v)| v > scale_out)
            .map(|(k, _)| k.clone())
            .collect();

        if max_factor > scale_out && current < policy.max {
            state.stable_in_periods = 0;
            let grown = (f64::from(current) * max_factor).ceil() as u32;
            let target = grown.max(current + 1).min(policy.max);
            return Decision {
                should_scale: true,
                target,
                reason: format!(
                    "utilisation {:.0}% of budget exceeds {:.0}% threshold",
                    max_factor * 100.0,
                    policy.scale_out_threshold_pct
                ),
                triggers,
                factors,
            };
        }

        if max_factor < scale_in && current > policy.min {
            state.stable_in_periods += 1;
            if state.stable_in_periods >= MIN_STABLE_PERIODS {
                state.stable_in_periods = 0;
                let target = (current - 1).max(policy.min);
                return Decision {
                    should_scale: true,
                    target,
                    reason: format!(
                        "utilisation {:.0}% of budget below {:.0}% for {MIN_STABLE_PERIODS} evaluations",
                        max_factor * 100.0,
                        policy.scale_in_threshold_pct
                    ),
                    triggers,
                    factors,
                };
            }
            let observed = state.stable_in_periods;
            return Decision::hold(
                current,
                format!("low utilisation, waiting for stability ({observed}/{MIN_STABLE_PERIODS})"),
            );
        }

        state.stable_in_periods = 0;
        Decision::hold(current, "within thresholds")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as TimeDelta;

    fn policy() -> ScalingPolicy {
        ScalingPolicy {
            min: 1,
            max: 5,
            target_rps_per_replica: 50.0,
            max_p95_latency_ms: 0.0,
            max_conn_per_replica: 0.0,
            max_cpu_pct: 0.0,
            max_memory_pct: 0.0,
            scale_out_threshold_pct: 80.0,
            scale_in_threshold_pct: 30.0,
            window_seconds: 20,
            cooldown_seconds: 30,
        }
    }

    fn sample(now: DateTime<Utc>, rps: f64, healthy: u32, total: u32) -> MetricSample {
        MetricSample {
            timestamp: now,
            rps,
            p95_latency_ms: 0.0,
            active_conn: 0.0,
            cpu_pct: 0.0,
            mem_pct: 0.0,
            healthy_replicas: healthy,
            total_replicas: total,
        }
    }

    fn feed(scaler: &Autoscaler, app: &str, now: DateTime<Utc>, rps: f64, healthy: u32) {
        // A window's worth of identical samples, one per second.
        for age in 0..20 {
            scaler.add_metrics(app, sample(now - TimeDelta::seconds(age), rps, healthy, healthy));
        }
    }

    #[test]
    fn manual_mode_never_scales() {
        let scaler = Autoscaler::new();
        scaler.set_policy("web", policy());
        let decision = scaler.evaluate("web", 1, ScalingMode::Manual);
        assert!(!decision.should_scale);
        assert_eq!(decision.reason, "manual scaling mode");
    }

    #[test]
    fn unknown_app_has_no_policy() {
        let scaler = Autoscaler::new();
        let decision = scaler.evaluate("ghost", 2, ScalingMode::Auto);
        assert!(!decision.should_scale);
        assert_eq!(decision.reason, "no scaling policy");
    }

    #[test]
    fn below_minimum_scales_to_min() {
        let scaler = Autoscaler::new();
        scaler.set_policy("web", ScalingPolicy { min: 2, ..policy() });
        let decision = scaler.evaluate("web", 0, ScalingMode::Auto);
        assert!(decision.should_scale);
        assert_eq!(decision.target, 2);
        assert_eq!(decision.triggers, vec!["min"]);
    }

    #[test]
    fn no_samples_holds() {
        let scaler = Autoscaler::new();
        scaler.set_policy("web", policy());
        let decision = scaler.evaluate("web", 1, ScalingMode::Auto);
        assert!(!decision.should_scale);
        assert_eq!(decision.reason, "no metrics in window");
    }

    #[test]
    fn scales_out_under_rps_pressure_then_cools_down() {
        let scaler = Autoscaler::new();
        scaler.set_policy("web", policy());
        let now = Utc::now();
        feed(&scaler, "web", now, 150.0, 1);

        let decision = scaler.evaluate_at("web", 1, ScalingMode::Auto, now);
        assert!(decision.should_scale);
        // factor 150/50 = 3.0 → ceil(1 × 3.0) = 3
        assert_eq!(decision.target, 3);
        assert_eq!(decision.triggers, vec!["rps"]);

        scaler.record_scaling_action_at("web", now);
        let again = scaler.evaluate_at("web", 3, ScalingMode::Auto, now + TimeDelta::seconds(10));
        assert!(!again.should_scale);
        assert_eq!(again.reason, "cooldown");

        // Once the cooldown has elapsed, evaluation resumes normally.
        let later = now + TimeDelta::seconds(40);
        feed(&scaler, "web", later, 150.0, 3);
        let after = scaler.evaluate_at("web", 3, ScalingMode::Auto, later);
        assert_ne!(after.reason, "cooldown");
    }

    #[test]
    fn scale_out_always_grows_by_at_least_one() {
        let scaler = Autoscaler::new();
        scaler.set_policy("web", policy());
        let now = Utc::now();
        // factor 170/4/50 = 0.85: above the threshold, but ceil(4 × 0.85) = 4
        // would not grow, so the target must still be current + 1.
        feed(&scaler, "web", now, 170.0, 4);
        let decision = scaler.evaluate_at("web", 4, ScalingMode::Auto, now);
        assert!(decision.should_scale);
        assert_eq!(decision.target, 5);
    }

    #[test]
    fn scale_in_requires_three_stable_periods() {
        let scaler = Autoscaler::new();
        scaler.set_policy("web", ScalingPolicy { min: 2, ..policy() });
        let mut now = Utc::now();

        for round in 1..=2 {
            feed(&scaler, "web", now, 40.0, 4); // factor 40/4/50 = 0.2
            let decision = scaler.evaluate_at("web", 4, ScalingMode::Auto, now);
            assert!(!decision.should_scale, "round {round} should hold");
            now += TimeDelta::seconds(10);
        }

        feed(&scaler, "web", now, 40.0, 4);
        let third = scaler.evaluate_at("web", 4, ScalingMode::Auto, now);
        assert!(third.should_scale);
        assert_eq!(third.target, 3);

        // Counter was reset by the action, so the next evaluation holds.
        now += TimeDelta::seconds(10);
        feed(&scaler, "web", now, 30.0, 3);
        let fourth = scaler.evaluate_at("web", 3, ScalingMode::Auto, now);
        assert!(!fourth.should_scale);
    }

    #[test]
    fn stability_counter_resets_on_normal_utilisation() {
        let scaler = Autoscaler::new();
        scaler.set_policy("web", ScalingPolicy { min: 2, ..policy() });
        let mut now = Utc::now();

        for _ in 0..2 {
            feed(&scaler, "web", now, 40.0, 4);
            scaler.evaluate_at("web", 4, ScalingMode::Auto, now);
            now += TimeDelta::seconds(10);
        }
        // Utilisation back in the normal band: streak broken.
        feed(&scaler, "web", now, 120.0, 4); // factor 0.6
        scaler.evaluate_at("web", 4, ScalingMode::Auto, now);
        now += TimeDelta::seconds(10);

        feed(&scaler, "web", now, 40.0, 4);
        let decision = scaler.evaluate_at("web", 4, ScalingMode::Auto, now);
        assert!(!decision.should_scale, "streak must restart after reset");
    }

    #[test]
    fn zero_healthy_is_an_emergency_even_in_cooldown() {
        let scaler = Autoscaler::new();
        scaler.set_policy("web", policy());
        let now = Utc::now();
        scaler.record_scaling_action_at("web", now); // cooldown active
        feed(&scaler, "web", now, 0.0, 0);

        let decision = scaler.evaluate_at("web", 2, ScalingMode::Auto, now);
        assert!(decision.should_scale);
        assert_eq!(decision.target, 3);
        assert_eq!(decision.reason, "no healthy replicas");
    }

    #[test]
    fn emergency_target_clamps_to_max() {
        let scaler = Autoscaler::new();
        scaler.set_policy("web", ScalingPolicy { max: 2, ..policy() });
        let now = Utc::now();
        feed(&scaler, "web", now, 0.0, 0);
        let decision = scaler.evaluate_at("web", 2, ScalingMode::Auto, now);
        assert!(!decision.should_scale);
        assert_eq!(decision.target, 2);
    }

    #[test]
    fn tied_signals_both_trigger() {
        let scaler = Autoscaler::new();
        scaler.set_policy(
            "web",
            ScalingPolicy {
                max_cpu_pct: 50.0,
                max_memory_pct: 50.0,
                target_rps_per_replica: 0.0,
                ..policy()
            },
        );
        let now = Utc::now();
        for age in 0..20 {
            scaler.add_metrics(
                "web",
                MetricSample {
                    timestamp: now - TimeDelta::seconds(age),
                    rps: 0.0,
                    p95_latency_ms: 0.0,
                    active_conn: 0.0,
                    cpu_pct: 45.0,
                    mem_pct: 45.0,
                    healthy_replicas: 1,
                    total_replicas: 1,
                },
            );
        }
        let decision = scaler.evaluate_at("web", 1, ScalingMode::Auto, now);
        assert!(decision.should_scale);
        assert_eq!(decision.triggers, vec!["cpu", "memory"]);
    }

    #[test]
    fn samples_are_pruned_to_twice_the_window() {
        let scaler = Autoscaler::new();
        scaler.set_policy("web", policy());
        let now = Utc::now();
        scaler.add_metrics("web", sample(now - TimeDelta::seconds(120), 10.0, 1, 1));
        scaler.add_metrics("web", sample(now, 10.0, 1, 1));
        assert_eq!(scaler.history("web").len(), 1);
    }
}
