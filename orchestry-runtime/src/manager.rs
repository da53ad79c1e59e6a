//! Replica-set ownership and reconciliation.
//!
//! The manager owns the process-local `app → [Replica]` map, authoritative
//! only on the current leader. Every mutating operation passes the
//! leadership gate, and replica mutations for one app are serialised by a
//! per-app lock; runtime calls are made without holding the map lock so one
//! slow container operation cannot block unrelated apps.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use orchestry_core::{
    resource::{parse_cpu, parse_memory},
    App, AppManifest, AppStatus, Replica, ReplicaState, ScalingMode,
};
use orchestry_store::{AppStore, AuditStore};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Mutex, RwLock};

use crate::{
    coordinator::LeadershipState,
    driver::{CreateContainer, RuntimeDriver},
    prober::HealthProber,
    publisher::UpstreamPublisher,
    Error,
};

/// Grace period for container stops.
const STOP_GRACE: Duration = Duration::from_secs(30);

/// Interval of the replica monitor tick.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(10);

struct ManagedApp {
    manifest: AppManifest,
    replicas: Vec<Replica>,
    /// Serialises replica-mutating operations for this app.
    gate: Arc<Mutex<()>>,
}

/// Outcome of `start`: containers adopted vs freshly launched.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StartReport {
    pub adopted: usize,
    pub started: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicaView {
    pub container_id: String,
    pub index: u32,
    pub ip: String,
    pub port: u16,
    pub state: ReplicaState,
    pub healthy: bool,
    pub cpu_pct: f64,
    pub memory_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppStatusReport {
    pub name: String,
    /// `running`, `degraded` (zero ready out of >0 tracked) or `stopped`.
    pub status: String,
    pub mode: ScalingMode,
    pub replicas: usize,
    pub ready_replicas: usize,
    pub desired_replicas: i32,
    pub instances: Vec<ReplicaView>,
}

/// Aggregated usage for one app, refreshed by the control loop.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AppUsage {
    pub total: u32,
    pub healthy: u32,
    pub avg_cpu_pct: f64,
    pub avg_mem_pct: f64,
}

pub struct AppManager {
    apps: RwLock<HashMap<String, ManagedApp>>,
    store: Arc<dyn AppStore>,
    audit: Arc<dyn AuditStore>,
    runtime: Arc<dyn RuntimeDriver>,
    prober: Arc<HealthProber>,
    publisher: Arc<UpstreamPublisher>,
    leadership: watch::Receiver<LeadershipState>,
    network: String,
}

impl AppManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn AppStore>,
        audit: Arc<dyn AuditStore>,
        runtime: Arc<dyn RuntimeDriver>,
        prober: Arc<HealthProber>,
        publisher: Arc<UpstreamPublisher>,
        leadership: watch::Receiver<LeadershipState>,
        network: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            apps: RwLock::new(HashMap::new()),
            store,
            audit,
            runtime,
            prober,
            publisher,
            leadership,
            network,
        })
    }

    fn require_leader(&self) -> Result<(), Error> {
        let state = self.leadership.borrow();
        if state.is_leader {
            Ok(())
        } else {
            Err(Error::Leadership {
                leader: state.leader_id.clone(),
            })
        }
    }

    /// Validate and persist a manifest. New apps start stopped with zero
    /// replicas; re-registering an existing app updates its spec in place.
    pub async fn register(&self, raw: Value) -> Result<App, Error> {
        self.require_leader()?;
        let manifest = AppManifest::from_json(&raw)?.normalize();
        manifest.validate()?;
        let name = manifest.name().to_string();

        let app = match self.store.get_app(&name).await? {
            Some(existing) => App {
                manifest: manifest.clone(),
                raw_spec: raw,
                mode: manifest.mode(),
                updated_at: Utc::now(),
                ..existing
            },
            None => App::registered(manifest.clone(), raw, Utc::now()),
        };
        self.store.save_app(&app).await?;

        // Keep the in-map manifest fresh for a running app.
        if let Some(entry) = self.apps.write().await.get_mut(&name) {
            entry.manifest = manifest;
        }
        self.audit
            .log_event(&name, "registered", "app manifest registered", None)
            .await?;
        tracing::info!(app = %name, "app registered");
        Ok(app)
    }

    /// Start an app: adopt labelled containers that already exist, start any
    /// stopped ones, then top up to the scaling minimum.
    pub async fn start(&self, name: &str) -> Result<StartReport, Error> {
        self.require_leader()?;
        let app = self.fetch_app(name).await?;
        let manifest = app.manifest.clone();
        let gate = self.app_gate(name, &manifest).await;
        let _guard = gate.lock().await;

        self.runtime.ensure_network(&self.network).await?;
        let adopted = self.reconcile_locked(name, &manifest).await?;

        let min = manifest.policy().map_or(1, |p| p.min) as usize;
        let mut started = 0;
        while self.replica_count(name).await < min {
            let index = self.next_free_index(name).await;
            self.launch_replica(name, &manifest, index).await?;
            started += 1;
        }

        let total = self.replica_count(name).await as i32;
        self.store
            .set_app_status(name, AppStatus::Running, total)
            .await?;
        self.republish(name).await?;
        self.audit
            .log_event(
                name,
                "started",
                &format!("app started ({adopted} adopted, {started} launched)"),
                None,
            )
            .await?;
        tracing::info!(app = name, adopted, started, "app started");
        Ok(StartReport { adopted, started })
    }

    /// Stop an app: gracefully stop and remove every tracked replica, drop
    /// probe targets, remove the proxy config and mark the app stopped.
    pub async fn stop(&self, name: &str) -> Result<(), Error> {
        self.require_leader()?;
        let app = self.fetch_app(name).await?;
        let gate = self.app_gate(name, &app.manifest).await;
        let _guard = gate.lock().await;

        for replica in self.snapshot(name).await {
            self.prober.deregister(&replica.container_id).await;
            if let Err(err) = self
                .runtime
                .stop_container(&replica.container_id, STOP_GRACE)
                .await
            {
                tracing::warn!(app = name, container = %replica.container_id, error = %err, "stop failed");
            }
            if let Err(err) = self
                .runtime
                .remove_container(&replica.container_id, true)
                .await
            {
                tracing::warn!(app = name, container = %replica.container_id, error = %err, "remove failed");
            }
        }
        self.apps.write().await.remove(name);
        self.publisher.remove(name).await?;
        self.store
            .set_app_status(name, AppStatus::Stopped, 0)
            .await?;
        self.audit
            .log_event(name, "stopped", "app stopped", None)
            .await?;
        tracing::info!(app = name, "app stopped");
        Ok(())
    }

    /// Move an app to exactly `target` replicas. Growth fills the lowest
    /// free indices; shrinkage removes the highest-indexed tail.
    pub async fn scale(&self, name: &str, target: u32) -> Result<(u32, u32), Error> {
        self.require_leader()?;
        let app = self.fetch_app(name).await?;
        let manifest = app.manifest.clone();
        let gate = self.app_gate(name, &manifest).await;
        let _guard = gate.lock().await;

        let current = self.replica_count(name).await as u32;
        if target > current {
            for _ in current..target {
                let index = self.next_free_index(name).await;
                self.launch_replica(name, &manifest, index).await?;
            }
        } else if target < current {
            let mut tail = self.snapshot(name).await;
            tail.sort_by_key(|r| r.index);
            let victims: Vec<Replica> = tail.split_off(target as usize);
            for replica in victims.iter().rev() {
                self.prober.deregister(&replica.container_id).await;
                self.runtime
                    .stop_container(&replica.container_id, STOP_GRACE)
                    .await?;
                self.runtime
                    .remove_container(&replica.container_id, true)
                    .await?;
                self.untrack(name, &replica.container_id).await;
            }
        }

        self.store
            .set_desired_replicas(name, target as i32)
            .await?;
        self.republish(name).await?;
        tracing::info!(app = name, from = current, to = target, "app scaled");
        Ok((current, target))
    }

    /// Bring the in-memory replica set into agreement with the runtime:
    /// start stopped labelled containers and adopt untracked ones. Returns
    /// the number adopted.
    pub async fn reconcile(&self, name: &str) -> Result<usize, Error> {
        self.require_leader()?;
        let app = self.fetch_app(name).await?;
        let manifest = app.manifest.clone();
        let gate = self.app_gate(name, &manifest).await;
        let _guard = gate.lock().await;
        let adopted = self.reconcile_locked(name, &manifest).await?;
        if adopted > 0 {
            self.republish(name).await?;
        }
        Ok(adopted)
    }

    async fn reconcile_locked(
        &self,
        name: &str,
        manifest: &AppManifest,
    ) -> Result<usize, Error> {
        let found = self.runtime.list_labelled("app", name).await?;
        let mut adopted = 0;
        for info in found {
            if !info.running {
                if let Err(err) = self.runtime.start_container(&info.id).await {
                    // Transient: the monitor recreates it on a later tick.
                    tracing::warn!(app = name, container = %info.id, error = %err, "could not start labelled container");
                    continue;
                }
            }
            if self.is_tracked(name, &info.id).await {
                continue;
            }
            let details = match self.runtime.inspect_container(&info.id, &self.network).await {
                Ok(details) => details,
                Err(err) => {
                    tracing::warn!(app = name, container = %info.id, error = %err, "inspect failed during adoption");
                    continue;
                }
            };
            let index = match info.labels.get("replica").and_then(|v| v.parse().ok()) {
                Some(index) => index,
                None => self.next_free_index(name).await,
            };
            let replica = Replica {
                container_id: details.id.clone(),
                app: name.to_string(),
                index,
                ip: details.ip.clone().unwrap_or_default(),
                port: manifest.container_port(),
                state: ReplicaState::Ready,
                last_seen: Utc::now(),
                failures: 0,
                cpu_pct: 0.0,
                memory_pct: 0.0,
            };
            self.track(name, replica, manifest).await;
            adopted += 1;
            tracing::info!(app = name, container = %details.id, index, "adopted existing container");
        }
        Ok(adopted)
    }

    /// Per-app monitor pass, run every [`MONITOR_INTERVAL`] on the leader:
    /// replace replicas the runtime reports as gone or not running, then top
    /// running apps back up to their scaling minimum.
    pub async fn monitor_tick(&self) {
        if self.require_leader().is_err() {
            return;
        }
        let names: Vec<String> = self.apps.read().await.keys().cloned().collect();
        for name in names {
            if let Err(err) = self.monitor_app(&name).await {
                tracing::warn!(app = %name, error = %err, "monitor pass failed");
            }
        }
    }

    async fn monitor_app(&self, name: &str) -> Result<(), Error> {
        let (manifest, gate) = {
            let apps = self.apps.read().await;
            let Some(entry) = apps.get(name) else {
                return Ok(());
            };
            (entry.manifest.clone(), Arc::clone(&entry.gate))
        };
        let _guard = gate.lock().await;

        let mut changed = false;
        for replica in self.snapshot(name).await {
            let running = match self
                .runtime
                .inspect_container(&replica.container_id, &self.network)
                .await
            {
                Ok(details) => details.running,
                Err(err) => {
                    tracing::warn!(app = name, container = %replica.container_id, error = %err, "inspect failed");
                    false
                }
            };
            if running {
                continue;
            }

            tracing::warn!(app = name, container = %replica.container_id, index = replica.index, "replica down, replacing");
            self.prober.deregister(&replica.container_id).await;
            self.untrack(name, &replica.container_id).await;
            let _ = self
                .runtime
                .remove_container(&replica.container_id, true)
                .await;
            changed = true;

            let index = self.next_free_index(name).await;
            match self.launch_replica(name, &manifest, index).await {
                Ok(fresh) => {
                    self.audit
                        .log_event(
                            name,
                            "replica_recreated",
                            &format!(
                                "replica {} replaced by {} at index {index}",
                                replica.container_id, fresh.container_id
                            ),
                            None,
                        )
                        .await?;
                }
                // Conflicts and transient failures alike wait for the next
                // tick; conflicting containers are never removed for us.
                Err(err) => {
                    tracing::warn!(app = name, error = %err, "replica recreation failed");
                }
            }
        }

        if let Some(app) = self.store.get_app(name).await? {
            if app.status == AppStatus::Running {
                let min = app.manifest.policy().map_or(1, |p| p.min) as usize;
                while self.replica_count(name).await < min {
                    let index = self.next_free_index(name).await;
                    self.launch_replica(name, &manifest, index).await?;
                    changed = true;
                }
            }
        }

        if changed {
            self.republish(name).await?;
        }
        Ok(())
    }

    /// Status for one app; served from the local map, which may be stale on
    /// non-leaders.
    pub async fn status(&self, name: &str) -> Result<AppStatusReport, Error> {
        let app = self.fetch_app(name).await?;
        let snapshot = self.snapshot(name).await;
        let mut instances = Vec::with_capacity(snapshot.len());
        let mut ready = 0;
        for replica in snapshot {
            let healthy = self.prober.is_healthy(&replica.container_id).await;
            if healthy && replica.state == ReplicaState::Ready {
                ready += 1;
            }
            instances.push(ReplicaView {
                container_id: replica.container_id,
                index: replica.index,
                ip: replica.ip,
                port: replica.port,
                state: replica.state,
                healthy,
                cpu_pct: replica.cpu_pct,
                memory_pct: replica.memory_pct,
            });
        }
        let status = match app.status {
            AppStatus::Stopped => "stopped",
            AppStatus::Running if !instances.is_empty() && ready == 0 => "degraded",
            AppStatus::Running => "running",
        };
        Ok(AppStatusReport {
            name: name.to_string(),
            status: status.to_string(),
            mode: app.mode,
            replicas: instances.len(),
            ready_replicas: ready,
            desired_replicas: app.desired_replicas,
            instances,
        })
    }

    /// Merged container logs across an app's replicas.
    pub async fn logs(&self, name: &str, lines: u32) -> Result<Vec<String>, Error> {
        let _ = self.fetch_app(name).await?;
        let mut merged = Vec::new();
        for replica in self.snapshot(name).await {
            match self
                .runtime
                .container_logs(&replica.container_id, lines)
                .await
            {
                Ok(lines) => {
                    let tag = replica.container_name();
                    merged.extend(lines.into_iter().map(|line| format!("[{tag}] {line}")));
                }
                Err(err) => {
                    tracing::warn!(app = name, container = %replica.container_id, error = %err, "log fetch failed");
                }
            }
        }
        Ok(merged)
    }

    /// Refresh per-replica cpu/memory readings and return per-app usage.
    pub async fn refresh_stats(&self) -> HashMap<String, AppUsage> {
        let names: Vec<String> = self.apps.read().await.keys().cloned().collect();
        let mut usage = HashMap::with_capacity(names.len());
        for name in names {
            let snapshot = self.snapshot(&name).await;
            let mut healthy = 0u32;
            let mut cpu_sum = 0.0;
            let mut mem_sum = 0.0;
            for replica in &snapshot {
                let stats = match self.runtime.container_stats(&replica.container_id).await {
                    Ok(stats) => stats,
                    Err(err) => {
                        tracing::debug!(container = %replica.container_id, error = %err, "stats unavailable");
                        continue;
                    }
                };
                cpu_sum += stats.cpu_pct;
                mem_sum += stats.memory_pct;
                let mut apps = self.apps.write().await;
                if let Some(entry) = apps.get_mut(&name) {
                    if let Some(tracked) = entry
                        .replicas
                        .iter_mut()
                        .find(|r| r.container_id == replica.container_id)
                    {
                        tracked.cpu_pct = stats.cpu_pct;
                        tracked.memory_pct = stats.memory_pct;
                        tracked.last_seen = Utc::now();
                    }
                }
            }
            for replica in &snapshot {
                if self.prober.is_healthy(&replica.container_id).await {
                    healthy += 1;
                }
            }
            let total = snapshot.len() as u32;
            let divisor = f64::from(total.max(1));
            usage.insert(
                name,
                AppUsage {
                    total,
                    healthy,
                    avg_cpu_pct: cpu_sum / divisor,
                    avg_mem_pct: mem_sum / divisor,
                },
            );
        }
        usage
    }

    /// Current replica snapshot for one app.
    pub async fn snapshot(&self, name: &str) -> Vec<Replica> {
        self.apps
            .read()
            .await
            .get(name)
            .map(|entry| entry.replicas.clone())
            .unwrap_or_default()
    }

    /// React to a probe flip: republish the owning app's upstreams.
    pub async fn on_health_change(&self, container_id: &str) {
        if self.require_leader().is_err() {
            return;
        }
        let owner = {
            let apps = self.apps.read().await;
            apps.iter()
                .find(|(_, entry)| {
                    entry
                        .replicas
                        .iter()
                        .any(|r| r.container_id == container_id)
                })
                .map(|(name, _)| name.clone())
        };
        if let Some(name) = owner {
            if let Err(err) = self.republish(&name).await {
                tracing::warn!(app = %name, error = %err, "republish after health change failed");
            }
        }
    }

    async fn fetch_app(&self, name: &str) -> Result<App, Error> {
        self.store
            .get_app(name)
            .await?
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    async fn app_gate(&self, name: &str, manifest: &AppManifest) -> Arc<Mutex<()>> {
        let mut apps = self.apps.write().await;
        let entry = apps.entry(name.to_string()).or_insert_with(|| ManagedApp {
            manifest: manifest.clone(),
            replicas: Vec::new(),
            gate: Arc::new(Mutex::new(())),
        });
        entry.manifest = manifest.clone();
        Arc::clone(&entry.gate)
    }

    async fn is_tracked(&self, name: &str, container_id: &str) -> bool {
        self.apps.read().await.get(name).is_some_and(|entry| {
            entry
                .replicas
                .iter()
                .any(|r| r.container_id == container_id)
        })
    }

    async fn replica_count(&self, name: &str) -> usize {
        self.apps
            .read()
            .await
            .get(name)
            .map_or(0, |entry| entry.replicas.len())
    }

    /// Lowest index not currently in use for the app.
    async fn next_free_index(&self, name: &str) -> u32 {
        let apps = self.apps.read().await;
        let used: HashSet<u32> = apps
            .get(name)
            .map(|entry| entry.replicas.iter().map(|r| r.index).collect())
            .unwrap_or_default();
        let mut index = 0;
        while used.contains(&index) {
            index += 1;
        }
        index
    }

    async fn track(&self, name: &str, replica: Replica, manifest: &AppManifest) {
        let health = manifest.health();
        let url = format!("http://{}:{}{}", replica.ip, replica.port, health.path);
        self.prober
            .register(&replica.container_id, url, health)
            .await;
        let mut apps = self.apps.write().await;
        if let Some(entry) = apps.get_mut(name) {
            entry.replicas.retain(|r| r.index != replica.index);
            entry.replicas.push(replica);
            entry.replicas.sort_by_key(|r| r.index);
        }
    }

    async fn untrack(&self, name: &str, container_id: &str) {
        let mut apps = self.apps.write().await;
        if let Some(entry) = apps.get_mut(name) {
            entry.replicas.retain(|r| r.container_id != container_id);
        }
    }

    async fn launch_replica(
        &self,
        name: &str,
        manifest: &AppManifest,
        index: u32,
    ) -> Result<Replica, Error> {
        let mut labels: HashMap<String, String> = manifest
            .metadata
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        labels.insert("app".to_string(), name.to_string());
        labels.insert("replica".to_string(), index.to_string());
        labels.insert("type".to_string(), manifest.spec.workload.clone());

        let resources = manifest.spec.resources.as_ref();
        let cpu_limit = resources
            .and_then(|r| r.cpu.as_deref())
            .map(parse_cpu)
            .transpose()?;
        let memory_limit = resources
            .and_then(|r| r.memory.as_deref())
            .map(parse_memory)
            .transpose()?;

        let request = CreateContainer {
            name: format!("{name}-{index}"),
            image: manifest.spec.image.clone(),
            labels,
            env: manifest
                .spec
                .env
                .iter()
                .map(|e| format!("{}={}", e.name, e.value))
                .collect(),
            network: self.network.clone(),
            cpu_limit,
            memory_limit,
        };

        let id = self.runtime.create_container(&request).await?;
        self.runtime.start_container(&id).await?;
        let details = self.runtime.inspect_container(&id, &self.network).await?;

        let replica = Replica {
            container_id: id,
            app: name.to_string(),
            index,
            ip: details.ip.unwrap_or_default(),
            port: manifest.container_port(),
            state: ReplicaState::Ready,
            last_seen: Utc::now(),
            failures: 0,
            cpu_pct: 0.0,
            memory_pct: 0.0,
        };
        self.track(name, replica.clone(), manifest).await;
        tracing::info!(app = name, container = %replica.container_id, index, "replica launched");
        Ok(replica)
    }

    async fn republish(&self, name: &str) -> Result<(), Error> {
        let mut servers = Vec::new();
        for replica in self.snapshot(name).await {
            if replica.state == ReplicaState::Ready
                && !replica.ip.is_empty()
                && self.prober.is_healthy(&replica.container_id).await
            {
                servers.push((replica.ip.clone(), replica.port));
            }
        }
        self.publisher.publish(name, &servers).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemAppStore, MemAuditStore, MockRuntime, OkProxy};
    use serde_json::json;

    struct Harness {
        manager: Arc<AppManager>,
        runtime: Arc<MockRuntime>,
        store: Arc<MemAppStore>,
        audit: Arc<MemAuditStore>,
        leadership: watch::Sender<LeadershipState>,
        _conf_dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let runtime = Arc::new(MockRuntime::default());
        let store = Arc::new(MemAppStore::default());
        let audit = Arc::new(MemAuditStore::default());
        let prober = Arc::new(HealthProber::new());
        let conf_dir = tempfile::tempdir().unwrap();
        let publisher = Arc::new(UpstreamPublisher::new(
            conf_dir.path(),
            Arc::new(OkProxy::default()),
        ));
        let (leadership, rx) = watch::channel(LeadershipState {
            is_leader: true,
            leader_id: Some("node-a".to_string()),
            term: 1,
        });
        let manager = AppManager::new(
            store.clone(),
            audit.clone(),
            runtime.clone(),
            prober,
            publisher,
            rx,
            "orchestry".to_string(),
        );
        Harness {
            manager,
            runtime,
            store,
            audit,
            leadership,
            _conf_dir: conf_dir,
        }
    }

    fn manifest(name: &str, min: u32) -> Value {
        json!({
            "apiVersion": "orchestry/v1",
            "kind": "App",
            "metadata": { "name": name },
            "spec": {
                "type": "http",
                "image": "nginx:alpine",
                "ports": [ { "containerPort": 8080 } ]
            },
            "scaling": { "minReplicas": min, "maxReplicas": 5 }
        })
    }

    #[tokio::test]
    async fn register_rejects_invalid_manifests() {
        let h = harness();
        let err = h
            .manager
            .register(json!({
                "apiVersion": "orchestry/v1",
                "kind": "App",
                "metadata": { "name": "web" },
                "spec": { "type": "tcp", "image": "x", "ports": [ { "containerPort": 1 } ] }
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn writes_are_gated_on_leadership() {
        let h = harness();
        h.leadership
            .send(LeadershipState {
                is_leader: false,
                leader_id: Some("node-b".to_string()),
                term: 2,
            })
            .unwrap();
        let err = h.manager.register(manifest("web", 1)).await.unwrap_err();
        match err {
            Error::Leadership { leader } => assert_eq!(leader.as_deref(), Some("node-b")),
            other => panic!("expected leadership error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_launches_up_to_min_replicas() {
        let h = harness();
        h.manager.register(manifest("web", 2)).await.unwrap();
        let report = h.manager.start("web").await.unwrap();
        assert_eq!(report.adopted, 0);
        assert_eq!(report.started, 2);
        assert_eq!(h.runtime.names(), vec!["web-0", "web-1"]);

        let app = h.store.get_app("web").await.unwrap().unwrap();
        assert_eq!(app.status, AppStatus::Running);
        assert_eq!(app.desired_replicas, 2);
    }

    #[tokio::test]
    async fn start_adopts_existing_labelled_containers() {
        let h = harness();
        // Created externally while the node was down, stopped.
        let seeded = h
            .runtime
            .seed("web-0", &[("app", "web"), ("replica", "0")], false);
        h.manager.register(manifest("web", 2)).await.unwrap();

        let report = h.manager.start("web").await.unwrap();
        assert_eq!(report.adopted, 1);
        assert_eq!(report.started, 1);

        let status = h.manager.status("web").await.unwrap();
        assert_eq!(status.replicas, 2);
        assert!(
            status.instances.iter().any(|i| i.container_id == seeded),
            "adopted container keeps its original id"
        );
        // The adopted container was started, not recreated.
        assert!(h.runtime.containers.lock().get(&seeded).unwrap().running);
    }

    #[tokio::test]
    async fn scale_up_and_down_reuses_dense_indices() {
        let h = harness();
        h.manager.register(manifest("web", 1)).await.unwrap();
        h.manager.start("web").await.unwrap();

        let (from, to) = h.manager.scale("web", 4).await.unwrap();
        assert_eq!((from, to), (1, 4));
        assert_eq!(h.runtime.names(), vec!["web-0", "web-1", "web-2", "web-3"]);

        // Shrinking removes the tail, leaving the low indices.
        h.manager.scale("web", 2).await.unwrap();
        assert_eq!(h.runtime.names(), vec!["web-0", "web-1"]);

        // Growth after shrink reuses the freed indices.
        h.manager.scale("web", 3).await.unwrap();
        assert_eq!(h.runtime.names(), vec!["web-0", "web-1", "web-2"]);
        assert_eq!(
            h.store
                .get_app("web")
                .await
                .unwrap()
                .unwrap()
                .desired_replicas,
            3
        );
    }

    #[tokio::test]
    async fn name_conflicts_surface_and_are_not_resolved() {
        let h = harness();
        // An unrelated container already owns the name web-0.
        h.runtime.seed("web-0", &[("app", "other")], true);
        h.manager.register(manifest("web", 1)).await.unwrap();

        let err = h.manager.start("web").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        // The conflicting container is untouched.
        assert_eq!(h.runtime.names(), vec!["web-0"]);
    }

    #[tokio::test]
    async fn monitor_replaces_dead_replicas() {
        let h = harness();
        h.manager.register(manifest("web", 2)).await.unwrap();
        h.manager.start("web").await.unwrap();

        let victim = h.manager.snapshot("web").await[0].container_id.clone();
        h.runtime.set_running(&victim, false);

        h.manager.monitor_tick().await;

        let snapshot = h.manager.snapshot("web").await;
        assert_eq!(snapshot.len(), 2);
        assert!(
            snapshot.iter().all(|r| r.container_id != victim),
            "dead replica must be replaced"
        );
        // Replacement landed on the freed index.
        assert_eq!(h.runtime.names(), vec!["web-0", "web-1"]);
        assert!(h
            .audit
            .events
            .lock()
            .iter()
            .any(|(_, kind, _)| kind == "replica_recreated"));
    }

    #[tokio::test]
    async fn monitor_tops_up_below_min() {
        let h = harness();
        h.manager.register(manifest("web", 3)).await.unwrap();
        h.manager.start("web").await.unwrap();

        // Drop one replica from tracking and the runtime entirely.
        let victim = h.manager.snapshot("web").await[2].clone();
        h.runtime.set_running(&victim.container_id, false);
        h.manager.monitor_tick().await;
        assert_eq!(h.manager.snapshot("web").await.len(), 3);
    }

    #[tokio::test]
    async fn stop_removes_everything() {
        let h = harness();
        h.manager.register(manifest("web", 2)).await.unwrap();
        h.manager.start("web").await.unwrap();
        h.manager.stop("web").await.unwrap();

        assert!(h.runtime.containers.lock().is_empty());
        assert!(h.manager.snapshot("web").await.is_empty());
        let app = h.store.get_app("web").await.unwrap().unwrap();
        assert_eq!(app.status, AppStatus::Stopped);
        assert_eq!(app.desired_replicas, 0);
    }

    #[tokio::test]
    async fn unknown_apps_are_not_found() {
        let h = harness();
        assert!(matches!(
            h.manager.start("ghost").await.unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(matches!(
            h.manager.status("ghost").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }
}
