//! In-memory stores and drivers used by the unit tests in this crate.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{Duration as TimeDelta, Utc};
use orchestry_core::{App, AppStatus, ClusterNode, Event, LeaderLease, NodeState, ScalingAction};
use orchestry_store::{
    AppStore, AuditStore, CoordinationStore, Error as StoreError, LeaseClaim, LeaseSnapshot,
    NewScalingAction,
};
use parking_lot::Mutex;
use serde_json::Value;

use crate::driver::{
    ContainerInfo, ContainerStats, CreateContainer, ProxyDriver, ProxyStatus, RuntimeDriver,
};
use crate::Error;

#[derive(Debug, Clone)]
pub struct MemLease {
    pub leader_id: String,
    pub term: i64,
    pub hostname: String,
    pub api_url: String,
    pub expired: bool,
}

/// Deterministic coordination store: lease expiry is an explicit flag rather
/// than wall-clock time.
#[derive(Default)]
pub struct MemCoordinationStore {
    pub lease: Mutex<Option<MemLease>>,
    pub nodes: Mutex<HashMap<String, ClusterNode>>,
    pub cluster_events: Mutex<Vec<(String, String, i64)>>,
}

impl MemCoordinationStore {
    pub fn expire_lease(&self) {
        if let Some(lease) = self.lease.lock().as_mut() {
            lease.expired = true;
        }
    }

    fn snapshot(lease: &MemLease) -> LeaseSnapshot {
        let now = Utc::now();
        let expires_at = if lease.expired {
            now - TimeDelta::seconds(1)
        } else {
            now + TimeDelta::seconds(10)
        };
        LeaseSnapshot {
            lease: LeaderLease {
                leader_id: lease.leader_id.clone(),
                term: lease.term,
                acquired_at: now,
                expires_at,
                renewed_at: now,
                hostname: lease.hostname.clone(),
                api_url: lease.api_url.clone(),
            },
            expired: lease.expired,
        }
    }
}

#[async_trait]
impl CoordinationStore for MemCoordinationStore {
    async fn upsert_node(&self, node: &ClusterNode) -> Result<(), StoreError> {
        self.nodes.lock().insert(node.node_id.clone(), node.clone());
        Ok(())
    }

    async fn heartbeat(
        &self,
        node_id: &str,
        state: NodeState,
        term: i64,
    ) -> Result<bool, StoreError> {
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(node_id) {
            Some(node) => {
                node.state = state;
                node.term = term;
                node.last_heartbeat = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_nodes(&self) -> Result<Vec<ClusterNode>, StoreError> {
        Ok(self.nodes.lock().values().cloned().collect())
    }

    async fn visible_nodes(&self) -> Result<Vec<ClusterNode>, StoreError> {
        self.list_nodes().await
    }

    async fn gc_stale_nodes(&self, _keep: &str) -> Result<u64, StoreError> {
        Ok(0)
    }

    async fn current_lease(&self) -> Result<Option<LeaseSnapshot>, StoreError> {
        Ok(self.lease.lock().as_ref().map(Self::snapshot))
    }

    async fn try_acquire_lease(&self, claim: &LeaseClaim) -> Result<bool, StoreError> {
        let mut lease = self.lease.lock();
        let free = match lease.as_ref() {
            None => true,
            Some(held) => held.expired || held.term < claim.term,
        };
        if free {
            *lease = Some(MemLease {
                leader_id: claim.leader_id.clone(),
                term: claim.term,
                hostname: claim.hostname.clone(),
                api_url: claim.api_url.clone(),
                expired: false,
            });
        }
        Ok(free)
    }

    async fn renew_lease(
        &self,
        leader_id: &str,
        term: i64,
        _ttl: Duration,
    ) -> Result<bool, StoreError> {
        let lease = self.lease.lock();
        Ok(matches!(
            lease.as_ref(),
            Some(held) if held.leader_id == leader_id && held.term == term && !held.expired
        ))
    }

    async fn release_lease(&self, leader_id: &str, term: i64) -> Result<(), StoreError> {
        let mut lease = self.lease.lock();
        if matches!(
            lease.as_ref(),
            Some(held) if held.leader_id == leader_id && held.term == term
        ) {
            *lease = None;
        }
        Ok(())
    }

    async fn log_cluster_event(
        &self,
        node_id: &str,
        event_type: &str,
        _data: Option<Value>,
        term: i64,
    ) -> Result<(), StoreError> {
        self.cluster_events
            .lock()
            .push((node_id.to_string(), event_type.to_string(), term));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemAppStore {
    pub apps: Mutex<HashMap<String, App>>,
}

#[async_trait]
impl AppStore for MemAppStore {
    async fn get_app(&self, name: &str) -> Result<Option<App>, StoreError> {
        Ok(self.apps.lock().get(name).cloned())
    }

    async fn save_app(&self, app: &App) -> Result<(), StoreError> {
        self.apps.lock().insert(app.name.clone(), app.clone());
        Ok(())
    }

    async fn list_apps(&self) -> Result<Vec<App>, StoreError> {
        Ok(self.apps.lock().values().cloned().collect())
    }

    async fn list_running_apps(&self) -> Result<Vec<App>, StoreError> {
        Ok(self
            .apps
            .lock()
            .values()
            .filter(|a| a.status == AppStatus::Running)
            .cloned()
            .collect())
    }

    async fn get_raw_spec(&self, name: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.apps.lock().get(name).map(|a| a.raw_spec.clone()))
    }

    async fn set_app_status(
        &self,
        name: &str,
        status: AppStatus,
        replicas: i32,
    ) -> Result<(), StoreError> {
        let mut apps = self.apps.lock();
        let app = apps
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("app {name}")))?;
        app.status = status;
        app.desired_replicas = replicas;
        app.updated_at = Utc::now();
        Ok(())
    }

    async fn set_desired_replicas(&self, name: &str, replicas: i32) -> Result<(), StoreError> {
        let mut apps = self.apps.lock();
        let app = apps
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("app {name}")))?;
        app.desired_replicas = replicas;
        app.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Default)]
pub struct MemAuditStore {
    pub events: Mutex<Vec<(String, String, String)>>,
    pub actions: Mutex<Vec<NewScalingAction>>,
}

#[async_trait]
impl AuditStore for MemAuditStore {
    async fn log_event(
        &self,
        app: &str,
        kind: &str,
        message: &str,
        _data: Option<Value>,
    ) -> Result<(), StoreError> {
        self.events
            .lock()
            .push((app.to_string(), kind.to_string(), message.to_string()));
        Ok(())
    }

    async fn get_events(&self, app: Option<&str>, limit: i64) -> Result<Vec<Event>, StoreError> {
        let events = self.events.lock();
        Ok(events
            .iter()
            .enumerate()
            .filter(|(_, (a, _, _))| app.is_none_or(|want| want == a.as_str()))
            .rev()
            .take(limit as usize)
            .map(|(id, (app, kind, message))| Event {
                id: id as i64,
                app: app.clone(),
                kind: kind.clone(),
                message: message.clone(),
                timestamp: Utc::now(),
                data: None,
            })
            .collect())
    }

    async fn log_scaling_action(&self, action: &NewScalingAction) -> Result<(), StoreError> {
        self.actions.lock().push(action.clone());
        Ok(())
    }

    async fn get_scaling_history(
        &self,
        app: &str,
        limit: i64,
    ) -> Result<Vec<ScalingAction>, StoreError> {
        let actions = self.actions.lock();
        Ok(actions
            .iter()
            .enumerate()
            .filter(|(_, a)| a.app == app)
            .rev()
            .take(limit as usize)
            .map(|(id, a)| ScalingAction {
                id: id as i64,
                app: a.app.clone(),
                from_replicas: a.from_replicas,
                to_replicas: a.to_replicas,
                reason: a.reason.clone(),
                triggered_by: a.triggered_by.clone(),
                metrics: a.metrics.clone(),
                timestamp: Utc::now(),
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
    pub ip: String,
}

/// Fake container runtime with just enough fidelity for the manager.
#[derive(Default)]
pub struct MockRuntime {
    pub containers: Mutex<HashMap<String, MockContainer>>,
    next: AtomicUsize,
}

impl MockRuntime {
    /// Place a pre-existing container, as if created outside the manager.
    pub fn seed(&self, name: &str, labels: &[(&str, &str)], running: bool) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let id = format!("seed-{n}");
        self.containers.lock().insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                name: name.to_string(),
                image: "seeded:latest".to_string(),
                labels: labels
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
                running,
                ip: format!("10.0.0.{}", n + 2),
            },
        );
        id
    }

    pub fn set_running(&self, id: &str, running: bool) {
        if let Some(container) = self.containers.lock().get_mut(id) {
            container.running = running;
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .containers
            .lock()
            .values()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    fn info(container: &MockContainer) -> ContainerInfo {
        ContainerInfo {
            id: container.id.clone(),
            name: container.name.clone(),
            running: container.running,
            labels: container.labels.clone(),
            ip: Some(container.ip.clone()),
        }
    }

    fn missing(id: &str) -> Error {
        Error::runtime(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no such container: {id}"),
        ))
    }
}

#[async_trait]
impl RuntimeDriver for MockRuntime {
    async fn ensure_network(&self, _name: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn create_container(&self, request: &CreateContainer) -> Result<String, Error> {
        let mut containers = self.containers.lock();
        if containers.values().any(|c| c.name == request.name) {
            return Err(Error::Conflict(request.name.clone()));
        }
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let id = format!("mock-{n}");
        containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                name: request.name.clone(),
                image: request.image.clone(),
                labels: request.labels.clone(),
                running: false,
                ip: format!("10.0.0.{}", n + 2),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), Error> {
        self.containers
            .lock()
            .get_mut(id)
            .map(|c| c.running = true)
            .ok_or_else(|| Self::missing(id))
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), Error> {
        self.containers
            .lock()
            .get_mut(id)
            .map(|c| c.running = false)
            .ok_or_else(|| Self::missing(id))
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<(), Error> {
        self.containers.lock().remove(id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str, _network: &str) -> Result<ContainerInfo, Error> {
        self.containers
            .lock()
            .get(id)
            .map(Self::info)
            .ok_or_else(|| Self::missing(id))
    }

    async fn list_labelled(&self, label: &str, value: &str) -> Result<Vec<ContainerInfo>, Error> {
        Ok(self
            .containers
            .lock()
            .values()
            .filter(|c| c.labels.get(label).map(String::as_str) == Some(value))
            .map(Self::info)
            .collect())
    }

    async fn container_logs(&self, id: &str, _tail: u32) -> Result<Vec<String>, Error> {
        Ok(vec![format!("log line from {id}")])
    }

    async fn container_stats(&self, _id: &str) -> Result<ContainerStats, Error> {
        Ok(ContainerStats::default())
    }
}

/// Proxy driver that always accepts.
#[derive(Default)]
pub struct OkProxy {
    pub reloads: AtomicUsize,
}

#[async_trait]
impl ProxyDriver for OkProxy {
    async fn validate_config(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn reload(&self) -> Result<(), Error> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn status(&self) -> Result<ProxyStatus, Error> {
        Ok(ProxyStatus::default())
    }
}
