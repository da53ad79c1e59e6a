//! Term-based leader election over the shared store.
//!
//! Every node runs three persistent tasks: a heartbeat (which also renews the
//! lease while leading), an election watch, and a membership monitor. The
//! state machine is `follower → candidate → leader → follower | stopped`.
//!
//! The single-leader invariant is enforced by the store's conditional lease
//! upsert; this module only decides *when* to bid and reacts to the outcome.
//! Losing a renewal demotes immediately, before the next control-loop tick,
//! so a deposed leader stops mutating state before its successor can have
//! acquired the lease.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use futures::FutureExt;
use orchestry_core::{ClusterNode, NodeState};
use orchestry_store::{CoordinationStore, LeaseClaim};
use rand::Rng;
use serde_json::json;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::Error;

/// Hook invoked with the term of the leadership transition.
pub type LeaderHook = Arc<dyn Fn(i64) + Send + Sync>;
/// Hook invoked with a snapshot of the visible membership.
pub type ClusterHook = Arc<dyn Fn(HashMap<String, ClusterNode>) + Send + Sync>;

/// Named callbacks fired on leadership and membership transitions.
///
/// Each hook runs on its own spawned task so a slow consumer cannot delay
/// heartbeats or renewals.
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_become_leader: Option<LeaderHook>,
    pub on_lose_leadership: Option<LeaderHook>,
    pub on_cluster_change: Option<ClusterHook>,
}

/// What the rest of the process needs to know about leadership, published
/// through a watch channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeadershipState {
    pub is_leader: bool,
    /// Current leader's node id, when known from the lease.
    pub leader_id: Option<String>,
    pub term: i64,
}

/// Election timing and node identity.
///
/// The intervals must satisfy `heartbeat_interval < election_tick <
/// lease_ttl`; the defaults are the 3 s / 5 s / 10 s development triple.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub node_id: String,
    pub hostname: String,
    pub port: u16,
    pub api_url: String,
    pub heartbeat_interval: Duration,
    pub election_tick: Duration,
    pub lease_ttl: Duration,
    pub membership_interval: Duration,
}

impl CoordinatorConfig {
    #[must_use]
    pub fn new(node_id: String, hostname: String, port: u16, api_url: String) -> Self {
        Self {
            node_id,
            hostname,
            port,
            api_url,
            heartbeat_interval: Duration::from_secs(3),
            election_tick: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(10),
            membership_interval: Duration::from_secs(15),
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.node_id.is_empty() {
            return Err(Error::Config("node_id may not be empty".into()));
        }
        if self.heartbeat_interval >= self.election_tick {
            return Err(Error::Config(
                "heartbeat_interval must be below election_tick".into(),
            ));
        }
        if self.election_tick >= self.lease_ttl {
            return Err(Error::Config(
                "election_tick must be below lease_ttl".into(),
            ));
        }
        Ok(())
    }
}

struct ElectionState {
    role: NodeState,
    term: i64,
    members: HashMap<String, ClusterNode>,
}

pub struct LeaderCoordinator {
    config: CoordinatorConfig,
    store: Arc<dyn CoordinationStore>,
    hooks: Hooks,
    state: Mutex<ElectionState>,
    leadership_tx: watch::Sender<LeadershipState>,
}

impl LeaderCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn CoordinationStore>,
        hooks: Hooks,
    ) -> Result<Arc<Self>, Error> {
        config.validate()?;
        let (leadership_tx, _) = watch::channel(LeadershipState::default());
        Ok(Arc::new(Self {
            config,
            store,
            hooks,
            state: Mutex::new(ElectionState {
                role: NodeState::Follower,
                term: 0,
                members: HashMap::new(),
            }),
            leadership_tx,
        }))
    }

    /// Watch channel reflecting this node's leadership view. The API leader
    /// gate and the control loop both subscribe here.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.leadership_tx.subscribe()
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.leadership_tx.borrow().is_leader
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    fn self_node(&self, role: NodeState, term: i64) -> ClusterNode {
        ClusterNode {
            node_id: self.config.node_id.clone(),
            hostname: self.config.hostname.clone(),
            port: self.config.port,
            api_url: self.config.api_url.clone(),
            state: role,
            term,
            last_heartbeat: Utc::now(),
            healthy: true,
        }
    }

    fn publish(&self, is_leader: bool, leader_id: Option<String>, term: i64) {
        self.leadership_tx.send_if_modified(|current| {
            let next = LeadershipState {
                is_leader,
                leader_id,
                term,
            };
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn fire_leader_hook(&self, hook: &Option<LeaderHook>, term: i64) {
        if let Some(hook) = hook.clone() {
            tokio::spawn(async move { hook(term) });
        }
    }

    /// Heartbeat this node's row; while leading, also renew the lease.
    pub async fn heartbeat_step(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let (role, term) = (state.role, state.term);
        if !self.store.heartbeat(&self.config.node_id, role, term).await? {
            // Row vanished (e.g. garbage-collected after a long stall).
            self.store.upsert_node(&self.self_node(role, term)).await?;
        }

        if role == NodeState::Leader {
            let renewed = self
                .store
                .renew_lease(&self.config.node_id, term, self.config.lease_ttl)
                .await?;
            if !renewed {
                self.demote(&mut state, "lease renewal failed").await;
            }
        }
        Ok(())
    }

    /// One pass of the election watch.
    ///
    /// Nothing to do while leading (renewal lives with the heartbeat). As a
    /// follower, a fresh lease just updates the observed leader; an expired
    /// or missing lease starts a candidacy at `max(local, observed) + 1`.
    pub async fn election_step(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if state.role == NodeState::Leader {
            return Ok(());
        }

        let lease = self.store.current_lease().await?;
        if let Some(snapshot) = &lease {
            if !snapshot.expired {
                state.role = NodeState::Follower;
                state.term = state.term.max(snapshot.lease.term);
                let leader_id = snapshot.lease.leader_id.clone();
                let term = snapshot.lease.term;
                self.publish(false, Some(leader_id), term);
                return Ok(());
            }
        }

        let observed = lease.as_ref().map_or(0, |s| s.lease.term);
        let term = state.term.max(observed) + 1;
        state.role = NodeState::Candidate;
        state.term = term;
        tracing::debug!(node = %self.config.node_id, term, "standing for election");

        let claim = LeaseClaim {
            leader_id: self.config.node_id.clone(),
            term,
            ttl: self.config.lease_ttl,
            hostname: self.config.hostname.clone(),
            api_url: self.config.api_url.clone(),
        };
        if self.store.try_acquire_lease(&claim).await? {
            state.role = NodeState::Leader;
            self.publish(true, Some(self.config.node_id.clone()), term);
            tracing::info!(node = %self.config.node_id, term, "acquired leadership");
            if let Err(err) = self
                .store
                .log_cluster_event(
                    &self.config.node_id,
                    "leader_elected",
                    Some(json!({ "hostname": self.config.hostname })),
                    term,
                )
                .await
            {
                tracing::warn!(error = %err, "failed to record leader_elected event");
            }
            self.fire_leader_hook(&self.hooks.on_become_leader, term);
        } else {
            // Someone else got there first at this or a higher term.
            state.role = NodeState::Follower;
            tracing::debug!(node = %self.config.node_id, term, "lost election");
        }
        Ok(())
    }

    /// One pass of the membership monitor: observe visible nodes, collect
    /// stale rows, and notify on changes.
    pub async fn membership_step(&self) -> Result<(), Error> {
        let visible = self.store.visible_nodes().await?;
        let collected = self.store.gc_stale_nodes(&self.config.node_id).await?;
        if collected > 0 {
            tracing::info!(collected, "garbage-collected stale cluster nodes");
        }

        let snapshot: HashMap<String, ClusterNode> = visible
            .into_iter()
            .map(|n| (n.node_id.clone(), n))
            .collect();
        let mut state = self.state.lock().await;
        let changed = state.members.len() != snapshot.len()
            || !snapshot.keys().all(|k| state.members.contains_key(k));
        if changed {
            state.members = snapshot.clone();
            drop(state);
            tracing::info!(nodes = snapshot.len(), "cluster membership changed");
            if let Some(hook) = self.hooks.on_cluster_change.clone() {
                tokio::spawn(async move { hook(snapshot) });
            }
        }
        Ok(())
    }

    /// Visible membership as of the last monitor pass.
    pub async fn members(&self) -> HashMap<String, ClusterNode> {
        self.state.lock().await.members.clone()
    }

    async fn demote(&self, state: &mut ElectionState, reason: &str) {
        if state.role != NodeState::Leader {
            return;
        }
        let term = state.term;
        state.role = NodeState::Follower;
        self.publish(false, None, term);
        tracing::warn!(node = %self.config.node_id, term, reason, "lost leadership");
        if let Err(err) = self
            .store
            .log_cluster_event(&self.config.node_id, "leader_lost", None, term)
            .await
        {
            tracing::warn!(error = %err, "failed to record leader_lost event");
        }
        self.fire_leader_hook(&self.hooks.on_lose_leadership, term);
    }

    /// Graceful shutdown: release the lease if held and mark the node row
    /// stopped.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        let term = state.term;
        if state.role == NodeState::Leader {
            if let Err(err) = self.store.release_lease(&self.config.node_id, term).await {
                tracing::warn!(error = %err, "failed to release lease on shutdown");
            }
            self.demote(&mut state, "voluntary release on shutdown").await;
        }
        state.role = NodeState::Stopped;
        if let Err(err) = self
            .store
            .heartbeat(&self.config.node_id, NodeState::Stopped, term)
            .await
        {
            tracing::warn!(error = %err, "failed to mark node stopped");
        }
    }

    /// Spawn the three persistent tasks. Each observes `cancel` and returns
    /// within one polling interval; a panicking step is logged and retried on
    /// the next interval.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(3);

        let this = Arc::clone(&self);
        let stop = cancel.clone();
        handles.push(tokio::spawn(async move {
            // Register before the first heartbeat so the row exists.
            let node = this.self_node(NodeState::Follower, 0);
            if let Err(err) = this.store.upsert_node(&node).await {
                tracing::warn!(error = %err, "initial node registration failed");
            }
            let mut tick = tokio::time::interval(this.config.heartbeat_interval);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = tick.tick() => {
                        match std::panic::AssertUnwindSafe(this.heartbeat_step()).catch_unwind().await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => tracing::warn!(error = %err, "heartbeat failed"),
                            Err(_) => tracing::error!("heartbeat task panicked"),
                        }
                    }
                }
            }
        }));

        let this = Arc::clone(&self);
        let stop = cancel.clone();
        handles.push(tokio::spawn(async move {
            // De-synchronise candidates so simultaneous starts do not all
            // bid on the same tick.
            let jitter = this.config.election_tick.mul_f64(rand::rng().random_range(0.0..1.0));
            tokio::time::sleep(jitter).await;
            let mut tick = tokio::time::interval(this.config.election_tick);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = tick.tick() => {
                        match std::panic::AssertUnwindSafe(this.election_step()).catch_unwind().await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => tracing::warn!(error = %err, "election watch failed"),
                            Err(_) => tracing::error!("election watch panicked"),
                        }
                    }
                }
            }
        }));

        let this = Arc::clone(&self);
        let stop = cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(this.config.membership_interval);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = tick.tick() => {
                        match std::panic::AssertUnwindSafe(this.membership_step()).catch_unwind().await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => tracing::warn!(error = %err, "membership monitor failed"),
                            Err(_) => tracing::error!("membership monitor panicked"),
                        }
                    }
                }
            }
        }));

        handles
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};

    use super::*;
    use crate::testing::MemCoordinationStore;

    fn coordinator(
        id: &str,
        store: &Arc<MemCoordinationStore>,
        hooks: Hooks,
    ) -> Arc<LeaderCoordinator> {
        let config = CoordinatorConfig::new(
            id.to_string(),
            format!("{id}.local"),
            8080,
            format!("http://{id}.local:8080"),
        );
        let store: Arc<dyn CoordinationStore> = Arc::clone(store) as _;
        LeaderCoordinator::new(config, store, hooks).unwrap()
    }

    #[tokio::test]
    async fn first_candidate_wins_term_one() {
        let store = Arc::new(MemCoordinationStore::default());
        let a = coordinator("node-a", &store, Hooks::default());

        a.election_step().await.unwrap();
        assert!(a.is_leader());
        let state = a.subscribe().borrow().clone();
        assert_eq!(state.term, 1);
        assert_eq!(state.leader_id.as_deref(), Some("node-a"));
        assert_eq!(
            store.cluster_events.lock().as_slice(),
            &[("node-a".to_string(), "leader_elected".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn second_node_follows_a_fresh_lease() {
        let store = Arc::new(MemCoordinationStore::default());
        let a = coordinator("node-a", &store, Hooks::default());
        let b = coordinator("node-b", &store, Hooks::default());

        a.election_step().await.unwrap();
        b.election_step().await.unwrap();
        assert!(a.is_leader());
        assert!(!b.is_leader());
        // The follower learns who leads from the lease.
        assert_eq!(
            b.subscribe().borrow().leader_id.as_deref(),
            Some("node-a")
        );
    }

    #[tokio::test]
    async fn failover_increments_the_term_and_elects_exactly_one() {
        let store = Arc::new(MemCoordinationStore::default());
        let a = coordinator("node-a", &store, Hooks::default());
        let b = coordinator("node-b", &store, Hooks::default());
        let c = coordinator("node-c", &store, Hooks::default());

        a.election_step().await.unwrap();
        b.election_step().await.unwrap();
        c.election_step().await.unwrap();
        assert!(a.is_leader());

        // "Kill" node-a: its lease simply expires, no release.
        store.expire_lease();

        b.election_step().await.unwrap();
        c.election_step().await.unwrap();
        assert!(b.is_leader());
        assert!(!c.is_leader());
        assert_eq!(b.subscribe().borrow().term, 2);

        // The deposed leader's next renewal fails and demotes it.
        a.heartbeat_step().await.unwrap();
        assert!(!a.is_leader());
    }

    #[tokio::test]
    async fn renewal_failure_demotes_and_fires_hook() {
        let store = Arc::new(MemCoordinationStore::default());
        let lost = Arc::new(AtomicI64::new(-1));
        let lost_term = Arc::clone(&lost);
        let hooks = Hooks {
            on_lose_leadership: Some(Arc::new(move |term| {
                lost_term.store(term, Ordering::SeqCst);
            })),
            ..Hooks::default()
        };
        let a = coordinator("node-a", &store, hooks);
        store
            .upsert_node(&a.self_node(NodeState::Follower, 0))
            .await
            .unwrap();

        a.election_step().await.unwrap();
        assert!(a.is_leader());

        // Simulate the lease being stolen at a higher term.
        store.expire_lease();
        let b = coordinator("node-b", &store, Hooks::default());
        b.election_step().await.unwrap();

        a.heartbeat_step().await.unwrap();
        assert!(!a.is_leader());
        assert_eq!(
            store
                .cluster_events
                .lock()
                .iter()
                .filter(|(_, kind, _)| kind == "leader_lost")
                .count(),
            1
        );
        // Hook runs on its own task.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(lost.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_releases_the_lease_for_the_next_candidate() {
        let store = Arc::new(MemCoordinationStore::default());
        let a = coordinator("node-a", &store, Hooks::default());
        let b = coordinator("node-b", &store, Hooks::default());

        a.election_step().await.unwrap();
        // b's election watch observes a's lease (and term) while following.
        b.election_step().await.unwrap();
        assert!(!b.is_leader());

        a.shutdown().await;
        assert!(store.lease.lock().is_none());

        // The released row is gone, so the observed term carries the
        // monotonicity across the transition.
        b.election_step().await.unwrap();
        assert!(b.is_leader());
        assert_eq!(b.subscribe().borrow().term, 2);
    }

    #[tokio::test]
    async fn rejects_inverted_intervals() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemCoordinationStore::default());
        let mut config = CoordinatorConfig::new(
            "node-a".into(),
            "node-a.local".into(),
            8080,
            "http://node-a.local:8080".into(),
        );
        config.heartbeat_interval = Duration::from_secs(30);
        assert!(LeaderCoordinator::new(config, store, Hooks::default()).is_err());
    }
}
