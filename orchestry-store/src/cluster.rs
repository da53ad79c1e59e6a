//! Cluster membership and the leader lease.
//!
//! The lease queries are where the single-leader invariant lives: acquisition
//! is one conditional upsert whose predicate only passes when the existing
//! row is expired or carries a lower term, and renewal only touches a row the
//! caller still owns. Both report success through the affected-row count.
//! Expiry is always judged by the database clock, never by node clocks.

use std::time::Duration;

use async_trait::async_trait;
use orchestry_core::{ClusterNode, LeaderLease, NodeState};
use serde_json::Value;
use sqlx::{postgres::PgRow, Row};

use crate::{
    traits::{CoordinationStore, LeaseClaim, LeaseSnapshot},
    Error, Store,
};

const VISIBILITY_WINDOW_SECS: i32 = 60;
const NODE_GC_AFTER_SECS: i32 = 300;

fn node_from_row(row: &PgRow) -> Result<ClusterNode, Error> {
    let state: String = row.try_get("state")?;
    let port: i32 = row.try_get("port")?;
    Ok(ClusterNode {
        node_id: row.try_get("node_id")?,
        hostname: row.try_get("hostname")?,
        port: u16::try_from(port).map_err(|_| Error::Corrupt(format!("node port {port}")))?,
        api_url: row.try_get("api_url")?,
        state: state.parse().map_err(Error::Corrupt)?,
        term: row.try_get("term")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
        healthy: row.try_get("is_healthy")?,
    })
}

fn lease_from_row(row: &PgRow) -> Result<LeaseSnapshot, Error> {
    Ok(LeaseSnapshot {
        lease: LeaderLease {
            leader_id: row.try_get("leader_id")?,
            term: row.try_get("term")?,
            acquired_at: row.try_get("acquired_at")?,
            expires_at: row.try_get("expires_at")?,
            renewed_at: row.try_get("renewed_at")?,
            hostname: row.try_get("hostname")?,
            api_url: row.try_get("api_url")?,
        },
        expired: row.try_get("expired")?,
    })
}

#[async_trait]
impl CoordinationStore for Store {
    async fn upsert_node(&self, node: &ClusterNode) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO cluster_nodes
                (node_id, hostname, port, api_url, state, term, last_heartbeat, is_healthy)
             VALUES ($1, $2, $3, $4, $5, $6, now(), TRUE)
             ON CONFLICT (node_id) DO UPDATE SET
                hostname = EXCLUDED.hostname,
                port = EXCLUDED.port,
                api_url = EXCLUDED.api_url,
                state = EXCLUDED.state,
                term = EXCLUDED.term,
                last_heartbeat = now(),
                is_healthy = TRUE,
                updated_at = now()",
        )
        .bind(&node.node_id)
        .bind(&node.hostname)
        .bind(i32::from(node.port))
        .bind(&node.api_url)
        .bind(node.state.as_str())
        .bind(node.term)
        .execute(self.write())
        .await?;
        Ok(())
    }

    async fn heartbeat(&self, node_id: &str, state: NodeState, term: i64) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE cluster_nodes
             SET last_heartbeat = now(), state = $2, term = $3, is_healthy = TRUE,
                 updated_at = now()
             WHERE node_id = $1",
        )
        .bind(node_id)
        .bind(state.as_str())
        .bind(term)
        .execute(self.write())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_nodes(&self) -> Result<Vec<ClusterNode>, Error> {
        let rows = sqlx::query(
            "SELECT node_id, hostname, port, api_url, state, term, last_heartbeat, is_healthy
             FROM cluster_nodes ORDER BY node_id",
        )
        .fetch_all(self.read())
        .await?;
        rows.iter().map(node_from_row).collect()
    }

    async fn visible_nodes(&self) -> Result<Vec<ClusterNode>, Error> {
        let rows = sqlx::query(
            "SELECT node_id, hostname, port, api_url, state, term, last_heartbeat, is_healthy
             FROM cluster_nodes
             WHERE last_heartbeat >= now() - make_interval(secs => $1)
             ORDER BY node_id",
        )
        .bind(f64::from(VISIBILITY_WINDOW_SECS))
        .fetch_all(self.read())
        .await?;
        rows.iter().map(node_from_row).collect()
    }

    async fn gc_stale_nodes(&self, keep: &str) -> Result<u64, Error> {
        let result = sqlx::query(
            "DELETE FROM cluster_nodes
             WHERE node_id <> $1 AND last_heartbeat < now() - make_interval(secs => $2)",
        )
        .bind(keep)
        .bind(f64::from(NODE_GC_AFTER_SECS))
        .execute(self.write())
        .await?;
        Ok(result.rows_affected())
    }

    async fn current_lease(&self) -> Result<Option<LeaseSnapshot>, Error> {
        let row = sqlx::query(
            "SELECT leader_id, term, acquired_at, expires_at, renewed_at, hostname, api_url,
                    (expires_at <= now()) AS expired
             FROM leader_lease WHERE id = 1",
        )
        .fetch_optional(self.read())
        .await?;
        row.as_ref().map(lease_from_row).transpose()
    }

    async fn try_acquire_lease(&self, claim: &LeaseClaim) -> Result<bool, Error> {
        let result = sqlx::query(
            "INSERT INTO leader_lease
                (id, leader_id, term, acquired_at, expires_at, renewed_at, hostname, api_url)
             VALUES (1, $1, $2, now(), now() + make_interval(secs => $3), now(), $4, $5)
             ON CONFLICT (id) DO UPDATE SET
                leader_id = EXCLUDED.leader_id,
                term = EXCLUDED.term,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at,
                renewed_at = EXCLUDED.renewed_at,
                hostname = EXCLUDED.hostname,
                api_url = EXCLUDED.api_url
             WHERE leader_lease.expires_at <= now() OR leader_lease.term < EXCLUDED.term",
        )
        .bind(&claim.leader_id)
        .bind(claim.term)
        .bind(claim.ttl.as_secs_f64())
        .bind(&claim.hostname)
        .bind(&claim.api_url)
        .execute(self.write())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn renew_lease(
        &self,
        leader_id: &str,
        term: i64,
        ttl: Duration,
    ) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE leader_lease
             SET expires_at = now() + make_interval(secs => $3), renewed_at = now()
             WHERE id = 1 AND leader_id = $1 AND term = $2",
        )
        .bind(leader_id)
        .bind(term)
        .bind(ttl.as_secs_f64())
        .execute(self.write())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, leader_id: &str, term: i64) -> Result<(), Error> {
        let result =
            sqlx::query("DELETE FROM leader_lease WHERE id = 1 AND leader_id = $1 AND term = $2")
                .bind(leader_id)
                .bind(term)
                .execute(self.write())
                .await?;
        if result.rows_affected() > 0 {
            tracing::info!(leader_id, term, "lease released");
        }
        Ok(())
    }

    async fn log_cluster_event(
        &self,
        node_id: &str,
        event_type: &str,
        data: Option<Value>,
        term: i64,
    ) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO cluster_events (node_id, event_type, event_data, term)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(node_id)
        .bind(event_type)
        .bind(data)
        .bind(term)
        .execute(self.write())
        .await?;
        Ok(())
    }
}
