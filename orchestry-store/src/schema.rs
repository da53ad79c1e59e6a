//! Idempotent schema bootstrap, executed at startup.

use sqlx::postgres::PgPool;

use crate::Error;

const DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS apps (
        name        TEXT PRIMARY KEY,
        spec        JSONB NOT NULL,
        raw_spec    JSONB NOT NULL,
        status      TEXT NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        replicas    INTEGER NOT NULL DEFAULT 0,
        mode        TEXT NOT NULL DEFAULT 'auto'
    )",
    "CREATE TABLE IF NOT EXISTS events (
        id          BIGSERIAL PRIMARY KEY,
        app         TEXT NOT NULL,
        type        TEXT NOT NULL,
        message     TEXT NOT NULL,
        timestamp   TIMESTAMPTZ NOT NULL DEFAULT now(),
        data        JSONB
    )",
    "CREATE TABLE IF NOT EXISTS scaling_actions (
        id            BIGSERIAL PRIMARY KEY,
        app           TEXT NOT NULL,
        \"from\"        INTEGER NOT NULL,
        \"to\"          INTEGER NOT NULL,
        reason        TEXT NOT NULL,
        triggered_by  TEXT NOT NULL,
        metrics       JSONB,
        timestamp     TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS cluster_nodes (
        node_id         TEXT PRIMARY KEY,
        hostname        TEXT NOT NULL,
        port            INTEGER NOT NULL,
        api_url         TEXT NOT NULL,
        state           TEXT NOT NULL,
        term            BIGINT NOT NULL DEFAULT 0,
        last_heartbeat  TIMESTAMPTZ NOT NULL DEFAULT now(),
        is_healthy      BOOLEAN NOT NULL DEFAULT TRUE,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    // The CHECK keeps this a singleton; the conditional upsert in cluster.rs
    // enforces the single-leader invariant on top of it.
    "CREATE TABLE IF NOT EXISTS leader_lease (
        id           INTEGER PRIMARY KEY CHECK (id = 1),
        leader_id    TEXT NOT NULL,
        term         BIGINT NOT NULL,
        acquired_at  TIMESTAMPTZ NOT NULL,
        expires_at   TIMESTAMPTZ NOT NULL,
        renewed_at   TIMESTAMPTZ NOT NULL,
        hostname     TEXT NOT NULL,
        api_url      TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS cluster_events (
        id          BIGSERIAL PRIMARY KEY,
        node_id     TEXT NOT NULL,
        event_type  TEXT NOT NULL,
        event_data  JSONB,
        term        BIGINT NOT NULL DEFAULT 0,
        timestamp   TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS idx_cluster_nodes_state ON cluster_nodes (state)",
    "CREATE INDEX IF NOT EXISTS idx_cluster_nodes_heartbeat ON cluster_nodes (last_heartbeat)",
    "CREATE INDEX IF NOT EXISTS idx_cluster_events_node_term ON cluster_events (node_id, term)",
    "CREATE INDEX IF NOT EXISTS idx_cluster_events_timestamp ON cluster_events (timestamp)",
];

pub(crate) async fn migrate(pool: &PgPool) -> Result<(), Error> {
    for statement in DDL {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::debug!(statements = DDL.len(), "schema ensured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::DDL;

    #[test]
    fn lease_table_is_a_checked_singleton() {
        let lease = DDL
            .iter()
            .find(|s| s.contains("leader_lease"))
            .expect("leader_lease DDL");
        assert!(lease.contains("CHECK (id = 1)"));
    }

    #[test]
    fn every_statement_is_idempotent() {
        for statement in DDL {
            assert!(
                statement.contains("IF NOT EXISTS"),
                "non-idempotent DDL: {statement}"
            );
        }
    }
}
