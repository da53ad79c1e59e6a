//! Append-only audit records: events and scaling history.

use async_trait::async_trait;
use orchestry_core::{Event, ScalingAction};
use serde_json::Value;
use sqlx::{postgres::PgRow, Row};

use crate::{
    traits::{AuditStore, NewScalingAction},
    Error, Store,
};

fn event_from_row(row: &PgRow) -> Result<Event, Error> {
    Ok(Event {
        id: row.try_get("id")?,
        app: row.try_get("app")?,
        kind: row.try_get("type")?,
        message: row.try_get("message")?,
        timestamp: row.try_get("timestamp")?,
        data: row.try_get("data")?,
    })
}

fn action_from_row(row: &PgRow) -> Result<ScalingAction, Error> {
    Ok(ScalingAction {
        id: row.try_get("id")?,
        app: row.try_get("app")?,
        from_replicas: row.try_get("from")?,
        to_replicas: row.try_get("to")?,
        reason: row.try_get("reason")?,
        triggered_by: row.try_get("triggered_by")?,
        metrics: row.try_get("metrics")?,
        timestamp: row.try_get("timestamp")?,
    })
}

#[async_trait]
impl AuditStore for Store {
    async fn log_event(
        &self,
        app: &str,
        kind: &str,
        message: &str,
        data: Option<Value>,
    ) -> Result<(), Error> {
        sqlx::query("INSERT INTO events (app, type, message, data) VALUES ($1, $2, $3, $4)")
            .bind(app)
            .bind(kind)
            .bind(message)
            .bind(data)
            .execute(self.write())
            .await?;
        Ok(())
    }

    async fn get_events(&self, app: Option<&str>, limit: i64) -> Result<Vec<Event>, Error> {
        let rows = match app {
            Some(app) => {
                sqlx::query(
                    "SELECT id, app, type, message, timestamp, data FROM events
                     WHERE app = $1 ORDER BY timestamp DESC LIMIT $2",
                )
                .bind(app)
                .bind(limit)
                .fetch_all(self.read())
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, app, type, message, timestamp, data FROM events
                     ORDER BY timestamp DESC LIMIT $1",
                )
                .bind(limit)
                .fetch_all(self.read())
                .await?
            }
        };
        rows.iter().map(event_from_row).collect()
    }

    async fn log_scaling_action(&self, action: &NewScalingAction) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO scaling_actions (app, \"from\", \"to\", reason, triggered_by, metrics)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&action.app)
        .bind(action.from_replicas)
        .bind(action.to_replicas)
        .bind(&action.reason)
        .bind(&action.triggered_by)
        .bind(&action.metrics)
        .execute(self.write())
        .await?;
        Ok(())
    }

    async fn get_scaling_history(
        &self,
        app: &str,
        limit: i64,
    ) -> Result<Vec<ScalingAction>, Error> {
        let rows = sqlx::query(
            "SELECT id, app, \"from\", \"to\", reason, triggered_by, metrics, timestamp
             FROM scaling_actions WHERE app = $1 ORDER BY timestamp DESC LIMIT $2",
        )
        .bind(app)
        .bind(limit)
        .fetch_all(self.read())
        .await?;
        rows.iter().map(action_from_row).collect()
    }
}
