//! App record persistence.

use async_trait::async_trait;
use orchestry_core::{App, AppManifest, AppStatus};
use serde_json::Value;
use sqlx::{postgres::PgRow, Row};

use crate::{traits::AppStore, Error, Store};

const APP_COLUMNS: &str = "name, spec, raw_spec, status, created_at, updated_at, replicas, mode";

fn app_from_row(row: &PgRow) -> Result<App, Error> {
    let name: String = row.try_get("name")?;
    let spec: Value = row.try_get("spec")?;
    let manifest: AppManifest =
        serde_json::from_value(spec).map_err(|e| Error::Corrupt(format!("app {name}: {e}")))?;
    let status: String = row.try_get("status")?;
    let mode: String = row.try_get("mode")?;
    Ok(App {
        manifest,
        raw_spec: row.try_get("raw_spec")?,
        status: status.parse().map_err(Error::Corrupt)?,
        mode: mode.parse().map_err(Error::Corrupt)?,
        desired_replicas: row.try_get("replicas")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        name,
    })
}

#[async_trait]
impl AppStore for Store {
    async fn get_app(&self, name: &str) -> Result<Option<App>, Error> {
        let row = sqlx::query(&format!("SELECT {APP_COLUMNS} FROM apps WHERE name = $1"))
            .bind(name)
            .fetch_optional(self.read())
            .await?;
        row.as_ref().map(app_from_row).transpose()
    }

    async fn save_app(&self, app: &App) -> Result<(), Error> {
        let spec = serde_json::to_value(&app.manifest)
            .map_err(|e| Error::Corrupt(format!("app {}: {e}", app.name)))?;
        sqlx::query(
            "INSERT INTO apps (name, spec, raw_spec, status, created_at, updated_at, replicas, mode)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (name) DO UPDATE SET
                spec = EXCLUDED.spec,
                raw_spec = EXCLUDED.raw_spec,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at,
                replicas = EXCLUDED.replicas,
                mode = EXCLUDED.mode",
        )
        .bind(&app.name)
        .bind(&spec)
        .bind(&app.raw_spec)
        .bind(app.status.as_str())
        .bind(app.created_at)
        .bind(app.updated_at)
        .bind(app.desired_replicas)
        .bind(app.mode.as_str())
        .execute(self.write())
        .await?;
        Ok(())
    }

    async fn list_apps(&self) -> Result<Vec<App>, Error> {
        let rows = sqlx::query(&format!("SELECT {APP_COLUMNS} FROM apps ORDER BY name"))
            .fetch_all(self.read())
            .await?;
        rows.iter().map(app_from_row).collect()
    }

    async fn list_running_apps(&self) -> Result<Vec<App>, Error> {
        let rows = sqlx::query(&format!(
            "SELECT {APP_COLUMNS} FROM apps WHERE status = 'running' ORDER BY name"
        ))
        .fetch_all(self.read())
        .await?;
        rows.iter().map(app_from_row).collect()
    }

    async fn get_raw_spec(&self, name: &str) -> Result<Option<Value>, Error> {
        let row = sqlx::query("SELECT raw_spec FROM apps WHERE name = $1")
            .bind(name)
            .fetch_optional(self.read())
            .await?;
        row.map(|r| r.try_get("raw_spec").map_err(Error::from))
            .transpose()
    }

    async fn set_app_status(
        &self,
        name: &str,
        status: AppStatus,
        replicas: i32,
    ) -> Result<(), Error> {
        let result = sqlx::query(
            "UPDATE apps SET status = $2, replicas = $3, updated_at = now() WHERE name = $1",
        )
        .bind(name)
        .bind(status.as_str())
        .bind(replicas)
        .execute(self.write())
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("app {name}")));
        }
        Ok(())
    }

    async fn set_desired_replicas(&self, name: &str, replicas: i32) -> Result<(), Error> {
        let result =
            sqlx::query("UPDATE apps SET replicas = $2, updated_at = now() WHERE name = $1")
                .bind(name)
                .bind(replicas)
                .execute(self.write())
                .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("app {name}")));
        }
        Ok(())
    }
}
