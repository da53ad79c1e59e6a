//! Health-aware proxy upstream publishing.
//!
//! For each app the publisher renders an upstream block from the healthy
//! replica set and applies it atomically: write to a temp file, rename over
//! the live config keeping the prior content as `.backup`, then validate and
//! reload the proxy. Validation or reload failure restores the previous
//! content, so the on-disk config always matches a configuration the proxy
//! accepted.

use std::{fmt::Write as _, path::PathBuf, sync::Arc};

use orchestry_core::{is_valid_app_name, ValidationError};

use crate::{driver::ProxyDriver, Error};

pub struct UpstreamPublisher {
    conf_dir: PathBuf,
    proxy: Arc<dyn ProxyDriver>,
}

impl UpstreamPublisher {
    pub fn new(conf_dir: impl Into<PathBuf>, proxy: Arc<dyn ProxyDriver>) -> Self {
        Self {
            conf_dir: conf_dir.into(),
            proxy,
        }
    }

    /// Publish the given `(ip, port)` upstreams for an app.
    ///
    /// An empty server set removes the app's config instead; the proxy must
    /// not route to an app with no healthy replicas.
    pub async fn publish(&self, app: &str, servers: &[(String, u16)]) -> Result<(), Error> {
        if !is_valid_app_name(app) {
            return Err(ValidationError::InvalidName(app.to_string()).into());
        }
        if servers.is_empty() {
            return self.remove(app).await;
        }

        let live = self.conf_dir.join(format!("{app}.conf"));
        let tmp = self.conf_dir.join(format!("{app}.conf.tmp"));
        let backup = self.conf_dir.join(format!("{app}.conf.backup"));

        let rendered = render_config(app, servers);
        tokio::fs::write(&tmp, rendered)
            .await
            .map_err(|err| Error::Proxy(format!("writing candidate config: {err}")))?;

        let had_previous = tokio::fs::metadata(&live).await.is_ok();
        if had_previous {
            tokio::fs::copy(&live, &backup)
                .await
                .map_err(|err| Error::Proxy(format!("backing up config: {err}")))?;
        }
        tokio::fs::rename(&tmp, &live)
            .await
            .map_err(|err| Error::Proxy(format!("installing config: {err}")))?;

        if let Err(err) = self.proxy.validate_config().await {
            self.rollback(app, had_previous).await;
            return Err(err);
        }
        if let Err(err) = self.proxy.reload().await {
            self.rollback(app, had_previous).await;
            return Err(err);
        }

        if had_previous {
            let _ = tokio::fs::remove_file(&backup).await;
        }
        tracing::info!(app, upstreams = servers.len(), "proxy config published");
        Ok(())
    }

    /// Remove an app's config and reload the proxy. Removing an absent
    /// config is a no-op.
    pub async fn remove(&self, app: &str) -> Result<(), Error> {
        if !is_valid_app_name(app) {
            return Err(ValidationError::InvalidName(app.to_string()).into());
        }
        let live = self.conf_dir.join(format!("{app}.conf"));
        if tokio::fs::metadata(&live).await.is_err() {
            return Ok(());
        }
        tokio::fs::remove_file(&live)
            .await
            .map_err(|err| Error::Proxy(format!("removing config: {err}")))?;
        self.proxy.reload().await?;
        tracing::info!(app, "proxy config removed");
        Ok(())
    }

    /// Put the pre-change content back after a failed validate or reload.
    async fn rollback(&self, app: &str, had_previous: bool) {
        let live = self.conf_dir.join(format!("{app}.conf"));
        let backup = self.conf_dir.join(format!("{app}.conf.backup"));
        let restored = if had_previous {
            tokio::fs::rename(&backup, &live).await
        } else {
            tokio::fs::remove_file(&live).await
        };
        if let Err(err) = restored {
            tracing::error!(app, error = %err, "config rollback failed");
        } else {
            tracing::warn!(app, "proxy config rolled back");
        }
    }
}

/// Render one app's upstream and server blocks.
fn render_config(app: &str, servers: &[(String, u16)]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "upstream {app}_backend {{");
    let _ = writeln!(out, "    least_conn;");
    for (ip, port) in servers {
        let _ = writeln!(out, "    server {ip}:{port} max_fails=3 fail_timeout=10s;");
    }
    let _ = writeln!(out, "}}");
    let _ = writeln!(out);
    let _ = writeln!(out, "server {{");
    let _ = writeln!(out, "    listen 80;");
    let _ = writeln!(out, "    server_name {app};");
    let _ = writeln!(out);
    let _ = writeln!(out, "    location / {{");
    let _ = writeln!(out, "        proxy_pass http://{app}_backend;");
    let _ = writeln!(out, "        proxy_set_header Host $host;");
    let _ = writeln!(out, "        proxy_set_header X-Real-IP $remote_addr;");
    let _ = writeln!(
        out,
        "        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;"
    );
    let _ = writeln!(out, "        proxy_set_header X-Forwarded-Proto $scheme;");
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out, "}}");
    out
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::driver::ProxyStatus;

    /// Proxy driver that can be told to fail the next validations/reloads.
    #[derive(Default)]
    struct FlakyProxy {
        fail_validates: AtomicUsize,
        fail_reloads: AtomicUsize,
        reloads: AtomicUsize,
    }

    #[async_trait]
    impl ProxyDriver for FlakyProxy {
        async fn validate_config(&self) -> Result<(), Error> {
            if self
                .fail_validates
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Proxy("nginx: configuration test failed".into()));
            }
            Ok(())
        }

        async fn reload(&self) -> Result<(), Error> {
            if self
                .fail_reloads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Proxy("nginx: reload failed".into()));
            }
            self.reloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn status(&self) -> Result<ProxyStatus, Error> {
            Ok(ProxyStatus::default())
        }
    }

    fn servers(ports: &[u16]) -> Vec<(String, u16)> {
        ports.iter().map(|p| ("10.0.0.2".to_string(), *p)).collect()
    }

    #[tokio::test]
    async fn publishes_and_clears_backup() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = Arc::new(FlakyProxy::default());
        let publisher = UpstreamPublisher::new(dir.path(), proxy.clone());

        publisher.publish("web", &servers(&[8080])).await.unwrap();

        let conf = std::fs::read_to_string(dir.path().join("web.conf")).unwrap();
        assert!(conf.contains("server 10.0.0.2:8080 max_fails=3 fail_timeout=10s;"));
        assert!(!dir.path().join("web.conf.backup").exists());
        assert!(!dir.path().join("web.conf.tmp").exists());
        assert_eq!(proxy.reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_validation_restores_previous_config() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = Arc::new(FlakyProxy::default());
        let publisher = UpstreamPublisher::new(dir.path(), proxy.clone());

        publisher.publish("web", &servers(&[8080])).await.unwrap();
        let before = std::fs::read_to_string(dir.path().join("web.conf")).unwrap();

        proxy.fail_validates.store(1, Ordering::SeqCst);
        let err = publisher
            .publish("web", &servers(&[8080, 8081]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Proxy(_)));

        let after = std::fs::read_to_string(dir.path().join("web.conf")).unwrap();
        assert_eq!(before, after, "on-disk config must equal pre-change content");
        // Only the first publish reloaded.
        assert_eq!(proxy.reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_reload_restores_previous_config() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = Arc::new(FlakyProxy::default());
        let publisher = UpstreamPublisher::new(dir.path(), proxy.clone());

        publisher.publish("web", &servers(&[8080])).await.unwrap();
        let before = std::fs::read_to_string(dir.path().join("web.conf")).unwrap();

        proxy.fail_reloads.store(1, Ordering::SeqCst);
        publisher
            .publish("web", &servers(&[8080, 8081]))
            .await
            .unwrap_err();
        let after = std::fs::read_to_string(dir.path().join("web.conf")).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn failed_first_publish_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = Arc::new(FlakyProxy::default());
        proxy.fail_validates.store(1, Ordering::SeqCst);
        let publisher = UpstreamPublisher::new(dir.path(), proxy);

        publisher.publish("web", &servers(&[8080])).await.unwrap_err();
        assert!(!dir.path().join("web.conf").exists());
    }

    #[tokio::test]
    async fn empty_server_set_removes_config() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = Arc::new(FlakyProxy::default());
        let publisher = UpstreamPublisher::new(dir.path(), proxy);

        publisher.publish("web", &servers(&[8080])).await.unwrap();
        publisher.publish("web", &[]).await.unwrap();
        assert!(!dir.path().join("web.conf").exists());

        // Removing an app that was never published is fine.
        publisher.remove("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_path_hostile_names() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = UpstreamPublisher::new(dir.path(), Arc::new(FlakyProxy::default()));
        let err = publisher
            .publish("../etc/passwd", &servers(&[8080]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
