//! Proxy driver for an nginx container managed alongside the controller.
//!
//! Validation and reload are executed inside the nginx container over the
//! runtime's exec API; the global counters come from the stub-status
//! endpoint.

use async_trait::async_trait;
use bollard::{
    exec::{CreateExecOptions, StartExecResults},
    Docker,
};
use futures::StreamExt;

use super::{ProxyDriver, ProxyStatus};
use crate::Error;

/// Where the proxy lives, usually read from `ORCHESTRY_NGINX_*` and
/// `CONTROLLER_LB_*` environment variables.
#[derive(Debug, Clone)]
pub struct NginxConfig {
    /// Name of the nginx container to exec into.
    pub container: String,
    /// Stub-status endpoint, e.g. `http://localhost:8081/nginx_status`.
    pub status_url: String,
}

pub struct NginxDriver {
    docker: Docker,
    config: NginxConfig,
    http: reqwest::Client,
}

impl NginxDriver {
    pub fn new(docker: Docker, config: NginxConfig) -> Self {
        Self {
            docker,
            config,
            http: reqwest::Client::new(),
        }
    }

    async fn exec(&self, cmd: &[&str]) -> Result<(), Error> {
        let exec = self
            .docker
            .create_exec(
                &self.config.container,
                CreateExecOptions {
                    cmd: Some(cmd.iter().map(ToString::to_string).collect()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| Error::Proxy(format!("exec setup failed: {err}")))?;

        let mut output = String::new();
        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|err| Error::Proxy(format!("exec start failed: {err}")))?;
        if let StartExecResults::Attached {
            output: mut stream, ..
        } = started
        {
            while let Some(Ok(chunk)) = stream.next().await {
                output.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|err| Error::Proxy(format!("exec inspect failed: {err}")))?;
        match inspect.exit_code {
            None | Some(0) => Ok(()),
            Some(code) => Err(Error::Proxy(format!(
                "`{}` exited with {code}: {}",
                cmd.join(" "),
                output.trim()
            ))),
        }
    }
}

#[async_trait]
impl ProxyDriver for NginxDriver {
    async fn validate_config(&self) -> Result<(), Error> {
        self.exec(&["nginx", "-t"]).await
    }

    async fn reload(&self) -> Result<(), Error> {
        self.exec(&["nginx", "-s", "reload"]).await
    }

    async fn status(&self) -> Result<ProxyStatus, Error> {
        let body = self
            .http
            .get(&self.config.status_url)
            .send()
            .await
            .map_err(|err| Error::Proxy(format!("status fetch failed: {err}")))?
            .text()
            .await
            .map_err(|err| Error::Proxy(format!("status read failed: {err}")))?;
        parse_stub_status(&body)
            .ok_or_else(|| Error::Proxy(format!("unparseable stub status: {body:?}")))
    }
}

/// Parse nginx stub-status output:
///
/// ```text
/// Active connections: 291
/// server accepts handled requests
///  16630948 16630948 31070465
/// Reading: 6 Writing: 179 Waiting: 106
/// ```
fn parse_stub_status(body: &str) -> Option<ProxyStatus> {
    let mut lines = body.lines();
    let active = lines
        .next()?
        .strip_prefix("Active connections:")?
        .trim()
        .parse()
        .ok()?;
    let _header = lines.next()?;
    let mut counters = lines.next()?.split_whitespace();
    Some(ProxyStatus {
        active_connections: active,
        accepts: counters.next()?.parse().ok()?,
        handled: counters.next()?.parse().ok()?,
        requests: counters.next()?.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stub_status() {
        let body = "Active connections: 291 \nserver accepts handled requests\n 16630948 16630948 31070465 \nReading: 6 Writing: 179 Waiting: 106 \n";
        let status = parse_stub_status(body).unwrap();
        assert_eq!(status.active_connections, 291);
        assert_eq!(status.accepts, 16_630_948);
        assert_eq!(status.requests, 31_070_465);
    }

    #[test]
    fn rejects_unexpected_bodies() {
        assert!(parse_stub_status("").is_none());
        assert!(parse_stub_status("<html>502</html>").is_none());
    }
}
