//! Node configuration from environment variables.

use std::path::PathBuf;

use orchestry_store::PgConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name}={value:?} is not valid")]
    Invalid { name: &'static str, value: String },

    #[error(transparent)]
    Store(#[from] orchestry_store::Error),

    #[error("could not determine hostname: {0}")]
    Hostname(#[source] std::io::Error),
}

/// Everything `orchestryd` reads from its environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address for the API (`ORCHESTRY_HOST`).
    pub host: String,
    /// API port (`ORCHESTRY_PORT`).
    pub port: u16,
    /// Stable node identity (`CLUSTER_NODE_ID`).
    pub node_id: String,
    /// Advertised hostname (`CLUSTER_HOSTNAME`).
    pub hostname: String,
    /// Name of the managed nginx container (`ORCHESTRY_NGINX_CONTAINER`).
    pub nginx_container: String,
    /// Directory the per-app configs are written to
    /// (`ORCHESTRY_NGINX_CONF_DIR`).
    pub nginx_conf_dir: PathBuf,
    /// Load-balancer address for the stub-status endpoint
    /// (`CONTROLLER_LB_HOST` / `CONTROLLER_LB_PORT`).
    pub lb_host: String,
    pub lb_port: u16,
    pub postgres: PgConfig,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let hostname = match var("CLUSTER_HOSTNAME") {
            Some(hostname) => hostname,
            None => hostname::get()
                .map_err(ConfigError::Hostname)?
                .to_string_lossy()
                .into_owned(),
        };
        let port = parsed("ORCHESTRY_PORT", 8090)?;
        Ok(Self {
            host: var("ORCHESTRY_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            node_id: var("CLUSTER_NODE_ID")
                .unwrap_or_else(|| format!("orchestry-{hostname}")),
            nginx_container: var("ORCHESTRY_NGINX_CONTAINER")
                .unwrap_or_else(|| "orchestry-nginx".to_string()),
            nginx_conf_dir: var("ORCHESTRY_NGINX_CONF_DIR")
                .map_or_else(|| PathBuf::from("/etc/nginx/conf.d"), PathBuf::from),
            lb_host: var("CONTROLLER_LB_HOST").unwrap_or_else(|| "localhost".to_string()),
            lb_port: parsed("CONTROLLER_LB_PORT", 8080)?,
            postgres: PgConfig::from_env()?,
            hostname,
        })
    }

    /// URL other nodes and redirect hints use to reach this node's API.
    #[must_use]
    pub fn api_url(&self) -> String {
        format!("http://{}:{}", self.hostname, self.port)
    }

    /// The proxy's stub-status endpoint.
    #[must_use]
    pub fn status_url(&self) -> String {
        format!("http://{}:{}/nginx_status", self.lb_host, self.lb_port)
    }

    /// The API bind address.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
