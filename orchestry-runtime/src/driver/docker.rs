//! Runtime driver backed by the local Docker daemon.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
        LogsOptions, RemoveContainerOptions, StartContainerOptions, StatsOptions,
        StopContainerOptions,
    },
    errors::Error as DockerError,
    network::{CreateNetworkOptions, ListNetworksOptions},
    service::{HostConfig, RestartPolicy, RestartPolicyNameEnum},
    Docker,
};
use futures::StreamExt;

use super::{ContainerInfo, ContainerStats, CreateContainer, RuntimeDriver};
use crate::Error;

const NANO_CPUS_PER_CORE: f64 = 1_000_000_000.0;

/// Talks to the Docker daemon over the local socket.
#[derive(Clone)]
pub struct DockerDriver {
    docker: Docker,
}

impl DockerDriver {
    /// Connect using the environment's default socket.
    pub fn connect() -> Result<Self, Error> {
        let docker = Docker::connect_with_local_defaults().map_err(Error::runtime)?;
        Ok(Self { docker })
    }

    #[must_use]
    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

/// Name collisions get their own error kind; everything else is a runtime
/// failure for the caller's polling loop to absorb.
fn map_err(err: DockerError) -> Error {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 409,
            message,
        } => Error::Conflict(message),
        other => Error::runtime(other),
    }
}

fn summary_ip(summary: &bollard::service::ContainerSummary) -> Option<String> {
    summary
        .network_settings
        .as_ref()
        .and_then(|ns| ns.networks.as_ref())
        .and_then(|networks| {
            networks
                .values()
                .filter_map(|n| n.ip_address.clone())
                .find(|ip| !ip.is_empty())
        })
}

#[async_trait]
impl RuntimeDriver for DockerDriver {
    async fn ensure_network(&self, name: &str) -> Result<(), Error> {
        let options = ListNetworksOptions {
            filters: HashMap::from([("name".to_string(), vec![name.to_string()])]),
        };
        let networks = self
            .docker
            .list_networks(Some(options))
            .await
            .map_err(map_err)?;
        if networks.iter().any(|n| n.name.as_deref() == Some(name)) {
            return Ok(());
        }
        let create = self
            .docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await;
        match create.map_err(map_err) {
            // Lost a race against another creator; the network exists.
            Err(Error::Conflict(_)) | Ok(_) => {
                tracing::debug!(network = name, "bridge network ensured");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn create_container(&self, request: &CreateContainer) -> Result<String, Error> {
        let options = CreateContainerOptions {
            name: request.name.clone(),
            platform: None,
        };
        let host_config = HostConfig {
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            network_mode: Some(request.network.clone()),
            nano_cpus: request
                .cpu_limit
                .map(|cores| (cores * NANO_CPUS_PER_CORE) as i64),
            memory: request.memory_limit.and_then(|bytes| i64::try_from(bytes).ok()),
            ..Default::default()
        };
        let config = Config {
            image: Some(request.image.clone()),
            env: Some(request.env.clone()),
            labels: Some(request.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(map_err)?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), Error> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_err)
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), Error> {
        let options = StopContainerOptions {
            t: i64::try_from(grace.as_secs()).unwrap_or(30),
        };
        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(map_err)
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), Error> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(map_err)
    }

    async fn inspect_container(&self, id: &str, network: &str) -> Result<ContainerInfo, Error> {
        let details = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(map_err)?;
        let running = details
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        let labels = details
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();
        let ip = details
            .network_settings
            .as_ref()
            .and_then(|ns| ns.networks.as_ref())
            .and_then(|networks| networks.get(network))
            .and_then(|n| n.ip_address.clone())
            .filter(|ip| !ip.is_empty());
        Ok(ContainerInfo {
            id: details.id.unwrap_or_else(|| id.to_string()),
            name: details
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            running,
            labels,
            ip,
        })
    }

    async fn list_labelled(&self, label: &str, value: &str) -> Result<Vec<ContainerInfo>, Error> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([(
                "label".to_string(),
                vec![format!("{label}={value}")],
            )]),
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(map_err)?;
        Ok(summaries
            .into_iter()
            .map(|s| ContainerInfo {
                ip: summary_ip(&s),
                id: s.id.unwrap_or_default(),
                name: s
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                running: s.state.as_deref() == Some("running"),
                labels: s.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn container_logs(&self, id: &str, tail: u32) -> Result<Vec<String>, Error> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));
        let mut lines = Vec::new();
        while let Some(chunk) = stream.next().await {
            let output = chunk.map_err(map_err)?;
            let text = String::from_utf8_lossy(&output.into_bytes()).into_owned();
            lines.extend(
                text.lines()
                    .filter(|line| !line.is_empty())
                    .map(str::to_string),
            );
        }
        Ok(lines)
    }

    async fn container_stats(&self, id: &str) -> Result<ContainerStats, Error> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let mut stream = self.docker.stats(id, Some(options));
        let Some(stats) = stream.next().await else {
            return Ok(ContainerStats::default());
        };
        let stats = stats.map_err(map_err)?;

        let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
            - stats.precpu_stats.cpu_usage.total_usage as f64;
        let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
            - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;
        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;
        let cpu_pct = if cpu_delta > 0.0 && system_delta > 0.0 {
            (cpu_delta / system_delta) * online_cpus * 100.0
        } else {
            0.0
        };

        let usage = stats.memory_stats.usage.unwrap_or(0) as f64;
        let limit = stats.memory_stats.limit.unwrap_or(0) as f64;
        let memory_pct = if limit > 0.0 {
            usage / limit * 100.0
        } else {
            0.0
        };

        Ok(ContainerStats { cpu_pct, memory_pct })
    }
}
