//! Node bootstrap and lifecycle.
//!
//! Wires the store, drivers, prober, manager, autoscaler, coordinator and
//! control loop together, serves the API, and tears everything down in
//! order on SIGINT/SIGTERM: cancel background tasks, release the lease,
//! mark the node stopped.

use std::sync::Arc;

use anyhow::Context as _;
use futures::FutureExt;
use orchestry_runtime::{
    AppManager, Autoscaler, ControlLoop, CoordinatorConfig, DockerDriver, HealthProber, Hooks,
    LeaderCoordinator, NginxConfig, NginxDriver, ProxyDriver, RuntimeDriver, UpstreamPublisher,
    DEFAULT_NETWORK, MONITOR_INTERVAL,
};
use orchestry_store::{AppStore, AuditStore, CoordinationStore, Store};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    api::{self, ApiState},
    config::Config,
};

/// A fully wired controller process.
pub struct Node {
    config: Config,
    state: ApiState,
    coordinator: Arc<LeaderCoordinator>,
    manager: Arc<AppManager>,
    control: Arc<ControlLoop>,
    prober: Arc<HealthProber>,
    cancel: CancellationToken,
}

impl Node {
    /// Connect to Postgres and Docker and assemble every component.
    pub async fn bootstrap(config: Config) -> anyhow::Result<Self> {
        let store = Store::connect(&config.postgres)
            .await
            .context("connecting to postgres")?;
        store.migrate().await.context("ensuring schema")?;
        let store = Arc::new(store);

        let docker =
            bollard::Docker::connect_with_local_defaults().context("connecting to docker")?;
        let runtime: Arc<dyn RuntimeDriver> = Arc::new(DockerDriver::from_client(docker.clone()));
        let proxy: Arc<dyn ProxyDriver> = Arc::new(NginxDriver::new(
            docker,
            NginxConfig {
                container: config.nginx_container.clone(),
                status_url: config.status_url(),
            },
        ));
        let publisher = Arc::new(UpstreamPublisher::new(
            config.nginx_conf_dir.clone(),
            proxy.clone(),
        ));

        let coordinator = LeaderCoordinator::new(
            CoordinatorConfig::new(
                config.node_id.clone(),
                config.hostname.clone(),
                config.port,
                config.api_url(),
            ),
            store.clone() as Arc<dyn CoordinationStore>,
            Hooks {
                on_become_leader: Some(Arc::new(|term| {
                    tracing::info!(term, "this node is now the leader");
                })),
                on_lose_leadership: Some(Arc::new(|term| {
                    tracing::warn!(term, "this node lost leadership");
                })),
                on_cluster_change: Some(Arc::new(|members| {
                    tracing::info!(nodes = members.len(), "cluster membership changed");
                })),
            },
        )
        .context("building leader coordinator")?;
        let leadership = coordinator.subscribe();

        let prober = Arc::new(HealthProber::new());
        let autoscaler = Arc::new(Autoscaler::new());
        let manager = AppManager::new(
            store.clone() as Arc<dyn AppStore>,
            store.clone() as Arc<dyn AuditStore>,
            runtime,
            prober.clone(),
            publisher,
            leadership.clone(),
            DEFAULT_NETWORK.to_string(),
        );
        let control = ControlLoop::new(
            store.clone() as Arc<dyn AppStore>,
            store.clone() as Arc<dyn AuditStore>,
            manager.clone(),
            autoscaler.clone(),
            proxy,
            leadership.clone(),
        );

        // Probe flips feed back into upstream publishing through a channel;
        // the prober never calls the manager directly.
        let (flip_tx, mut flip_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        prober.set_on_change(Arc::new(move |container_id, _healthy| {
            let _ = flip_tx.send(container_id);
        }));
        let republisher = manager.clone();
        tokio::spawn(async move {
            while let Some(container_id) = flip_rx.recv().await {
                republisher.on_health_change(&container_id).await;
            }
        });

        let state = ApiState {
            apps: store.clone() as Arc<dyn AppStore>,
            audit: store.clone() as Arc<dyn AuditStore>,
            cluster: store as Arc<dyn CoordinationStore>,
            manager: manager.clone(),
            autoscaler,
            prober: prober.clone(),
            leadership,
            node_id: config.node_id.clone(),
        };

        Ok(Self {
            config,
            state,
            coordinator,
            manager,
            control,
            prober,
            cancel: CancellationToken::new(),
        })
    }

    /// Spawn the background tasks and serve the API until shutdown.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut tasks: Vec<JoinHandle<()>> =
            self.coordinator.clone().spawn(self.cancel.clone());
        tasks.push(tokio::spawn(
            self.prober.clone().run(self.cancel.clone()),
        ));
        tasks.push(tokio::spawn(
            self.control.clone().run(self.cancel.clone()),
        ));

        // Replica monitor: inspect, replace, top up.
        let manager = self.manager.clone();
        let monitor_cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(MONITOR_INTERVAL);
            loop {
                tokio::select! {
                    () = monitor_cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let pass = std::panic::AssertUnwindSafe(manager.monitor_tick());
                        if pass.catch_unwind().await.is_err() {
                            tracing::error!("replica monitor panicked");
                        }
                    }
                }
            }
        }));

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr())
            .await
            .with_context(|| format!("binding {}", self.config.bind_addr()))?;
        tracing::info!(
            addr = %self.config.bind_addr(),
            node = %self.config.node_id,
            "orchestry API listening"
        );

        let shutdown = self.cancel.clone();
        axum::serve(listener, api::router(self.state))
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                shutdown.cancel();
            })
            .await
            .context("serving API")?;

        tracing::info!("shutting down");
        self.cancel.cancel();
        self.coordinator.shutdown().await;
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("installing SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
