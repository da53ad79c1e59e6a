use tracing_subscriber::EnvFilter;

use orchestry::{Config, Node};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        node = %config.node_id,
        hostname = %config.hostname,
        "starting orchestry controller"
    );

    let node = Node::bootstrap(config).await?;
    node.run().await
}
