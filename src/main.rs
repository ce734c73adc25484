use clap::Parser;
use shardline::config::NodeArgs;
use shardline::node::ClusterNode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = NodeArgs::parse().into_config()?;

    tracing::info!("Starting node {}", config.node_id);
    if config.peers.is_empty() {
        tracing::info!("No peers configured; starting as the first node");
    } else {
        tracing::info!("Peers: {:?}", config.peers);
    }

    let node = ClusterNode::start(config).await?;
    tracing::info!(
        "Node {} ready: clients on {}, peers on {}",
        node.local_id(),
        node.client_addr(),
        node.replication_addr()
    );
    tracing::info!("Press Ctrl+C to shutdown");

    tokio::signal::ctrl_c().await?;
    node.shutdown();

    Ok(())
}
