use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use lamport_mutex::{
    audit::{self, AuditLog},
    cli::{Cli, Command},
    config::ClusterConfig,
    message::NodeId,
    node::{self, Node, NodeConfig, SHARED_LOG},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Node(args) => {
            let config = ClusterConfig::load(&args.config)?;
            run_node(&config, args.id).await?;
        }
        Command::Cluster(args) => {
            let config = ClusterConfig::load(&args.config)?;
            run_cluster(&config).await?;
        }
        Command::Audit(args) => run_audit(&args.path)?,
    }

    Ok(())
}

async fn run_node(config: &ClusterConfig, id: NodeId) -> Result<()> {
    let node_config = NodeConfig::from_cluster(config, id)?;
    let listener = node::bind(&node_config.directory, id).await?;
    info!(node = id, addr = %listener.local_addr()?, "node listening");

    let node = Node::start(node_config).await?;
    node.run_until(listener, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to listen for ctrl-c");
        }
    })
    .await
}

/// Runs all nodes in one process. Every listener is bound before any node
/// starts so that no node waits on a peer that is merely slow to bind.
async fn run_cluster(config: &ClusterConfig) -> Result<()> {
    let directory = config.directory()?;
    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;
    AuditLog::reset(log_dir.join(SHARED_LOG))?;

    let mut listeners = Vec::with_capacity(directory.len());
    for id in directory.ids() {
        listeners.push((id, node::bind(&directory, id).await?));
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut tasks = Vec::with_capacity(listeners.len());
    for (id, listener) in listeners {
        let node = Node::start(NodeConfig::from_cluster(config, id)?).await?;
        let mut stop_rx = stop_rx.clone();
        tasks.push((
            id,
            tokio::spawn(node.run_until(listener, async move {
                let _ = stop_rx.wait_for(|stop| *stop).await;
            })),
        ));
    }
    info!(nodes = tasks.len(), log_dir = %log_dir.display(), "cluster running, ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    let _ = stop_tx.send(true);

    for (id, task) in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(node = id, error = ?err, "node exited with error"),
            Err(err) => warn!(node = id, error = ?err, "node task failed"),
        }
    }

    match audit::verify_file(&log_dir.join(SHARED_LOG)) {
        Ok(summary) => info!(sections = summary.sections.len(), "audit log consistent"),
        Err(err) => warn!(error = ?err, "audit log check failed"),
    }
    Ok(())
}

fn run_audit(path: &Path) -> Result<()> {
    let summary = audit::verify_file(path)?;
    let mut nodes: Vec<NodeId> = summary.sections.iter().map(|(node, _, _)| *node).collect();
    nodes.sort_unstable();
    nodes.dedup();

    println!("{} critical sections, no overlap", summary.sections.len());
    for node in nodes {
        println!("node {node}: {}", summary.count_for(node));
    }
    Ok(())
}
