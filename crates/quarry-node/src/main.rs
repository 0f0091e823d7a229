//! Quarry simulation binary
//!
//! Runs a prey and a handful of players in one process against an
//! in-process registrar, each taking random steps.

use std::sync::Arc;
use std::time::Duration;

use quarry_node::node::env_or;
use quarry_node::{Direction, LocalRegistrar, MoveOutcome, Node, NodeConfig, NodeHandle};
use rand::seq::SliceRandom;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn random_walk(node: Arc<NodeHandle>, steps: usize) {
    for _ in 0..steps {
        let direction = *Direction::ALL
            .choose(&mut rand::thread_rng())
            .unwrap_or(&Direction::Up);
        match node.submit(direction).await {
            Ok(MoveOutcome::Accepted(at)) => tracing::debug!(id = node.id(), %at, "moved"),
            Ok(other) => tracing::debug!(id = node.id(), ?other, "move not applied"),
            Err(e) => {
                tracing::warn!(id = node.id(), "stopping walk: {}", e);
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quarry_sim=info,quarry_node=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let players: usize = env_or("QUARRY_SIM_PLAYERS", 3);
    let steps: usize = env_or("QUARRY_SIM_STEPS", 40);
    tracing::info!(players, steps, "Starting Quarry simulation");

    let registrar = Arc::new(LocalRegistrar::default());
    let mut nodes = vec![Arc::new(
        Node::start(NodeConfig::default().prey(), registrar.clone()).await?,
    )];
    for _ in 0..players {
        nodes.push(Arc::new(
            Node::start(NodeConfig::default(), registrar.clone()).await?,
        ));
    }

    let walks: Vec<_> = nodes
        .iter()
        .map(|node| tokio::spawn(random_walk(Arc::clone(node), steps)))
        .collect();
    for walk in walks {
        walk.await?;
    }

    for node in &nodes {
        let view = node.view().borrow().clone();
        tracing::info!(id = node.id(), score = view.score, "final view: {}", view.to_json()?);
    }

    for node in nodes {
        if let Ok(node) = Arc::try_unwrap(node) {
            node.shutdown().await;
        }
    }
    Ok(())
}
