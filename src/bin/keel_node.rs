//! keel-node: one partition of a keel cluster
//!
//! Runs the log dispatcher, the engine's stream processor and the cluster
//! messaging transport in a single process. Other members submit commands
//! on the `command` subject.
//!
//! ## Configuration
//! ```yaml
//! dispatcher:
//!   partition_size: 4194304
//!   mode: pipeline
//!
//! processing:
//!   partition_id: 1
//!   snapshot_path: /var/lib/keel/partition-1.json
//!
//! messaging:
//!   cluster_id: production
//!   host: 10.0.0.1
//!   port: 26502
//!   compression: lz4
//!
//! node:
//!   export_records: true
//!   peers: ["10.0.0.2:26502", "10.0.0.3:26502"]
//! ```
//!
//! The configuration file is given as the first argument or through
//! `KEEL_CONFIG`. Any key can be overridden as `KEEL__SECTION__KEY`.

use tracing::{error, info};

use keel::config::Config;
use keel::node::Node;
use keel::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref()).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    let node = Node::start(config).await?;

    let reachable = node.ping_peers().await;
    info!(peers = reachable.len(), "keel-node running, press Ctrl+C to exit");

    tokio::signal::ctrl_c().await?;

    node.shutdown().await?;
    Ok(())
}
