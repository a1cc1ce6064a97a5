//! Battlefield messaging fabric -- runnable server.
//!
//! Brings up the session hub over a WebSocket listener, seeds an optional
//! demo topology, and runs until Ctrl-C, cancelling outstanding mining and
//! scheduled-recovery tasks before exiting.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sainya_fabric::fabric::FabricConfig;
use sainya_fabric::registry::{Node, Position};
use sainya_fabric::Fabric;

#[derive(Parser)]
#[command(name = "sainya-fabric", version, about = "Battlefield messaging fabric")]
struct Args {
    /// Address the session hub listens on.
    #[arg(long, default_value = "127.0.0.1:8765")]
    bind: SocketAddr,

    /// Data directory for the per-node ledgers.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Proof-of-work mining difficulty (leading zero hex chars).
    #[arg(long, default_value_t = sainya_fabric::block::DEFAULT_DIFFICULTY)]
    difficulty: u32,

    /// P2P adjacency radius, abstract units.
    #[arg(long, default_value_t = sainya_fabric::registry::DEFAULT_P2P_RANGE)]
    p2p_range: f64,

    /// Max hops for a normal P2P flood.
    #[arg(long, default_value_t = 5)]
    max_hops: u32,

    /// Max hops for the scripted demo flood.
    #[arg(long, default_value_t = 3)]
    demo_flood_hops: u32,

    /// Seed a fixed 5-node demo topology on startup.
    #[arg(long)]
    demo: bool,
}

/// Seeds the fixed demo topology: 5 named nodes at abstract-plane
/// coordinates, mirroring the scenarios in §8 of the specification.
async fn seed_demo_topology(fabric: &Fabric) -> sainya_fabric::Result<()> {
    let roster = [
        ("alpha_1", "Alpha One", "SGT", "1st Squad", 0.0, 0.0),
        ("bravo_1", "Bravo One", "CPL", "1st Squad", 150.0, 0.0),
        ("charlie_1", "Charlie One", "PVT", "2nd Squad", 300.0, 0.0),
        ("delta_1", "Delta One", "LT", "Command", 700.0, 0.0),
        ("echo_1", "Echo One", "SGT", "2nd Squad", 300.0, 150.0),
    ];
    for (id, name, rank, unit, x, y) in roster {
        let node = Node::new(id, name, rank, unit, Position { x, y })?;
        fabric.registry.insert(node).await;
    }
    info!(count = roster.len(), "seeded demo topology");
    Ok(())
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("sainya_fabric=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let fabric = match Fabric::new(FabricConfig {
        data_dir: args.data_dir,
        difficulty: args.difficulty,
        p2p_range: args.p2p_range,
        max_hops: args.max_hops,
        demo_flood_hops: args.demo_flood_hops,
    }) {
        Ok(f) => Arc::new(f),
        Err(e) => {
            error!(error = %e, "fatal config error during startup");
            return std::process::ExitCode::from(2);
        }
    };

    if args.demo {
        if let Err(e) = seed_demo_topology(&fabric).await {
            error!(error = %e, "failed to seed demo topology");
            return std::process::ExitCode::from(2);
        }
    }

    let listener = match sainya_fabric::hub::bind(args.bind).await {
        Ok(l) => l,
        Err(e) => {
            error!(bind = %args.bind, error = %e, "failed to bind session hub");
            return std::process::ExitCode::from(1);
        }
    };

    let hub_fabric = fabric.clone();
    let hub_task = tokio::spawn(async move { sainya_fabric::hub::serve(hub_fabric, listener).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        result = hub_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "session hub exited with error");
                    return std::process::ExitCode::from(1);
                }
                Err(e) => {
                    error!(error = %e, "session hub task panicked");
                    return std::process::ExitCode::from(1);
                }
            }
        }
    }

    fabric.cancel.cancel();
    info!("shutdown complete");
    std::process::ExitCode::SUCCESS
}
