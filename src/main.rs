//! # globaldb
//!
//! Runs a cluster of in-process replicas over a simulated gossip network,
//! writes concurrently (optionally across a partition), heals and reports
//! whether every replica converged to the same state.

use clap::Parser;
use simulation::{SimulationConfig, SimulationReport};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod simulation;

#[derive(Parser)]
#[command(name = "globaldb")]
#[command(about = "Replicated key-value store simulation over a Merkle-DAG of delta-CRDTs")]
#[command(version)]
struct Cli {
    /// Number of replicas
    #[arg(short = 'n', long, default_value_t = 4)]
    replicas: usize,

    /// Operations issued by each replica
    #[arg(short, long, default_value_t = 200)]
    writes: usize,

    /// Size of the key space
    #[arg(short, long, default_value_t = 50)]
    keys: usize,

    /// Share of operations that are deletes
    #[arg(long, default_value_t = 0.1)]
    delete_ratio: f64,

    /// Split the cluster in two while writing
    #[arg(short, long)]
    partition: bool,

    /// Head rebroadcast interval in milliseconds
    #[arg(long, default_value_t = 200)]
    rebroadcast_ms: u64,

    /// Seconds to wait for convergence
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Seed for the generated workload
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "globaldb=debug" } else { "globaldb=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = SimulationConfig {
        replicas: cli.replicas,
        writes_per_replica: cli.writes,
        keys: cli.keys,
        delete_ratio: cli.delete_ratio,
        partition: cli.partition,
        rebroadcast_interval: Duration::from_millis(cli.rebroadcast_ms.max(1)),
        timeout: Duration::from_secs(cli.timeout),
        seed: cli.seed,
    };

    match simulation::run(config).await {
        Ok(report) => finish(report),
        Err(err) => {
            tracing::error!(error = %err, "simulation failed");
            ExitCode::FAILURE
        }
    }
}

fn finish(report: SimulationReport) -> ExitCode {
    report.print();
    if report.converged {
        println!("\n✓ All replicas converged");
        ExitCode::SUCCESS
    } else {
        println!("\n✗ Replicas diverged");
        ExitCode::FAILURE
    }
}
