//! # Kafka Sentinel - Supervisor Entry Point
//!
//! Long-lived self-healing supervisor for Kafka + ZooKeeper clusters:
//! probes every configured node, runs recovery actions with bounded
//! retries when a node goes unhealthy, and alerts operators once
//! self-healing is exhausted.

use clap::Parser;
use kafka_sentinel::supervisor::Supervisor;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(
    name = "kafka-sentinel",
    version,
    about = "Self-healing supervisor for Kafka and ZooKeeper clusters"
)]
struct Cli {
    /// Path to the configuration file (default: discover
    /// config.yaml|yml|json|ini in the working directory)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Fatal error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let supervisor = Supervisor::initialize(cli.config.as_deref()).await?;
    supervisor.start().await?;

    // Blocks until SIGINT/SIGTERM or the internal error budget trips.
    supervisor.run().await?;
    supervisor.stop().await?;
    Ok(())
}
