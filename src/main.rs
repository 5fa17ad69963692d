//! Daybreak CLI
//!
//! A distributed exact nearest-neighbor search engine.
//!
//! # Usage
//!
//! ```bash
//! # Start the master (worker listener + HTTP front-end)
//! daybreak master --port 9876 --http 127.0.0.1:8080
//!
//! # Start a worker and point it at the master
//! daybreak worker --master 127.0.0.1:9876 --data points.tsv
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use daybreak::master::{Master, MasterConfig};
use daybreak::server::{self, AppState};
use daybreak::worker::{Worker, WorkerConfig};

#[derive(Parser)]
#[command(name = "daybreak")]
#[command(about = "A distributed exact nearest-neighbor search engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the master: worker listener plus HTTP front-end
    Master {
        /// Host the worker listener binds
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port workers register on
        #[arg(short, long, default_value = "9876")]
        port: u16,

        /// Address of the HTTP front-end
        #[arg(long, default_value = "127.0.0.1:8080")]
        http: SocketAddr,

        /// Per-query deadline in milliseconds; afterwards the query
        /// finalizes with whatever partial results arrived
        #[arg(long, default_value = "30000")]
        query_deadline_ms: u64,
    },

    /// Run a shard-holding worker
    Worker {
        /// Master address, host:port
        #[arg(short, long)]
        master: String,

        /// Shard file loaded at startup and rewritten on shutdown
        #[arg(short, long)]
        data: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Master {
            host,
            port,
            http,
            query_deadline_ms,
        } => {
            let bind_addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .context("invalid worker listener address")?;
            let master = Master::bind(MasterConfig {
                bind_addr,
                query_deadline: Duration::from_millis(query_deadline_ms),
            })
            .context("binding worker listener")?;
            tracing::info!("master listening for workers on {}", master.local_addr());
            master.start().context("starting accept loop")?;

            let state = Arc::new(AppState::new(Arc::clone(&master)));
            let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
            runtime
                .block_on(server::serve(state, http))
                .context("running http front-end")?;

            master.shutdown();
        }
        Commands::Worker { master, data } => {
            let mut worker = Worker::new(WorkerConfig {
                master_addr: master,
                data_path: data,
            })
            .context("initializing worker")?;
            worker.run().context("running worker")?;
        }
    }

    Ok(())
}
