//! Scribe server: hosts plain-text documents for collaborative editing.
//!
//! Runs a `CollabServer` over RocksDB (or memory with `--in-memory`) and
//! flushes every open document on Ctrl-C.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use scribe_collab::disk::DiskConfig;
use scribe_collab::manager::ManagerConfig;
use scribe_collab::server::{CollabServer, ServerConfig};
use scribe_core::TextStep;

/// Collaborative document server
#[derive(Parser, Debug)]
#[command(name = "scribe-server", version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory
    #[arg(long, value_name = "PATH", default_value = "scribe_data")]
    data_dir: PathBuf,

    /// Keep documents in memory only
    #[arg(long)]
    in_memory: bool,

    /// Steps retained per document for pulls and rebasing
    #[arg(long, default_value_t = 10_000)]
    max_step_history: usize,

    /// Answer GetDocument for unknown names with 404 instead of creating them
    #[arg(long)]
    no_create: bool,

    /// Quiet period before a changed document is written, in milliseconds
    #[arg(long, default_value_t = 250)]
    debounce_ms: u64,

    /// Longest a changed document may stay unwritten, in milliseconds
    #[arg(long, default_value_t = 1000)]
    debounce_max_ms: u64,

    /// Seconds without requests before an instance is unloaded
    #[arg(long, default_value_t = 300)]
    idle_secs: u64,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            storage_path: (!self.in_memory).then(|| self.data_dir.clone()),
            manager: ManagerConfig {
                max_step_history: self.max_step_history,
                create_missing: !self.no_create,
                idle_timeout: Duration::from_secs(self.idle_secs),
                ..ManagerConfig::default()
            },
            disk: DiskConfig {
                debounce_wait: Duration::from_millis(self.debounce_ms),
                debounce_max_wait: Duration::from_millis(self.debounce_max_ms),
            },
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let server: CollabServer<TextStep> = match CollabServer::new(cli.server_config()) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open storage at {}: {e}", cli.data_dir.display());
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
    }

    if let Err(e) = server.shutdown().await {
        error!("Shutdown flush failed: {e}");
        std::process::exit(1);
    }
    let stats = server.manager().stats().await;
    info!(
        "Served {} pushes and {} pulls across {} documents",
        stats.pushes, stats.pulls, stats.instances
    );
}
