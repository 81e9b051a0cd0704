use anyhow::Context;
use clap::Parser;
use rcached::backend::InMemoryCache;
use rcached::{CacheServer, Locator, ServerConfig};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rcached")]
#[command(about = "External cache manager for content-addressed filesystem clients", long_about = None)]
struct Cli {
    /// Endpoint locator, `unix=<path>` or `tcp=<host>:<port>`
    #[arg(long)]
    locator: String,

    /// Name advertised to clients in the handshake
    #[arg(long, default_value = "rcached")]
    name: String,

    /// Upper bound for read sizes and store part payloads, in bytes
    #[arg(long, default_value_t = common::DEFAULT_MAX_OBJECT_SIZE)]
    max_object_size: usize,

    /// In-memory cache capacity, in bytes
    #[arg(long, default_value_t = 1 << 30)]
    capacity: u64,

    /// Worker count handed to the backend; request handling stays single-threaded
    #[arg(long, default_value_t = 0)]
    workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let locator: Locator = cli.locator.parse().context("cannot parse locator")?;

    let backend = Arc::new(InMemoryCache::new(cli.capacity));
    let config = ServerConfig {
        name: cli.name,
        max_object_size: cli.max_object_size,
        num_workers: cli.workers,
        ..Default::default()
    };
    let server = CacheServer::bind(config, backend, &locator).await?;
    info!("listening on {locator}");

    let terminator = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, terminating");
            terminator.terminate();
        }
    });

    let detacher = server.handle();
    let mut usr1 = signal(SignalKind::user_defined1()).context("cannot install SIGUSR1 handler")?;
    tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            info!("received SIGUSR1, asking clients to detach");
            detacher.ask_to_detach();
        }
    });

    server.run().await
}
