//! DX cluster ingest daemon - stream propagation spots into SQLite.

use anyhow::{Context, Result};
use clap::Parser;
use dxcluster::{
    client::ClusterClient,
    config::Config,
    db::{PersistenceWorker, open_database},
    dxcc::DxccResolver,
    parser::LineParser,
    queue::write_queue,
    stats::IngestStats,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, reload, util::SubscriberInitExt};

/// DX cluster ingest daemon - stream propagation spots into SQLite
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Callsign to use for cluster logins
    #[arg(short, long, env = "CLUSTER_CALLSIGN")]
    callsign: Option<String>,

    /// Path to the configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the DXCC prefix table (cty.csv)
    #[arg(long)]
    cty_file: Option<PathBuf>,

    /// Path to the SQLite spot database
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print statistics every N seconds (0 = never)
    #[arg(short, long)]
    stats_interval: Option<u64>,

    /// Maximum runtime in seconds (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_runtime: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(callsign) = args.callsign {
        config.callsign = callsign;
    }
    if let Some(cty_file) = args.cty_file {
        config.cty_file = cty_file;
    }
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if let Some(stats_interval) = args.stats_interval {
        config.stats_interval = stats_interval;
    }
    config.validate()?;

    // Initialize logging behind a reload handle so verbosity can be flipped
    // at runtime without a restart.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let (filter_layer, reload_handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    info!("dxcluster starting...");
    info!("Callsign: {}", config.callsign);
    info!("Servers: {}", config.servers.join(", "));
    info!("Database: {}", config.db_path.display());

    let resolver = DxccResolver::from_path(&config.cty_file)
        .context("failed to load DXCC prefix table")?;
    info!("{} DXCC prefixes loaded", resolver.len());

    let stats = Arc::new(IngestStats::new());
    let conn = open_database(
        &config.db_path,
        Duration::from_secs(config.db_busy_timeout),
    )?;

    // The worker is the sole owner of the connection; it drains the queue
    // on its own blocking thread and exits when the last sender drops.
    let (queue, queue_rx) = write_queue(config.queue_capacity, Arc::clone(&stats));
    let worker = PersistenceWorker::new(conn, queue_rx, Arc::clone(&stats));
    let worker_handle = std::thread::spawn(move || worker.run());

    // Shutdown plumbing: the network task stops opening connections, the
    // queue closes behind it, and in-flight batches are allowed to finish.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Shutdown signal received");
        let _ = shutdown_tx_clone.send(true);
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let shutdown_tx_clone = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut term =
                signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
            term.recv().await;
            info!("SIGTERM received");
            let _ = shutdown_tx_clone.send(true);
        });

        // SIGUSR1 flips between the configured level and debug at runtime.
        let log_level = args.log_level.clone();
        tokio::spawn(async move {
            let mut usr1 =
                signal(SignalKind::user_defined1()).expect("Failed to install SIGUSR1 handler");
            let mut debug = false;
            while usr1.recv().await.is_some() {
                debug = !debug;
                let directive = if debug { "debug" } else { log_level.as_str() };
                match reload_handle.reload(EnvFilter::new(directive)) {
                    Ok(()) => info!("log level now {directive}"),
                    Err(err) => warn!("failed to reload log filter: {err}"),
                }
            }
        });
    }

    if args.max_runtime > 0 {
        let shutdown_tx_clone = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(args.max_runtime)).await;
            info!("Max runtime reached");
            let _ = shutdown_tx_clone.send(true);
        });
    }

    if config.stats_interval > 0 {
        let stats_clone = Arc::clone(&stats);
        let stats_interval = config.stats_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(stats_interval));
            interval.tick().await;
            loop {
                interval.tick().await;
                println!("\n{}", stats_clone.summary());
            }
        });
    }

    let client = ClusterClient::new(
        config.cluster_config(),
        LineParser::new(resolver),
        queue,
        Arc::clone(&stats),
    );
    client.run(shutdown_rx).await;

    info!("waiting for pending writes to flush");
    if worker_handle.join().is_err() {
        warn!("persistence worker panicked");
    }

    // Final statistics
    println!("\n{}", stats.summary());

    Ok(())
}
