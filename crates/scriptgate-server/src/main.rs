//! Scriptgate Server
//!
//! Secure script delivery over HTTP and a real-time device command channel
//! over WebSocket.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};

use scriptgate_core::config::load_config;
use scriptgate_core::db::unix_timestamp;
use scriptgate_core::tracing_init::{LogFormat, init_tracing};

use scriptgate_server::api::{AppState, build_router};
use scriptgate_server::storage::ServerDatabase;

#[derive(Parser, Debug)]
#[command(name = "scriptgate-server")]
#[command(
    version,
    about = "Scriptgate server - secure script delivery and device command channel"
)]
struct Args {
    /// JSON settings file.
    #[arg(long, env = "SCRIPTGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the settings file).
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Path to SQLite database file.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("scriptgate_server=info", LogFormat::from_json_flag(args.log_json))
        .map_err(|e| anyhow::anyhow!("installing log subscriber: {e}"))?;

    let mut config = load_config(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.listen_addr = addr;
    }
    if let Some(path) = args.db_path {
        config.database_path = Some(path);
    }
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.listen_addr,
        "Starting scriptgate-server"
    );

    let db_path = config.resolved_database_path()?;
    info!(path = %db_path.display(), "Opening server database");
    let db = ServerDatabase::open(&db_path).await?;

    let stale = db.close_stale_connections().await?;
    if stale > 0 {
        info!(stale, "Closed connection rows left over from a previous run");
    }

    let state = AppState::new(&db, &config);

    // Background expiry sweep
    let tracker = state.tracker.clone();
    let sweep_every = config.expiry_sweep_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            match tracker.sweep_expired(unix_timestamp()).await {
                Ok(stats) if stats.deliveries > 0 || stats.instructions > 0 => {
                    info!(
                        deliveries = stats.deliveries,
                        instructions = stats.instructions,
                        "Expiry sweep completed"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Expiry sweep failed");
                }
                _ => {}
            }
        }
    });

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Server listening");

    tokio::select! {
        result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .into_future() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Server stopped");
    Ok(())
}
