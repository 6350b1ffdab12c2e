//! txnsvc - Transaction record service
//!
//! Serves create, update, get and delete over transaction records kept in
//! PostgreSQL.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use txnsvc_server::{load_dotenv, run_metrics_server, Config, Metrics, Server, ServerConfig};
use txnsvc_store::{PgStore, SchemaMode, TransactionStore};

#[derive(Parser)]
#[command(name = "txnsvc")]
#[command(about = "Transaction record service over PostgreSQL")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides PORT and the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// YAML configuration file
    #[arg(short, long, env = "TXNSVC_CONFIG")]
    config: Option<PathBuf>,

    /// Drop and recreate the accounts table at startup
    #[arg(long)]
    reset_schema: bool,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Startup and serve failures are logged; the process still exits normally.
    if let Err(e) = run(args).await {
        tracing::error!("{}", e);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    match load_dotenv(None) {
        Ok(Some(path)) => tracing::info!("Loaded environment from {}", path.display()),
        Ok(None) => tracing::debug!("No .env file found"),
        Err(e) => tracing::warn!("{}", e),
    }

    let mut config = match args.config {
        Some(ref path) => {
            let config = Config::load_from(path)
                .map_err(|e| format!("Failed to load config: {}", e))?;
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => Config::load().map_err(|e| format!("Failed to load config: {}", e))?,
    };

    if let Some(port) = args.port {
        config.network.bind_addr.set_port(port);
    }
    if args.reset_schema {
        config.database.schema_mode = SchemaMode::Reset;
    }

    tracing::info!("Starting txnsvc server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  Database pool: {} connection(s), {}s acquire timeout",
        config.database.max_connections,
        config.database.connect_timeout_secs
    );
    tracing::info!("  Schema mode: {}", config.database.schema_mode);
    if config.database.schema_mode.is_destructive() {
        tracing::warn!("  Existing records will be dropped");
    }

    let store = PgStore::connect(&config.database.store_config())
        .await
        .map_err(|e| format!("Failed to connect to database: {}", e))?;
    tracing::info!("Connected to database");

    store
        .prepare(config.database.schema_mode)
        .await
        .map_err(|e| format!("Failed to initialize table: {}", e))?;
    tracing::info!("Table initialized");

    let store: Arc<dyn TransactionStore> = Arc::new(store);

    let (metrics_shutdown, _) = broadcast::channel::<()>(1);
    let mut server_config = ServerConfig::new(config.network.bind_addr)
        .with_idle_timeout(config.network.idle_timeout())
        .with_max_connections(config.network.max_connections)
        .with_max_in_flight(config.network.max_in_flight);

    if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());

        let addr = config.metrics.bind_addr;
        let shutdown = metrics_shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        });
        tracing::info!("  Metrics: enabled on {}", addr);
    } else {
        tracing::info!("  Metrics: disabled");
    }

    let server = Arc::new(Server::new(server_config, store.clone()));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    let shutdown_metrics = metrics_shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
        let _ = shutdown_metrics.send(());
    });

    // Run server (blocks until shutdown)
    let result = server.run().await;

    let _ = metrics_shutdown.send(());
    store.close().await;

    result.map_err(|e| format!("Failed to serve: {}", e))?;
    tracing::info!("Server stopped");
    Ok(())
}
