use std::sync::Arc;

use clap::Parser;
use linkcache_core::{HttpLinkBackend, LinkBackend, LinkCacheConfig, SessionStore};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use linkcache_server::subsystems::sync::SyncOrchestrator;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "linkcache.toml")]
    config: String,

    /// Validate the config and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match LinkCacheConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.service.log_level.clone()));
    fmt().with_env_filter(filter).init();

    if args.check {
        println!("✅ Config OK: backend {}", config.backend.base_url);
        println!(
            "✅ Store: max entry age {}s, sweep every {}s",
            config.store.max_entry_age_seconds, config.store.sweep_interval_seconds
        );
        return Ok(());
    }

    let backend: Arc<dyn LinkBackend> = match HttpLinkBackend::new(&config.backend) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            eprintln!("Failed to build session service client: {}", e);
            std::process::exit(1);
        }
    };
    let store = Arc::new(SessionStore::new());
    let orchestrator = Arc::new(SyncOrchestrator::from_config(store.clone(), backend, &config));

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    tokio::spawn(linkcache_server::subsystems::sweep::run_sweep_loop(
        store,
        config.store.clone(),
        tx.subscribe(),
    ));

    linkcache_server::http::start_http_server(orchestrator, config, tx.subscribe()).await?;

    Ok(())
}
