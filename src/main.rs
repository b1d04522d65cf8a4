use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tracelens::api::rate_limit;
use tracelens::config::Config;
use tracelens::engine::{maintenance, AnalysisEngine};
use tracelens::AppState;

#[derive(Parser, Debug)]
#[command(name = "tracelens")]
#[command(author, version, about = "Privacy analysis backend for social media profiles", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "tracelens.toml")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config)?;

    // Initialize logging
    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting TraceLens v{}", env!("CARGO_PKG_VERSION"));

    // Ensure data directory exists
    std::fs::create_dir_all(&config.server.data_dir)?;

    // Initialize database
    let db = tracelens::db::init(&config.server.data_dir).await?;

    // Metrics recorder
    let metrics_handle = tracelens::api::metrics::init_metrics()?;

    // Create analysis job channel
    let (analysis_tx, analysis_rx) = mpsc::channel(100);

    // Create app state
    let state = Arc::new(
        AppState::new(config.clone(), db.clone(), analysis_tx.clone())
            .with_metrics(metrics_handle),
    );

    // Start the analysis engine
    let engine = AnalysisEngine::new(db.clone(), analysis_rx);
    tokio::spawn(async move {
        engine.run().await;
    });

    // Pick up sessions left behind by the previous run
    tracelens::engine::recover_interrupted(&db, &analysis_tx).await?;

    // Background maintenance
    maintenance::spawn_sweep_task(db.clone(), config.retention.clone());
    maintenance::spawn_deep_cleanup_task(db.clone(), config.retention.clone());
    rate_limit::spawn_cleanup_task(
        state.rate_limiter.clone(),
        config.rate_limit.cleanup_interval,
    );
    {
        let tracker = state.login_tracker.clone();
        let interval = config.rate_limit.cleanup_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
                tracker.cleanup_expired();
            }
        });
    }

    // Create API router
    let app = tracelens::api::create_router(state);

    // Start API server
    let api_addr = format!("{}:{}", config.server.host, config.server.api_port);
    let listener = tokio::net::TcpListener::bind(&api_addr).await?;

    tracing::info!("API server listening on http://{}", api_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
