//! Entry point: configuration, router assembly, graceful shutdown.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use opsnotebook_server::{api_router, AppState, Config, TargetManager};

/// OpsNotebook backend: supervises tunnel drivers and proxies client traffic
/// through them.
#[derive(Parser)]
#[command(name = "opsnotebook-server", version)]
struct Cli {
    /// Path to the JSON config file (the CONFIG_PATH environment variable
    /// wins when set).
    #[arg(long, default_value = "config.json")]
    config: String,
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:12808")]
    listen: String,
    /// Directory of UI assets served at `/` (STATIC_DIR wins when set).
    #[arg(long, default_value = "./static")]
    static_dir: String,
    /// tracing filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("opsnotebook-server v{} starting", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::var("CONFIG_PATH").unwrap_or(cli.config);
    let pattern = std::env::var("TARGET_PATTERN").unwrap_or_default();
    let static_dir = std::env::var("STATIC_DIR").unwrap_or(cli.static_dir);

    let config = match Config::load_with_pattern(&config_path, &pattern) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    if !pattern.is_empty() {
        info!(
            "filtered targets with pattern {pattern:?}: {} targets loaded",
            config.targets.len()
        );
    }

    let manager = TargetManager::new(&config);

    // Bring targets up in the background; the API serves `connecting` states
    // in the meantime.
    {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager.connect_all().await;
        });
    }

    let state = AppState {
        manager: Arc::clone(&manager),
    };
    let app = api_router(state)
        .fallback_service(ServeDir::new(&static_dir))
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&cli.listen)
        .await
        .expect("failed to bind");
    info!("OpsNotebook backend running on {}", cli.listen);

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("server error");

    // Terminate every driver process group before the process exits.
    info!("shutting down...");
    manager.shutdown().await;
    info!("goodbye");
}
