//! tus Server
//!
//! A resumable upload server speaking tus 1.0.0 with the creation,
//! checksum and expiration extensions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tus_server::config::Config;
use tus_server::routes;
use tus_server::state::AppState;
use tus_server::upload::{
    EngineSettings, KvStore, LocalFileSink, LogNotifier, MemoryKvStore, SqliteKvStore,
    UploadEngine,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "tus_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting tus server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Upload directory: {}", config.storage.upload_dir.display());

    // Session store
    let kv: Arc<dyn KvStore> = if config.uses_memory_store() {
        tracing::info!("Using in-memory session store");
        Arc::new(MemoryKvStore::new())
    } else {
        let store = SqliteKvStore::connect(&config.database.url)
            .await
            .context("Failed to initialize session database")?;
        tracing::info!("Session database initialized at {}", config.database.url);
        Arc::new(store)
    };

    tokio::fs::create_dir_all(&config.storage.upload_dir)
        .await
        .context("Failed to create upload directory")?;

    let engine = UploadEngine::new(
        kv,
        Arc::new(LocalFileSink::new(config.storage.upload_dir.clone())),
        Arc::new(LogNotifier),
        EngineSettings {
            max_size: config.upload.max_size,
            base_url: config.uploads_url(),
        },
    );

    let cleanup = engine
        .clone()
        .start_cleanup_task(Duration::from_secs(config.upload.cleanup_interval_secs.max(1)));

    let app = routes::router(AppState::new(config.clone(), engine));

    // Start server with graceful shutdown
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid SERVER_HOST/SERVER_PORT")?;
    tracing::info!("tus server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    cleanup.abort();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
