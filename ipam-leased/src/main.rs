mod allocator;
mod api;
mod bindings;
mod cipher;
mod cleanup;
mod config;
mod engine;
mod error;
mod prefix_cache;
mod store;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::allocator::{Allocator, NetboxClient};
use crate::cipher::SivCipher;
use crate::cleanup::Reconciler;
use crate::config::Config;
use crate::engine::LeaseEngine;
use crate::prefix_cache::PrefixCache;
use crate::store::{AddressDb, StoreHandle};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ipam_leased=info"))
        )
        .init();

    tracing::info!("Starting ipam-leased");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/ipam-leased/config.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // Open SQLite database on its own thread
    let db = AddressDb::open(&config.store.db_path)?;
    tracing::info!("Opened database at {:?}", config.store.db_path);
    let store = StoreHandle::spawn(db);

    let key = config.cipher.resolve_key()?;
    let cipher = Arc::new(SivCipher::new(&key));

    let netbox = Arc::new(NetboxClient::new(&config.netbox)?);

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    let ready_retry = Duration::from_secs(config.netbox.ready_retry_secs);
    tokio::select! {
        ready = netbox.wait_until_ready(ready_retry, &cancel) => ready?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received before Netbox became ready");
            store.shutdown().await?;
            return Ok(());
        }
    }
    tracing::info!("Netbox at {} is ready", config.netbox.url);

    // Without a first snapshot nothing can be allocated
    let cache = Arc::new(PrefixCache::new());
    cache
        .refresh(netbox.as_ref())
        .await
        .context("Initial prefix cache refresh failed")?;

    let allocator: Arc<dyn Allocator> = netbox.clone();
    let engine = LeaseEngine::new(
        allocator.clone(),
        Arc::new(store.clone()),
        cache.clone(),
        cipher,
    );

    // Spawn cleanup worker
    let reconciler = Reconciler::new(Arc::new(store.clone()), allocator.clone());
    let cleanup_interval = Duration::from_secs(config.cleanup.interval_secs);
    let cleanup_cancel = cancel.clone();
    let cleanup_handle = tokio::spawn(async move {
        if let Err(e) = cleanup::run(reconciler, cleanup_interval, cleanup_cancel).await {
            tracing::error!("Cleanup worker error: {}", e);
        }
    });

    // Spawn cache refresher, if enabled
    let refresh_handle = match config.cache.refresh_interval_secs {
        0 => None,
        secs => {
            let refresh_cache = cache.clone();
            let refresh_allocator = allocator.clone();
            let refresh_cancel = cancel.clone();
            Some(tokio::spawn(async move {
                refresh_loop(refresh_cache, refresh_allocator, Duration::from_secs(secs), refresh_cancel).await
            }))
        }
    };

    // Build API router
    let app_state = api::routes::AppState {
        engine,
        cache: cache.clone(),
        max_retention_days: config.api.max_retention_days,
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Trigger cancellation
    cancel.cancel();

    // Wait for all tasks to complete
    let _ = tokio::join!(cleanup_handle, server_handle);
    if let Some(handle) = refresh_handle {
        let _ = handle.await;
    }

    // Shutdown store thread
    if let Err(e) = store.shutdown().await {
        tracing::error!("Failed to shutdown store: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Periodically rebuild the prefix cache. Failures keep the old snapshot.
async fn refresh_loop(
    cache: Arc<PrefixCache>,
    allocator: Arc<dyn Allocator>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; startup already refreshed
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = cache.refresh(allocator.as_ref()).await {
                    tracing::error!("Failed to refresh prefix cache: {:#}", e);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Cache refresher shutting down");
                break;
            }
        }
    }
}
