pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use log::warn;
use tokio::net::TcpListener;

use crate::cache::CacheManager;
use crate::config::Config;
use crate::upstream::UpstreamClient;

use state::AppState;

pub async fn run_server(config: Arc<Config>, cache: Arc<CacheManager>) -> Result<()> {
    let upstream = UpstreamClient::new(&config)?;
    let state = AppState {
        config: config.clone(),
        cache: cache.clone(),
        upstream,
        start_time: Instant::now(),
    };

    let router = routes::build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;

    eprintln!("Registry proxy listening on {addr}");
    eprintln!("  Custom domain: {}", config.custom_domain);
    eprintln!("  Cache directory: {}", config.cache_dir.display());
    eprintln!("  Cache enabled: {}", config.cache_enabled);
    eprintln!("  Debug mode: {}", config.debug);
    if config.debug {
        eprintln!("  Available routes:");
        for (host, upstream) in &config.routes {
            eprintln!("    {host} -> {upstream}");
        }
    }

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cache.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!("Failed to install SIGTERM handler: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    eprintln!("\nShutting down...");
}
