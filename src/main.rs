use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use registry_proxy::cache::{CacheConfig, CacheManager};
use registry_proxy::config::Config;
use registry_proxy::server;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "registry-proxy",
    about = "Caching reverse proxy for the OCI/Docker Registry V2 API",
    version
)]
struct Cli {
    /// Probe the local /health endpoint and exit non-zero on failure
    #[arg(long)]
    health_check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(Config::from_env());

    let default_filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    if cli.health_check {
        return health_check(config.port).await;
    }

    let cache = CacheManager::new(CacheConfig {
        dir: config.cache_dir.clone(),
        manifest_ttl: config.manifest_ttl,
        blob_ttl: config.blob_ttl,
        debug: config.debug,
        ..CacheConfig::default()
    })?;

    server::run_server(config, cache).await
}

/// In-process probe used by container health checks.
async fn health_check(port: u16) -> Result<()> {
    let url = format!("http://localhost:{port}/health");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()?;

    match client.get(&url).send().await {
        Ok(response) if response.status().is_success() => {
            eprintln!("Health check passed");
            Ok(())
        }
        Ok(response) => {
            eprintln!("Health check failed: status code {}", response.status());
            std::process::exit(1);
        }
        Err(error) => {
            eprintln!("Health check failed: {error}");
            std::process::exit(1);
        }
    }
}
