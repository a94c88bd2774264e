//! `mitm-proxy` — a thin demonstration binary wiring the core library
//! together: load configuration, build a `CryptoEngine`, register the
//! built-in HTTP(S) handler and logging middleware, and run the
//! `ConnectionSupervisor` until interrupted.
//!
//! Grounded on the teacher's `main.rs` clap CLI shape; the MCP server and
//! hook-processing modes are out of scope for this core and are not
//! reproduced here.

use anyhow::{Context, Result};
use clap::Parser;
use mitm_core::{
    ConnectionSupervisor, CryptoEngine, HTTPProtocolHandler, LoggingMiddleware, MiddlewareChain,
    ProtocolRegistry, ProxyConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mitm-proxy")]
#[command(about = "Customizable MITM TCP proxy core", long_about = None)]
struct Cli {
    /// Path to a TOML config file; falls back to environment variables and
    /// defaults when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address override.
    #[arg(long)]
    host: Option<std::net::IpAddr>,

    /// Listen port override.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ProxyConfig::from_file(path).context("failed to load config file")?,
        None => ProxyConfig::from_env(),
    };
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let crypto = Arc::new(CryptoEngine::with_cache_size(&config.tls.cert_dir, config.tls.lru_max_size)?);
    tracing::info!(cert_dir = %config.tls.cert_dir.display(), "root CA ready");

    let http_handler = Arc::new(HTTPProtocolHandler::new(
        crypto,
        config.buffer_size,
        config.timeout(),
        config.keep_alive,
    ));
    let protocols = ProtocolRegistry::new(vec![http_handler]);
    let middlewares = MiddlewareChain::new(vec![Arc::new(LoggingMiddleware)]);

    let supervisor = Arc::new(ConnectionSupervisor::new(
        protocols,
        middlewares,
        config.timeout(),
        config.shutdown_grace(),
    ));

    let run_supervisor = supervisor.clone();
    let host = config.host;
    let port = config.port;
    let accept_loop = tokio::spawn(async move { run_supervisor.run(host, port).await });

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");
    supervisor.stop().await;

    match accept_loop.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "accept loop exited with error"),
        Err(e) => tracing::error!(error = %e, "accept loop task panicked"),
    }

    Ok(())
}
