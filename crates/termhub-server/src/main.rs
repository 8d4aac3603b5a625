//! Container terminal session server.
//!
//! Run with: cargo run -p termhub-server -- --config termhub.toml
//!
//! Sessions are opened over HTTP (`POST /api/sessions`) and streamed over
//! `ws://<host>:<port>/ws/{session_id}`.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use termhub_core::{Config, ContainerRuntime, runtime::MemoryRuntime};
use termhub_pty::{DockerExecRuntime, DockerSettings};
use termhub_transport::{AppContext, router};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "termhub", version, about = "Terminal sessions into running containers")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "TERMHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Serve sessions from an in-process echo runtime instead of Docker.
    #[arg(long)]
    memory_runtime: bool,

    /// Override the listen port.
    #[arg(short, long)]
    port: Option<u16>,
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let registry = tracing_subscriber::registry().with(filter);

    if config.logging.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_or_default(cli.config.as_deref())?;
    config.apply_env_overrides();
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    config.validate().context("Invalid configuration")?;

    init_tracing(&config);

    let runtime: Arc<dyn ContainerRuntime> = if cli.memory_runtime {
        tracing::warn!("Using in-memory echo runtime; no containers will be contacted");
        Arc::new(MemoryRuntime::with_echo())
    } else {
        Arc::new(DockerExecRuntime::locate(DockerSettings::from(&config.runtime)).await?)
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let ctx = AppContext::new(config, runtime);
    ctx.start();

    let app = router(ctx.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Server listening on http://{addr}");

    let token = ctx.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                () = shutdown_signal() => {}
                () = token.cancelled() => {}
            }
        })
        .await
        .context("Server error")?;

    ctx.shutdown().await;
    Ok(())
}
