use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::signal;
use tracing::info;

use duplexd::config::Config;
use duplexd::server::TcpServer;
use duplexd::session::{RequestHandler, SetupHandler, SetupInfo, SetupRejected};
use duplexd::telemetry::{init_tracing, TracingConfig};
use duplexd::wire::Payload;

#[derive(Parser, Debug)]
#[command(name = "duplexd")]
#[command(author, version, about = "TCP transport server for duplex sessions")]
struct Args {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Validate config and exit
    #[arg(long)]
    validate: bool,
}

/// Demo setup handler: optionally checks a shared token carried in the
/// setup metadata, then serves every request by echoing its payload.
struct EchoSetup {
    token: Option<String>,
}

#[async_trait]
impl SetupHandler for EchoSetup {
    async fn accept(&self, setup: SetupInfo) -> Result<Arc<dyn RequestHandler>, SetupRejected> {
        if let Some(expected) = &self.token {
            if setup.metadata.as_deref() != Some(expected.as_bytes()) {
                return Err(SetupRejected::new("invalid token"));
            }
        }
        info!(peer = ?setup.peer, "session accepted");
        Ok(Arc::new(EchoHandler))
    }
}

struct EchoHandler;

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle_request(&self, request: Payload) -> Result<Payload> {
        Ok(request)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (to get log settings)
    let config = Config::load(&args.config)?;

    let tracing_config = TracingConfig {
        service_name: "duplexd".to_string(),
        log_level: config.telemetry.log_level.clone(),
        json_logs: config.telemetry.json_logs,
    };
    init_tracing(&tracing_config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "starting duplexd"
    );

    if args.validate {
        info!("configuration is valid");
        return Ok(());
    }

    let setup = Arc::new(EchoSetup {
        token: config.auth.token.clone(),
    });

    let server = TcpServer::with_addr(config.server.address).configure_server(|mut options| {
        options.max_connections = config.limits.max_connections;
        options.max_frame_len = config.limits.max_frame_len;
        options
    });

    let started = server.start(setup).await.context("failed to start server")?;
    info!(address = %started.local_addr(), "listening");

    wait_for_signal().await?;
    info!("shutdown signal received");

    started.shutdown();
    started.await_shutdown().await;
    info!("goodbye");

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    Ok(())
}
