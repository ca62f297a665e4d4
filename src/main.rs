use mcpgate::auth::CredentialRegistry;
use mcpgate::config::Config;
use mcpgate::limiter::RateLimiter;
use mcpgate::registry::ConnectionRegistry;
use mcpgate::server::{BridgeContext, BridgeServer, PKG_NAME, SSE_ENDPOINT, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mcpgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration: optional TOML file, then environment overrides
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let mut config = match &config_path {
        Some(path) => Config::load(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to load configuration");
            e
        })?,
        None => Config::default(),
    };
    config.apply_env()?;

    if let Some(path) = &config_path {
        info!(path = %path.display(), "Configuration loaded");
    }

    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Wire the bridge collaborators
    let registry = Arc::new(ConnectionRegistry::new());
    let context = Arc::new(BridgeContext {
        upstream: config.upstream.clone(),
        credentials: CredentialRegistry::new(&config.auth.effective_identities()),
        limiter: RateLimiter::default(),
        registry: Arc::clone(&registry),
        shutdown_rx: shutdown_rx.clone(),
    });

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = BridgeServer::new(bind_addr, Arc::clone(&context));
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Bridge server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown; streaming loops unwind into their cleanup phase
    let _ = shutdown_tx.send(true);

    let in_flight = registry.len();
    if in_flight > 0 {
        info!(in_flight, "Waiting for active connections to clean up...");
        if !registry.drained(Duration::from_secs(10)).await {
            let stuck = registry.snapshot();
            warn!(
                remaining = stuck.len(),
                sessions = ?stuck.iter().map(|s| s.id).collect::<Vec<_>>(),
                "Connections still cleaning up at exit"
            );
        }
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting MCP SSE bridge");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        endpoint = SSE_ENDPOINT,
        "Server configuration"
    );
    info!(
        command = %config.upstream.command,
        args = ?config.upstream.args,
        grace_secs = config.upstream.shutdown_grace_period_secs,
        "Upstream configuration"
    );
    if config.auth.enabled() {
        info!(
            identities = config.auth.effective_identities().len(),
            "API key authentication enabled"
        );
    } else {
        warn!("Running without API key authentication");
    }
}
