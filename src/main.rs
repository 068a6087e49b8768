use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use relay_engine::{RpcForwardResolver, SessionLifecycleController};
use relay_server::{HostedTransport, ServerConfig};
use relay_settings::RelaySettings;
use relay_store::{Database, SqliteStore};
use relay_telemetry::TelemetryConfig;

#[derive(Debug, Parser)]
#[command(name = "relay-wallet", about = "Wallet-side call-request relay")]
struct Cli {
    /// Settings file (default: ~/.relay/settings.json)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => relay_settings::load_settings_from_path(path),
        None => relay_settings::load_settings(),
    }
    .context("failed to load settings")?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(host) = cli.host {
        settings.server.host = host;
    }

    let telemetry = Arc::new(relay_telemetry::init_telemetry(telemetry_config(&settings)));
    tracing::info!("starting relay wallet");

    let db = Database::open(&PathBuf::from(&settings.store.path))
        .with_context(|| format!("failed to open store at {}", settings.store.path))?;
    tracing::info!(path = %db.path().display(), "store opened");

    let capabilities = settings.wallet.capabilities();
    let transport = Arc::new(HostedTransport::new(
        Duration::from_millis(settings.server.negotiation_timeout_ms),
        settings.server.max_send_queue,
    ));
    let resolver = RpcForwardResolver::new(
        settings.resolver.rpc_url.clone(),
        Duration::from_millis(settings.resolver.timeout_ms),
        capabilities.clone(),
    )
    .context("failed to build resolver")?;
    tracing::info!(rpc_url = resolver.rpc_url(), "forwarding unhandled calls upstream");

    let controller = SessionLifecycleController::new(
        transport.clone(),
        Arc::new(resolver),
        Arc::new(SqliteStore::new(db)),
        capabilities,
        settings.wallet.duplicate_policy,
    );

    match controller.restore().await {
        Ok(snapshot) => tracing::info!(status = ?snapshot.status, "session restore finished"),
        Err(e) => tracing::warn!(error = %e, "session restore failed"),
    }

    let config = ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        max_send_queue: settings.server.max_send_queue,
    };
    let handle = relay_server::start(config, controller, transport, Some(telemetry))
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "relay wallet ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    handle.shutdown();
    Ok(())
}

fn telemetry_config(settings: &RelaySettings) -> TelemetryConfig {
    let telemetry = &settings.telemetry;
    TelemetryConfig {
        log_level: telemetry.log_level.parse().unwrap_or(tracing::Level::INFO),
        log_to_sqlite: telemetry.log_to_sqlite,
        log_db_path: PathBuf::from(&telemetry.log_db_path),
        ..TelemetryConfig::default()
    }
}
