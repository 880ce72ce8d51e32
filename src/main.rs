//! # pronto
//!
//! Realtime delivery server binary: loads settings, wires the ticket store,
//! request state, enrichment worker and WebSocket server, then serves until
//! SIGINT/SIGTERM.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use pronto_enrich::{HttpProviderResolver, ProviderEnrichmentWorker, ResultPublisher, WorkerConfig};
use pronto_server::bootstrap::prepare_auth;
use pronto_server::shutdown::shutdown_signal;
use pronto_server::{ProntoServer, ServerConfig};
use pronto_settings::{load_settings, load_settings_from_path, ProntoSettings};
use pronto_store::{MemoryJobLocks, MemoryProviderCache, RequestStateStore};
use pronto_telemetry::{init_telemetry, install_panic_hook, LogFormat, TelemetryConfig};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogStyle {
    Json,
    Compact,
}

/// Pronto realtime server.
#[derive(Parser, Debug)]
#[command(name = "pronto", about = "Realtime search result delivery over WebSocket")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (defaults to `$PRONTO_SETTINGS` or `~/.pronto/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "json")]
    log_format: LogStyle,

    /// Default log level; `RUST_LOG` takes precedence.
    #[arg(long, default_value = "info")]
    log_level: Level,
}

fn load(cli: &Cli) -> Result<ProntoSettings> {
    let mut settings = match &cli.settings {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => load_settings().context("failed to load settings")?,
    };
    if let Some(host) = &cli.host {
        settings.server.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    settings.validate().context("invalid settings")?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_telemetry(&TelemetryConfig {
        log_level: cli.log_level,
        format: match cli.log_format {
            LogStyle::Json => LogFormat::Json,
            LogStyle::Compact => LogFormat::Compact,
        },
        ..TelemetryConfig::default()
    })?;
    install_panic_hook();

    let settings = load(&cli)?;
    info!(environment = ?settings.auth.environment, "starting pronto");

    let background = CancellationToken::new();
    let auth = prepare_auth(&settings.auth, background.clone()).await?;

    let mut config = ServerConfig::from_settings(&settings);
    config.auth = auth.policy;

    let states = Arc::new(RequestStateStore::new(settings.request_state.ttl()));
    let mut server = ProntoServer::new(config, states, auth.tickets);

    match settings.enrichment.resolver_url.as_deref() {
        Some(url) => {
            let resolver =
                HttpProviderResolver::new(url).context("failed to build provider resolver")?;
            let publisher: Arc<dyn ResultPublisher> = server.manager().clone();
            let worker = ProviderEnrichmentWorker::new(
                Arc::new(resolver),
                Arc::new(MemoryProviderCache::new()),
                Arc::new(MemoryJobLocks::new()),
                publisher,
                WorkerConfig::from(&settings.enrichment),
            );
            server.attach_enrichment(Arc::new(worker));
            info!(resolver = url, "provider enrichment enabled");
        }
        None => warn!("no provider resolver configured, enrichment disabled"),
    }

    let handle = server.listen().await?;
    info!(port = handle.port(), "pronto ready");

    shutdown_signal().await;

    let drained = server.shutdown_gracefully(handle).await;
    background.cancel();
    if let Some(purge) = auth.purge {
        let _ = purge.await;
    }
    if !drained {
        warn!("shutdown deadline reached before all tasks finished");
    }
    Ok(())
}
