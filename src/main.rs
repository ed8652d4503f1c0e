use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use scale_server::ServerConfig;
use scale_store::{JsonFileStore, DEFAULT_HISTORY_FILE};
use scale_telemetry::{LogFormat, TelemetryConfig};
use tracing::Level;

/// Weight-reading relay: archives readings and rebroadcasts them over WebSocket.
#[derive(Debug, Parser)]
#[command(name = "scale-relay", version, about)]
struct Args {
    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Address to bind.
    #[arg(long, env = "SCALE_HOST", default_value = "0.0.0.0")]
    host: String,

    /// JSON file holding the history snapshot.
    #[arg(long = "history-file", env = "SCALE_HISTORY_FILE", default_value = DEFAULT_HISTORY_FILE)]
    history_file: PathBuf,

    /// Default log level; RUST_LOG takes precedence.
    #[arg(long, env = "SCALE_LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// `json` or `pretty`.
    #[arg(long, env = "SCALE_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            history_path: self.history_file.clone(),
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _telemetry = scale_telemetry::init_telemetry(TelemetryConfig {
        log_level: args.log_level,
        format: args.log_format,
        ..TelemetryConfig::default()
    });

    let config = args.server_config();
    tracing::info!(
        port = config.port,
        history = %config.history_path.display(),
        "Starting scale relay"
    );

    let store = JsonFileStore::new(&config.history_path);
    let handle = scale_server::start(config, store)
        .await
        .context("failed to start relay server")?;

    tracing::info!(addr = %handle.addr(), "Scale relay ready");

    scale_server::shutdown_signal().await;
    tracing::info!("Shutting down");

    let stats = handle.shutdown().await.context("relay task failed")?;
    tracing::info!(
        samples = stats.history,
        saves = stats.saves,
        "History saved, goodbye"
    );
    Ok(())
}
