// PiWardrive - field wireless reconnaissance appliance
//
// A single process hosts the whole backend:
// - Scheduler + TaskQueue: periodic collection and maintenance work
// - HealthCollector: host metrics, service liveness, GPS, alerts
// - Store (SQLite): schema-migrated persistence with buffered writes
// - TileCache: bounded on-disk map tiles with route prefetch
// - RemoteSync: resumable range uploads to a remote aggregator
// - API server (axum): JSON endpoints plus WebSocket/SSE push
//
// The Supervisor wires the components together; mpsc/broadcast
// channels connect producers to the push surface.

mod api;
mod bus;
mod cli;
mod config;
mod error;
mod export;
mod gps;
mod health;
mod queue;
mod retry;
mod scheduler;
mod store;
mod supervisor;
mod sync;
mod tiles;
mod widgets;

use anyhow::Result;
use clap::Parser;
use config::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Map the rotation interval to what the appender supports.
fn rotation_for(interval_secs: u64) -> tracing_appender::rolling::Rotation {
    use tracing_appender::rolling::Rotation;
    if interval_secs >= 86_400 {
        Rotation::DAILY
    } else if interval_secs >= 3_600 {
        Rotation::HOURLY
    } else {
        Rotation::MINUTELY
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    // An invalid document refuses startup and names the offending keys
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    // Precedence: RUST_LOG env var > config level > "info";
    // debug_mode bumps the default
    let level = if config.debug_mode {
        "debug"
    } else {
        &config.logging.level
    };
    let default_filter = format!("piwardrive={level},tower_http=info,axum=info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    // serve also writes rotated file logs under $PW_HOME/logs/
    let _file_guard = if matches!(cli.command, cli::Command::Serve) {
        let log_dir = config.log_dir();
        std::fs::create_dir_all(&log_dir)?;
        let appender = tracing_appender::rolling::RollingFileAppender::new(
            rotation_for(config.logging.rotate_interval_secs),
            log_dir,
            "piwardrive.log",
        );
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        None
    };

    tracing::debug!("piwardrive {} starting", config::VERSION);
    cli::execute(cli.command, config).await
}
