// CLI surface
//
// serve          - run the appliance until interrupted
// migrate        - run schema migrations forward or back
// export         - range export from the store (csv/json/kml)
// sync           - run the remote sync engine once
// tile-maintenance - operational tile cache commands
// export-logs    - tail the application log, optionally upload it

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, VERSION};
use crate::error::Error;
use crate::export::{self, ExportFormat};
use crate::store::{migrations, Store, WriterOptions};
use crate::supervisor;
use crate::sync::{RemoteSync, SyncResult};
use crate::tiles::{prefetch, TileCache};

/// PiWardrive - field wireless reconnaissance appliance
#[derive(Parser)]
#[command(name = "piwardrive")]
#[command(version = VERSION)]
#[command(about = "Field wireless reconnaissance appliance", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the service
    Serve,

    /// Run schema migrations forward, or back to --to N
    Migrate {
        /// Target schema version (defaults to the latest)
        #[arg(long)]
        to: Option<i64>,
    },

    /// Export a time range of records from the store
    Export {
        #[arg(long, value_enum)]
        fmt: ExportFormat,
        /// Range start (RFC3339 or YYYY-MM-DD)
        #[arg(long)]
        start: Option<String>,
        /// Range end (RFC3339 or YYYY-MM-DD)
        #[arg(long)]
        end: Option<String>,
        #[arg(long)]
        output: PathBuf,
    },

    /// Run the remote sync engine once and exit with the remote status
    Sync {
        /// Single pass (the only supported mode from the CLI)
        #[arg(long)]
        once: bool,
        /// Database file to sync instead of the configured store
        #[arg(long)]
        db: Option<PathBuf>,
        /// Destination aggregator URL (overrides configuration)
        #[arg(long)]
        url: Option<String>,
    },

    /// Tile cache maintenance
    #[command(subcommand)]
    TileMaintenance(TileCommand),

    /// Tail the application log to a file, optionally uploading it
    ExportLogs {
        /// Number of trailing lines
        #[arg(short = 'n', long, default_value_t = 200)]
        lines: usize,
        #[arg(long)]
        output: PathBuf,
        /// POST the tail to this URL after writing it
        #[arg(long)]
        upload: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum TileCommand {
    /// Fetch every tile overlapping a bounding box
    Prefetch {
        min_lat: f64,
        min_lon: f64,
        max_lat: f64,
        max_lon: f64,
        #[arg(long, default_value_t = 16)]
        zoom: u32,
        /// Cache directory (defaults to the configured tile path)
        #[arg(long)]
        folder: Option<PathBuf>,
    },
    /// Delete tiles older than --days
    PurgeOld {
        #[arg(long, default_value_t = 30)]
        days: u32,
        #[arg(long)]
        folder: Option<PathBuf>,
    },
    /// Evict oldest tiles until the cache fits --limit-mb
    EnforceLimit {
        #[arg(long = "limit-mb", default_value_t = 512)]
        limit_mb: u64,
        #[arg(long)]
        folder: Option<PathBuf>,
    },
}

fn parse_when(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("unparseable time {raw:?} (RFC3339 or YYYY-MM-DD)"))?;
    Ok(DateTime::from_naive_utc_and_offset(
        date.and_hms_opt(0, 0, 0).expect("midnight exists"),
        Utc,
    ))
}

/// Dispatch a parsed command.
pub async fn execute(command: Command, config: Config) -> anyhow::Result<()> {
    match command {
        Command::Serve => {
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    signal.cancel();
                }
            });
            supervisor::run(config, shutdown).await
        }

        Command::Migrate { to } => {
            let path = config.db_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut conn = rusqlite::Connection::open(&path)
                .with_context(|| format!("open {}", path.display()))?;
            let target = to.unwrap_or_else(migrations::latest_version);
            migrations::migrate_to(&mut conn, target)?;
            println!(
                "{} at schema version {}",
                path.display(),
                migrations::applied_version(&conn)?
            );
            Ok(())
        }

        Command::Export {
            fmt,
            start,
            end,
            output,
        } => {
            let start = start.as_deref().map(parse_when).transpose()?;
            let end = end.as_deref().map(parse_when).transpose()?;
            let store = Store::open(&config.db_path(), WriterOptions::default())?;
            let count = export::export_range(&store, fmt, start, end, &output)?;
            store.shutdown().await?;
            println!("exported {count} records to {}", output.display());
            Ok(())
        }

        Command::Sync { once: _, db, url } => {
            let destination = url.or_else(|| config.sync.remote_sync_url.clone());
            let Some(destination) = destination else {
                return Err(Error::validation(
                    "remote sync requires a destination URL (--url or remote_sync_url)",
                )
                .into());
            };

            let db_path = db.unwrap_or_else(|| config.db_path());
            let mut sync_config = config.clone();
            sync_config.sync.remote_sync_url = Some(destination);

            let store = std::sync::Arc::new(Store::open(&db_path, WriterOptions::default())?);
            let sync = RemoteSync::new(
                store.clone(),
                crate::config::ConfigHandle::new(sync_config),
            )?;
            let result = sync.run_once().await?;
            store.shutdown().await?;

            match result {
                SyncResult::Uploaded {
                    range_start,
                    range_end,
                    rows,
                    status,
                } => {
                    println!("uploaded rows {range_start}..={range_end} ({rows} rows, HTTP {status})");
                    Ok(())
                }
                SyncResult::Idle | SyncResult::IdleTimeout { .. } => {
                    println!("nothing to sync");
                    Ok(())
                }
                SyncResult::BackedOff | SyncResult::Deferred { .. } => {
                    bail!("sync failed; retry scheduled")
                }
                SyncResult::NoDestination => {
                    unreachable!("destination checked above")
                }
            }
        }

        Command::TileMaintenance(action) => tile_maintenance(action, &config).await,

        Command::ExportLogs {
            lines,
            output,
            upload,
        } => {
            let log_path = config.log_dir().join("piwardrive.log");
            export::export_logs(&log_path, lines, &output, upload.as_deref()).await?;
            println!("wrote last {lines} lines to {}", output.display());
            Ok(())
        }
    }
}

async fn tile_maintenance(action: TileCommand, config: &Config) -> anyhow::Result<()> {
    let folder = |override_path: Option<PathBuf>| {
        override_path.unwrap_or_else(|| config.tile_dir())
    };

    match action {
        TileCommand::Prefetch {
            min_lat,
            min_lon,
            max_lat,
            max_lon,
            zoom,
            folder: dir,
        } => {
            let cache = TileCache::new(folder(dir), config.tiles.source_url.clone())?;
            let progress = |done: u64, total: u64| {
                if done == total || done % 25 == 0 {
                    println!("{done}/{total}");
                }
            };
            let report = prefetch::prefetch_region(
                &cache,
                min_lat,
                min_lon,
                max_lat,
                max_lon,
                zoom,
                Some(&progress),
                CancellationToken::new(),
            )
            .await?;
            println!(
                "prefetched {} tiles ({} cached, {} failed)",
                report.fetched, report.skipped, report.failed
            );
            if report.fetched == 0 && report.skipped == 0 {
                bail!("no tiles fetched");
            }
            Ok(())
        }
        TileCommand::PurgeOld { days, folder: dir } => {
            let cache = TileCache::new(folder(dir), config.tiles.source_url.clone())?;
            let removed = cache.purge_old(Duration::from_secs(days as u64 * 86_400))?;
            println!("purged {removed} tiles older than {days} days");
            Ok(())
        }
        TileCommand::EnforceLimit {
            limit_mb,
            folder: dir,
        } => {
            let cache = TileCache::new(folder(dir), config.tiles.source_url.clone())?;
            let removed = cache.enforce_limit(limit_mb * 1024 * 1024)?;
            println!(
                "evicted {removed} tiles; cache now {} bytes",
                cache.total_bytes()?
            );
            Ok(())
        }
    }
}
