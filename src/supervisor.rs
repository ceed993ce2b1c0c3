// Supervisor
//
// Owns construction and lifecycle. Every component is built here and
// injected into its consumers - there are no global singletons. The
// dependency graph is one-way: scheduler -> queue -> job bodies ->
// (collector | tiles | sync) -> store, and the store calls no one.
// Shutdown cancels the root token, then stops components in reverse
// start order with a bounded grace period.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use futures::future::BoxFuture;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api::{self, auth::AuthState, ApiState};
use crate::bus::Bus;
use crate::config::{Config, ConfigHandle};
use crate::error::Error;
use crate::gps::{GpsClient, TrackBuffer};
use crate::health::HealthCollector;
use crate::queue::{FullPolicy, Priority, TaskQueue};
use crate::scheduler::{adjust_gps_interval, Scheduler};
use crate::store::{Store, WriterOptions};
use crate::sync::RemoteSync;
use crate::tiles::{prefetch, TileCache};

/// Grace period for in-flight work during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const GPS_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const RETENTION_INTERVAL: Duration = Duration::from_secs(86_400);
const TRACK_CAPACITY: usize = 256;

/// Run the appliance until `shutdown` fires.
pub async fn run(config: Config, shutdown: CancellationToken) -> anyhow::Result<()> {
    let home = config.home();
    std::fs::create_dir_all(&home)
        .with_context(|| format!("create data directory {}", home.display()))?;

    let config = ConfigHandle::new(config);
    let snapshot = config.snapshot();

    // Leaves first: store, bus, queue
    let store = Arc::new(
        Store::open(&snapshot.db_path(), WriterOptions::default())
            .context("open persistence store")?,
    );
    let bus = Bus::new(snapshot.push.buffer_events);
    let queue = TaskQueue::start(
        snapshot.queue.workers,
        snapshot.queue.capacity,
        FullPolicy::ShedLow,
    );
    let scheduler = Scheduler::new(queue.clone());

    let gps = Arc::new(GpsClient::new(
        &snapshot.gps.host,
        snapshot.gps.port,
        GPS_RECONNECT_DELAY,
    ));
    let track = Arc::new(TrackBuffer::new(TRACK_CAPACITY));
    let collector = Arc::new(HealthCollector::new(
        store.clone(),
        bus.clone(),
        gps.clone(),
        config.clone(),
    ));
    let tiles = Arc::new(
        TileCache::new(snapshot.tile_dir(), snapshot.tiles.source_url.clone())
            .context("open tile cache")?,
    );
    let sync = Arc::new(RemoteSync::new(store.clone(), config.clone()).context("init sync")?);

    register_jobs(
        &scheduler, &config, &collector, &gps, &track, &tiles, &sync, &store,
    );

    let root = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.clone().run(root.child_token()));

    let listener = TcpListener::bind(&snapshot.bind_addr)
        .await
        .with_context(|| format!("bind {}", snapshot.bind_addr))?;
    let api_state = ApiState {
        config: config.clone(),
        store: store.clone(),
        bus: bus.clone(),
        scheduler: scheduler.clone(),
        queue: queue.clone(),
        auth: Arc::new(AuthState::new()),
    };
    let api_task = tokio::spawn(api::serve(api_state, listener, root.child_token()));

    tracing::info!("piwardrive up; data directory {}", home.display());
    shutdown.cancelled().await;
    tracing::info!("shutting down");

    // Reverse order: stop producing, drain workers, flush the store,
    // close the listener
    root.cancel();
    let _ = scheduler_task.await;
    queue.shutdown(SHUTDOWN_GRACE).await;
    if let Err(e) = store.shutdown().await {
        tracing::error!("store shutdown: {e}");
    }
    let _ = api_task.await;

    tracing::info!("shutdown complete");
    Ok(())
}

type Job = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

#[allow(clippy::too_many_arguments)]
fn register_jobs(
    scheduler: &Arc<Scheduler>,
    config: &ConfigHandle,
    collector: &Arc<HealthCollector>,
    gps: &Arc<GpsClient>,
    track: &Arc<TrackBuffer>,
    tiles: &Arc<TileCache>,
    sync: &Arc<RemoteSync>,
    store: &Arc<Store>,
) {
    let snapshot = config.snapshot();

    // Health collection drives the dashboard; keep it high priority
    let job: Job = {
        let collector = collector.clone();
        Arc::new(move |token| {
            let collector = collector.clone();
            Box::pin(async move { collector.tick(token).await })
        })
    };
    scheduler.register(
        "health-poll",
        snapshot.health_poll_interval(),
        job,
        Priority::High,
        0.1,
    );

    // GPS poll feeds the track buffer and adapts its own cadence to
    // the measured speed
    let job: Job = {
        let gps = gps.clone();
        let track = track.clone();
        let config = config.clone();
        let scheduler = Arc::downgrade(scheduler);
        Arc::new(move |_token| {
            let gps = gps.clone();
            let track = track.clone();
            let config = config.clone();
            let scheduler = Weak::clone(&scheduler);
            Box::pin(async move {
                let position = gps.get_position().await;
                if let Some(position) = position {
                    let config = config.snapshot();
                    if let Some(scheduler) = scheduler.upgrade() {
                        let next = adjust_gps_interval(
                            Duration::from_secs(config.gps.map_poll_gps),
                            position.speed_m_s.unwrap_or(0.0),
                            Duration::from_secs(config.gps.map_poll_gps),
                            Duration::from_secs(config.gps.map_poll_gps_max),
                            config.gps.movement_threshold,
                        );
                        scheduler.set_interval("gps-poll", next);
                    }
                    track.push(position);
                }
                Ok(())
            })
        })
    };
    scheduler.register(
        "gps-poll",
        Duration::from_secs(snapshot.gps.map_poll_gps_max),
        job,
        Priority::Normal,
        0.1,
    );

    // Tile cache maintenance: age purge then size eviction
    let job: Job = {
        let tiles = tiles.clone();
        let config = config.clone();
        Arc::new(move |_token| {
            let tiles = tiles.clone();
            let config = config.snapshot();
            Box::pin(async move {
                let max_age =
                    Duration::from_secs(config.tiles.max_age_days as u64 * 86_400);
                let limit = config.tiles.cache_limit_mb * 1024 * 1024;
                tokio::task::spawn_blocking(move || -> Result<(), Error> {
                    tiles.purge_old(max_age)?;
                    tiles.enforce_limit(limit)?;
                    Ok(())
                })
                .await
                .map_err(|e| Error::storage(format!("tile maintenance task: {e}")))?
            })
        })
    };
    scheduler.register(
        "tile-maintenance",
        Duration::from_secs(snapshot.tiles.maintenance_interval_secs),
        job,
        Priority::Low,
        0.1,
    );

    // Route prefetch warms tiles ahead of the current heading
    let job: Job = {
        let tiles = tiles.clone();
        let track = track.clone();
        let config = config.clone();
        Arc::new(move |token| {
            let tiles = tiles.clone();
            let track = track.snapshot();
            let config = config.snapshot();
            Box::pin(async move {
                prefetch::route_prefetch(
                    &tiles,
                    &track,
                    config.tiles.route_prefetch_lookahead,
                    config.tiles.route_prefetch_radius,
                    config.tiles.route_prefetch_zoom,
                    token,
                )
                .await?;
                Ok(())
            })
        })
    };
    scheduler.register(
        "route-prefetch",
        Duration::from_secs(snapshot.tiles.route_prefetch_interval_secs),
        job,
        Priority::Low,
        0.1,
    );

    // Remote sync; a permanent protocol error propagates and disables
    // the job after repeated failures
    let job: Job = {
        let sync = sync.clone();
        Arc::new(move |_token| {
            let sync = sync.clone();
            Box::pin(async move {
                sync.run_once().await?;
                Ok(())
            })
        })
    };
    scheduler.register(
        "remote-sync",
        Duration::from_secs(snapshot.sync.interval_secs),
        job,
        Priority::Normal,
        0.1,
    );

    // Retention: purge old health and detection rows, then vacuum
    let job: Job = {
        let store = store.clone();
        let config = config.clone();
        Arc::new(move |_token| {
            let store = store.clone();
            let config = config.snapshot();
            Box::pin(async move {
                let now = chrono::Utc::now();
                let health_cutoff =
                    now - chrono::Duration::days(config.health.retention_days as i64);
                let detection_cutoff =
                    now - chrono::Duration::days(config.detection_retention_days as i64);
                let removed = store.purge_old_health(health_cutoff).await?
                    + store.purge_old_detections(detection_cutoff).await?;
                if removed > 0 {
                    store.vacuum().await?;
                }
                Ok(())
            })
        })
    };
    scheduler.register("retention", RETENTION_INTERVAL, job, Priority::Low, 0.1);

    // Rotated-log cleanup
    if snapshot.logging.cleanup_rotated_logs {
        let job: Job = {
            let config = config.clone();
            Arc::new(move |_token| {
                let config = config.snapshot();
                Box::pin(async move {
                    let log_dir = config.log_dir();
                    let keep = config.logging.rotate_archives as usize;
                    tokio::task::spawn_blocking(move || prune_rotated_logs(&log_dir, keep))
                        .await
                        .map_err(|e| Error::storage(format!("log cleanup task: {e}")))??;
                    Ok(())
                })
            })
        };
        scheduler.register(
            "log-cleanup",
            Duration::from_secs(snapshot.logging.rotate_interval_secs),
            job,
            Priority::Low,
            0.1,
        );
    }
}

/// Delete rotated log archives beyond `keep`, newest kept first.
pub fn prune_rotated_logs(dir: &std::path::Path, keep: usize) -> Result<u64, Error> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(0),
    };
    let mut archives: Vec<(std::path::PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let name = path.file_name()?.to_string_lossy().to_string();
            // Rotated files carry a date suffix: piwardrive.log.2025-08-01
            if !name.starts_with("piwardrive.log.") {
                return None;
            }
            let mtime = entry.metadata().ok()?.modified().ok()?;
            Some((path, mtime))
        })
        .collect();

    if archives.len() <= keep {
        return Ok(0);
    }
    archives.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in archives.into_iter().skip(keep) {
        if std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    if removed > 0 {
        tracing::info!("removed {removed} rotated log archives");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_keeps_newest_archives() {
        let dir = std::env::temp_dir().join(format!(
            "piwardrive-prune-{}",
            std::process::id()
        ));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();

        for day in 1..=4 {
            std::fs::write(dir.join(format!("piwardrive.log.2025-08-0{day}")), "x").unwrap();
            std::thread::sleep(Duration::from_millis(15));
        }
        std::fs::write(dir.join("piwardrive.log"), "current").unwrap();
        std::fs::write(dir.join("unrelated.txt"), "keep").unwrap();

        let removed = prune_rotated_logs(&dir, 2).unwrap();
        assert_eq!(removed, 2);
        // Oldest archives went; current log and unrelated files stay
        assert!(!dir.join("piwardrive.log.2025-08-01").exists());
        assert!(!dir.join("piwardrive.log.2025-08-02").exists());
        assert!(dir.join("piwardrive.log.2025-08-03").exists());
        assert!(dir.join("piwardrive.log.2025-08-04").exists());
        assert!(dir.join("piwardrive.log").exists());
        assert!(dir.join("unrelated.txt").exists());
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn prune_is_noop_under_limit() {
        let dir = std::env::temp_dir().join(format!(
            "piwardrive-prune-noop-{}",
            std::process::id()
        ));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("piwardrive.log.2025-08-01"), "x").unwrap();
        assert_eq!(prune_rotated_logs(&dir, 7).unwrap(), 0);
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn supervisor_starts_and_stops_cleanly() {
        let home = std::env::temp_dir().join(format!(
            "piwardrive-supervisor-{}",
            std::process::id()
        ));
        std::fs::remove_dir_all(&home).ok();

        let mut config = Config {
            data_dir: Some(home.clone()),
            bind_addr: "127.0.0.1:0".to_string(),
            ..Config::default()
        };
        // Keep the collector quiet during the smoke test
        config.health.poll_interval_secs = 3600;

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(config, shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(300)).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(15), task)
            .await
            .expect("supervisor exits within the grace period")
            .unwrap()
            .unwrap();
        std::fs::remove_dir_all(home).ok();
    }
}
