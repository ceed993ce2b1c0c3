// Persistence store
//
// SQLite in WAL mode, split the way the writer/query pair works in
// practice: one dedicated writer thread owning the sole write
// connection, and a small r2d2 pool of read connections for concurrent
// queries. Connections are never shared between tasks; each pooled
// reader verifies the on-disk schema version when it is acquired.
//
// Write latency is amortised: health samples buffer in the writer and
// flush by size, by interval, or on demand. Transient disk faults are
// retried on the 50/200/800 ms ladder before a StorageError surfaces;
// constraint violations surface immediately.

pub mod migrations;
pub mod models;
mod writer;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OpenFlags};
use tokio::sync::oneshot;

use crate::error::{Error, Result};

pub use models::*;
pub use writer::{StoreMetrics, StoreMetricsSnapshot, WriterOptions};

use writer::{WriteCommand, WriteOp};

/// Pragmas applied to every connection, writer and reader alike.
const CONNECTION_PRAGMAS: &str = "
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;
    PRAGMA busy_timeout=5000;
    PRAGMA foreign_keys=ON;
";

/// Verifies the schema version each time a pooled reader is acquired.
#[derive(Debug)]
struct ReaderCustomizer {
    expected_version: i64,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for ReaderCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(CONNECTION_PRAGMAS)?;
        let version: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;
        if version != self.expected_version {
            return Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_MISMATCH),
                Some(format!(
                    "schema version {version} does not match expected {}",
                    self.expected_version
                )),
            ));
        }
        Ok(())
    }
}

pub struct Store {
    tx: SyncSender<WriteCommand>,
    writer: Mutex<Option<JoinHandle<()>>>,
    readers: Pool<SqliteConnectionManager>,
    metrics: Arc<StoreMetrics>,
    path: PathBuf,
}

impl Store {
    /// Open (or create) the database, run pending migrations, spawn the
    /// writer thread, and build the read pool. Idempotent.
    pub fn open(path: &Path, options: WriterOptions) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(path)?;
        conn.execute_batch(CONNECTION_PRAGMAS)?;
        migrations::migrate_latest(&mut conn)?;

        let metrics = Arc::new(StoreMetrics::default());
        let (tx, rx) = std::sync::mpsc::sync_channel(options.channel_buffer);

        let writer_metrics = metrics.clone();
        let writer_options = options.clone();
        let writer = std::thread::Builder::new()
            .name("store-writer".into())
            .spawn(move || {
                writer::writer_thread(conn, rx, writer_options, writer_metrics);
            })
            .map_err(|e| Error::storage(format!("spawn writer thread: {e}")))?;

        let manager = SqliteConnectionManager::file(path)
            .with_flags(OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX);
        let readers = Pool::builder()
            .max_size(4)
            .connection_customizer(Box::new(ReaderCustomizer {
                expected_version: migrations::latest_version(),
            }))
            .build(manager)?;

        Ok(Self {
            tx,
            writer: Mutex::new(Some(writer)),
            readers,
            metrics,
            path: path.to_path_buf(),
        })
    }

    #[allow(dead_code)] // Handy for operator tooling
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metrics(&self) -> StoreMetricsSnapshot {
        self.metrics.snapshot()
    }

    // ── write path ──────────────────────────────────────────────────

    /// Append a health sample. Amortised: the record lands in the writer
    /// buffer and hits disk on the next flush. Under sustained
    /// backpressure the sample is dropped and counted.
    pub fn save_health(&self, record: HealthRecord) -> Result<()> {
        match self.tx.try_send(WriteCommand::SaveHealth(record)) {
            Ok(()) => Ok(()),
            Err(std::sync::mpsc::TrySendError::Full(_)) => {
                self.metrics
                    .records_dropped
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                tracing::warn!("store write channel full, dropping health sample");
                Ok(())
            }
            Err(std::sync::mpsc::TrySendError::Disconnected(_)) => {
                Err(Error::storage("store writer is gone"))
            }
        }
    }

    /// Force the buffered samples to disk.
    pub async fn flush(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WriteCommand::Flush(reply_tx))
            .map_err(|_| Error::storage("store writer is gone"))?;
        reply_rx
            .await
            .map_err(|_| Error::storage("store writer dropped flush reply"))?
    }

    async fn exec(&self, op: WriteOp) -> Result<u64> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WriteCommand::Exec(op, reply_tx))
            .map_err(|_| Error::storage("store writer is gone"))?;
        reply_rx
            .await
            .map_err(|_| Error::storage("store writer dropped reply"))?
    }

    pub async fn create_scan_session(&self, session: ScanSession) -> Result<()> {
        self.exec(WriteOp::CreateScanSession(session)).await?;
        Ok(())
    }

    fn require_session(&self, id: &str) -> Result<()> {
        if self.session_exists(id)? {
            Ok(())
        } else {
            Err(Error::validation(format!("unknown scan session {id:?}")))
        }
    }

    pub async fn append_wifi(&self, d: WifiDetection) -> Result<()> {
        self.require_session(&d.scan_session_id)?;
        self.exec(WriteOp::AppendWifi(d)).await?;
        Ok(())
    }

    #[allow(dead_code)] // Scanner bridge currently feeds Wi-Fi only
    pub async fn append_bluetooth(&self, d: BluetoothDetection) -> Result<()> {
        self.require_session(&d.scan_session_id)?;
        self.exec(WriteOp::AppendBluetooth(d)).await?;
        Ok(())
    }

    #[allow(dead_code)] // Scanner bridge currently feeds Wi-Fi only
    pub async fn append_cellular(&self, d: CellularDetection) -> Result<()> {
        self.require_session(&d.scan_session_id)?;
        self.exec(WriteOp::AppendCellular(d)).await?;
        Ok(())
    }

    #[allow(dead_code)] // Populated once the GPS poll writes track sessions
    pub async fn append_track_point(&self, d: GpsTrackPoint) -> Result<()> {
        self.require_session(&d.scan_session_id)?;
        self.exec(WriteOp::AppendTrackPoint(d)).await?;
        Ok(())
    }

    #[allow(dead_code)] // Scanner bridge currently feeds Wi-Fi only
    pub async fn append_network_fingerprint(&self, d: NetworkFingerprint) -> Result<()> {
        self.require_session(&d.scan_session_id)?;
        self.exec(WriteOp::AppendNetworkFingerprint(d)).await?;
        Ok(())
    }

    #[allow(dead_code)] // Scanner bridge currently feeds Wi-Fi only
    pub async fn append_suspicious(&self, d: SuspiciousActivity) -> Result<()> {
        self.require_session(&d.scan_session_id)?;
        self.exec(WriteOp::AppendSuspicious(d)).await?;
        Ok(())
    }

    #[allow(dead_code)] // Scanner bridge currently feeds Wi-Fi only
    pub async fn append_analytics(&self, d: NetworkAnalyticsRow) -> Result<()> {
        self.require_session(&d.scan_session_id)?;
        self.exec(WriteOp::AppendAnalytics(d)).await?;
        Ok(())
    }

    pub async fn upsert_app_state(&self, state: AppState) -> Result<()> {
        self.exec(WriteOp::UpsertAppState(state)).await?;
        Ok(())
    }

    pub async fn replace_dashboard_settings(&self, settings: DashboardSettings) -> Result<()> {
        self.exec(WriteOp::ReplaceDashboard(settings)).await?;
        Ok(())
    }

    pub async fn touch_fingerprint(&self, bssid: &str, seen_at: DateTime<Utc>) -> Result<()> {
        self.exec(WriteOp::TouchFingerprint {
            bssid: bssid.to_string(),
            seen_at,
        })
        .await?;
        Ok(())
    }

    pub async fn upsert_geofence(&self, polygon: GeofencePolygon) -> Result<()> {
        self.exec(WriteOp::UpsertGeofence(polygon)).await?;
        Ok(())
    }

    #[allow(dead_code)] // Geofence management endpoint lands with the UI
    pub async fn delete_geofence(&self, name: &str) -> Result<u64> {
        self.exec(WriteOp::DeleteGeofence(name.to_string())).await
    }

    /// Delete health records older than `cutoff`; returns rows removed.
    pub async fn purge_old_health(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.exec(WriteOp::PurgeHealth(cutoff)).await
    }

    /// Delete detection records older than `cutoff` across all tables.
    pub async fn purge_old_detections(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.exec(WriteOp::PurgeDetections(cutoff)).await
    }

    /// Reclaim space. No-op when the writer has a transaction open.
    pub async fn vacuum(&self) -> Result<()> {
        self.exec(WriteOp::Vacuum).await?;
        Ok(())
    }

    /// Flush and stop the writer thread. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let handle = self.writer.lock().expect("writer lock poisoned").take();
        if let Some(handle) = handle {
            self.flush().await.ok();
            let _ = self.tx.send(WriteCommand::Shutdown);
            tokio::task::spawn_blocking(move || {
                let _ = handle.join();
            })
            .await
            .map_err(|e| Error::storage(format!("join writer: {e}")))?;
        }
        Ok(())
    }

    // ── read path ───────────────────────────────────────────────────

    fn reader(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.readers.get()?)
    }

    fn parse_ts(raw: String) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| Error::storage(format!("bad timestamp {raw:?}: {e}")))
    }

    /// Most recent `n` health records, newest first.
    pub fn load_recent_health(&self, n: usize) -> Result<Vec<HealthRecord>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, cpu_temp_celsius, cpu_percent, mem_percent, disk_percent
             FROM health_records ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([n as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<f64>>(1)?,
                row.get::<_, Option<f64>>(2)?,
                row.get::<_, Option<f64>>(3)?,
                row.get::<_, Option<f64>>(4)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (ts, temp, cpu, mem, disk) = row?;
            records.push(HealthRecord {
                timestamp: Self::parse_ts(ts)?,
                cpu_temp_celsius: temp,
                cpu_percent: cpu,
                mem_percent: mem,
                disk_percent: disk,
            });
        }
        Ok(records)
    }

    /// Health records within [start, end], oldest first. Used by export.
    pub fn load_health_range(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<HealthRecord>> {
        let conn = self.reader()?;
        let start = start.map(|t| t.to_rfc3339()).unwrap_or_default();
        let end = end
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "9999".to_string());
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, cpu_temp_celsius, cpu_percent, mem_percent, disk_percent
             FROM health_records WHERE timestamp >= ?1 AND timestamp <= ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![start, end], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<f64>>(1)?,
                row.get::<_, Option<f64>>(2)?,
                row.get::<_, Option<f64>>(3)?,
                row.get::<_, Option<f64>>(4)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (ts, temp, cpu, mem, disk) = row?;
            records.push(HealthRecord {
                timestamp: Self::parse_ts(ts)?,
                cpu_temp_celsius: temp,
                cpu_percent: cpu,
                mem_percent: mem,
                disk_percent: disk,
            });
        }
        Ok(records)
    }

    pub fn session_exists(&self, id: &str) -> Result<bool> {
        let conn = self.reader()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM scan_sessions WHERE id = ?1",
            [id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn load_app_state(&self) -> Result<AppState> {
        let conn = self.reader()?;
        let result = conn.query_row(
            "SELECT last_screen, last_start, first_run FROM app_state WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        );
        match result {
            Ok((last_screen, last_start, first_run)) => Ok(AppState {
                last_screen,
                last_start: match last_start {
                    Some(raw) => Some(Self::parse_ts(raw)?),
                    None => None,
                },
                first_run: first_run != 0,
            }),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(AppState {
                first_run: true,
                ..AppState::default()
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn load_dashboard_settings(&self) -> Result<DashboardSettings> {
        let conn = self.reader()?;
        let result = conn.query_row(
            "SELECT widgets FROM dashboard_settings WHERE id = 1",
            [],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(raw) => Ok(DashboardSettings {
                widgets: serde_json::from_str(&raw)
                    .map_err(|e| Error::storage(format!("widget layout: {e}")))?,
            }),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(DashboardSettings::default()),
            Err(e) => Err(e.into()),
        }
    }

    #[allow(dead_code)] // Fingerprint lookup endpoint lands with the UI
    pub fn load_fingerprint(&self, bssid: &str) -> Result<Option<Fingerprint>> {
        let conn = self.reader()?;
        let result = conn.query_row(
            "SELECT bssid, first_seen, last_seen FROM fingerprints WHERE bssid = ?1",
            [bssid],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        );
        match result {
            Ok((bssid, first, last)) => Ok(Some(Fingerprint {
                bssid,
                first_seen: Self::parse_ts(first)?,
                last_seen: Self::parse_ts(last)?,
            })),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_geofences(&self) -> Result<Vec<GeofencePolygon>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare_cached(
            "SELECT name, points, enter_message, exit_message FROM geofences ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;
        let mut fences = Vec::new();
        for row in rows {
            let (name, points, enter_message, exit_message) = row?;
            fences.push(GeofencePolygon {
                name,
                points: serde_json::from_str(&points)
                    .map_err(|e| Error::storage(format!("geofence points: {e}")))?,
                enter_message,
                exit_message,
            });
        }
        Ok(fences)
    }

    /// Row counts per user table, for observability.
    pub fn get_table_counts(&self) -> Result<BTreeMap<String, u64>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )?;
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        let mut counts = BTreeMap::new();
        for table in tables {
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| {
                    row.get(0)
                })?;
            counts.insert(table, count as u64);
        }
        Ok(counts)
    }

    /// Health rows with row id above `after`, oldest first, capped at
    /// `limit`. Feeds the sync engine's range extraction.
    pub fn health_rows_after(
        &self,
        after: i64,
        limit: u64,
    ) -> Result<Vec<(i64, serde_json::Value)>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, timestamp, cpu_temp_celsius, cpu_percent, mem_percent, disk_percent
             FROM health_records WHERE id > ?1 ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<f64>>(2)?,
                row.get::<_, Option<f64>>(3)?,
                row.get::<_, Option<f64>>(4)?,
                row.get::<_, Option<f64>>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, ts, temp, cpu, mem, disk) = row?;
            out.push((
                id,
                serde_json::json!({
                    "id": id,
                    "timestamp": ts,
                    "cpu_temp_celsius": temp,
                    "cpu_percent": cpu,
                    "mem_percent": mem,
                    "disk_percent": disk,
                }),
            ));
        }
        Ok(out)
    }

    /// GPS track points within [start, end], oldest first. Feeds the
    /// KML export.
    pub fn load_track_range(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<GpsTrackPoint>> {
        let conn = self.reader()?;
        let start = start.map(|t| t.to_rfc3339()).unwrap_or_default();
        let end = end
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "9999".to_string());
        let mut stmt = conn.prepare_cached(
            "SELECT scan_session_id, detection_timestamp, latitude, longitude,
                    speed_m_s, heading_deg, fix_mode
             FROM gps_track_points
             WHERE detection_timestamp >= ?1 AND detection_timestamp <= ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![start, end], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, Option<f64>>(4)?,
                row.get::<_, Option<f64>>(5)?,
                row.get::<_, Option<i64>>(6)?,
            ))
        })?;
        let mut points = Vec::new();
        for row in rows {
            let (session, ts, lat, lon, speed, heading, fix) = row?;
            points.push(GpsTrackPoint {
                scan_session_id: session,
                detection_timestamp: Self::parse_ts(ts)?,
                latitude: lat,
                longitude: lon,
                speed_m_s: speed,
                heading_deg: heading,
                fix_mode: fix,
            });
        }
        Ok(points)
    }

    pub fn max_health_row_id(&self) -> Result<i64> {
        let conn = self.reader()?;
        let id: i64 = conn.query_row(
            "SELECT COALESCE(MAX(id), 0) FROM health_records",
            [],
            |row| row.get(0),
        )?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn temp_db(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "piwardrive-store-{tag}-{}.db",
            std::process::id()
        ))
    }

    fn open_store(tag: &str) -> (Store, PathBuf) {
        let path = temp_db(tag);
        std::fs::remove_file(&path).ok();
        let store = Store::open(
            &path,
            WriterOptions {
                batch_size: 4,
                flush_interval: Duration::from_millis(50),
                channel_buffer: 64,
            },
        )
        .unwrap();
        (store, path)
    }

    fn record(ts: &str) -> HealthRecord {
        HealthRecord {
            timestamp: DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc),
            cpu_temp_celsius: Some(48.2),
            cpu_percent: Some(12.5),
            mem_percent: Some(40.0),
            disk_percent: Some(61.0),
        }
    }

    fn cleanup(path: PathBuf) {
        std::fs::remove_file(&path).ok();
        std::fs::remove_file(path.with_extension("db-wal")).ok();
        std::fs::remove_file(path.with_extension("db-shm")).ok();
    }

    #[tokio::test]
    async fn save_flush_load_round_trip() {
        let (store, path) = open_store("roundtrip");
        let rec = record("2025-06-01T12:00:00Z");
        store.save_health(rec.clone()).unwrap();
        store.flush().await.unwrap();

        let loaded = store.load_recent_health(1).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], rec);

        store.shutdown().await.unwrap();
        cleanup(path);
    }

    #[tokio::test]
    async fn recent_health_is_newest_first() {
        let (store, path) = open_store("newest");
        for hour in 10..14 {
            store
                .save_health(record(&format!("2025-06-01T{hour}:00:00Z")))
                .unwrap();
        }
        store.flush().await.unwrap();

        let loaded = store.load_recent_health(2).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded[0].timestamp > loaded[1].timestamp);

        store.shutdown().await.unwrap();
        cleanup(path);
    }

    #[tokio::test]
    async fn purge_removes_old_rows() {
        let (store, path) = open_store("purge");
        store.save_health(record("2025-01-01T00:00:00Z")).unwrap();
        store.save_health(record("2025-06-01T00:00:00Z")).unwrap();
        store.flush().await.unwrap();

        let cutoff = DateTime::parse_from_rfc3339("2025-03-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let removed = store.purge_old_health(cutoff).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.load_recent_health(10).unwrap().len(), 1);

        store.shutdown().await.unwrap();
        cleanup(path);
    }

    #[tokio::test]
    async fn detection_requires_known_session() {
        let (store, path) = open_store("session");
        let detection = WifiDetection {
            scan_session_id: "missing".to_string(),
            detection_timestamp: Utc::now(),
            bssid: "aa:bb:cc:dd:ee:ff".to_string(),
            ssid: Some("net".to_string()),
            channel: Some(6),
            signal_dbm: Some(-61.0),
            encryption: Some("wpa2".to_string()),
            latitude: None,
            longitude: None,
        };
        let err = store.append_wifi(detection.clone()).await.unwrap_err();
        assert_eq!(err.kind(), "ValidationError");

        store
            .create_scan_session(ScanSession {
                id: "missing".to_string(),
                started_at: Utc::now(),
                scan_type: "wifi".to_string(),
                notes: None,
            })
            .await
            .unwrap();
        store.append_wifi(detection).await.unwrap();

        store.shutdown().await.unwrap();
        cleanup(path);
    }

    #[tokio::test]
    async fn app_state_upserts_single_row() {
        let (store, path) = open_store("appstate");
        assert!(store.load_app_state().unwrap().first_run);

        store
            .upsert_app_state(AppState {
                last_screen: Some("map".to_string()),
                last_start: Some(Utc::now()),
                first_run: false,
            })
            .await
            .unwrap();
        store
            .upsert_app_state(AppState {
                last_screen: Some("stats".to_string()),
                last_start: Some(Utc::now()),
                first_run: false,
            })
            .await
            .unwrap();

        let state = store.load_app_state().unwrap();
        assert_eq!(state.last_screen.as_deref(), Some("stats"));
        assert_eq!(store.get_table_counts().unwrap()["app_state"], 1);

        store.shutdown().await.unwrap();
        cleanup(path);
    }

    #[tokio::test]
    async fn fingerprint_first_seen_is_immutable() {
        let (store, path) = open_store("fingerprint");
        let t1 = DateTime::parse_from_rfc3339("2025-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let t2 = t1 + chrono::Duration::hours(5);

        store.touch_fingerprint("aa:bb", t1).await.unwrap();
        store.touch_fingerprint("aa:bb", t2).await.unwrap();

        let fp = store.load_fingerprint("aa:bb").unwrap().unwrap();
        assert_eq!(fp.first_seen, t1);
        assert_eq!(fp.last_seen, t2);

        store.shutdown().await.unwrap();
        cleanup(path);
    }

    #[tokio::test]
    async fn geofence_rejects_degenerate_polygon() {
        let (store, path) = open_store("geofence");
        let err = store
            .upsert_geofence(GeofencePolygon {
                name: "bad".to_string(),
                points: vec![(0.0, 0.0), (1.0, 1.0)],
                enter_message: None,
                exit_message: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");

        store.shutdown().await.unwrap();
        cleanup(path);
    }

    #[tokio::test]
    async fn health_rows_after_feeds_sync() {
        let (store, path) = open_store("rows-after");
        for hour in 10..13 {
            store
                .save_health(record(&format!("2025-06-01T{hour}:00:00Z")))
                .unwrap();
        }
        store.flush().await.unwrap();

        let rows = store.health_rows_after(0, 10).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].0 < w[1].0));

        let tail = store.health_rows_after(rows[1].0, 10).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(store.max_health_row_id().unwrap(), rows[2].0);

        store.shutdown().await.unwrap();
        cleanup(path);
    }

    #[tokio::test]
    async fn vacuum_is_safe() {
        let (store, path) = open_store("vacuum");
        store.save_health(record("2025-06-01T00:00:00Z")).unwrap();
        store.flush().await.unwrap();
        store.vacuum().await.unwrap();
        store.shutdown().await.unwrap();
        cleanup(path);
    }
}
