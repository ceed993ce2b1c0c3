// Dedicated writer thread
//
// All mutations funnel through one OS thread owning one connection, so
// writes are serialised without locks and the async runtime never
// blocks on SQLite. Health samples are batched: the buffer flushes when
// it reaches the batch size, when the flush interval elapses, or when a
// caller asks explicitly. Any other mutation flushes the buffer first
// so cross-table ordering is preserved.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tokio::sync::oneshot;

use super::models::*;
use crate::error::{Error, Result};
use crate::retry::{retry_blocking, RetryPolicy};

/// Mutations accepted by the writer thread.
pub(crate) enum WriteCommand {
    SaveHealth(HealthRecord),
    Flush(oneshot::Sender<Result<()>>),
    Exec(WriteOp, oneshot::Sender<Result<u64>>),
    Shutdown,
}

/// Immediate (non-buffered) mutations. Each returns affected row count.
pub(crate) enum WriteOp {
    CreateScanSession(ScanSession),
    AppendWifi(WifiDetection),
    AppendBluetooth(BluetoothDetection),
    AppendCellular(CellularDetection),
    AppendTrackPoint(GpsTrackPoint),
    AppendNetworkFingerprint(NetworkFingerprint),
    AppendSuspicious(SuspiciousActivity),
    AppendAnalytics(NetworkAnalyticsRow),
    UpsertAppState(AppState),
    ReplaceDashboard(DashboardSettings),
    TouchFingerprint {
        bssid: String,
        seen_at: DateTime<Utc>,
    },
    UpsertGeofence(GeofencePolygon),
    DeleteGeofence(String),
    PurgeHealth(DateTime<Utc>),
    PurgeDetections(DateTime<Utc>),
    Vacuum,
}

/// Writer-side knobs; defaults match the store contract.
#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub channel_buffer: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval: Duration::from_secs(5),
            channel_buffer: 1024,
        }
    }
}

/// Observability counters for the write path.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    pub records_written: AtomicU64,
    pub records_dropped: AtomicU64,
    pub write_failures: AtomicU64,
    pub flush_count: AtomicU64,
    pub write_latency_us: AtomicU64,
    pub batch_pending: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct StoreMetricsSnapshot {
    pub records_written: u64,
    pub records_dropped: u64,
    pub write_failures: u64,
    pub flush_count: u64,
    pub avg_write_latency_us: u64,
    pub batch_pending: u64,
}

impl StoreMetrics {
    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        let flushes = self.flush_count.load(Ordering::Relaxed);
        StoreMetricsSnapshot {
            records_written: self.records_written.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            flush_count: flushes,
            avg_write_latency_us: {
                let total = self.write_latency_us.load(Ordering::Relaxed);
                if flushes > 0 {
                    total / flushes
                } else {
                    0
                }
            },
            batch_pending: self.batch_pending.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn writer_thread(
    conn: Connection,
    rx: Receiver<WriteCommand>,
    options: WriterOptions,
    metrics: Arc<StoreMetrics>,
) {
    let mut batch: Vec<HealthRecord> = Vec::with_capacity(options.batch_size);
    let mut last_flush = Instant::now();

    loop {
        match rx.recv_timeout(options.flush_interval) {
            Ok(WriteCommand::SaveHealth(record)) => {
                batch.push(record);
                metrics
                    .batch_pending
                    .store(batch.len() as u64, Ordering::Relaxed);
                if batch.len() >= options.batch_size {
                    // A failed flush keeps the batch for the next attempt
                    let _ = flush_batch(&conn, &mut batch, &metrics);
                    last_flush = Instant::now();
                }
            }
            Ok(WriteCommand::Flush(reply)) => {
                let result = flush_batch(&conn, &mut batch, &metrics);
                last_flush = Instant::now();
                let _ = reply.send(result);
            }
            Ok(WriteCommand::Exec(op, reply)) => {
                // Buffered samples land first so readers never observe a
                // purge or upsert ahead of earlier health rows
                if let Err(e) = flush_batch(&conn, &mut batch, &metrics) {
                    let _ = reply.send(Err(e));
                    continue;
                }
                let result = retry_blocking(RetryPolicy::storage(), Error::is_retriable, || {
                    exec_op(&conn, &op)
                });
                if result.is_err() {
                    metrics.write_failures.fetch_add(1, Ordering::Relaxed);
                }
                let _ = reply.send(result);
            }
            Ok(WriteCommand::Shutdown) => {
                let _ = flush_batch(&conn, &mut batch, &metrics);
                tracing::debug!("store writer thread shutting down");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                if !batch.is_empty() && last_flush.elapsed() >= options.flush_interval {
                    let _ = flush_batch(&conn, &mut batch, &metrics);
                    last_flush = Instant::now();
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = flush_batch(&conn, &mut batch, &metrics);
                break;
            }
        }
    }
}

/// Flush the buffered health samples in one transaction.
fn flush_batch(
    conn: &Connection,
    batch: &mut Vec<HealthRecord>,
    metrics: &StoreMetrics,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let start = Instant::now();
    let count = batch.len() as u64;

    let result = retry_blocking(RetryPolicy::storage(), Error::is_retriable, || {
        conn.execute("BEGIN IMMEDIATE", [])?;
        let mut insert = || -> Result<()> {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO health_records
                 (timestamp, cpu_temp_celsius, cpu_percent, mem_percent, disk_percent)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for record in batch.iter() {
                stmt.execute(params![
                    record.timestamp.to_rfc3339(),
                    record.cpu_temp_celsius,
                    record.cpu_percent,
                    record.mem_percent,
                    record.disk_percent,
                ])?;
            }
            Ok(())
        };
        match insert() {
            Ok(()) => {
                conn.execute("COMMIT", [])?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    });

    match result {
        Ok(()) => {
            batch.clear();
            metrics.records_written.fetch_add(count, Ordering::Relaxed);
            metrics.flush_count.fetch_add(1, Ordering::Relaxed);
            metrics
                .write_latency_us
                .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
            metrics.batch_pending.store(0, Ordering::Relaxed);
            Ok(())
        }
        Err(e) => {
            // Keep the batch for the next attempt
            metrics.write_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!("health batch flush failed: {e}");
            Err(e)
        }
    }
}

fn exec_op(conn: &Connection, op: &WriteOp) -> Result<u64> {
    let affected = match op {
        WriteOp::CreateScanSession(s) => conn.execute(
            "INSERT INTO scan_sessions (id, started_at, scan_type, notes)
             VALUES (?1, ?2, ?3, ?4)",
            params![s.id, s.started_at.to_rfc3339(), s.scan_type, s.notes],
        )?,
        WriteOp::AppendWifi(d) => conn.execute(
            "INSERT INTO wifi_detections
             (scan_session_id, detection_timestamp, bssid, ssid, channel,
              signal_dbm, encryption, latitude, longitude)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                d.scan_session_id,
                d.detection_timestamp.to_rfc3339(),
                d.bssid,
                d.ssid,
                d.channel,
                d.signal_dbm,
                d.encryption,
                d.latitude,
                d.longitude,
            ],
        )?,
        WriteOp::AppendBluetooth(d) => conn.execute(
            "INSERT INTO bluetooth_detections
             (scan_session_id, detection_timestamp, mac, name, rssi_dbm)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                d.scan_session_id,
                d.detection_timestamp.to_rfc3339(),
                d.mac,
                d.name,
                d.rssi_dbm,
            ],
        )?,
        WriteOp::AppendCellular(d) => conn.execute(
            "INSERT INTO cellular_detections
             (scan_session_id, detection_timestamp, cell_id, mcc, mnc, rsrp_dbm)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                d.scan_session_id,
                d.detection_timestamp.to_rfc3339(),
                d.cell_id,
                d.mcc,
                d.mnc,
                d.rsrp_dbm,
            ],
        )?,
        WriteOp::AppendTrackPoint(d) => conn.execute(
            "INSERT INTO gps_track_points
             (scan_session_id, detection_timestamp, latitude, longitude,
              speed_m_s, heading_deg, fix_mode)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                d.scan_session_id,
                d.detection_timestamp.to_rfc3339(),
                d.latitude,
                d.longitude,
                d.speed_m_s,
                d.heading_deg,
                d.fix_mode,
            ],
        )?,
        WriteOp::AppendNetworkFingerprint(d) => conn.execute(
            "INSERT INTO network_fingerprints
             (scan_session_id, detection_timestamp, bssid, vendor, signature)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                d.scan_session_id,
                d.detection_timestamp.to_rfc3339(),
                d.bssid,
                d.vendor,
                d.signature,
            ],
        )?,
        WriteOp::AppendSuspicious(d) => conn.execute(
            "INSERT INTO suspicious_activities
             (scan_session_id, detection_timestamp, kind, detail)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                d.scan_session_id,
                d.detection_timestamp.to_rfc3339(),
                d.kind,
                d.detail,
            ],
        )?,
        WriteOp::AppendAnalytics(d) => conn.execute(
            "INSERT INTO network_analytics
             (scan_session_id, detection_timestamp, metric, value)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                d.scan_session_id,
                d.detection_timestamp.to_rfc3339(),
                d.metric,
                d.value,
            ],
        )?,
        WriteOp::UpsertAppState(s) => conn.execute(
            "INSERT INTO app_state (id, last_screen, last_start, first_run)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
               last_screen = excluded.last_screen,
               last_start = excluded.last_start,
               first_run = excluded.first_run",
            params![
                s.last_screen,
                s.last_start.map(|t| t.to_rfc3339()),
                s.first_run as i64,
            ],
        )?,
        WriteOp::ReplaceDashboard(s) => {
            let widgets = serde_json::to_string(&s.widgets)
                .map_err(|e| Error::validation(format!("widget layout: {e}")))?;
            conn.execute(
                "INSERT INTO dashboard_settings (id, widgets) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET widgets = excluded.widgets",
                params![widgets],
            )?
        }
        WriteOp::TouchFingerprint { bssid, seen_at } => conn.execute(
            "INSERT INTO fingerprints (bssid, first_seen, last_seen)
             VALUES (?1, ?2, ?2)
             ON CONFLICT(bssid) DO UPDATE SET last_seen = excluded.last_seen",
            params![bssid, seen_at.to_rfc3339()],
        )?,
        WriteOp::UpsertGeofence(g) => {
            if g.points.len() < 3 {
                return Err(Error::validation("geofence needs at least 3 vertices"));
            }
            let points = serde_json::to_string(&g.points)
                .map_err(|e| Error::validation(format!("geofence points: {e}")))?;
            conn.execute(
                "INSERT INTO geofences (name, points, enter_message, exit_message)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                   points = excluded.points,
                   enter_message = excluded.enter_message,
                   exit_message = excluded.exit_message",
                params![g.name, points, g.enter_message, g.exit_message],
            )?
        }
        WriteOp::DeleteGeofence(name) => {
            conn.execute("DELETE FROM geofences WHERE name = ?1", params![name])?
        }
        WriteOp::PurgeHealth(cutoff) => conn.execute(
            "DELETE FROM health_records WHERE timestamp < ?1",
            params![cutoff.to_rfc3339()],
        )?,
        WriteOp::PurgeDetections(cutoff) => {
            let cutoff = cutoff.to_rfc3339();
            let mut total = 0usize;
            for table in [
                "wifi_detections",
                "bluetooth_detections",
                "cellular_detections",
                "gps_track_points",
                "network_fingerprints",
                "suspicious_activities",
                "network_analytics",
            ] {
                total += conn.execute(
                    &format!("DELETE FROM {table} WHERE detection_timestamp < ?1"),
                    params![cutoff],
                )?;
            }
            total
        }
        WriteOp::Vacuum => {
            // No-op while a transaction is open; the writer is the only
            // writer, so autocommit means it is safe to reclaim space
            if conn.is_autocommit() {
                conn.execute_batch("VACUUM")?;
            } else {
                tracing::debug!("vacuum skipped: transaction in progress");
            }
            0
        }
    };
    Ok(affected as u64)
}
