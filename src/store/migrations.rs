// Versioned schema migrations
//
// Each migration declares forward and rollback SQL. Applied versions are
// recorded in schema_migrations; opening a database whose version is
// newer than the highest migration known to this binary fails
// (forward-incompatible).

use rusqlite::Connection;

use crate::error::{Error, Result};

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "health and singletons",
        up: "
            CREATE TABLE health_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                cpu_temp_celsius REAL,
                cpu_percent REAL,
                mem_percent REAL,
                disk_percent REAL
            );
            CREATE INDEX idx_health_timestamp ON health_records(timestamp);
            CREATE TABLE app_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_screen TEXT,
                last_start TEXT,
                first_run INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE dashboard_settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                widgets TEXT NOT NULL DEFAULT '[]'
            );
        ",
        down: "
            DROP TABLE dashboard_settings;
            DROP TABLE app_state;
            DROP INDEX idx_health_timestamp;
            DROP TABLE health_records;
        ",
    },
    Migration {
        version: 2,
        name: "scan sessions and detections",
        up: "
            CREATE TABLE scan_sessions (
                id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                scan_type TEXT NOT NULL,
                notes TEXT
            );
            CREATE TABLE wifi_detections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scan_session_id TEXT NOT NULL REFERENCES scan_sessions(id),
                detection_timestamp TEXT NOT NULL,
                bssid TEXT NOT NULL,
                ssid TEXT,
                channel INTEGER,
                signal_dbm REAL,
                encryption TEXT,
                latitude REAL,
                longitude REAL
            );
            CREATE INDEX idx_wifi_ts ON wifi_detections(detection_timestamp);
            CREATE TABLE bluetooth_detections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scan_session_id TEXT NOT NULL REFERENCES scan_sessions(id),
                detection_timestamp TEXT NOT NULL,
                mac TEXT NOT NULL,
                name TEXT,
                rssi_dbm REAL
            );
            CREATE INDEX idx_bt_ts ON bluetooth_detections(detection_timestamp);
            CREATE TABLE cellular_detections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scan_session_id TEXT NOT NULL REFERENCES scan_sessions(id),
                detection_timestamp TEXT NOT NULL,
                cell_id TEXT NOT NULL,
                mcc TEXT,
                mnc TEXT,
                rsrp_dbm REAL
            );
            CREATE INDEX idx_cell_ts ON cellular_detections(detection_timestamp);
            CREATE TABLE gps_track_points (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scan_session_id TEXT NOT NULL REFERENCES scan_sessions(id),
                detection_timestamp TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                speed_m_s REAL,
                heading_deg REAL,
                fix_mode INTEGER
            );
            CREATE INDEX idx_track_ts ON gps_track_points(detection_timestamp);
            CREATE TABLE network_fingerprints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scan_session_id TEXT NOT NULL REFERENCES scan_sessions(id),
                detection_timestamp TEXT NOT NULL,
                bssid TEXT NOT NULL,
                vendor TEXT,
                signature TEXT
            );
            CREATE TABLE suspicious_activities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scan_session_id TEXT NOT NULL REFERENCES scan_sessions(id),
                detection_timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                detail TEXT
            );
            CREATE TABLE network_analytics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scan_session_id TEXT NOT NULL REFERENCES scan_sessions(id),
                detection_timestamp TEXT NOT NULL,
                metric TEXT NOT NULL,
                value REAL NOT NULL
            );
            CREATE TABLE fingerprints (
                bssid TEXT PRIMARY KEY,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL
            );
        ",
        down: "
            DROP TABLE fingerprints;
            DROP TABLE network_analytics;
            DROP TABLE suspicious_activities;
            DROP TABLE network_fingerprints;
            DROP INDEX idx_track_ts;
            DROP TABLE gps_track_points;
            DROP INDEX idx_cell_ts;
            DROP TABLE cellular_detections;
            DROP INDEX idx_bt_ts;
            DROP TABLE bluetooth_detections;
            DROP INDEX idx_wifi_ts;
            DROP TABLE wifi_detections;
            DROP TABLE scan_sessions;
        ",
    },
    Migration {
        version: 3,
        name: "geofences",
        up: "
            CREATE TABLE geofences (
                name TEXT PRIMARY KEY,
                points TEXT NOT NULL,
                enter_message TEXT,
                exit_message TEXT
            );
        ",
        down: "
            DROP TABLE geofences;
        ",
    },
];

/// Highest version this binary knows how to produce.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

fn ensure_bookkeeping(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )?;
    Ok(())
}

/// Version currently applied on disk (0 for a fresh database).
pub fn applied_version(conn: &Connection) -> Result<i64> {
    ensure_bookkeeping(conn)?;
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Migrate forward or backward to `target`. Each step runs in its own
/// transaction together with its bookkeeping row.
pub fn migrate_to(conn: &mut Connection, target: i64) -> Result<()> {
    let current = applied_version(conn)?;
    if current > latest_version() {
        return Err(Error::storage(format!(
            "database schema version {current} is newer than supported {}",
            latest_version()
        )));
    }
    if target > latest_version() || target < 0 {
        return Err(Error::validation(format!(
            "unknown schema version {target} (supported 0..={})",
            latest_version()
        )));
    }

    if target > current {
        for migration in MIGRATIONS.iter().filter(|m| m.version > current && m.version <= target) {
            let tx = conn.transaction()?;
            tx.execute_batch(migration.up)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    migration.version,
                    migration.name,
                    chrono::Utc::now().to_rfc3339()
                ],
            )?;
            tx.commit()?;
            tracing::info!("applied migration {} ({})", migration.version, migration.name);
        }
    } else if target < current {
        for migration in MIGRATIONS
            .iter()
            .rev()
            .filter(|m| m.version <= current && m.version > target)
        {
            let tx = conn.transaction()?;
            tx.execute_batch(migration.down)?;
            tx.execute(
                "DELETE FROM schema_migrations WHERE version = ?1",
                [migration.version],
            )?;
            tx.commit()?;
            tracing::info!(
                "rolled back migration {} ({})",
                migration.version,
                migration.name
            );
        }
    }
    Ok(())
}

/// Bring the database to the latest known version. Idempotent.
pub fn migrate_latest(conn: &mut Connection) -> Result<()> {
    migrate_to(conn, latest_version())
}
