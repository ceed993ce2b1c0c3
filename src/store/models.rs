// Row types for the persistence store
//
// Detection records are append-mostly and carry the scan session they
// were captured under. Health records are immutable samples; only
// AppState, DashboardSettings and Fingerprint.last_seen are ever
// rewritten in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One host telemetry sample. Timestamps are monotonically
/// non-decreasing per producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub timestamp: DateTime<Utc>,
    pub cpu_temp_celsius: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub mem_percent: Option<f64>,
    pub disk_percent: Option<f64>,
}

/// Singleton UI state; upsert semantics, exactly one row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppState {
    pub last_screen: Option<String>,
    pub last_start: Option<DateTime<Utc>>,
    pub first_run: bool,
}

/// Singleton widget layout; replaced atomically as an opaque list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardSettings {
    pub widgets: Vec<serde_json::Value>,
}

/// Per-BSSID sighting record. `first_seen` is immutable; `last_seen`
/// advances on every sighting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fingerprint {
    pub bssid: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A scanner run; every detection references one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub scan_type: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiDetection {
    pub scan_session_id: String,
    pub detection_timestamp: DateTime<Utc>,
    pub bssid: String,
    pub ssid: Option<String>,
    pub channel: Option<i64>,
    pub signal_dbm: Option<f64>,
    pub encryption: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BluetoothDetection {
    pub scan_session_id: String,
    pub detection_timestamp: DateTime<Utc>,
    pub mac: String,
    pub name: Option<String>,
    pub rssi_dbm: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellularDetection {
    pub scan_session_id: String,
    pub detection_timestamp: DateTime<Utc>,
    pub cell_id: String,
    pub mcc: Option<String>,
    pub mnc: Option<String>,
    pub rsrp_dbm: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpsTrackPoint {
    pub scan_session_id: String,
    pub detection_timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_m_s: Option<f64>,
    pub heading_deg: Option<f64>,
    pub fix_mode: Option<i64>,
}

/// Derived per-network signature captured during a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkFingerprint {
    pub scan_session_id: String,
    pub detection_timestamp: DateTime<Utc>,
    pub bssid: String,
    pub vendor: Option<String>,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspiciousActivity {
    pub scan_session_id: String,
    pub detection_timestamp: DateTime<Utc>,
    pub kind: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAnalyticsRow {
    pub scan_session_id: String,
    pub detection_timestamp: DateTime<Utc>,
    pub metric: String,
    pub value: f64,
}

/// Named polygon with enter/exit notifications. At least three vertices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeofencePolygon {
    pub name: String,
    /// (lat, lon) vertices
    pub points: Vec<(f64, f64)>,
    pub enter_message: Option<String>,
    pub exit_message: Option<String>,
}

impl GeofencePolygon {
    /// Ray-cast containment test.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        let n = self.points.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (lat_i, lon_i) = self.points[i];
            let (lat_j, lon_j) = self.points[j];
            if ((lon_i > lon) != (lon_j > lon))
                && (lat < (lat_j - lat_i) * (lon - lon_i) / (lon_j - lon_i) + lat_i)
            {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}
