// Configuration for the appliance
//
// Configuration is loaded in order of precedence:
// 1. Environment variables (highest priority)
// 2. Config snapshot ($PW_HOME/config.json)
// 3. Built-in defaults (lowest priority)
//
// The loaded document is validated once; an invalid document refuses
// startup and names the offending keys. At runtime the process holds a
// single read-only snapshot, replaced atomically by POST /api/config.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Health collector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Collector tick interval (seconds)
    pub poll_interval_secs: u64,
    /// CPU temperature alert threshold (Celsius)
    pub temp_threshold_c: f64,
    /// Memory usage alert threshold (percent)
    pub mem_threshold_percent: f64,
    /// Disk usage alert threshold (percent)
    pub disk_threshold_percent: f64,
    /// Consecutive breaching samples before an ALERT is emitted
    pub anomaly_consecutive_samples: u32,
    /// Network interfaces to sample for throughput deltas
    pub net_interfaces: Vec<String>,
    /// External service units probed for liveness
    pub service_units: Vec<String>,
    /// Health record retention window (days)
    pub retention_days: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            temp_threshold_c: 80.0,
            mem_threshold_percent: 95.0,
            disk_threshold_percent: 95.0,
            anomaly_consecutive_samples: 3,
            net_interfaces: vec!["wlan0".to_string(), "eth0".to_string()],
            service_units: vec![
                "kismet".to_string(),
                "bettercap".to_string(),
                "gpsd".to_string(),
            ],
            retention_days: 30,
        }
    }
}

/// GPS polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsConfig {
    pub host: String,
    pub port: u16,
    /// Fastest adaptive poll interval, used when moving (seconds)
    pub map_poll_gps: u64,
    /// Slowest adaptive poll interval, used when stationary (seconds)
    pub map_poll_gps_max: u64,
    /// Speed above which the fastest interval applies (m/s)
    pub movement_threshold: f64,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2947,
            map_poll_gps: 2,
            map_poll_gps_max: 30,
            movement_threshold: 1.0,
        }
    }
}

/// Tile cache geometry and prefetch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TileConfig {
    /// Cache directory (defaults under $PW_HOME/tiles)
    pub offline_tile_path: Option<PathBuf>,
    /// Remote tile source; {z}/{x}/{y} placeholders
    pub source_url: String,
    /// Maintenance job cadence (seconds)
    pub maintenance_interval_secs: u64,
    /// Tiles older than this are purged (days)
    pub max_age_days: u32,
    /// Total cache size ceiling (megabytes)
    pub cache_limit_mb: u64,
    /// Route prefetch cadence (seconds)
    pub route_prefetch_interval_secs: u64,
    /// Future steps fetched ahead of the current heading
    pub route_prefetch_lookahead: u32,
    /// Tube radius around the extrapolated route (tiles)
    pub route_prefetch_radius: u32,
    /// Zoom level used by the route prefetcher
    pub route_prefetch_zoom: u32,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            offline_tile_path: None,
            source_url: "https://tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
            maintenance_interval_secs: 3600,
            max_age_days: 30,
            cache_limit_mb: 512,
            route_prefetch_interval_secs: 60,
            route_prefetch_lookahead: 5,
            route_prefetch_radius: 1,
            route_prefetch_zoom: 16,
        }
    }
}

/// Remote sync settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Aggregator base URL; sync is disabled when unset
    pub remote_sync_url: Option<String>,
    /// Sync job cadence (seconds)
    pub interval_secs: u64,
    /// Maximum rows per range upload
    pub batch_max: u64,
    /// Skip the upload when no new rows appeared for this long (seconds)
    pub idle_timeout_secs: u64,
    /// Backoff base delay after a failed upload (seconds)
    pub backoff_base_secs: u64,
    /// Backoff ceiling (seconds)
    pub backoff_cap_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_sync_url: None,
            interval_secs: 300,
            batch_max: 1000,
            idle_timeout_secs: 3600,
            backoff_base_secs: 5,
            backoff_cap_secs: 900,
        }
    }
}

/// Log rotation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Rotation interval (seconds); hourly and daily are the useful values
    pub rotate_interval_secs: u64,
    /// Rotated archives kept on disk
    pub rotate_archives: u32,
    /// Whether the maintenance job deletes archives beyond the limit
    pub cleanup_rotated_logs: bool,
    /// Allow-list for GET /api/logs
    pub log_paths: Vec<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            rotate_interval_secs: 86_400,
            rotate_archives: 7,
            cleanup_rotated_logs: true,
            log_paths: Vec::new(),
        }
    }
}

/// Push stream (WebSocket / SSE) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Per-subscriber buffered events before drop-oldest kicks in
    pub buffer_events: usize,
    /// Heartbeat cadence (seconds)
    pub heartbeat_interval_secs: u64,
    /// Missed heartbeats before a subscriber is dropped
    pub missed_heartbeats: u32,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            buffer_events: 64,
            heartbeat_interval_secs: 15,
            missed_heartbeats: 3,
        }
    }
}

/// API authentication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// SHA-256 hex digest of the operator password; auth is disabled when unset
    pub password_hash: Option<String>,
    /// Bearer token lifetime (seconds)
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            password_hash: None,
            token_ttl_secs: 3600,
        }
    }
}

/// Task queue sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: usize,
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            capacity: 64,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the API server binds to
    pub bind_addr: String,

    /// Data directory; state.db, tiles/, logs/, config.json, offsets.json
    pub data_dir: Option<PathBuf>,

    /// Verbose logging
    pub debug_mode: bool,

    /// Detection record retention window (days)
    pub detection_retention_days: u32,

    /// Per-widget enable flags; widgets absent from the map are enabled
    pub widgets: BTreeMap<String, bool>,

    pub health: HealthConfig,
    pub gps: GpsConfig,
    pub tiles: TileConfig,
    pub sync: SyncConfig,
    pub logging: LogConfig,
    pub push: PushConfig,
    pub auth: AuthConfig,
    pub queue: QueueConfig,

    /// Static JSON served verbatim by /api/status; test affordance only.
    /// Never persisted - set through PW_HEALTH_FILE.
    #[serde(skip)]
    pub health_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            data_dir: None,
            debug_mode: false,
            detection_retention_days: 7,
            widgets: BTreeMap::new(),
            health: HealthConfig::default(),
            gps: GpsConfig::default(),
            tiles: TileConfig::default(),
            sync: SyncConfig::default(),
            logging: LogConfig::default(),
            push: PushConfig::default(),
            auth: AuthConfig::default(),
            queue: QueueConfig::default(),
            health_file: None,
        }
    }
}

impl Config {
    /// Resolve the data directory: config value > $PW_HOME > ~/.piwardrive
    pub fn home(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        if let Ok(dir) = std::env::var("PW_HOME") {
            return PathBuf::from(dir);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".piwardrive")
    }

    pub fn db_path(&self) -> PathBuf {
        self.home().join("state.db")
    }

    pub fn tile_dir(&self) -> PathBuf {
        self.tiles
            .offline_tile_path
            .clone()
            .unwrap_or_else(|| self.home().join("tiles"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.home().join("logs")
    }

    pub fn offsets_path(&self) -> PathBuf {
        self.home().join("offsets.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.home().join("config.json")
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_secs(self.health.poll_interval_secs)
    }

    /// Whether a widget is enabled; unknown flags default to enabled.
    pub fn widget_enabled(&self, name: &str) -> bool {
        self.widgets.get(name).copied().unwrap_or(true)
    }

    /// Load configuration: env > file > defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        let path = config.config_path();
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| Error::storage(format!("read {}: {e}", path.display())))?;
            config = serde_json::from_str(&contents).map_err(|e| Error::Configuration {
                keys: vec!["config.json".to_string()],
                message: e.to_string(),
            })?;
        }

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides on top of the loaded document.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("PW_BIND") {
            self.bind_addr = v;
        }
        if let Ok(v) = std::env::var("PW_HEALTH_POLL") {
            if let Ok(secs) = v.parse() {
                self.health.poll_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("PW_GPSD_HOST") {
            self.gps.host = v;
        }
        if let Ok(v) = std::env::var("PW_GPSD_PORT") {
            if let Ok(port) = v.parse() {
                self.gps.port = port;
            }
        }
        if let Ok(v) = std::env::var("PW_HEALTH_FILE") {
            self.health_file = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("PW_REMOTE_SYNC_URL") {
            self.sync.remote_sync_url = Some(v);
        }
        if let Ok(v) = std::env::var("PW_DEBUG") {
            self.debug_mode = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    /// Validate the document, collecting every offending key.
    pub fn validate(&self) -> Result<()> {
        let mut keys = Vec::new();

        if self.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            keys.push("bind_addr".to_string());
        }
        if self.health.poll_interval_secs == 0 {
            keys.push("health.poll_interval_secs".to_string());
        }
        if !(0.0..=200.0).contains(&self.health.temp_threshold_c) {
            keys.push("health.temp_threshold_c".to_string());
        }
        if !(0.0..=100.0).contains(&self.health.mem_threshold_percent) {
            keys.push("health.mem_threshold_percent".to_string());
        }
        if !(0.0..=100.0).contains(&self.health.disk_threshold_percent) {
            keys.push("health.disk_threshold_percent".to_string());
        }
        if self.health.anomaly_consecutive_samples == 0 {
            keys.push("health.anomaly_consecutive_samples".to_string());
        }
        if self.gps.map_poll_gps == 0 || self.gps.map_poll_gps > self.gps.map_poll_gps_max {
            keys.push("gps.map_poll_gps".to_string());
        }
        if self.gps.movement_threshold <= 0.0 {
            keys.push("gps.movement_threshold".to_string());
        }
        if !self.tiles.source_url.contains("{z}") {
            keys.push("tiles.source_url".to_string());
        }
        if self.tiles.maintenance_interval_secs == 0 {
            keys.push("tiles.maintenance_interval_secs".to_string());
        }
        if self.tiles.cache_limit_mb == 0 {
            keys.push("tiles.cache_limit_mb".to_string());
        }
        if let Some(url) = &self.sync.remote_sync_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                keys.push("sync.remote_sync_url".to_string());
            }
        }
        if self.sync.batch_max == 0 {
            keys.push("sync.batch_max".to_string());
        }
        if self.push.buffer_events == 0 {
            keys.push("push.buffer_events".to_string());
        }
        if self.push.missed_heartbeats == 0 {
            keys.push("push.missed_heartbeats".to_string());
        }
        if self.queue.workers == 0 {
            keys.push("queue.workers".to_string());
        }
        if self.queue.capacity == 0 {
            keys.push("queue.capacity".to_string());
        }
        if let Some(hash) = &self.auth.password_hash {
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                keys.push("auth.password_hash".to_string());
            }
        }
        if self.auth.token_ttl_secs == 0 {
            keys.push("auth.token_ttl_secs".to_string());
        }
        for path in &self.logging.log_paths {
            if !path.is_absolute() {
                keys.push(format!("logging.log_paths[{}]", path.display()));
            }
        }

        if keys.is_empty() {
            Ok(())
        } else {
            Err(Error::Configuration {
                keys,
                message: "rejected option values".to_string(),
            })
        }
    }

    /// Persist the snapshot to config.json (write-to-temp, rename).
    pub fn save(&self) -> Result<()> {
        let path = self.config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::storage(format!("serialize config: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Process-wide read-only configuration snapshot, replaced atomically
/// (copy-on-write) by POST /api/config. Readers clone an Arc; no lock is
/// held across await points.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Current snapshot. Cheap: a refcount bump.
    pub fn snapshot(&self) -> Arc<Config> {
        self.inner.read().expect("config lock poisoned").clone()
    }

    /// Validate, persist, and swap in a replacement document.
    pub fn replace(&self, config: Config) -> Result<Arc<Config>> {
        config.validate()?;
        config.save()?;
        let next = Arc::new(config);
        *self.inner.write().expect("config lock poisoned") = next.clone();
        Ok(next)
    }
}

/// Tail `path` for up to `lines` lines, used by /api/logs and export-logs.
pub fn tail_file(path: &Path, lines: usize) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::NotFound(format!("{}: {e}", path.display())))?;
    let all: Vec<&str> = contents.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|s| s.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_home(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "piwardrive-config-{tag}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn validation_names_offending_keys() {
        let mut config = Config::default();
        config.health.poll_interval_secs = 0;
        config.tiles.cache_limit_mb = 0;
        let err = config.validate().unwrap_err();
        match err {
            Error::Configuration { keys, .. } => {
                assert!(keys.contains(&"health.poll_interval_secs".to_string()));
                assert!(keys.contains(&"tiles.cache_limit_mb".to_string()));
            }
            other => panic!("expected ConfigurationError, got {other:?}"),
        }
    }

    #[test]
    fn gps_bounds_checked() {
        let mut config = Config::default();
        config.gps.map_poll_gps = 60;
        config.gps.map_poll_gps_max = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_and_reload_round_trip() {
        let home = temp_home("roundtrip");
        let mut config = Config {
            data_dir: Some(home.clone()),
            ..Config::default()
        };
        config.health.poll_interval_secs = 42;
        config.save().unwrap();

        let raw = std::fs::read_to_string(home.join("config.json")).unwrap();
        let loaded: Config = serde_json::from_str(&raw).unwrap();
        assert_eq!(loaded.health.poll_interval_secs, 42);
        std::fs::remove_dir_all(home).ok();
    }

    #[test]
    fn handle_swaps_atomically() {
        let home = temp_home("swap");
        let config = Config {
            data_dir: Some(home.clone()),
            ..Config::default()
        };
        let handle = ConfigHandle::new(config);
        let before = handle.snapshot();

        let mut next = (*before).clone();
        next.debug_mode = true;
        handle.replace(next).unwrap();

        assert!(!before.debug_mode);
        assert!(handle.snapshot().debug_mode);
        std::fs::remove_dir_all(home).ok();
    }

    #[test]
    fn replace_rejects_invalid() {
        let home = temp_home("reject");
        let config = Config {
            data_dir: Some(home.clone()),
            ..Config::default()
        };
        let handle = ConfigHandle::new(config);
        let mut bad = (*handle.snapshot()).clone();
        bad.queue.workers = 0;
        assert!(handle.replace(bad).is_err());
        std::fs::remove_dir_all(home).ok();
    }

    #[test]
    fn widget_flags_default_enabled() {
        let mut config = Config::default();
        assert!(config.widget_enabled("cpu_temp"));
        config.widgets.insert("cpu_temp".to_string(), false);
        assert!(!config.widget_enabled("cpu_temp"));
    }

    #[test]
    fn tail_returns_last_lines() {
        let path = std::env::temp_dir().join(format!("piwardrive-tail-{}", std::process::id()));
        std::fs::write(&path, "1\n2\n3\n").unwrap();
        assert_eq!(tail_file(&path, 2).unwrap(), vec!["2", "3"]);
        assert_eq!(tail_file(&path, 10).unwrap(), vec!["1", "2", "3"]);
        std::fs::remove_file(path).ok();
    }
}
