// Remote sync engine
//
// Pushes persisted health rows to a remote aggregator with at-most-once
// observable upload per row range. A per-destination cursor records the
// last row id the aggregator acknowledged; it only ever advances on a
// 2xx, so a retried range is re-sent in full and never skipped.
// Transient failures back off exponentially with full jitter inside the
// engine; a non-retriable 4xx is a protocol error that disables the
// sync job until the operator intervenes.

pub mod rangedb;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::ConfigHandle;
use crate::error::{Error, Result};
use crate::retry::backoff_with_full_jitter;
use crate::store::Store;
use rangedb::TableDump;

const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(15);

/// Persisted upload cursor for one destination.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncOffset {
    pub destination_url: String,
    pub last_row_id: i64,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// offsets.json: destination url -> cursor.
struct OffsetFile {
    path: PathBuf,
    offsets: Mutex<HashMap<String, SyncOffset>>,
}

impl OffsetFile {
    fn load(path: PathBuf) -> Result<Self> {
        let offsets = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)
                .map_err(|e| Error::storage(format!("offsets.json: {e}")))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            offsets: Mutex::new(offsets),
        })
    }

    fn get(&self, destination: &str) -> SyncOffset {
        self.offsets
            .lock()
            .expect("offsets lock poisoned")
            .get(destination)
            .cloned()
            .unwrap_or_else(|| SyncOffset {
                destination_url: destination.to_string(),
                ..SyncOffset::default()
            })
    }

    fn put(&self, offset: SyncOffset) -> Result<()> {
        let snapshot = {
            let mut offsets = self.offsets.lock().expect("offsets lock poisoned");
            offsets.insert(offset.destination_url.clone(), offset);
            offsets.clone()
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| Error::storage(format!("serialize offsets: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncResult {
    /// Range acknowledged; cursor advanced.
    Uploaded {
        range_start: i64,
        range_end: i64,
        rows: u64,
        status: u16,
    },
    /// No rows beyond the cursor this pass; still inside the idle
    /// window.
    Idle,
    /// Cursor unchanged and no new rows for at least the idle timeout;
    /// the pass was skipped entirely.
    IdleTimeout { idle_for: Duration },
    /// A previous failure's backoff window is still open.
    BackedOff,
    /// Transient failure this pass; the engine scheduled a retry.
    Deferred { consecutive_failures: u32 },
    /// No destination configured.
    NoDestination,
}

pub struct RemoteSync {
    store: std::sync::Arc<Store>,
    config: ConfigHandle,
    offsets: OffsetFile,
    client: reqwest::Client,
    next_attempt: Mutex<Option<Instant>>,
    /// Last time the store held rows beyond the cursor; drives the
    /// idle-timeout skip.
    last_new_rows: Mutex<Instant>,
}

impl RemoteSync {
    pub fn new(store: std::sync::Arc<Store>, config: ConfigHandle) -> Result<Self> {
        let offsets_path = config.snapshot().offsets_path();
        let client = reqwest::Client::builder()
            .timeout(OUTBOUND_TIMEOUT)
            .build()
            .map_err(|e| Error::TransientNetwork(format!("build sync client: {e}")))?;
        Ok(Self {
            store,
            config,
            offsets: OffsetFile::load(offsets_path)?,
            client,
            next_attempt: Mutex::new(None),
            last_new_rows: Mutex::new(Instant::now()),
        })
    }

    #[allow(dead_code)] // Cursor introspection for operator tooling
    pub fn offset_for(&self, destination: &str) -> SyncOffset {
        self.offsets.get(destination)
    }

    /// One sync pass against the configured destination.
    pub async fn run_once(&self) -> Result<SyncResult> {
        let config = self.config.snapshot();
        let Some(destination) = config.sync.remote_sync_url.clone() else {
            return Ok(SyncResult::NoDestination);
        };
        self.sync_destination(&destination, config.sync.batch_max, &config)
            .await
    }

    async fn sync_destination(
        &self,
        destination: &str,
        batch_max: u64,
        config: &crate::config::Config,
    ) -> Result<SyncResult> {
        {
            let next = self.next_attempt.lock().expect("backoff lock poisoned");
            if let Some(at) = *next {
                if Instant::now() < at {
                    return Ok(SyncResult::BackedOff);
                }
            }
        }

        let mut offset = self.offsets.get(destination);

        // Cursor unchanged and nothing new: inside the idle window this
        // is an ordinary empty pass; past it the engine goes quiescent
        // and skips the upload entirely
        if self.store.max_health_row_id()? <= offset.last_row_id {
            let idle_for = self
                .last_new_rows
                .lock()
                .expect("idle clock poisoned")
                .elapsed();
            if idle_for >= Duration::from_secs(config.sync.idle_timeout_secs) {
                tracing::debug!("no new rows for {idle_for:?}, skipping upload");
                return Ok(SyncResult::IdleTimeout { idle_for });
            }
            return Ok(SyncResult::Idle);
        }
        *self.last_new_rows.lock().expect("idle clock poisoned") = Instant::now();

        let rows = self.store.health_rows_after(offset.last_row_id, batch_max)?;
        if rows.is_empty() {
            return Ok(SyncResult::Idle);
        }

        let range_start = rows.first().expect("nonempty").0;
        let range_end = rows.last().expect("nonempty").0;
        let row_count = rows.len() as u64;
        let body = rangedb::encode(&[TableDump {
            name: "health_records".to_string(),
            rows: rows.into_iter().map(|(_, row)| row).collect(),
        }])?;
        let digest = {
            let mut hasher = Sha256::new();
            hasher.update(&body);
            format!("{:x}", hasher.finalize())
        };

        offset.last_attempt = Some(Utc::now());
        let url = format!("{}/ingest", destination.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/x-pwdb")
            .header("X-Range-Start", range_start.to_string())
            .header("X-Range-End", range_end.to_string())
            .header("X-Content-Digest", &digest)
            .body(body)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                let status = response.status().as_u16();
                offset.last_row_id = range_end;
                offset.last_success = Some(Utc::now());
                offset.consecutive_failures = 0;
                self.offsets.put(offset)?;
                *self.next_attempt.lock().expect("backoff lock poisoned") = None;
                tracing::info!(
                    "synced rows {range_start}..={range_end} to {destination} ({status})"
                );
                Ok(SyncResult::Uploaded {
                    range_start,
                    range_end,
                    rows: row_count,
                    status,
                })
            }
            Ok(response) => {
                let status = response.status();
                if status.as_u16() == 408
                    || status.as_u16() == 429
                    || status.is_server_error()
                {
                    self.defer(offset, config, format!("{url}: {status}"))
                } else {
                    // Cursor stays put; the operator re-enables the job
                    offset.consecutive_failures += 1;
                    self.offsets.put(offset)?;
                    Err(Error::PermanentProtocol(format!(
                        "{url} rejected upload: {status}"
                    )))
                }
            }
            Err(e) => {
                let message = format!("{url}: {e}");
                self.defer(offset, config, message)
            }
        }
    }

    fn defer(
        &self,
        mut offset: SyncOffset,
        config: &crate::config::Config,
        message: String,
    ) -> Result<SyncResult> {
        offset.consecutive_failures += 1;
        let failures = offset.consecutive_failures;
        let delay = backoff_with_full_jitter(
            Duration::from_secs(config.sync.backoff_base_secs),
            Duration::from_secs(config.sync.backoff_cap_secs),
            failures.saturating_sub(1),
        );
        self.offsets.put(offset)?;
        *self.next_attempt.lock().expect("backoff lock poisoned") =
            Some(Instant::now() + delay);
        tracing::warn!("sync deferred ({message}); retry in {delay:?} (failure #{failures})");
        Ok(SyncResult::Deferred {
            consecutive_failures: failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::{HealthRecord, WriterOptions};
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::sync::Arc;

    struct Captured {
        headers: Mutex<Option<HeaderMap>>,
        body: Mutex<Option<Vec<u8>>>,
        status: AtomicU16,
        hits: AtomicU16,
    }

    async fn aggregator(captured: Arc<Captured>) -> String {
        let state = captured.clone();
        let app = Router::new().route(
            "/ingest",
            post(move |headers: HeaderMap, body: bytes::Bytes| {
                let state = state.clone();
                async move {
                    state.hits.fetch_add(1, Ordering::SeqCst);
                    *state.headers.lock().unwrap() = Some(headers);
                    *state.body.lock().unwrap() = Some(body.to_vec());
                    axum::http::StatusCode::from_u16(state.status.load(Ordering::SeqCst))
                        .unwrap()
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn harness(
        tag: &str,
        status: u16,
        mutate: impl FnOnce(&mut Config),
    ) -> (RemoteSync, Arc<Captured>, PathBuf, String) {
        let home = std::env::temp_dir().join(format!(
            "piwardrive-sync-{tag}-{}",
            std::process::id()
        ));
        std::fs::remove_dir_all(&home).ok();
        std::fs::create_dir_all(&home).unwrap();

        let captured = Arc::new(Captured {
            headers: Mutex::new(None),
            body: Mutex::new(None),
            status: AtomicU16::new(status),
            hits: AtomicU16::new(0),
        });
        let destination = aggregator(captured.clone()).await;

        let mut config = Config {
            data_dir: Some(home.clone()),
            ..Config::default()
        };
        config.sync.remote_sync_url = Some(destination.clone());
        config.sync.backoff_base_secs = 60;
        mutate(&mut config);

        let store = Arc::new(
            Store::open(&home.join("state.db"), WriterOptions::default()).unwrap(),
        );
        for hour in 10..13 {
            store
                .save_health(HealthRecord {
                    timestamp: chrono::DateTime::parse_from_rfc3339(&format!(
                        "2025-06-01T{hour}:00:00Z"
                    ))
                    .unwrap()
                    .with_timezone(&Utc),
                    cpu_temp_celsius: Some(50.0),
                    cpu_percent: None,
                    mem_percent: None,
                    disk_percent: None,
                })
                .unwrap();
        }
        store.flush().await.unwrap();

        let sync = RemoteSync::new(store, ConfigHandle::new(config)).unwrap();
        (sync, captured, home, destination)
    }

    #[tokio::test]
    async fn successful_upload_advances_cursor() {
        let (sync, captured, home, destination) = harness("ok", 200, |_| {}).await;

        let result = sync.run_once().await.unwrap();
        let SyncResult::Uploaded {
            range_start,
            range_end,
            status,
            ..
        } = result
        else {
            panic!("expected upload, got {result:?}");
        };
        assert_eq!(range_start, 1);
        assert_eq!(range_end, 3);
        assert_eq!(status, 200);

        let headers = captured.headers.lock().unwrap().clone().unwrap();
        assert_eq!(headers["content-type"], "application/x-pwdb");
        assert_eq!(headers["x-range-start"], "1");
        assert_eq!(headers["x-range-end"], "3");

        let body = captured.body.lock().unwrap().clone().unwrap();
        let tables = rangedb::decode(&body).unwrap();
        assert_eq!(tables[0].name, "health_records");
        assert_eq!(tables[0].rows.len(), 3);

        // Cursor persisted; the next pass is idle
        assert_eq!(sync.offset_for(&destination).last_row_id, 3);
        assert_eq!(sync.run_once().await.unwrap(), SyncResult::Idle);

        let raw = std::fs::read_to_string(home.join("offsets.json")).unwrap();
        assert!(raw.contains("\"last_row_id\": 3"));
        std::fs::remove_dir_all(home).ok();
    }

    #[tokio::test]
    async fn idle_timeout_goes_quiescent() {
        let (sync, captured, home, _destination) = harness("idle", 200, |c| {
            c.sync.idle_timeout_secs = 0;
        })
        .await;

        assert!(matches!(
            sync.run_once().await.unwrap(),
            SyncResult::Uploaded { .. }
        ));

        // Everything is synced and the idle window is zero: the next
        // pass skips the upload entirely
        assert!(matches!(
            sync.run_once().await.unwrap(),
            SyncResult::IdleTimeout { .. }
        ));
        assert_eq!(captured.hits.load(Ordering::SeqCst), 1);
        std::fs::remove_dir_all(home).ok();
    }

    #[tokio::test]
    async fn server_error_defers_without_advancing() {
        let (sync, captured, home, destination) = harness("5xx", 500, |_| {}).await;

        let result = sync.run_once().await.unwrap();
        assert_eq!(
            result,
            SyncResult::Deferred {
                consecutive_failures: 1
            }
        );
        let offset = sync.offset_for(&destination);
        assert_eq!(offset.last_row_id, 0);
        assert_eq!(offset.consecutive_failures, 1);
        assert!(offset.last_success.is_none());

        // Backoff gate holds: no second request goes out
        assert_eq!(sync.run_once().await.unwrap(), SyncResult::BackedOff);
        assert_eq!(captured.hits.load(Ordering::SeqCst), 1);
        std::fs::remove_dir_all(home).ok();
    }

    #[tokio::test]
    async fn client_error_is_permanent() {
        let (sync, _captured, home, destination) = harness("4xx", 422, |_| {}).await;
        let err = sync.run_once().await.unwrap_err();
        assert_eq!(err.kind(), "PermanentProtocolError");
        assert_eq!(sync.offset_for(&destination).last_row_id, 0);
        std::fs::remove_dir_all(home).ok();
    }

    #[tokio::test]
    async fn no_destination_is_reported() {
        let home = std::env::temp_dir().join(format!(
            "piwardrive-sync-nodest-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&home).unwrap();
        let config = Config {
            data_dir: Some(home.clone()),
            ..Config::default()
        };
        let store = Arc::new(
            Store::open(&home.join("state.db"), WriterOptions::default()).unwrap(),
        );
        let sync = RemoteSync::new(store, ConfigHandle::new(config)).unwrap();
        assert_eq!(sync.run_once().await.unwrap(), SyncResult::NoDestination);
        std::fs::remove_dir_all(home).ok();
    }
}
