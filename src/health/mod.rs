// Health and telemetry collector
//
// One tick samples host metrics, per-interface throughput, GPS and the
// liveness of the configured external services, then writes the record
// through the store and publishes it on the status topic. Service
// probes run behind per-service circuit breakers so a wedged scanner
// cannot stall the tick. Sustained threshold breaches and geofence
// transitions raise events on the alerts topic.

pub mod breaker;
pub mod parsers;
pub mod system;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, TOPIC_ALERTS, TOPIC_STATUS};
use crate::config::ConfigHandle;
use crate::error::Result;
use crate::gps::GpsClient;
use crate::store::{HealthRecord, Store};
use breaker::{BreakerState, CircuitBreaker};
use parsers::CpuTimes;

/// Consecutive probe failures before a service breaker opens.
const BREAKER_THRESHOLD: u32 = 3;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);
const BREAKER_COOLDOWN_CAP: Duration = Duration::from_secs(480);

#[derive(Debug, Clone, Copy)]
struct NetSample {
    rx: u64,
    tx: u64,
    at: Instant,
}

#[derive(Default)]
struct CollectorState {
    breakers: HashMap<String, CircuitBreaker>,
    prior_cpu: Option<CpuTimes>,
    prior_net: HashMap<String, NetSample>,
    anomaly_streak: u32,
    inside_fence: HashMap<String, bool>,
}

pub struct HealthCollector {
    store: std::sync::Arc<Store>,
    bus: Bus,
    gps: std::sync::Arc<GpsClient>,
    config: ConfigHandle,
    state: tokio::sync::Mutex<CollectorState>,
}

impl HealthCollector {
    pub fn new(
        store: std::sync::Arc<Store>,
        bus: Bus,
        gps: std::sync::Arc<GpsClient>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            store,
            bus,
            gps,
            config,
            state: tokio::sync::Mutex::new(CollectorState::default()),
        }
    }

    /// One collection pass. Observes `cancel` between samples.
    pub async fn tick(&self, cancel: CancellationToken) -> Result<()> {
        let config = self.config.snapshot();
        let mut state = self.state.lock().await;

        if cancel.is_cancelled() {
            return Ok(());
        }

        // Host metrics
        let cpu_temp = system::read_cpu_temp().await;
        let cpu_times = system::read_cpu_times().await;
        let cpu_percent = match (state.prior_cpu, cpu_times) {
            (Some(prior), Some(current)) => parsers::cpu_percent_between(prior, current),
            _ => None,
        };
        state.prior_cpu = cpu_times;
        let mem_percent = system::read_mem_percent().await;
        let disk_percent = system::read_disk_percent(&config.home()).await;

        if cancel.is_cancelled() {
            return Ok(());
        }

        // Per-interface throughput deltas against the cached sample
        let mut net = serde_json::Map::new();
        for iface in &config.health.net_interfaces {
            if let Some((rx, tx)) = system::read_net_counters(iface).await {
                let now = Instant::now();
                if let Some(prior) = state.prior_net.get(iface) {
                    let dt = now.duration_since(prior.at).as_secs_f64();
                    if dt > 0.0 {
                        net.insert(
                            iface.clone(),
                            json!({
                                "rx_bytes_per_s": (rx.saturating_sub(prior.rx)) as f64 / dt,
                                "tx_bytes_per_s": (tx.saturating_sub(prior.tx)) as f64 / dt,
                            }),
                        );
                    }
                }
                state.prior_net.insert(iface.clone(), NetSample { rx, tx, at: now });
            }
        }

        // Service liveness behind per-service breakers
        let mut services = serde_json::Map::new();
        for unit in &config.health.service_units {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let breaker = state.breakers.entry(unit.clone()).or_insert_with(|| {
                CircuitBreaker::new(BREAKER_THRESHOLD, BREAKER_COOLDOWN, BREAKER_COOLDOWN_CAP)
            });
            let status = if breaker.allow() {
                match system::service_active(unit).await {
                    Ok(active) => {
                        breaker.record_success();
                        if active { "active" } else { "inactive" }
                    }
                    Err(e) => {
                        breaker.record_failure();
                        tracing::debug!("service probe {unit} failed: {e}");
                        "unknown"
                    }
                }
            } else {
                "unknown"
            };
            services.insert(
                unit.clone(),
                json!({
                    "status": status,
                    "breaker": match breaker.state() {
                        BreakerState::Closed => "closed",
                        BreakerState::Open => "open",
                        BreakerState::HalfOpen => "half_open",
                    },
                }),
            );
        }

        let position = self.gps.get_position().await;

        let record = HealthRecord {
            timestamp: Utc::now(),
            cpu_temp_celsius: cpu_temp,
            cpu_percent,
            mem_percent,
            disk_percent,
        };

        self.store.save_health(record.clone())?;

        self.bus.publish(
            TOPIC_STATUS,
            json!({
                "record": record,
                "net": net,
                "services": services,
                "gps": position.as_ref().map(|p| json!({
                    "lat": p.latitude,
                    "lon": p.longitude,
                    "mode": p.mode,
                    "accuracy": p.accuracy,
                })),
            }),
        );

        self.check_anomalies(&mut state, &record, &config);
        if let Some(position) = &position {
            self.check_geofences(&mut state, position.latitude, position.longitude);
        }

        Ok(())
    }

    /// Emit one ALERT when a threshold has been breached for N
    /// consecutive samples; re-arm only after a clean sample.
    fn check_anomalies(
        &self,
        state: &mut CollectorState,
        record: &HealthRecord,
        config: &crate::config::Config,
    ) {
        let mut breaches = Vec::new();
        if let Some(temp) = record.cpu_temp_celsius {
            if temp > config.health.temp_threshold_c {
                breaches.push(format!("cpu_temp {temp:.1}C"));
            }
        }
        if let Some(mem) = record.mem_percent {
            if mem > config.health.mem_threshold_percent {
                breaches.push(format!("mem {mem:.1}%"));
            }
        }
        if let Some(disk) = record.disk_percent {
            if disk > config.health.disk_threshold_percent {
                breaches.push(format!("disk {disk:.1}%"));
            }
        }

        if breaches.is_empty() {
            state.anomaly_streak = 0;
            return;
        }
        state.anomaly_streak += 1;
        if state.anomaly_streak == config.health.anomaly_consecutive_samples {
            tracing::warn!("anomaly alert: {}", breaches.join(", "));
            self.bus.publish(
                TOPIC_ALERTS,
                json!({
                    "kind": "ALERT",
                    "breaches": breaches,
                    "consecutive_samples": state.anomaly_streak,
                }),
            );
        }
    }

    fn check_geofences(&self, state: &mut CollectorState, lat: f64, lon: f64) {
        let fences = match self.store.list_geofences() {
            Ok(fences) => fences,
            Err(e) => {
                tracing::debug!("geofence load failed: {e}");
                return;
            }
        };
        for fence in fences {
            let inside = fence.contains(lat, lon);
            let was_inside = state.inside_fence.get(&fence.name).copied().unwrap_or(false);
            if inside != was_inside {
                let message = if inside {
                    fence.enter_message.clone()
                } else {
                    fence.exit_message.clone()
                };
                self.bus.publish(
                    TOPIC_ALERTS,
                    json!({
                        "kind": "geofence",
                        "name": fence.name,
                        "event": if inside { "enter" } else { "exit" },
                        "message": message,
                    }),
                );
            }
            state.inside_fence.insert(fence.name, inside);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::config::Config;
    use crate::store::{GeofencePolygon, WriterOptions};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn temp_db(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "piwardrive-health-{tag}-{}.db",
            std::process::id()
        ))
    }

    fn collector(tag: &str) -> (HealthCollector, Bus, PathBuf) {
        let path = temp_db(tag);
        std::fs::remove_file(&path).ok();
        let store = Arc::new(Store::open(&path, WriterOptions::default()).unwrap());
        let bus = Bus::new(16);
        // Unroutable daemon: positions stay None, ticks still succeed
        let gps = Arc::new(GpsClient::new("127.0.0.1", 1, Duration::from_secs(600)));
        let config = ConfigHandle::new(Config {
            data_dir: Some(std::env::temp_dir()),
            ..Config::default()
        });
        (
            HealthCollector::new(store, bus.clone(), gps, config),
            bus,
            path,
        )
    }

    #[tokio::test]
    async fn tick_publishes_status() {
        let (collector, bus, path) = collector("tick");
        let mut sub = bus.subscribe(TOPIC_STATUS);

        collector.tick(CancellationToken::new()).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(message.payload.get("record").is_some());
        assert!(message.payload.get("services").is_some());
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn anomaly_fires_after_consecutive_breaches() {
        let (collector, bus, path) = collector("anomaly");
        let mut alerts = bus.subscribe(TOPIC_ALERTS);
        let config = collector.config.snapshot();

        let hot = HealthRecord {
            timestamp: Utc::now(),
            cpu_temp_celsius: Some(99.0),
            cpu_percent: None,
            mem_percent: None,
            disk_percent: None,
        };
        let mut state = CollectorState::default();
        for _ in 0..config.health.anomaly_consecutive_samples {
            collector.check_anomalies(&mut state, &hot, &config);
        }
        let alert = tokio::time::timeout(Duration::from_millis(200), alerts.recv())
            .await
            .expect("alert emitted")
            .unwrap();
        assert_eq!(alert.payload["kind"], "ALERT");

        // One more hot sample does not re-fire
        collector.check_anomalies(&mut state, &hot, &config);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), alerts.recv())
                .await
                .is_err()
        );
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn geofence_transition_alerts() {
        let (collector, bus, path) = collector("fence");
        let mut alerts = bus.subscribe(TOPIC_ALERTS);

        collector
            .store
            .upsert_geofence(GeofencePolygon {
                name: "depot".to_string(),
                points: vec![(0.0, 0.0), (0.0, 10.0), (10.0, 10.0), (10.0, 0.0)],
                enter_message: Some("welcome".to_string()),
                exit_message: Some("goodbye".to_string()),
            })
            .await
            .unwrap();

        let mut state = CollectorState::default();
        collector.check_geofences(&mut state, 5.0, 5.0);
        let enter = alerts.recv().await.unwrap();
        assert_eq!(enter.payload["event"], "enter");
        assert_eq!(enter.payload["message"], "welcome");

        collector.check_geofences(&mut state, 20.0, 20.0);
        let exit = alerts.recv().await.unwrap();
        assert_eq!(exit.payload["event"], "exit");

        // No transition, no alert
        collector.check_geofences(&mut state, 21.0, 21.0);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), alerts.recv())
                .await
                .is_err()
        );

        collector.store.shutdown().await.unwrap();
        std::fs::remove_file(path).ok();
    }
}
