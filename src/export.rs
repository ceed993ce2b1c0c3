// Range export and log export
//
// `export` writes a time range of health records as CSV or JSON, or the
// GPS track as KML. `export-logs` tails the application log to a file
// and optionally posts it to a remote collector.

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::config::tail_file;
use crate::error::{Error, Result};
use crate::store::{GpsTrackPoint, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Csv,
    Json,
    Kml,
}

/// Export records in [start, end] to `output`.
pub fn export_range(
    store: &Store,
    fmt: ExportFormat,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    output: &Path,
) -> Result<u64> {
    let mut file = std::fs::File::create(output)?;
    let count = match fmt {
        ExportFormat::Csv => {
            let records = store.load_health_range(start, end)?;
            let mut writer = csv::Writer::from_writer(&mut file);
            for record in &records {
                writer
                    .serialize(record)
                    .map_err(|e| Error::storage(format!("csv export: {e}")))?;
            }
            writer.flush()?;
            drop(writer);
            records.len()
        }
        ExportFormat::Json => {
            let records = store.load_health_range(start, end)?;
            serde_json::to_writer_pretty(&mut file, &records)
                .map_err(|e| Error::storage(format!("serialize export: {e}")))?;
            records.len()
        }
        ExportFormat::Kml => {
            let points = store.load_track_range(start, end)?;
            write_kml(&mut file, &points)?;
            points.len()
        }
    };
    file.flush()?;
    Ok(count as u64)
}

fn write_kml(out: &mut impl Write, points: &[GpsTrackPoint]) -> Result<()> {
    writeln!(out, "<?xml version=\"1.0\" encoding=\"UTF-8\"?>")?;
    writeln!(out, "<kml xmlns=\"http://www.opengis.net/kml/2.2\">")?;
    writeln!(out, "  <Document>")?;
    writeln!(out, "    <name>piwardrive track</name>")?;
    writeln!(out, "    <Placemark>")?;
    writeln!(out, "      <LineString>")?;
    writeln!(out, "        <coordinates>")?;
    for point in points {
        // KML is lon,lat ordered
        writeln!(out, "          {},{}", point.longitude, point.latitude)?;
    }
    writeln!(out, "        </coordinates>")?;
    writeln!(out, "      </LineString>")?;
    writeln!(out, "    </Placemark>")?;
    writeln!(out, "  </Document>")?;
    writeln!(out, "</kml>")?;
    Ok(())
}

/// Tail the newest application log, write it to `output`, optionally
/// POST it to `upload`.
pub async fn export_logs(
    log_path: &Path,
    lines: usize,
    output: &Path,
    upload: Option<&str>,
) -> Result<()> {
    let tail = tail_file(log_path, lines)?;
    let body = tail.join("\n");
    std::fs::write(output, &body)?;

    if let Some(url) = upload {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| Error::TransientNetwork(format!("build upload client: {e}")))?;
        let response = client
            .post(url)
            .header("Content-Type", "text/plain")
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::TransientNetwork(format!(
                "log upload to {url} failed: {}",
                response.status()
            )));
        }
        tracing::info!("log tail uploaded to {url}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{HealthRecord, ScanSession, WriterOptions};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn temp_home(tag: &str) -> PathBuf {
        let home = std::env::temp_dir().join(format!(
            "piwardrive-export-{tag}-{}",
            std::process::id()
        ));
        std::fs::remove_dir_all(&home).ok();
        std::fs::create_dir_all(&home).unwrap();
        home
    }

    fn ts(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    async fn seeded_store(home: &Path) -> Arc<Store> {
        let store = Arc::new(
            Store::open(&home.join("state.db"), WriterOptions::default()).unwrap(),
        );
        for hour in 10..13 {
            store
                .save_health(HealthRecord {
                    timestamp: ts(&format!("2025-06-01T{hour}:00:00Z")),
                    cpu_temp_celsius: Some(50.0),
                    cpu_percent: Some(10.0),
                    mem_percent: None,
                    disk_percent: Some(60.0),
                })
                .unwrap();
        }
        store.flush().await.unwrap();
        store
    }

    #[tokio::test]
    async fn csv_export_covers_the_range() {
        let home = temp_home("csv");
        let store = seeded_store(&home).await;
        let output = home.join("out.csv");

        let count = export_range(
            &store,
            ExportFormat::Csv,
            Some(ts("2025-06-01T10:30:00Z")),
            None,
            &output,
        )
        .unwrap();
        assert_eq!(count, 2);

        let contents = std::fs::read_to_string(&output).unwrap();
        let mut lines = contents.lines();
        assert!(lines.next().unwrap().starts_with("timestamp,"));
        assert!(contents.contains("2025-06-01T11:00:00"));
        assert!(!contents.contains("2025-06-01T10:00:00"));

        store.shutdown().await.unwrap();
        std::fs::remove_dir_all(home).ok();
    }

    #[tokio::test]
    async fn json_export_round_trips() {
        let home = temp_home("json");
        let store = seeded_store(&home).await;
        let output = home.join("out.json");

        export_range(&store, ExportFormat::Json, None, None, &output).unwrap();
        let records: Vec<HealthRecord> =
            serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].timestamp, ts("2025-06-01T10:00:00Z"));

        store.shutdown().await.unwrap();
        std::fs::remove_dir_all(home).ok();
    }

    #[tokio::test]
    async fn kml_export_writes_track() {
        let home = temp_home("kml");
        let store = seeded_store(&home).await;
        store
            .create_scan_session(ScanSession {
                id: "s1".to_string(),
                started_at: Utc::now(),
                scan_type: "drive".to_string(),
                notes: None,
            })
            .await
            .unwrap();
        store
            .append_track_point(GpsTrackPoint {
                scan_session_id: "s1".to_string(),
                detection_timestamp: ts("2025-06-01T10:00:00Z"),
                latitude: 51.5,
                longitude: -0.12,
                speed_m_s: None,
                heading_deg: None,
                fix_mode: Some(3),
            })
            .await
            .unwrap();

        let output = home.join("track.kml");
        let count = export_range(&store, ExportFormat::Kml, None, None, &output).unwrap();
        assert_eq!(count, 1);
        let contents = std::fs::read_to_string(&output).unwrap();
        assert!(contents.contains("<kml"));
        assert!(contents.contains("-0.12,51.5"));

        store.shutdown().await.unwrap();
        std::fs::remove_dir_all(home).ok();
    }

    #[tokio::test]
    async fn log_export_writes_tail_and_uploads_once() {
        use axum::routing::post;
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Mutex;

        let home = temp_home("logs");
        let log = home.join("app.log");
        std::fs::write(&log, "1\n2\n3\n").unwrap();

        let hits = Arc::new(AtomicU32::new(0));
        let captured = Arc::new(Mutex::new(String::new()));
        let handler_hits = hits.clone();
        let handler_captured = captured.clone();
        let app = axum::Router::new().route(
            "/",
            post(move |body: String| {
                let hits = handler_hits.clone();
                let captured = handler_captured.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    *captured.lock().unwrap() = body;
                    "ok"
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let output = home.join("out.txt");
        export_logs(&log, 2, &output, Some(&url)).await.unwrap();

        assert_eq!(std::fs::read_to_string(&output).unwrap(), "2\n3");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(*captured.lock().unwrap(), "2\n3");
        std::fs::remove_dir_all(home).ok();
    }
}
