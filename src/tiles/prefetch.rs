// Region and route prefetch
//
// Region prefetch walks every tile overlapping a bounding box with
// bounded fetch concurrency, reporting (done, total) progress. Route
// prefetch extrapolates the current heading from the tail of the GPS
// track and warms a tube of tiles ahead of the vehicle; tiles already
// on disk cost nothing, so repeated passes are idempotent.

use std::collections::BTreeSet;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use super::{tile_for, tiles_for_bbox, TileCache, TileKey};
use crate::error::Result;
use crate::gps::GpsPosition;

/// In-flight fetch bound for region prefetch.
const FETCH_CONCURRENCY: usize = 8;
/// Track samples used to derive the heading.
const HEADING_SAMPLES: usize = 5;
/// Fallback step when the track is too short to measure one (degrees,
/// roughly 100 m).
const FALLBACK_STEP_DEG: f64 = 0.001;

pub type ProgressFn = dyn Fn(u64, u64) + Send + Sync;

/// Summary of one prefetch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    pub total: u64,
    pub fetched: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Fetch every tile overlapping the bounding box at zoom `z`.
pub async fn prefetch_region(
    cache: &TileCache,
    min_lat: f64,
    min_lon: f64,
    max_lat: f64,
    max_lon: f64,
    z: u32,
    progress: Option<&ProgressFn>,
    cancel: CancellationToken,
) -> Result<PrefetchReport> {
    let tiles = tiles_for_bbox(min_lat, min_lon, max_lat, max_lon, z);
    prefetch_tiles(cache, tiles, progress, cancel).await
}

/// Fetch a tube of tiles ahead of the track's current heading.
pub async fn route_prefetch(
    cache: &TileCache,
    track: &[GpsPosition],
    lookahead: u32,
    radius: u32,
    z: u32,
    cancel: CancellationToken,
) -> Result<PrefetchReport> {
    let Some(last) = track.last() else {
        return Ok(PrefetchReport::default());
    };

    // Heading and step from the last few samples; a stationary or
    // single-point track still warms the tube around the current tile
    let window_start = track.len().saturating_sub(HEADING_SAMPLES);
    let window = &track[window_start..];
    let (dlat, dlon) = match window.first() {
        Some(first) if window.len() >= 2 => {
            let steps = (window.len() - 1) as f64;
            let dlat = (last.latitude - first.latitude) / steps;
            let dlon = (last.longitude - first.longitude) / steps;
            if dlat.abs() < f64::EPSILON && dlon.abs() < f64::EPSILON {
                (0.0, 0.0)
            } else {
                (dlat, dlon)
            }
        }
        _ => (FALLBACK_STEP_DEG, 0.0),
    };

    let mut keys = BTreeSet::new();
    for step in 0..=lookahead {
        let lat = last.latitude + dlat * step as f64;
        let lon = last.longitude + dlon * step as f64;
        if !(-85.0511..=85.0511).contains(&lat) {
            continue;
        }
        let center = tile_for(lat, lon, z);
        let max_index = (1u32 << z).saturating_sub(1);
        for dx in -(radius as i64)..=(radius as i64) {
            for dy in -(radius as i64)..=(radius as i64) {
                let x = center.x as i64 + dx;
                let y = center.y as i64 + dy;
                if x < 0 || y < 0 || x > max_index as i64 || y > max_index as i64 {
                    continue;
                }
                keys.insert(TileKey {
                    z,
                    x: x as u32,
                    y: y as u32,
                });
            }
        }
    }

    prefetch_tiles(cache, keys.into_iter().collect(), None, cancel).await
}

async fn prefetch_tiles(
    cache: &TileCache,
    tiles: Vec<TileKey>,
    progress: Option<&ProgressFn>,
    cancel: CancellationToken,
) -> Result<PrefetchReport> {
    let total = tiles.len() as u64;
    let mut report = PrefetchReport {
        total,
        ..PrefetchReport::default()
    };
    let mut done = 0u64;

    let mut results = stream::iter(tiles.into_iter().map(|key| {
        let cancel = cancel.clone();
        async move {
            if cancel.is_cancelled() {
                return None;
            }
            Some(cache.fetch_tile(key).await)
        }
    }))
    .buffer_unordered(FETCH_CONCURRENCY);

    while let Some(result) = results.next().await {
        done += 1;
        match result {
            Some(Ok(true)) => report.fetched += 1,
            Some(Ok(false)) => report.skipped += 1,
            Some(Err(e)) => {
                report.failed += 1;
                tracing::debug!("tile fetch failed: {e}");
            }
            None => report.skipped += 1,
        }
        if let Some(progress) = progress {
            progress(done, total);
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Tiny tile server counting requests, for cache-hit assertions.
    async fn tile_server() -> (String, Arc<AtomicU64>) {
        let hits = Arc::new(AtomicU64::new(0));
        let handler_hits = hits.clone();
        let app = Router::new().route(
            "/:z/:x/:y",
            get(move |Path((z, x, y)): Path<(u32, u32, u32)>| {
                let hits = handler_hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    format!("tile-{z}-{x}-{y}").into_bytes()
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/{{z}}/{{x}}/{{y}}"), hits)
    }

    fn temp_root(tag: &str) -> std::path::PathBuf {
        let root = std::env::temp_dir().join(format!(
            "piwardrive-prefetch-{tag}-{}",
            std::process::id()
        ));
        std::fs::remove_dir_all(&root).ok();
        root
    }

    fn position(lat: f64, lon: f64) -> GpsPosition {
        GpsPosition {
            latitude: lat,
            longitude: lon,
            mode: 3,
            accuracy: None,
            speed_m_s: None,
            heading_deg: None,
        }
    }

    #[tokio::test]
    async fn second_region_pass_hits_cache() {
        let (url, hits) = tile_server().await;
        let cache = TileCache::new(temp_root("region"), url).unwrap();

        let report = prefetch_region(
            &cache,
            0.0,
            0.0,
            0.1,
            0.1,
            1,
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(report.fetched >= 1);
        assert_eq!(report.failed, 0);
        let first_pass = hits.load(Ordering::SeqCst);
        assert_eq!(first_pass, report.fetched);

        let report = prefetch_region(
            &cache,
            0.0,
            0.0,
            0.1,
            0.1,
            1,
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(report.fetched, 0);
        assert_eq!(report.skipped, report.total);
        // No additional network requests on the second pass
        assert_eq!(hits.load(Ordering::SeqCst), first_pass);
        std::fs::remove_dir_all(cache.root()).ok();
    }

    #[tokio::test]
    async fn progress_reaches_total() {
        let (url, _hits) = tile_server().await;
        let cache = TileCache::new(temp_root("progress"), url).unwrap();

        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = seen.clone();
        let progress = move |done: u64, total: u64| {
            assert!(done <= total);
            seen_cb.store(done, Ordering::SeqCst);
        };
        let report = prefetch_region(
            &cache,
            51.0,
            -0.5,
            51.5,
            0.5,
            8,
            Some(&progress),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), report.total);
        std::fs::remove_dir_all(cache.root()).ok();
    }

    #[tokio::test]
    async fn route_prefetch_is_idempotent() {
        let (url, hits) = tile_server().await;
        let cache = TileCache::new(temp_root("route"), url).unwrap();

        // Heading due east along the equator
        let track: Vec<GpsPosition> = (0..6).map(|i| position(0.0, 0.01 * i as f64)).collect();

        let report = route_prefetch(&cache, &track, 5, 1, 12, CancellationToken::new())
            .await
            .unwrap();
        assert!(report.fetched > 0);
        let first_pass = hits.load(Ordering::SeqCst);

        let report = route_prefetch(&cache, &track, 5, 1, 12, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.fetched, 0);
        assert_eq!(hits.load(Ordering::SeqCst), first_pass);
        std::fs::remove_dir_all(cache.root()).ok();
    }

    #[tokio::test]
    async fn empty_track_is_a_noop() {
        let (url, hits) = tile_server().await;
        let cache = TileCache::new(temp_root("empty"), url).unwrap();
        let report = route_prefetch(&cache, &[], 5, 1, 12, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report, PrefetchReport::default());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        std::fs::remove_dir_all(cache.root()).ok();
    }

    #[tokio::test]
    async fn cancellation_stops_fetching() {
        let (url, _hits) = tile_server().await;
        let cache = TileCache::new(temp_root("cancel"), url).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = prefetch_region(&cache, 51.0, -0.5, 51.5, 0.5, 8, None, cancel)
            .await
            .unwrap();
        assert_eq!(report.fetched, 0);
        assert_eq!(report.skipped, report.total);
        std::fs::remove_dir_all(cache.root()).ok();
    }
}
