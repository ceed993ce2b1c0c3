// On-disk map tile cache
//
// Tiles are keyed by (z, x, y) and stored at a path derived from the
// key. Writes are atomic: bytes land in a .tmp sibling and are renamed
// into place while an exclusive per-key lock is held, so readers see
// the old tile or the new one, never a torn file. Maintenance is
// age-based purge plus size-based eviction by ascending mtime.

pub mod prefetch;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::error::{Error, Result};
use crate::retry::{retry, RetryPolicy};

/// Tile fetch timeout.
const FETCH_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub z: u32,
    pub x: u32,
    pub y: u32,
}

/// Slippy-map tile containing a coordinate.
pub fn tile_for(lat: f64, lon: f64, z: u32) -> TileKey {
    let n = 2f64.powi(z as i32);
    let x = ((lon + 180.0) / 360.0 * n).floor();
    let lat_rad = lat.to_radians();
    let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / std::f64::consts::PI) / 2.0 * n)
        .floor();
    let max = n as u32 - 1;
    TileKey {
        z,
        x: (x.max(0.0) as u32).min(max),
        y: (y.max(0.0) as u32).min(max),
    }
}

/// All tiles overlapping the bounding box at zoom `z`.
pub fn tiles_for_bbox(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64, z: u32) -> Vec<TileKey> {
    let a = tile_for(max_lat, min_lon, z);
    let b = tile_for(min_lat, max_lon, z);
    let (x0, x1) = (a.x.min(b.x), a.x.max(b.x));
    let (y0, y1) = (a.y.min(b.y), a.y.max(b.y));
    let mut tiles = Vec::with_capacity(((x1 - x0 + 1) * (y1 - y0 + 1)) as usize);
    for x in x0..=x1 {
        for y in y0..=y1 {
            tiles.push(TileKey { z, x, y });
        }
    }
    tiles
}

pub struct TileCache {
    root: PathBuf,
    source_url: String,
    client: reqwest::Client,
    locks: Mutex<HashMap<TileKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl TileCache {
    pub fn new(root: PathBuf, source_url: String) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| Error::TransientNetwork(format!("build tile client: {e}")))?;
        Ok(Self {
            root,
            source_url,
            client,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic path for a key: root/z/x/y.png
    pub fn path_for(&self, key: TileKey) -> PathBuf {
        self.root
            .join(key.z.to_string())
            .join(key.x.to_string())
            .join(format!("{}.png", key.y))
    }

    pub fn contains(&self, key: TileKey) -> bool {
        self.path_for(key).is_file()
    }

    fn key_lock(&self, key: TileKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("tile lock table poisoned");
        locks.entry(key).or_default().clone()
    }

    fn remote_url(&self, key: TileKey) -> String {
        self.source_url
            .replace("{z}", &key.z.to_string())
            .replace("{x}", &key.x.to_string())
            .replace("{y}", &key.y.to_string())
    }

    /// Atomically write tile bytes under the key's exclusive lock.
    pub async fn store_tile(&self, key: TileKey, bytes: &[u8]) -> Result<()> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("png.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Ensure a tile is present. Returns true when bytes were fetched,
    /// false on a cache hit or a permanent (4xx) skip. 5xx and timeouts
    /// retry with jittered exponential backoff.
    pub async fn fetch_tile(&self, key: TileKey) -> Result<bool> {
        if self.contains(key) {
            return Ok(false);
        }
        let url = self.remote_url(key);

        let response = retry(RetryPolicy::tile_fetch(), Error::is_retriable, || async {
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(Error::from)?;
            let status = response.status();
            if status.is_success() {
                let bytes = response.bytes().await.map_err(Error::from)?;
                return Ok(Some(bytes));
            }
            if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
                return Err(Error::TransientNetwork(format!("{url}: {status}")));
            }
            // Remaining 4xx are permanent for this key
            Ok(None)
        })
        .await?;

        match response {
            Some(bytes) => {
                self.store_tile(key, &bytes).await?;
                Ok(true)
            }
            None => {
                tracing::debug!("tile {key:?} skipped: permanent upstream rejection");
                Ok(false)
            }
        }
    }

    fn walk_tiles(&self) -> Result<Vec<(PathBuf, u64, SystemTime)>> {
        let mut tiles = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                // In-progress writes are not tiles yet
                if path.extension().map(|e| e == "tmp").unwrap_or(false) {
                    continue;
                }
                if let Ok(meta) = entry.metadata() {
                    let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    tiles.push((path, meta.len(), mtime));
                }
            }
        }
        Ok(tiles)
    }

    pub fn total_bytes(&self) -> Result<u64> {
        Ok(self.walk_tiles()?.iter().map(|(_, size, _)| size).sum())
    }

    /// Delete tiles whose mtime is older than now - max_age. Returns
    /// the number removed.
    pub fn purge_old(&self, max_age: Duration) -> Result<u64> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;
        for (path, _, mtime) in self.walk_tiles()? {
            if mtime < cutoff && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!("tile purge removed {removed} tiles older than {max_age:?}");
        }
        Ok(removed)
    }

    /// Evict tiles by ascending mtime until the cache fits max_bytes.
    /// Returns the number removed.
    pub fn enforce_limit(&self, max_bytes: u64) -> Result<u64> {
        let mut tiles = self.walk_tiles()?;
        let mut total: u64 = tiles.iter().map(|(_, size, _)| size).sum();
        if total <= max_bytes {
            return Ok(0);
        }
        tiles.sort_by_key(|(_, _, mtime)| *mtime);

        let mut removed = 0;
        for (path, size, _) in tiles {
            if total <= max_bytes {
                break;
            }
            if std::fs::remove_file(&path).is_ok() {
                total = total.saturating_sub(size);
                removed += 1;
            }
        }
        tracing::info!("tile eviction removed {removed} tiles, {total} bytes remain");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cache(tag: &str) -> TileCache {
        let root = std::env::temp_dir().join(format!(
            "piwardrive-tiles-{tag}-{}",
            std::process::id()
        ));
        std::fs::remove_dir_all(&root).ok();
        TileCache::new(root, "http://127.0.0.1:9/{z}/{x}/{y}.png".to_string()).unwrap()
    }

    #[test]
    fn tile_math_known_values() {
        assert_eq!(tile_for(0.0, 0.0, 0), TileKey { z: 0, x: 0, y: 0 });
        // Greenwich at z=1 sits in the south-east quadrant boundary
        assert_eq!(tile_for(0.0, 0.0, 1), TileKey { z: 1, x: 1, y: 1 });
        // Central London, z=10 (well-known slippy map example)
        assert_eq!(
            tile_for(51.5074, -0.1278, 10),
            TileKey { z: 10, x: 511, y: 340 }
        );
    }

    #[test]
    fn bbox_enumerates_cover() {
        let tiles = tiles_for_bbox(0.0, 0.0, 0.1, 0.1, 1);
        assert!(!tiles.is_empty());
        let tiles = tiles_for_bbox(51.0, -1.0, 52.0, 1.0, 8);
        assert!(tiles.len() > 1);
        assert!(tiles.iter().all(|t| t.z == 8));
    }

    #[tokio::test]
    async fn store_is_atomic_and_path_deterministic() {
        let cache = temp_cache("store");
        let key = TileKey { z: 3, x: 4, y: 5 };
        assert!(!cache.contains(key));

        cache.store_tile(key, b"tile-bytes").await.unwrap();
        assert!(cache.contains(key));
        assert!(cache.path_for(key).ends_with("3/4/5.png"));
        assert_eq!(std::fs::read(cache.path_for(key)).unwrap(), b"tile-bytes");
        // No leftover temp file
        assert!(!cache.path_for(key).with_extension("png.tmp").exists());
        std::fs::remove_dir_all(cache.root()).ok();
    }

    #[tokio::test]
    async fn purge_old_respects_age() {
        let cache = temp_cache("purge");
        cache
            .store_tile(TileKey { z: 1, x: 0, y: 0 }, b"old")
            .await
            .unwrap();
        assert_eq!(cache.purge_old(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(cache.purge_old(Duration::from_secs(0)).unwrap(), 1);
        assert_eq!(cache.total_bytes().unwrap(), 0);
        std::fs::remove_dir_all(cache.root()).ok();
    }

    #[tokio::test]
    async fn enforce_limit_evicts_oldest_first() {
        let cache = temp_cache("limit");
        let first = TileKey { z: 1, x: 0, y: 0 };
        let second = TileKey { z: 1, x: 1, y: 0 };
        cache.store_tile(first, &[0u8; 100]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.store_tile(second, &[0u8; 100]).await.unwrap();

        let removed = cache.enforce_limit(150).unwrap();
        assert_eq!(removed, 1);
        assert!(!cache.contains(first), "oldest tile goes first");
        assert!(cache.contains(second));
        assert!(cache.total_bytes().unwrap() <= 150);
        std::fs::remove_dir_all(cache.root()).ok();
    }

    #[tokio::test]
    async fn enforce_limit_is_noop_under_limit() {
        let cache = temp_cache("noop");
        cache
            .store_tile(TileKey { z: 1, x: 0, y: 0 }, &[0u8; 10])
            .await
            .unwrap();
        assert_eq!(cache.enforce_limit(1_000_000).unwrap(), 0);
        std::fs::remove_dir_all(cache.root()).ok();
    }
}
