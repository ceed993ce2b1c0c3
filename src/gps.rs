// gpsd client
//
// Speaks the gpsd JSON watch protocol over TCP. The connection is
// opened lazily on first use; a dead daemon costs the caller nothing
// but a None - errors never propagate, and reconnect attempts are
// spaced by a bounded delay. The last known fix is retained so a
// momentary read failure does not blank the position.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_secs(1);
const WATCH_COMMAND: &str = "?WATCH={\"enable\":true,\"json\":true};\n";

/// A position fix as reported by gpsd.
#[derive(Debug, Clone, PartialEq)]
pub struct GpsPosition {
    pub latitude: f64,
    pub longitude: f64,
    /// gpsd fix mode: 0/1 none, 2 = 2D, 3 = 3D
    pub mode: i64,
    /// Estimated horizontal error (meters), when reported
    pub accuracy: Option<f64>,
    pub speed_m_s: Option<f64>,
    pub heading_deg: Option<f64>,
}

/// Subset of the gpsd TPV report we care about.
#[derive(Debug, Deserialize)]
struct TpvReport {
    class: String,
    #[serde(default)]
    mode: i64,
    lat: Option<f64>,
    lon: Option<f64>,
    epx: Option<f64>,
    epy: Option<f64>,
    speed: Option<f64>,
    track: Option<f64>,
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    _writer: OwnedWriteHalf,
}

struct ClientState {
    conn: Option<Connection>,
    next_attempt: Option<Instant>,
    last_known: Option<GpsPosition>,
}

pub struct GpsClient {
    host: String,
    port: u16,
    reconnect_delay: Duration,
    state: Mutex<ClientState>,
}

impl GpsClient {
    pub fn new(host: &str, port: u16, reconnect_delay: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            reconnect_delay,
            state: Mutex::new(ClientState {
                conn: None,
                next_attempt: None,
                last_known: None,
            }),
        }
    }

    /// Current position, or None when no fix is available. Never fails;
    /// a connection error schedules a reconnect and falls back to the
    /// last known fix.
    pub async fn get_position(&self) -> Option<GpsPosition> {
        let mut state = self.state.lock().await;

        if state.conn.is_none() {
            if let Some(next) = state.next_attempt {
                if Instant::now() < next {
                    return state.last_known.clone();
                }
            }
            match self.connect().await {
                Ok(conn) => {
                    state.conn = Some(conn);
                    state.next_attempt = None;
                }
                Err(e) => {
                    tracing::debug!("gpsd connect {}:{} failed: {e}", self.host, self.port);
                    state.next_attempt = Some(Instant::now() + self.reconnect_delay);
                    return state.last_known.clone();
                }
            }
        }

        match self.poll_fix(state.conn.as_mut().expect("connection present")).await {
            Ok(Some(position)) => {
                state.last_known = Some(position.clone());
                Some(position)
            }
            Ok(None) => state.last_known.clone(),
            Err(e) => {
                tracing::debug!("gpsd read failed: {e}");
                state.conn = None;
                state.next_attempt = Some(Instant::now() + self.reconnect_delay);
                state.last_known.clone()
            }
        }
    }

    async fn connect(&self) -> std::io::Result<Connection> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timeout"))??;
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(WATCH_COMMAND.as_bytes()).await?;
        Ok(Connection {
            reader: BufReader::new(read_half),
            _writer: write_half,
        })
    }

    /// Drain reports until a usable TPV arrives or the read window
    /// closes. A closed window is not an error; it just means no new
    /// fix this tick.
    async fn poll_fix(&self, conn: &mut Connection) -> std::io::Result<Option<GpsPosition>> {
        let deadline = Instant::now() + READ_TIMEOUT;
        let mut line = String::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            line.clear();
            let read = match tokio::time::timeout(remaining, conn.reader.read_line(&mut line)).await
            {
                Ok(result) => result?,
                Err(_) => return Ok(None),
            };
            if read == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "gpsd closed the connection",
                ));
            }

            let Ok(report) = serde_json::from_str::<TpvReport>(line.trim()) else {
                continue;
            };
            if report.class != "TPV" || report.mode < 2 {
                continue;
            }
            let (Some(lat), Some(lon)) = (report.lat, report.lon) else {
                continue;
            };
            let accuracy = match (report.epx, report.epy) {
                (Some(x), Some(y)) => Some(x.max(y)),
                (Some(x), None) => Some(x),
                (None, Some(y)) => Some(y),
                (None, None) => None,
            };
            return Ok(Some(GpsPosition {
                latitude: lat,
                longitude: lon,
                mode: report.mode,
                accuracy,
                speed_m_s: report.speed,
                heading_deg: report.track,
            }));
        }
    }
}

/// Rolling window of recent fixes. The GPS poll job pushes here; the
/// route prefetcher reads the tail to extrapolate a heading.
pub struct TrackBuffer {
    points: std::sync::Mutex<std::collections::VecDeque<GpsPosition>>,
    capacity: usize,
}

impl TrackBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            points: std::sync::Mutex::new(std::collections::VecDeque::with_capacity(capacity)),
            capacity: capacity.max(2),
        }
    }

    pub fn push(&self, position: GpsPosition) {
        let mut points = self.points.lock().expect("track lock poisoned");
        if points.len() >= self.capacity {
            points.pop_front();
        }
        points.push_back(position);
    }

    /// Oldest-first snapshot of the window.
    pub fn snapshot(&self) -> Vec<GpsPosition> {
        self.points
            .lock()
            .expect("track lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    #[allow(dead_code)] // Map recentering reads the newest fix
    pub fn latest(&self) -> Option<GpsPosition> {
        self.points
            .lock()
            .expect("track lock poisoned")
            .back()
            .cloned()
    }
}
