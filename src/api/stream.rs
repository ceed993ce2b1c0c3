// Push endpoints
//
// WebSocket and SSE subscribers ride the topic bus. Every message is
// one JSON envelope keyed by topic name ({"aps": [...]}, {"status":
// {...}}). Slow consumers get drop-oldest semantics from the bus; the
// number of messages lost is reported when the subscriber goes away.
// WebSocket peers are pinged on the heartbeat interval and dropped
// after K missed pongs.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::json;

use super::error::ApiResult;
use super::ApiState;
use crate::bus::{Subscription, TOPIC_APS, TOPIC_STATUS};

/// WebSocket send timeout.
const WS_SEND_TIMEOUT: Duration = Duration::from_secs(2);

fn envelope(topic: &str, payload: serde_json::Value) -> String {
    json!({ topic: payload }).to_string()
}

// ── WebSocket ───────────────────────────────────────────────────────

pub async fn ws_aps(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.on_upgrade(move |socket| ws_topic_loop(socket, state, TOPIC_APS))
}

pub async fn ws_status(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.on_upgrade(move |socket| ws_topic_loop(socket, state, TOPIC_STATUS))
}

async fn ws_topic_loop(mut socket: WebSocket, state: ApiState, topic: &'static str) {
    let config = state.config.snapshot();
    let mut sub = state.bus.subscribe(topic);
    let mut heartbeat =
        tokio::time::interval(Duration::from_secs(config.push.heartbeat_interval_secs));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so the miss counter
    // starts at the first real interval
    heartbeat.tick().await;
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            message = sub.recv() => {
                let Some(message) = message else { break };
                let text = envelope(topic, message.payload);
                match tokio::time::timeout(WS_SEND_TIMEOUT, socket.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!("ws {topic} send failed: {e}");
                        break;
                    }
                    Err(_) => {
                        tracing::debug!("ws {topic} send timed out");
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                missed += 1;
                if missed > config.push.missed_heartbeats {
                    tracing::debug!("ws {topic} subscriber missed {missed} heartbeats, dropping");
                    break;
                }
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => missed = 0,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("ws {topic} receive failed: {e}");
                        break;
                    }
                }
            }
        }
    }

    if sub.dropped() > 0 {
        tracing::info!(
            "ws {topic} subscriber disconnected, {} messages dropped",
            sub.dropped()
        );
    }
}

// ── Server-Sent Events ──────────────────────────────────────────────

/// Reports drop-oldest losses when the SSE stream is torn down.
struct SubscriptionGuard {
    sub: Subscription,
    topic: &'static str,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if self.sub.dropped() > 0 {
            tracing::info!(
                "sse {} subscriber disconnected, {} messages dropped",
                self.topic,
                self.sub.dropped()
            );
        }
    }
}

fn topic_stream(
    state: &ApiState,
    topic: &'static str,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let guard = SubscriptionGuard {
        sub: state.bus.subscribe(topic),
        topic,
    };
    futures::stream::unfold(guard, move |mut guard| async move {
        let message = guard.sub.recv().await?;
        let event = Event::default().data(envelope(guard.topic, message.payload));
        Some((Ok(event), guard))
    })
}

fn keep_alive(state: &ApiState) -> KeepAlive {
    KeepAlive::new().interval(Duration::from_secs(
        state.config.snapshot().push.heartbeat_interval_secs,
    ))
}

pub async fn sse_aps(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(topic_stream(&state, TOPIC_APS)).keep_alive(keep_alive(&state))
}

pub async fn sse_status(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(topic_stream(&state, TOPIC_STATUS)).keep_alive(keep_alive(&state))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
    /// Seconds between replayed records
    interval: Option<f64>,
}

/// Replay recent health records as SSE, one per interval, oldest first.
pub async fn sse_history(
    State(state): State<ApiState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let limit = query.limit.unwrap_or(20).clamp(1, 500);
    let interval = Duration::from_secs_f64(query.interval.unwrap_or(1.0).clamp(0.0, 60.0));

    let mut records = state.store.load_recent_health(limit)?;
    records.reverse();

    let events = records
        .into_iter()
        .map(|record| Ok(Event::default().data(json!({ "status": record }).to_string())));
    let stream = tokio_stream::StreamExt::throttle(tokio_stream::iter(events), interval);
    Ok(Sse::new(stream).keep_alive(keep_alive(&state)))
}
