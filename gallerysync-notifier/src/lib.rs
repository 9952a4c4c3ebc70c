use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use gallerysync_core::{
    DataProcessed, EVENT_DATA_PROCESSED, EVENT_PROCESS_DATA, EVENT_PROCESSING_ERROR,
    EventEnvelope, ItemId, MAX_EVENT_FRAME_BYTES, ProcessData, ProcessingFailed,
    decode_event_frame, encode_event_frame,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{debug, error, info, warn};

pub mod pipeline;

pub use pipeline::{BoundingBox, FixedCountDetector, HumanDetector, NullDetector, PipelineError};

use pipeline::process_submission;

/// Transport-level limit; frames between this and `MAX_EVENT_FRAME_BYTES`
/// reach the handler and are dropped there without closing the socket.
const WS_MESSAGE_LIMIT: usize = MAX_EVENT_FRAME_BYTES * 2;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct ProcessingSettings {
    /// Artificial latency applied before each submission is processed.
    pub delay: Duration,
}

#[derive(Clone)]
pub struct AppState {
    detector: Arc<dyn HumanDetector>,
    settings: ProcessingSettings,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            detector: Arc::new(NullDetector),
            settings: ProcessingSettings::default(),
        }
    }

    #[must_use]
    pub fn with_detector(mut self, detector: impl HumanDetector) -> Self {
        self.detector = Arc::new(detector);
        self
    }

    #[must_use]
    pub fn with_processing_delay(mut self, delay: Duration) -> Self {
        self.settings.delay = delay;
        self
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn consume(&mut self, amount: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "notifier listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_frame_size(WS_MESSAGE_LIMIT)
        .max_message_size(WS_MESSAGE_LIMIT)
        .on_upgrade(move |socket| async move {
            handle_socket(state, socket).await;
        })
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Split sockets only flush queued pongs on a write, so keep writing.
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            if ws_sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let session_id = hex::encode(rand::random::<[u8; 8]>());
    info!(session = %session_id, "client connected");

    let mut rate_limiter = TokenBucket::new(8.0, 4.0);
    let mut sequence: u64 = 0;

    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!(session = %session_id, "websocket receive error: {}", err);
                break;
            }
        };

        match message {
            Message::Text(text) => {
                let frame = text.as_str();
                if frame.len() > MAX_EVENT_FRAME_BYTES {
                    warn!(session = %session_id, size = frame.len(), "dropping oversized frame");
                    continue;
                }

                let envelope = match decode_event_frame(frame) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(session = %session_id, "failed to decode frame: {}", err);
                        continue;
                    }
                };

                if envelope.event != EVENT_PROCESS_DATA {
                    warn!(session = %session_id, event = %envelope.event, "ignoring unknown event");
                    continue;
                }

                if !rate_limiter.consume(1.0) {
                    warn!(session = %session_id, "rate limit exceeded");
                    send_event(
                        &outbound_tx,
                        EVENT_PROCESSING_ERROR,
                        &ProcessingFailed {
                            reason: "rate limit exceeded".to_owned(),
                            text: submission_text(&envelope),
                        },
                    );
                    continue;
                }

                let request = match envelope.payload::<ProcessData>() {
                    Ok(request) => request,
                    Err(err) => {
                        warn!(session = %session_id, "rejecting malformed process_data: {}", err);
                        send_event(
                            &outbound_tx,
                            EVENT_PROCESSING_ERROR,
                            &ProcessingFailed {
                                reason: err.to_string(),
                                text: submission_text(&envelope),
                            },
                        );
                        continue;
                    }
                };

                sequence += 1;
                let sid = item_id(&session_id, sequence);
                debug!(session = %session_id, sid = %sid, "queued submission");
                tokio::spawn(run_processing(
                    state.clone(),
                    request,
                    sid,
                    outbound_tx.clone(),
                ));
            }
            Message::Binary(_) => {
                warn!(session = %session_id, "ignoring binary frame");
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    send_task.abort();
    info!(session = %session_id, "client disconnected");
}

async fn run_processing(
    state: AppState,
    request: ProcessData,
    sid: ItemId,
    outbound_tx: mpsc::UnboundedSender<Message>,
) {
    if !state.settings.delay.is_zero() {
        tokio::time::sleep(state.settings.delay).await;
    }

    let text = request.text.clone();
    let detector = Arc::clone(&state.detector);
    let result =
        tokio::task::spawn_blocking(move || process_submission(&request, detector.as_ref())).await;

    match result {
        Ok(Ok(processed)) => {
            info!(sid = %sid, human_count = processed.human_count, "submission processed");
            send_event(
                &outbound_tx,
                EVENT_DATA_PROCESSED,
                &DataProcessed {
                    sid,
                    image: processed.jpeg_base64,
                    text,
                    human_count: processed.human_count,
                },
            );
        }
        Ok(Err(err)) => {
            warn!(sid = %sid, "processing failed: {}", err);
            send_event(
                &outbound_tx,
                EVENT_PROCESSING_ERROR,
                &ProcessingFailed {
                    reason: err.to_string(),
                    text,
                },
            );
        }
        Err(err) => {
            error!(sid = %sid, "processing task aborted: {}", err);
            send_event(
                &outbound_tx,
                EVENT_PROCESSING_ERROR,
                &ProcessingFailed {
                    reason: "internal processing failure".to_owned(),
                    text,
                },
            );
        }
    }
}

fn send_event<T: Serialize>(
    outbound_tx: &mpsc::UnboundedSender<Message>,
    event: &str,
    payload: &T,
) {
    let frame = match EventEnvelope::from_payload(event, payload)
        .and_then(|envelope| encode_event_frame(&envelope))
    {
        Ok(frame) => frame,
        Err(err) => {
            error!(event, "failed to serialize outbound event: {}", err);
            return;
        }
    };

    // The client may already be gone; nothing to report then.
    let _ = outbound_tx.send(Message::Text(frame.into()));
}

/// Best-effort text of a submission that is being refused, so the client can match the reply.
fn submission_text(envelope: &EventEnvelope) -> String {
    envelope
        .data
        .get("text")
        .and_then(|value| value.as_str())
        .unwrap_or_default()
        .to_owned()
}

fn item_id(session_id: &str, sequence: u64) -> ItemId {
    let digest = Sha256::digest(format!("{session_id}:{sequence}:{}", now_unix_ms()).as_bytes());
    hex::encode(&digest[..12])
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_refuses_after_burst() {
        let mut bucket = TokenBucket::new(2.0, 0.0);
        assert!(bucket.consume(1.0));
        assert!(bucket.consume(1.0));
        assert!(!bucket.consume(1.0));
    }

    #[test]
    fn submission_text_tolerates_missing_or_mistyped_text() {
        let with_text = EventEnvelope::new(EVENT_PROCESS_DATA, serde_json::json!({ "text": "hi" }));
        assert_eq!(submission_text(&with_text), "hi");

        let mistyped = EventEnvelope::new(EVENT_PROCESS_DATA, serde_json::json!({ "text": 5 }));
        assert_eq!(submission_text(&mistyped), "");
    }

    #[test]
    fn item_ids_differ_per_sequence() {
        let first = item_id("abcd", 1);
        let second = item_id("abcd", 2);
        assert_ne!(first, second);
        assert_eq!(first.len(), 24);
    }
}
