//! In-process mock relay for end-to-end tests.
//!
//! Implements the store-and-forward protocol the SDK speaks: an SSE
//! `/events` endpoint with event-id sequencing, replay and per-message
//! TTL, a `/message` POST sink, and a `/verify` stub. A stall switch
//! silences live subscribers (heartbeats and deliveries) without closing
//! their sockets, which is exactly what a dead upstream looks like to the
//! client.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

const HEARTBEAT_EVERY: Duration = Duration::from_millis(300);

#[derive(Clone)]
struct StoredMessage {
    id: u64,
    to: String,
    frame: String,
    expires_at: Instant,
}

#[derive(Clone)]
struct RelayState {
    messages: Arc<Mutex<Vec<StoredMessage>>>,
    live: broadcast::Sender<StoredMessage>,
    next_id: Arc<AtomicU64>,
    /// Bumped by [`MockRelay::stall`]; subscribers opened under an older
    /// epoch go silent.
    stall_epoch: Arc<AtomicU64>,
}

/// Handle to a running mock relay.
pub struct MockRelay {
    /// Base URL clients connect to.
    pub url: String,
    state: RelayState,
}

impl MockRelay {
    /// Bind an ephemeral port and serve the relay routes.
    pub async fn start() -> Self {
        let state = RelayState {
            messages: Arc::new(Mutex::new(Vec::new())),
            live: broadcast::channel(256).0,
            next_id: Arc::new(AtomicU64::new(0)),
            stall_epoch: Arc::new(AtomicU64::new(0)),
        };

        let app = Router::new()
            .route("/events", get(events))
            .route("/message", post(message))
            .route("/verify", post(verify))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock relay");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve mock relay");
        });

        Self {
            url: format!("http://{addr}"),
            state,
        }
    }

    /// Silence every currently open subscription: no more heartbeats, no
    /// more deliveries, socket left open. New subscriptions are live.
    pub fn stall(&self) {
        self.state.stall_epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of messages the relay has accepted.
    pub fn message_count(&self) -> usize {
        self.state.messages.lock().expect("messages lock").len()
    }
}

#[derive(Deserialize)]
struct EventsParams {
    client_id: String,
    last_event_id: Option<String>,
    heartbeat: Option<String>,
    #[allow(dead_code)]
    enable_queue_done_event: Option<String>,
}

#[derive(Deserialize)]
struct MessageParams {
    client_id: String,
    to: String,
    ttl: Option<u64>,
    #[allow(dead_code)]
    topic: Option<String>,
    trace_id: Option<String>,
}

async fn events(
    State(state): State<RelayState>,
    Query(params): Query<EventsParams>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let ids: HashSet<String> = params
        .client_id
        .split(',')
        .map(str::to_string)
        .collect();
    let after: u64 = params
        .last_event_id
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let heartbeats = params.heartbeat.is_some();
    let my_epoch = state.stall_epoch.load(Ordering::SeqCst);

    let (tx, rx) = mpsc::channel::<Event>(64);

    // Subscribe before collecting the replay so nothing published in
    // between is lost; duplicates are filtered by id below.
    let mut live = state.live.subscribe();
    let replay: Vec<StoredMessage> = {
        let messages = state.messages.lock().expect("messages lock");
        let now = Instant::now();
        messages
            .iter()
            .filter(|m| m.id > after && ids.contains(&m.to) && m.expires_at > now)
            .cloned()
            .collect()
    };

    let stall_epoch = Arc::clone(&state.stall_epoch);
    tokio::spawn(async move {
        let mut last_sent = after;
        for m in replay {
            if tx
                .send(Event::default().id(m.id.to_string()).data(m.frame.clone()))
                .await
                .is_err()
            {
                return;
            }
            last_sent = m.id;
        }

        let mut ticker = tokio::time::interval(HEARTBEAT_EVERY);
        loop {
            let stalled = stall_epoch.load(Ordering::SeqCst) != my_epoch;
            tokio::select! {
                _ = ticker.tick() => {
                    if heartbeats && !stalled {
                        if tx.send(Event::default().data("heartbeat")).await.is_err() {
                            return;
                        }
                    }
                }
                received = live.recv() => {
                    let Ok(m) = received else { return };
                    if stalled || m.id <= last_sent || !ids.contains(&m.to) {
                        continue;
                    }
                    last_sent = m.id;
                    if tx
                        .send(Event::default().id(m.id.to_string()).data(m.frame))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    });

    Sse::new(ReceiverStream::new(rx).map(Ok))
}

async fn message(
    State(state): State<RelayState>,
    Query(params): Query<MessageParams>,
    body: String,
) -> axum::http::StatusCode {
    let id = state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let mut frame = serde_json::json!({
        "from": params.client_id,
        "message": body,
    });
    if let Some(trace_id) = &params.trace_id {
        frame["trace_id"] = serde_json::Value::String(trace_id.clone());
    }

    let stored = StoredMessage {
        id,
        to: params.to,
        frame: frame.to_string(),
        expires_at: Instant::now() + Duration::from_secs(params.ttl.unwrap_or(300)),
    };
    state
        .messages
        .lock()
        .expect("messages lock")
        .push(stored.clone());
    let _ = state.live.send(stored);

    axum::http::StatusCode::OK
}

async fn verify(Json(_body): Json<serde_json::Value>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
