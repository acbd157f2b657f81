//! Bridge provider: owner of the paired client sessions and the
//! connection lifecycle.
//!
//! The provider drives (re)connection of one [`Gateway`] with retry and
//! backoff, supervises a heartbeat watchdog that catches silent stream
//! stalls, encrypts outgoing and decrypts incoming payloads, and
//! dispatches decoded events to the host's listener.
//!
//! # Event Flow
//!
//! ```text
//! host ──► send ──► encrypt ──► POST /message ──► relay
//! relay ──► SSE frame ──► Gateway ──► decrypt ──► listener
//! ```
//!
//! # Generations
//!
//! One [`CancellationToken`] represents the current connection
//! generation. `restore_connection` cancels it and installs a fresh one;
//! `close` cancels it for good. Every connect attempt, send, watchdog
//! tick, and reconnect runs under a child of the current generation, so
//! superseded work can never touch the listener.

// Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::constants::{
    DEFAULT_CONNECTING_DEADLINE, DEFAULT_MAX_RECONNECT_DELAY, DEFAULT_RECONNECT_DELAY,
    HEARTBEAT_FORMAT_MESSAGE, HEARTBEAT_GRACE,
};
use crate::error::BridgeError;
use crate::gateway::{
    Gateway, GatewayErrorsListener, GatewayListener, GatewayOptions, RegisterOptions, SendOptions,
};
use crate::retry::{retry, RetryOptions};
use crate::session::{public_key_from_hex, SessionKeypair};
use crate::sse::SseFrame;
use crate::util::same_id_set;
use crate::wire::{ConnectSource, FrameEnvelope, RequestSource};

const POISONED: &str = "provider state poisoned";

/// Frame payload marking a relay keep-alive.
const HEARTBEAT_DATA: &str = "heartbeat";

/// One pairing of a local session with a remote peer.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    /// This peer's key material.
    pub session: SessionKeypair,
    /// Hex public key of the remote peer this session is paired with.
    pub client_id: String,
}

impl ClientConnection {
    fn session_id(&self) -> String {
        self.session.session_id()
    }
}

/// Decoded event delivered to the host listener.
#[derive(Debug, Clone)]
pub struct InboundMessage<T> {
    /// Relay resume cursor of the frame carrying this message.
    pub last_event_id: Option<String>,
    /// Sender-supplied correlation id.
    pub trace_id: Option<String>,
    /// Hex public key of the sending peer.
    pub from: String,
    /// Decrypted, decoded payload.
    pub message: T,
    /// Request origin metadata, sealed by the relay to this receiver.
    pub request_source: Option<RequestSource>,
    /// Clear connection metadata from the relay.
    pub connect_source: Option<ConnectSource>,
}

/// Host listener for decoded inbound messages.
pub type Listener<T> = Arc<dyn Fn(InboundMessage<T>) + Send + Sync>;

/// Host listener for non-fatal bridge failures.
pub type ErrorsListener = Arc<dyn Fn(BridgeError) + Send + Sync>;

/// Fired at every connect attempt.
pub type ConnectingListener = Arc<dyn Fn() + Send + Sync>;

/// Reconnect policy for one generation.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Resume cursor to restore delivery from.
    pub last_event_id: Option<String>,
    /// Deadline for a single subscription attempt.
    pub connecting_deadline: Option<Duration>,
    /// Base retry delay.
    pub delay: Duration,
    /// Exponential delay ceiling.
    pub max_delay: Duration,
    /// Whether the retry delay doubles after each failure.
    pub exponential: bool,
    /// Outer cancellation the generation chains from.
    pub cancel: CancellationToken,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            last_event_id: None,
            connecting_deadline: Some(DEFAULT_CONNECTING_DEADLINE),
            delay: DEFAULT_RECONNECT_DELAY,
            max_delay: DEFAULT_MAX_RECONNECT_DELAY,
            exponential: true,
            cancel: CancellationToken::new(),
        }
    }
}

/// Per-send overrides. Unset fields fall back to the reconnect policy
/// defaults (unbounded attempts, 1s exponential delay capped at 7s).
#[derive(Debug, Clone, Default)]
pub struct SendRetryOptions {
    /// Explicit topic; otherwise derived from the message's `method`.
    pub topic: Option<String>,
    /// Relay storage TTL in seconds.
    pub ttl: Option<u64>,
    /// Correlation id forwarded to the relay.
    pub trace_id: Option<String>,
    /// Cancellation; defaults to the current generation.
    pub cancel: Option<CancellationToken>,
    /// Attempt budget.
    pub attempts: Option<u32>,
    /// Base delay between attempts.
    pub delay: Option<Duration>,
    /// Whether the delay doubles after each failure.
    pub exponential: Option<bool>,
    /// Delay ceiling.
    pub max_delay: Option<Duration>,
}

/// Construction parameters for [`Provider::open`].
pub struct ProviderOptions<T> {
    /// Base URL of the relay.
    pub bridge_url: String,
    /// Initial client pairings.
    pub clients: Vec<ClientConnection>,
    /// Inbound message listener.
    pub listener: Option<Listener<T>>,
    /// Failure listener.
    pub errors_listener: Option<ErrorsListener>,
    /// Fired at every connect attempt.
    pub on_connecting: Option<ConnectingListener>,
    /// Stall threshold for the heartbeat watchdog; `None` disarms it.
    /// Recommended at least 3x the relay's heartbeat interval.
    pub heartbeat_reconnect_interval: Option<Duration>,
    /// Initial reconnect policy.
    pub connection: ConnectionOptions,
}

impl<T> ProviderOptions<T> {
    /// Options with default policy and no listeners.
    #[must_use]
    pub fn new(bridge_url: impl Into<String>, clients: Vec<ClientConnection>) -> Self {
        Self {
            bridge_url: bridge_url.into(),
            clients,
            listener: None,
            errors_listener: None,
            on_connecting: None,
            heartbeat_reconnect_interval: None,
            connection: ConnectionOptions::default(),
        }
    }
}

struct ProviderState {
    clients: Vec<ClientConnection>,
    last_event_id: Option<String>,
    generation: Option<CancellationToken>,
    gateway: Option<Arc<Gateway>>,
    options: ConnectionOptions,
}

/// Duplex bridge endpoint for one side of the pairing.
///
/// Generic over the decoded inbound payload: the app and wallet sides of
/// a pairing instantiate it with their respective request/response types.
pub struct Provider<T> {
    /// Self-handle for gateway hooks and the watchdog task; weak so
    /// background work never keeps a dropped provider alive.
    weak_self: Weak<Provider<T>>,
    http: reqwest::Client,
    bridge_url: String,
    heartbeat_reconnect_interval: Option<Duration>,
    state: Mutex<ProviderState>,
    heartbeat_at: Mutex<Instant>,
    listener: Mutex<Option<Listener<T>>>,
    errors_listener: Mutex<Option<ErrorsListener>>,
    on_connecting: Mutex<Option<ConnectingListener>>,
}

impl<T> std::fmt::Debug for Provider<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("bridge_url", &self.bridge_url)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl<T> Provider<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Build a provider and connect it.
    ///
    /// On connection failure the partially built provider is closed
    /// before the error is surfaced.
    pub async fn open(options: ProviderOptions<T>) -> Result<Arc<Self>, BridgeError> {
        let provider = Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            http: reqwest::Client::new(),
            bridge_url: options.bridge_url,
            heartbeat_reconnect_interval: options.heartbeat_reconnect_interval,
            state: Mutex::new(ProviderState {
                clients: Vec::new(),
                last_event_id: None,
                generation: None,
                gateway: None,
                options: ConnectionOptions::default(),
            }),
            heartbeat_at: Mutex::new(Instant::now()),
            listener: Mutex::new(options.listener),
            errors_listener: Mutex::new(options.errors_listener),
            on_connecting: Mutex::new(options.on_connecting),
        });

        if let Err(e) = provider
            .restore_connection(options.clients, options.connection)
            .await
        {
            provider.close();
            return Err(e);
        }
        Ok(provider)
    }

    /// Replace the client set and (re)connect under a fresh generation.
    ///
    /// An empty client set is a no-op: nothing to subscribe for, current
    /// state untouched. Otherwise the previous generation is cancelled,
    /// the old gateway is closed, and the connect loop retries until it
    /// succeeds or the generation dies.
    pub async fn restore_connection(
        &self,
        clients: Vec<ClientConnection>,
        options: ConnectionOptions,
    ) -> Result<(), BridgeError> {
        if clients.is_empty() {
            log::debug!("restore_connection called with no clients; nothing to do");
            return Ok(());
        }

        let generation = {
            let mut state = self.state.lock().expect(POISONED);
            state.clients = clients;
            state.last_event_id = options.last_event_id.clone();
            state.options = options.clone();
            let generation = options.cancel.child_token();
            let previous = state.generation.replace(generation.clone());
            if let Some(previous) = previous {
                previous.cancel();
            }
            generation
        };

        if generation.is_cancelled() {
            return Ok(());
        }

        let previous_gateway = self.state.lock().expect(POISONED).gateway.take();
        if let Some(gateway) = previous_gateway {
            gateway.close();
        }

        let retry_options = RetryOptions {
            attempts: u32::MAX,
            delay: options.delay,
            exponential: options.exponential,
            max_delay: Some(options.max_delay),
        };
        retry(|token| self.open_gateway(token), &retry_options, &generation).await?;

        self.arm_watchdog(&generation);
        Ok(())
    }

    /// Reconnect only if the session-id set actually changed.
    ///
    /// Set-equal inputs (order and duplicates ignored) are a no-op, so
    /// hosts can call this freely on every state sync without tearing
    /// down a healthy subscription.
    pub async fn update_clients(
        &self,
        clients: Vec<ClientConnection>,
        cancel: CancellationToken,
    ) -> Result<(), BridgeError> {
        let (previous_ids, mut options) = {
            let state = self.state.lock().expect(POISONED);
            let ids: Vec<String> = state.clients.iter().map(ClientConnection::session_id).collect();
            let mut options = state.options.clone();
            options.last_event_id = state.last_event_id.clone();
            (ids, options)
        };
        let new_ids: Vec<String> = clients.iter().map(ClientConnection::session_id).collect();

        if same_id_set(&previous_ids, &new_ids) {
            log::debug!("update_clients: session set unchanged; keeping subscription");
            return Ok(());
        }

        options.cancel = cancel;
        self.restore_connection(clients, options).await
    }

    /// Encrypt and send one message to a peer.
    ///
    /// Sends go through the stateless request path, so they keep working
    /// while the subscription is down or reconnecting. A cancelled
    /// generation turns the call into a silent no-op.
    pub async fn send<M: Serialize>(
        &self,
        message: &M,
        session: &SessionKeypair,
        client_session_id: &str,
        options: SendRetryOptions,
    ) -> Result<(), BridgeError> {
        let cancel = match &options.cancel {
            Some(cancel) => cancel.clone(),
            None => {
                let state = self.state.lock().expect(POISONED);
                state.generation.clone().unwrap_or_default()
            }
        };
        if cancel.is_cancelled() {
            return Ok(());
        }

        let value = serde_json::to_value(message)?;
        let topic = derive_topic(&value, options.topic.clone());
        let receiver = public_key_from_hex(client_session_id)?;
        let ciphertext = session.encrypt(value.to_string().as_bytes(), &receiver)?;
        let from = session.session_id();

        let retry_options = RetryOptions {
            attempts: options.attempts.unwrap_or(u32::MAX),
            delay: options.delay.unwrap_or(DEFAULT_RECONNECT_DELAY),
            exponential: options.exponential.unwrap_or(true),
            max_delay: Some(options.max_delay.unwrap_or(DEFAULT_MAX_RECONNECT_DELAY)),
        };

        let http = &self.http;
        let bridge_url = self.bridge_url.as_str();
        let ciphertext_ref: &[u8] = &ciphertext;
        let from_ref: &str = &from;
        retry(
            |token| {
                let send_options = SendOptions {
                    topic: topic.clone(),
                    ttl: options.ttl,
                    trace_id: options.trace_id.clone(),
                    cancel: token,
                };
                async move {
                    Gateway::send_request(
                        http,
                        bridge_url,
                        ciphertext_ref,
                        from_ref,
                        client_session_id,
                        &send_options,
                    )
                    .await
                }
            },
            &retry_options,
            &cancel,
        )
        .await
    }

    /// Tear down the connection and clear all generation state.
    /// Idempotent.
    pub fn close(&self) {
        let (generation, gateway) = {
            let mut state = self.state.lock().expect(POISONED);
            state.clients.clear();
            state.last_event_id = None;
            (state.generation.take(), state.gateway.take())
        };
        if let Some(generation) = generation {
            generation.cancel();
        }
        if let Some(gateway) = gateway {
            gateway.close();
        }
        log::debug!("bridge provider closed");
    }

    /// Swap the inbound message listener.
    pub fn listen(&self, listener: Listener<T>) {
        *self.listener.lock().expect(POISONED) = Some(listener);
    }

    /// Swap the failure listener.
    pub fn set_errors_listener(&self, listener: ErrorsListener) {
        *self.errors_listener.lock().expect(POISONED) = Some(listener);
    }

    /// Swap the connect-attempt callback.
    pub fn set_on_connecting(&self, listener: ConnectingListener) {
        *self.on_connecting.lock().expect(POISONED) = Some(listener);
    }

    /// Dispose the subscription without dropping generation state.
    #[deprecated(note = "use close/restore_connection instead")]
    pub fn pause(&self) {
        if let Some(gateway) = self.gateway() {
            #[allow(deprecated)]
            gateway.pause();
        }
    }

    /// Re-register the subscription after [`Provider::pause`].
    #[deprecated(note = "use close/restore_connection instead")]
    pub async fn unpause(&self) -> Result<(), BridgeError> {
        let (gateway, deadline, generation) = {
            let state = self.state.lock().expect(POISONED);
            (
                state.gateway.clone(),
                state.options.connecting_deadline,
                state.generation.clone(),
            )
        };
        let Some(gateway) = gateway else {
            return Ok(());
        };
        let cancel = generation
            .map(|g| g.child_token())
            .unwrap_or_default();
        #[allow(deprecated)]
        gateway
            .unpause(RegisterOptions {
                connecting_deadline: deadline,
                cancel,
            })
            .await
    }

    /// Look up the client connection paired with a remote peer.
    ///
    /// Keyed by `client_id` (the remote peer's hex public key, which is
    /// how incoming frames are attributed), not by the local session id.
    pub fn get_crypto_session(&self, client_id: &str) -> Result<ClientConnection, BridgeError> {
        self.state
            .lock()
            .expect(POISONED)
            .clients
            .iter()
            .find(|c| c.client_id == client_id)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownClient(client_id.to_string()))
    }

    /// Whether the subscription is live.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.gateway().map(|g| g.is_ready()).unwrap_or(false)
    }

    /// Whether a (re)connect is in flight.
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        self.gateway().map(|g| g.is_connecting()).unwrap_or(false)
    }

    /// Whether the gateway exists but its subscription is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.gateway().map(|g| g.is_closed()).unwrap_or(false)
    }

    /// Time since the last observed heartbeat.
    #[must_use]
    pub fn heartbeat_age(&self) -> Duration {
        self.heartbeat_at.lock().expect(POISONED).elapsed()
    }

    fn gateway(&self) -> Option<Arc<Gateway>> {
        self.state.lock().expect(POISONED).gateway.clone()
    }

    /// One gateway build + registration attempt. The retry engine owns
    /// the loop; the heartbeat watchdog is armed by the caller.
    async fn open_gateway(&self, cancel: CancellationToken) -> Result<(), BridgeError> {
        if cancel.is_cancelled() {
            return Err(BridgeError::cancelled());
        }

        let (session_ids, last_event_id, connecting_deadline, previous) = {
            let mut state = self.state.lock().expect(POISONED);
            let ids: Vec<String> = state.clients.iter().map(ClientConnection::session_id).collect();
            (
                ids,
                state.last_event_id.clone(),
                state.options.connecting_deadline,
                state.gateway.take(),
            )
        };
        if let Some(gateway) = previous {
            gateway.close();
        }

        let weak = self.weak_self.clone();
        let listener: GatewayListener = {
            let weak = weak.clone();
            Arc::new(move |frame| {
                if let Some(provider) = weak.upgrade() {
                    provider.handle_gateway_frame(frame);
                }
            })
        };
        let errors_listener: GatewayErrorsListener = Arc::new(move |error| {
            if let Some(provider) = weak.upgrade() {
                provider.handle_gateway_error(error);
            }
        });

        let gateway = Gateway::new(GatewayOptions {
            bridge_url: self.bridge_url.clone(),
            session_ids,
            listener,
            errors_listener,
            last_event_id,
            heartbeat_format: Some(HEARTBEAT_FORMAT_MESSAGE.to_string()),
            enable_queue_done_event: false,
        });
        self.state.lock().expect(POISONED).gateway = Some(Arc::clone(&gateway));

        self.notify_connecting();
        gateway
            .register_session(RegisterOptions {
                connecting_deadline,
                cancel,
            })
            .await
    }

    /// Re-run the connect loop under the current policy and reset the
    /// heartbeat clock.
    async fn reconnect(&self, cancel: CancellationToken) -> Result<(), BridgeError> {
        let options = self.state.lock().expect(POISONED).options.clone();
        let retry_options = RetryOptions {
            attempts: u32::MAX,
            delay: options.delay,
            exponential: options.exponential,
            max_delay: Some(options.max_delay),
        };

        retry(|token| self.open_gateway(token), &retry_options, &cancel).await?;

        *self.heartbeat_at.lock().expect(POISONED) = Instant::now();
        Ok(())
    }

    fn arm_watchdog(&self, generation: &CancellationToken) {
        let Some(interval) = self.heartbeat_reconnect_interval else {
            return;
        };
        *self.heartbeat_at.lock().expect(POISONED) = Instant::now();
        let weak = self.weak_self.clone();
        tokio::spawn(watchdog_loop(weak, interval, generation.child_token()));
    }

    fn handle_gateway_frame(&self, frame: SseFrame) {
        if frame.data == HEARTBEAT_DATA {
            *self.heartbeat_at.lock().expect(POISONED) = Instant::now();
            return;
        }

        if let Err(e) = self.process_frame(&frame) {
            if !e.is_cancelled() {
                self.notify_error(e);
            }
        }
    }

    /// Decode one non-heartbeat frame and deliver it to the listener.
    fn process_frame(&self, frame: &SseFrame) -> Result<(), BridgeError> {
        let envelope: FrameEnvelope = serde_json::from_str(&frame.data)?;

        let connection = self.get_crypto_session(&envelope.from)?;
        let sender = public_key_from_hex(&envelope.from)?;
        let ciphertext = BASE64
            .decode(&envelope.message)
            .map_err(|e| BridgeError::Parse(format!("invalid message encoding: {e}")))?;
        let plaintext = connection.session.decrypt(&ciphertext, &sender)?;
        let message: T = serde_json::from_slice(&plaintext)?;

        let request_source = match &envelope.request_source {
            Some(sealed) => {
                let sealed = BASE64
                    .decode(sealed)
                    .map_err(|e| BridgeError::Parse(format!("invalid request_source encoding: {e}")))?;
                let opened = connection.session.open_sealed(&sealed)?;
                Some(serde_json::from_slice::<RequestSource>(&opened)?)
            }
            None => None,
        };

        if let Some(id) = &frame.id {
            self.advance_last_event_id(id);
        }

        let event = InboundMessage {
            last_event_id: frame.id.clone(),
            trace_id: envelope.trace_id.clone(),
            from: envelope.from.clone(),
            message,
            request_source,
            connect_source: envelope.connect_source.clone(),
        };

        let listener = self.listener.lock().expect(POISONED).clone();
        match listener {
            Some(listener) => listener(event),
            None => log::debug!("inbound message dropped: no listener installed"),
        }
        Ok(())
    }

    fn handle_gateway_error(&self, error: BridgeError) {
        let (gateway, generation) = {
            let state = self.state.lock().expect(POISONED);
            (state.gateway.clone(), state.generation.clone())
        };
        let Some(gateway) = gateway else {
            return;
        };

        if gateway.is_closed() || gateway.is_connecting() {
            let Some(generation) = generation else {
                return;
            };
            let Some(this) = self.weak_self.upgrade() else {
                return;
            };
            log::debug!("bridge connection lost: {error}; reconnecting");
            let token = generation.child_token();
            tokio::spawn(async move {
                this.notify_connecting();
                if let Err(e) = this.reconnect(token).await {
                    if !e.is_cancelled() {
                        this.notify_error(e);
                    }
                }
            });
        } else {
            self.notify_error(error);
        }
    }

    /// Resume cursors only move forward within a generation.
    fn advance_last_event_id(&self, id: &str) {
        let mut state = self.state.lock().expect(POISONED);
        let advances = match (state.last_event_id.as_deref(), id.parse::<u64>()) {
            (Some(current), Ok(new)) => current.parse::<u64>().map_or(true, |cur| new >= cur),
            _ => true,
        };
        if advances {
            state.last_event_id = Some(id.to_string());
        }
    }

    fn notify_connecting(&self) {
        let callback = self.on_connecting.lock().expect(POISONED).clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn notify_error(&self, error: BridgeError) {
        let listener = self.errors_listener.lock().expect(POISONED).clone();
        match listener {
            Some(listener) => listener(error),
            None => log::warn!("unhandled bridge error: {error}"),
        }
    }
}

/// Derive the relay routing topic from an explicit override or the
/// message's `method` field.
fn derive_topic(message: &serde_json::Value, explicit: Option<String>) -> Option<String> {
    explicit.or_else(|| {
        message
            .get("method")
            .and_then(|m| m.as_str())
            .map(str::to_string)
    })
}

/// Stall detector for the event stream.
///
/// The relay heartbeats on a fixed cadence; if none is observed for the
/// configured interval, the stream is presumed dead even though the TCP
/// connection may still look healthy. One grace sleep separates a real
/// stall from a host loop that was merely blocked: after a long block the
/// first tick computes a huge elapsed time while the missing frames may
/// already sit in the socket buffer.
async fn watchdog_loop<T>(
    provider: Weak<Provider<T>>,
    interval: Duration,
    cancel: CancellationToken,
) where
    T: DeserializeOwned + Send + 'static,
{
    loop {
        let elapsed = {
            let Some(provider) = provider.upgrade() else {
                return;
            };
            provider.heartbeat_age()
        };

        if elapsed < interval {
            tokio::select! {
                () = tokio::time::sleep(interval / 2) => continue,
                () = cancel.cancelled() => return,
            }
        }

        tokio::select! {
            () = tokio::time::sleep(HEARTBEAT_GRACE) => {}
            () = cancel.cancelled() => return,
        }

        let Some(provider) = provider.upgrade() else {
            return;
        };
        if cancel.is_cancelled() {
            return;
        }
        if provider.heartbeat_age() < interval {
            continue;
        }

        log::warn!(
            "no heartbeat for {}ms (threshold {}ms); reconnecting",
            provider.heartbeat_age().as_millis(),
            interval.as_millis(),
        );
        if let Err(e) = provider.reconnect(cancel.child_token()).await {
            if e.is_cancelled() {
                return;
            }
            provider.notify_error(e);
        }
    }
}
