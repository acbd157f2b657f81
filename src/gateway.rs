//! Relay gateway: one SSE subscription plus HTTP POST sends.
//!
//! A [`Gateway`] owns exactly one event-stream subscription (held in a
//! [`ResourceCell`], so racing re-registrations can never leak a second
//! live stream) and performs the stateless HTTP sends. It does not retry
//! on its own: a stream failure after `open` is routed to the owner's
//! errors listener, and the owner decides whether to reconnect.
//!
//! # Protocol
//!
//! ```text
//! GET  {bridge}/events?client_id=a,b[&last_event_id=N][&heartbeat=fmt]
//! POST {bridge}/message?client_id=from&to=to&ttl=300[&topic=..][&trace_id=..]
//! POST {bridge}/verify            {"client_id": .., "url": .., "type": ..}
//! ```

// Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio_util::sync::CancellationToken;

use crate::constants::{
    DEFAULT_CONNECTING_DEADLINE, DEFAULT_TTL_SECS, EVENTS_PATH, MESSAGE_PATH, VERIFY_PATH,
};
use crate::deadline::with_deadline;
use crate::error::BridgeError;
use crate::resource::{Resource, ResourceCell};
use crate::sse::{FrameHandler, SseFrame, SseSubscription, StreamErrorHandler};
use crate::util::{distinct, join_url};
use crate::wire::{VerifyRequest, VerifyResponse};

impl Resource for SseSubscription {
    fn dispose(&self) {
        SseSubscription::dispose(self);
    }
}

/// Callback receiving every frame the subscription dispatches, heartbeats
/// included. Interpretation is the owner's job.
pub type GatewayListener = Arc<dyn Fn(SseFrame) + Send + Sync>;

/// Callback receiving post-open stream failures.
pub type GatewayErrorsListener = Arc<dyn Fn(BridgeError) + Send + Sync>;

/// Construction parameters for [`Gateway::open`].
pub struct GatewayOptions {
    /// Base URL of the relay.
    pub bridge_url: String,
    /// Session ids to subscribe for; de-duplicated, order preserved.
    pub session_ids: Vec<String>,
    /// Frame listener.
    pub listener: GatewayListener,
    /// Stream failure listener.
    pub errors_listener: GatewayErrorsListener,
    /// Resume cursor to start the subscription from.
    pub last_event_id: Option<String>,
    /// Heartbeat format to request from the relay.
    pub heartbeat_format: Option<String>,
    /// Ask the relay for a queue-done marker after replaying stored
    /// messages.
    pub enable_queue_done_event: bool,
}

/// Parameters for one registration attempt.
#[derive(Debug, Clone)]
pub struct RegisterOptions {
    /// Deadline for this attempt. The surrounding retry loop owns the
    /// overall budget.
    pub connecting_deadline: Option<Duration>,
    /// Cancellation for this attempt.
    pub cancel: CancellationToken,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            connecting_deadline: Some(DEFAULT_CONNECTING_DEADLINE),
            cancel: CancellationToken::new(),
        }
    }
}

/// Options for one message send.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// RPC method hint the relay may use for routing analytics.
    pub topic: Option<String>,
    /// Relay storage TTL in seconds; defaults to
    /// [`DEFAULT_TTL_SECS`](crate::constants::DEFAULT_TTL_SECS).
    pub ttl: Option<u64>,
    /// Caller-supplied correlation id.
    pub trace_id: Option<String>,
    /// Cancellation for this request.
    pub cancel: CancellationToken,
}

/// One relay connection: an SSE subscription plus HTTP sends.
pub struct Gateway {
    /// Self-handle for the subscription's frame/error hooks; weak so the
    /// reader task never keeps a closed gateway alive.
    weak_self: Weak<Gateway>,
    http: reqwest::Client,
    bridge_url: String,
    session_ids: Vec<String>,
    heartbeat_format: Option<String>,
    enable_queue_done_event: bool,
    /// Advanced by every incoming frame that carries an id; used to
    /// resume when the subscription is re-registered.
    last_event_id: Mutex<Option<String>>,
    listener: Mutex<GatewayListener>,
    errors_listener: Mutex<GatewayErrorsListener>,
    subscription: ResourceCell<SseSubscription>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("bridge_url", &self.bridge_url)
            .field("session_ids", &self.session_ids)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Build an unregistered gateway. Most callers want [`Gateway::open`].
    #[must_use]
    pub fn new(options: GatewayOptions) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            http: reqwest::Client::new(),
            bridge_url: options.bridge_url,
            session_ids: distinct(&options.session_ids),
            heartbeat_format: options.heartbeat_format,
            enable_queue_done_event: options.enable_queue_done_event,
            last_event_id: Mutex::new(options.last_event_id),
            listener: Mutex::new(options.listener),
            errors_listener: Mutex::new(options.errors_listener),
            subscription: ResourceCell::new(),
        })
    }

    /// Build a gateway and register its subscription.
    ///
    /// On registration failure the partially built gateway is closed
    /// before the error is surfaced.
    pub async fn open(
        options: GatewayOptions,
        register: RegisterOptions,
    ) -> Result<Arc<Self>, BridgeError> {
        let gateway = Self::new(options);
        if let Err(e) = gateway.register_session(register).await {
            gateway.close();
            return Err(e);
        }
        Ok(gateway)
    }

    /// Open the SSE subscription, bounded by the attempt deadline.
    ///
    /// Returns once the relay has acknowledged the subscription. Any
    /// previously held subscription is disposed first by the resource
    /// cell.
    pub async fn register_session(&self, options: RegisterOptions) -> Result<(), BridgeError> {
        let url = self.subscription_url();
        let weak = self.weak_self.clone();

        with_deadline(
            move |composed| async move {
                let on_frame: FrameHandler = {
                    let weak = weak.clone();
                    Arc::new(move |frame| {
                        if let Some(gateway) = weak.upgrade() {
                            gateway.handle_frame(frame);
                        }
                    })
                };
                let on_error: StreamErrorHandler = Arc::new(move |error| {
                    if let Some(gateway) = weak.upgrade() {
                        gateway.handle_stream_error(error);
                    }
                });

                let http = self.http.clone();
                self.subscription
                    .create(&composed, move |token| async move {
                        SseSubscription::connect(&http, &url, on_frame, on_error, token).await
                    })
                    .await
                    .map(|_| ())
            },
            options.connecting_deadline,
            &options.cancel,
            "bridge registration",
        )
        .await
    }

    /// Send one encrypted message through this gateway's relay.
    pub async fn send(
        &self,
        message: &[u8],
        from: &str,
        to: &str,
        options: &SendOptions,
    ) -> Result<(), BridgeError> {
        Self::send_request(&self.http, &self.bridge_url, message, from, to, options).await
    }

    /// Send without a gateway instance.
    ///
    /// Sends are stateless POSTs and must keep working while the
    /// subscription is down, so the provider's retry loop goes through
    /// this path.
    pub async fn send_request(
        http: &reqwest::Client,
        bridge_url: &str,
        message: &[u8],
        from: &str,
        to: &str,
        options: &SendOptions,
    ) -> Result<(), BridgeError> {
        let mut url = format!(
            "{}?client_id={from}&to={to}&ttl={}",
            join_url(bridge_url, MESSAGE_PATH),
            options.ttl.unwrap_or(DEFAULT_TTL_SECS),
        );
        if let Some(topic) = &options.topic {
            url.push_str(&format!("&topic={topic}"));
        }
        if let Some(trace_id) = &options.trace_id {
            url.push_str(&format!("&trace_id={trace_id}"));
        }

        let request = http.post(&url).body(BASE64.encode(message));
        let response = tokio::select! {
            () = options.cancel.cancelled() => return Err(BridgeError::cancelled()),
            result = request.send() => result?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::Http {
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    /// Verify a URL pairing through this gateway's relay.
    pub async fn verify(
        &self,
        request: &VerifyRequest,
        cancel: &CancellationToken,
    ) -> Result<VerifyResponse, BridgeError> {
        Self::verify_request(&self.http, &self.bridge_url, request, cancel).await
    }

    /// Verify without a gateway instance.
    pub async fn verify_request(
        http: &reqwest::Client,
        bridge_url: &str,
        request: &VerifyRequest,
        cancel: &CancellationToken,
    ) -> Result<VerifyResponse, BridgeError> {
        let url = join_url(bridge_url, VERIFY_PATH);
        let response = tokio::select! {
            () = cancel.cancelled() => return Err(BridgeError::cancelled()),
            result = http.post(&url).json(request).send() => result?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::Http {
                status: status.as_u16(),
            });
        }
        response
            .json::<VerifyResponse>()
            .await
            .map_err(|e| BridgeError::Parse(e.to_string()))
    }

    /// Dispose the subscription. Idempotent.
    pub fn close(&self) {
        self.subscription.dispose();
    }

    /// Dispose the subscription while keeping the gateway reusable.
    #[deprecated(note = "dispose/re-register the provider connection instead")]
    pub fn pause(&self) {
        self.subscription.dispose();
    }

    /// Re-register after [`Gateway::pause`].
    #[deprecated(note = "dispose/re-register the provider connection instead")]
    pub async fn unpause(&self, options: RegisterOptions) -> Result<(), BridgeError> {
        self.register_session(options).await
    }

    /// Swap the frame listener.
    pub fn set_listener(&self, listener: GatewayListener) {
        *self.listener.lock().expect("listener lock poisoned") = listener;
    }

    /// Swap the stream failure listener.
    pub fn set_errors_listener(&self, listener: GatewayErrorsListener) {
        *self
            .errors_listener
            .lock()
            .expect("errors listener lock poisoned") = listener;
    }

    /// Whether the subscription is live and delivering frames.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.subscription
            .current()
            .is_some_and(|s| s.is_open())
    }

    /// Whether a registration is in flight.
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        self.subscription.is_creating()
    }

    /// Whether the subscription is gone (never registered, failed, or
    /// disposed) and no registration is in flight.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        !self.is_connecting()
            && self
                .subscription
                .current()
                .is_none_or(|s| s.is_closed())
    }

    /// The resume cursor observed on this subscription, if any.
    #[must_use]
    pub fn last_event_id(&self) -> Option<String> {
        self.last_event_id
            .lock()
            .expect("last_event_id lock poisoned")
            .clone()
    }

    fn subscription_url(&self) -> String {
        let mut url = format!(
            "{}?client_id={}",
            join_url(&self.bridge_url, EVENTS_PATH),
            self.session_ids.join(","),
        );
        if let Some(id) = self
            .last_event_id
            .lock()
            .expect("last_event_id lock poisoned")
            .as_ref()
        {
            url.push_str(&format!("&last_event_id={id}"));
        }
        if let Some(format) = &self.heartbeat_format {
            url.push_str(&format!("&heartbeat={format}"));
        }
        if self.enable_queue_done_event {
            url.push_str("&enable_queue_done_event=true");
        }
        url
    }

    fn handle_frame(&self, frame: SseFrame) {
        if let Some(id) = &frame.id {
            *self
                .last_event_id
                .lock()
                .expect("last_event_id lock poisoned") = Some(id.clone());
        }
        let listener = self.listener.lock().expect("listener lock poisoned").clone();
        listener(frame);
    }

    fn handle_stream_error(&self, error: BridgeError) {
        let listener = self
            .errors_listener
            .lock()
            .expect("errors listener lock poisoned")
            .clone();
        listener(error);
    }
}
