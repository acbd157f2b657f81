//! One SSE subscription over a streaming HTTP GET.
//!
//! [`SseSubscription::connect`] resolves once the relay has acknowledged
//! the subscription (response headers received), then keeps reading frames
//! on a background task until the stream fails, ends, or the subscription
//! is disposed. Frames and post-open stream failures are pushed to the
//! caller-supplied handlers.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use super::parser::{SseFrame, SseParser};
use crate::error::BridgeError;

/// Handler invoked for every dispatched frame.
pub type FrameHandler = Arc<dyn Fn(SseFrame) + Send + Sync>;

/// Handler invoked when the stream fails after it was opened.
pub type StreamErrorHandler = Arc<dyn Fn(BridgeError) + Send + Sync>;

const STATE_OPEN: u8 = 0;
const STATE_CLOSED: u8 = 1;

/// Live handle to one event stream.
///
/// Dropping the handle does not stop the reader; call
/// [`SseSubscription::dispose`] (the owning resource cell does).
pub struct SseSubscription {
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SseSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseSubscription")
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl SseSubscription {
    /// Open the stream and spawn the reader task.
    ///
    /// Fails with [`BridgeError::ConnectBeforeOpen`] if the relay rejects
    /// or drops the request before acknowledging it, and with
    /// [`BridgeError::Cancelled`] if `cancel` fires first.
    pub async fn connect(
        http: &reqwest::Client,
        url: &str,
        on_frame: FrameHandler,
        on_error: StreamErrorHandler,
        cancel: CancellationToken,
    ) -> Result<Self, BridgeError> {
        if cancel.is_cancelled() {
            return Err(BridgeError::cancelled());
        }

        log::debug!("opening SSE subscription: {url}");
        let request = http
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream");

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(BridgeError::cancelled()),
            result = request.send() => {
                result.map_err(|e| BridgeError::ConnectBeforeOpen(e.to_string()))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::ConnectBeforeOpen(format!(
                "relay answered status {status}"
            )));
        }

        let state = Arc::new(AtomicU8::new(STATE_OPEN));
        let reader_state = Arc::clone(&state);
        let reader_cancel = cancel.clone();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut parser = SseParser::new();

            loop {
                let chunk = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    chunk = stream.next() => chunk,
                };

                match chunk {
                    Some(Ok(bytes)) => {
                        for frame in parser.push_bytes(&bytes) {
                            if reader_cancel.is_cancelled() {
                                break;
                            }
                            on_frame(frame);
                        }
                    }
                    Some(Err(e)) => {
                        reader_state.store(STATE_CLOSED, Ordering::SeqCst);
                        if !reader_cancel.is_cancelled() {
                            on_error(BridgeError::StreamClosed(e.to_string()));
                        }
                        return;
                    }
                    None => {
                        reader_state.store(STATE_CLOSED, Ordering::SeqCst);
                        if !reader_cancel.is_cancelled() {
                            on_error(BridgeError::StreamClosed(
                                "relay ended the event stream".into(),
                            ));
                        }
                        return;
                    }
                }
            }

            reader_state.store(STATE_CLOSED, Ordering::SeqCst);
        });

        Ok(Self { state, cancel })
    }

    /// Whether the stream is still delivering frames.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_OPEN && !self.cancel.is_cancelled()
    }

    /// Whether the stream has stopped (failure, relay close, or dispose).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }

    /// Stop the reader and mark the subscription closed. Idempotent.
    pub fn dispose(&self) {
        self.cancel.cancel();
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
    }
}
