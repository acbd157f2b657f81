//! SDK error type.
//!
//! Every failure originating in this crate surfaces as a [`BridgeError`].
//! The variants are kinds, not a deep taxonomy: callers match on the few
//! they care about (cancellation, mostly) and log the rest.

/// Prefix carried by every rendered error message so SDK failures are
/// recognizable in host application logs.
pub const ERROR_PREFIX: &str = "[BRIDGE_SDK]";

/// Unified error for all bridge operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The current connection generation was cancelled. Never delivered to
    /// the errors listener; only returned from the cancelled operation.
    #[error("[BRIDGE_SDK] cancelled after {attempts} attempt(s)")]
    Cancelled {
        /// Attempts completed before cancellation was observed.
        attempts: u32,
    },

    /// A deadline elapsed before the guarded operation finished.
    #[error("[BRIDGE_SDK] timed out: {0}")]
    Timeout(String),

    /// The SSE stream failed before the relay acknowledged the
    /// subscription. The caller's retry loop handles this.
    #[error("[BRIDGE_SDK] bridge error before connecting: {0}")]
    ConnectBeforeOpen(String),

    /// The relay answered an HTTP request with a non-2xx status.
    #[error("[BRIDGE_SDK] bridge request failed with status {status}")]
    Http {
        /// HTTP status code returned by the relay.
        status: u16,
    },

    /// An opened SSE stream failed or was closed by the relay.
    #[error("[BRIDGE_SDK] bridge stream closed: {0}")]
    StreamClosed(String),

    /// The HTTP client failed below the protocol layer.
    #[error("[BRIDGE_SDK] transport: {0}")]
    Transport(#[from] reqwest::Error),

    /// An incoming frame or response body could not be parsed.
    #[error("[BRIDGE_SDK] malformed bridge payload: {0}")]
    Parse(String),

    /// Encryption or decryption failed.
    #[error("[BRIDGE_SDK] crypto: {0}")]
    Crypto(String),

    /// `get_crypto_session` was called with a client id no connection is
    /// paired with.
    #[error("[BRIDGE_SDK] unknown client id: {0}")]
    UnknownClient(String),

    /// A freshly created resource was discarded because a newer creation
    /// superseded it. Internal; not user-facing.
    #[error("[BRIDGE_SDK] creation aborted by a newer creation")]
    Superseded,
}

impl BridgeError {
    /// Cancellation with no meaningful attempt count.
    pub(crate) fn cancelled() -> Self {
        BridgeError::Cancelled { attempts: 0 }
    }

    /// Whether this error is a generation-cancellation.
    ///
    /// Cancellation stops at the generation boundary: it is returned to the
    /// caller but never pushed to the errors listener.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BridgeError::Cancelled { .. })
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Parse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_prefix() {
        let errors = [
            BridgeError::Cancelled { attempts: 3 },
            BridgeError::Timeout("registration".into()),
            BridgeError::ConnectBeforeOpen("connection refused".into()),
            BridgeError::StreamClosed("reset by peer".into()),
            BridgeError::Http { status: 500 },
            BridgeError::Parse("bad json".into()),
            BridgeError::Crypto("bad key".into()),
            BridgeError::UnknownClient("deadbeef".into()),
            BridgeError::Superseded,
        ];
        for e in errors {
            assert!(e.to_string().starts_with(ERROR_PREFIX), "{e}");
        }
    }

    #[test]
    fn test_only_cancelled_is_cancelled() {
        assert!(BridgeError::Cancelled { attempts: 1 }.is_cancelled());
        assert!(!BridgeError::Superseded.is_cancelled());
        assert!(!BridgeError::Http { status: 404 }.is_cancelled());
    }
}
