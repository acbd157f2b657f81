//! Protocol-wide constants.
//!
//! This module centralizes the relay protocol defaults so the policy knobs
//! are discoverable in one place. Constants are grouped by domain.

use std::time::Duration;

// ============================================================================
// Relay endpoints
// ============================================================================

/// Path of the SSE subscription endpoint, relative to the bridge URL.
pub const EVENTS_PATH: &str = "events";

/// Path of the message send endpoint, relative to the bridge URL.
pub const MESSAGE_PATH: &str = "message";

/// Path of the verification endpoint, relative to the bridge URL.
pub const VERIFY_PATH: &str = "verify";

// ============================================================================
// Timeouts & retry policy
// ============================================================================

/// Deadline for a single SSE subscription attempt.
///
/// Applies to one attempt only; the surrounding retry loop starts the next
/// attempt when an individual one times out.
pub const DEFAULT_CONNECTING_DEADLINE: Duration = Duration::from_millis(14_000);

/// Base delay between (re)connect and send retries.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1_000);

/// Ceiling for the exponential retry delay.
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_millis(7_000);

/// Default attempt count for the generic retry engine.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 10;

/// Default delay between attempts for the generic retry engine.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

// ============================================================================
// Messages & heartbeat
// ============================================================================

/// Relay-side storage TTL for an outgoing message, in seconds.
pub const DEFAULT_TTL_SECS: u64 = 300;

/// Heartbeat frame format requested from the relay. With this format the
/// relay emits ordinary frames whose data is the literal `heartbeat`.
pub const HEARTBEAT_FORMAT_MESSAGE: &str = "message";

/// Grace period after a missed heartbeat before forcing a reconnect.
///
/// When the host loop has been blocked, the first watchdog tick afterwards
/// computes a huge elapsed time even though a fresh frame may already be
/// buffered. The grace gives the runtime one turn to deliver it.
pub const HEARTBEAT_GRACE: Duration = Duration::from_millis(100);
