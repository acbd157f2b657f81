//! Client SDK for an end-to-end encrypted duplex bridge over an HTTP+SSE
//! relay.
//!
//! Two peers (an application and a wallet) exchange NaCl-box ciphertext
//! through a dumb store-and-forward relay. Each peer holds an SSE
//! subscription for frames addressed to its session ids and POSTs
//! ciphertext to send. The relay sequences frames with monotone event ids
//! and stores undelivered messages for a bounded TTL, so a peer that
//! reconnects with its last observed id resumes without loss.
//!
//! # Architecture
//!
//! ```text
//! Provider ──────────────────────────────────────────────────
//!   owns client pairings, generation token, heartbeat watchdog
//!   encrypt / decrypt, listener dispatch, reconnect policy
//!        │
//!        ▼
//! Gateway ───────────────────────────────────────────────────
//!   one SSE subscription (ResourceCell) + stateless HTTP sends
//!        │
//!        ▼
//! SseSubscription ── streaming GET + incremental frame parser
//! ```
//!
//! # Modules
//!
//! - [`provider`] - connection owner: clients, reconnects, crypto, dispatch
//! - [`gateway`] - one relay connection: subscription + sends
//! - [`session`] - key pairs and box encryption
//! - [`sse`] - event-stream parser and subscription handle
//! - [`retry`] - bounded retry with backoff
//! - [`resource`] - single-slot resource holder
//! - [`deadline`] - deadline + cancellation composition

pub mod constants;
pub mod deadline;
pub mod error;
pub mod gateway;
pub mod provider;
pub mod resource;
pub mod retry;
pub mod session;
pub mod sse;
pub mod util;
pub mod wire;

pub use error::BridgeError;
pub use gateway::{Gateway, GatewayOptions, RegisterOptions, SendOptions};
pub use provider::{
    ClientConnection, ConnectionOptions, InboundMessage, Provider, ProviderOptions,
    SendRetryOptions,
};
pub use session::SessionKeypair;
pub use wire::{ConnectSource, RequestSource, VerifyRequest, VerifyResponse};

// Re-exported so hosts can share cancellation tokens without naming the
// underlying crate.
pub use tokio_util::sync::CancellationToken;
