//! Server-sent events transport: incremental parser and subscription
//! handle.

pub mod client;
pub mod parser;

pub use client::{FrameHandler, SseSubscription, StreamErrorHandler};
pub use parser::{SseFrame, SseParser};
