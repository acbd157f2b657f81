//! Bounded retry with fixed or exponential delay.
//!
//! The (re)connect and send paths both run through [`retry`]: connect
//! loops use effectively unbounded attempts (failure there means only
//! cancellation), sends use the caller's budget.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::constants::{DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_DELAY};
use crate::error::BridgeError;

/// Retry policy.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Maximum number of attempts. `u32::MAX` retries until cancelled.
    pub attempts: u32,
    /// Delay between failed attempts.
    pub delay: Duration,
    /// Double the delay after each failure.
    pub exponential: bool,
    /// Ceiling for the exponential delay. `None` leaves it unbounded.
    pub max_delay: Option<Duration>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
            exponential: false,
            max_delay: None,
        }
    }
}

impl RetryOptions {
    /// Delay before the attempt following failure number `failures`
    /// (0-indexed).
    fn delay_after(&self, failures: u32) -> Duration {
        if !self.exponential {
            return self.delay;
        }
        let doubled = self
            .delay
            .saturating_mul(2u32.saturating_pow(failures.min(31)));
        match self.max_delay {
            Some(cap) => doubled.min(cap),
            None => doubled,
        }
    }
}

/// Run `operation` up to `options.attempts` times.
///
/// The operation receives a child token of `cancel`. Cancellation between
/// attempts or during a back-off sleep stops the loop with
/// [`BridgeError::Cancelled`] carrying the attempt count; otherwise the
/// final attempt's error propagates.
pub async fn retry<T, F, Fut>(
    mut operation: F,
    options: &RetryOptions,
    cancel: &CancellationToken,
) -> Result<T, BridgeError>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, BridgeError>>,
{
    let attempts = options.attempts.max(1);
    let mut completed = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled {
                attempts: completed,
            });
        }

        match operation(cancel.child_token()).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_cancelled() => {
                return Err(BridgeError::Cancelled {
                    attempts: completed.saturating_add(1),
                })
            }
            Err(e) => {
                completed = completed.saturating_add(1);
                log::debug!("attempt {completed}/{attempts} failed: {e}");
                if completed >= attempts {
                    return Err(e);
                }
            }
        }

        let pause = options.delay_after(completed - 1);
        tokio::select! {
            () = tokio::time::sleep(pause) => {}
            () = cancel.cancelled() => {
                return Err(BridgeError::Cancelled {
                    attempts: completed,
                });
            }
        }
    }
}
