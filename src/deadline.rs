//! Deadline and cancellation composition.
//!
//! [`with_deadline`] runs an async action under a token that is cancelled
//! when either the caller's token fires or an optional deadline elapses
//! (union-of-abort semantics). The action observes the composed token and
//! is expected to bail out when it fires.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;

/// Run `action` bounded by `deadline` and by external cancellation.
///
/// The action receives a child token of `cancel`; the deadline cancels
/// that child without touching the parent. If `cancel` is already fired on
/// entry, the action is never invoked.
pub async fn with_deadline<T, F, Fut>(
    action: F,
    deadline: Option<Duration>,
    cancel: &CancellationToken,
    what: &str,
) -> Result<T, BridgeError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, BridgeError>>,
{
    if cancel.is_cancelled() {
        return Err(BridgeError::cancelled());
    }

    let composed = cancel.child_token();
    let fut = action(composed.clone());

    match deadline {
        Some(limit) => {
            tokio::select! {
                result = fut => result,
                () = tokio::time::sleep(limit) => {
                    composed.cancel();
                    Err(BridgeError::Timeout(format!(
                        "{what} exceeded {}ms",
                        limit.as_millis()
                    )))
                }
                () = cancel.cancelled() => {
                    composed.cancel();
                    Err(BridgeError::cancelled())
                }
            }
        }
        None => {
            tokio::select! {
                result = fut => result,
                () = cancel.cancelled() => {
                    composed.cancel();
                    Err(BridgeError::cancelled())
                }
            }
        }
    }
}
