//! Single-slot async resource holder.
//!
//! A [`ResourceCell`] owns at most one live resource at any instant, under
//! racing creations. `create` cancels and supersedes any in-flight
//! creation; a creation that loses the race has its late-arriving result
//! disposed rather than installed. This replaces the cyclical ownership a
//! naive "connection owns reconnector owns connection" design accrues.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;

/// An owned resource the cell can shut down.
pub trait Resource: Send + Sync + 'static {
    /// Release the resource. Must be idempotent and must not panic.
    fn dispose(&self);
}

struct CellState<T> {
    current: Option<Arc<T>>,
    cancel: Option<CancellationToken>,
    /// Bumped by every `create` and `dispose`; a creation only installs
    /// its result if the epoch it started under is still live.
    epoch: u64,
    creating: bool,
}

/// Holder for at most one live resource.
pub struct ResourceCell<T: Resource> {
    state: Mutex<CellState<T>>,
}

impl<T: Resource> Default for ResourceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Resource> ResourceCell<T> {
    /// Create an empty cell.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CellState {
                current: None,
                cancel: None,
                epoch: 0,
                creating: false,
            }),
        }
    }

    /// Replace the held resource with the factory's output.
    ///
    /// Any prior in-flight creation is cancelled and any held resource is
    /// disposed before the factory runs. The factory receives a child
    /// token of `cancel`. If another `create` (or `dispose`) supersedes
    /// this one while the factory runs, a successful result is disposed
    /// and [`BridgeError::Superseded`] is returned; a failed factory
    /// propagates its own error.
    pub async fn create<F, Fut>(
        &self,
        cancel: &CancellationToken,
        factory: F,
    ) -> Result<Arc<T>, BridgeError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, BridgeError>>,
    {
        let (token, epoch) = {
            let mut state = self.state.lock().expect("resource cell poisoned");
            if let Some(prev) = state.cancel.take() {
                prev.cancel();
            }
            if let Some(prev) = state.current.take() {
                prev.dispose();
            }
            state.epoch += 1;
            state.creating = true;
            let token = cancel.child_token();
            state.cancel = Some(token.clone());
            (token, state.epoch)
        };

        let result = factory(token).await;

        let mut state = self.state.lock().expect("resource cell poisoned");
        if state.epoch != epoch {
            // Lost the race: a newer creation or a dispose took over while
            // the factory ran. A late success must not leak.
            return match result {
                Ok(resource) => {
                    resource.dispose();
                    Err(BridgeError::Superseded)
                }
                Err(e) => Err(e),
            };
        }

        state.creating = false;
        match result {
            Ok(resource) => {
                let resource = Arc::new(resource);
                state.current = Some(Arc::clone(&resource));
                Ok(resource)
            }
            Err(e) => {
                state.cancel = None;
                Err(e)
            }
        }
    }

    /// The held resource, if any.
    #[must_use]
    pub fn current(&self) -> Option<Arc<T>> {
        self.state
            .lock()
            .expect("resource cell poisoned")
            .current
            .clone()
    }

    /// Whether a creation is currently in flight.
    #[must_use]
    pub fn is_creating(&self) -> bool {
        self.state.lock().expect("resource cell poisoned").creating
    }

    /// Cancel any in-flight creation and dispose the held resource.
    /// Idempotent; disposal errors are the resource's own problem.
    pub fn dispose(&self) {
        let mut state = self.state.lock().expect("resource cell poisoned");
        state.epoch += 1;
        state.creating = false;
        if let Some(token) = state.cancel.take() {
            token.cancel();
        }
        if let Some(current) = state.current.take() {
            current.dispose();
        }
    }
}
