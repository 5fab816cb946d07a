//! The single authoritative state value and its observers.
//!
//! [`StateCell`] is the only writer. Every mutation, from any pipeline on any
//! execution context, goes through [`StateCell::apply`], which holds one lock
//! while it computes the new state, records it in history and broadcasts it.
//! That lock is what makes the mutation order total.
//!
//! # Guarantees
//!
//! - **Replay-one**: a new [`StateStream`] yields the current state first,
//!   then every later state in apply order. Current value and receiver are
//!   taken under the same lock, so nothing is missed or repeated.
//! - **No blocking on observers**: a subscriber that falls more than the
//!   channel capacity behind skips states (logged) instead of stalling
//!   the engine.
//! - **Nothing after teardown**: once the store's cancellation token fires,
//!   `apply` refuses every mutation.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::action::SetBy;
use crate::history::BoundedHistoryLog;
use crate::reduce::Mutator;

/// A state value tagged with who produced it and where it sits in the order.
#[derive(Debug, Clone)]
pub struct VersionedState<S, A> {
    pub set_by: SetBy<A>,
    pub state: S,
    /// 0 for the initial state, +1 per applied mutation.
    pub version: u64,
    pub applied_at: DateTime<Utc>,
}

/// A reducer or pipeline failure, as broadcast on the error stream.
#[derive(Debug, Clone)]
pub struct ActionFailure<S, A> {
    /// State current when the failure was reported.
    pub state: S,
    /// The simple action that failed (the child, for composites).
    pub action: A,
    pub error: Arc<anyhow::Error>,
}

// =============================================================================
// State Cell
// =============================================================================

struct CellInner<S, A> {
    current: VersionedState<S, A>,
    history: BoundedHistoryLog<VersionedState<S, A>>,
}

pub(crate) struct StateCell<S, A> {
    inner: Mutex<CellInner<S, A>>,
    states: broadcast::Sender<VersionedState<S, A>>,
    errors: broadcast::Sender<ActionFailure<S, A>>,
    cancel: CancellationToken,
}

impl<S, A> StateCell<S, A>
where
    S: Clone + Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    /// Seed the cell with the initial state, authored by `Initialization`.
    ///
    /// Channel capacities below 1 are raised to 1.
    pub(crate) fn new(
        initial: S,
        history_capacity: usize,
        state_capacity: usize,
        error_capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        let current = VersionedState {
            set_by: SetBy::Initialization,
            state: initial,
            version: 0,
            applied_at: Utc::now(),
        };
        let mut history = BoundedHistoryLog::new(history_capacity);
        history.push(current.clone());

        let (states, _) = broadcast::channel(state_capacity.max(1));
        let (errors, _) = broadcast::channel(error_capacity.max(1));

        Self {
            inner: Mutex::new(CellInner { current, history }),
            states,
            errors,
            cancel,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CellInner<S, A>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("state lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub(crate) fn current(&self) -> VersionedState<S, A> {
        self.lock().current.clone()
    }

    pub(crate) fn history(&self) -> Vec<VersionedState<S, A>> {
        self.lock().history.to_vec()
    }

    /// Apply one mutation on behalf of `action`.
    ///
    /// Returns the new version, or `None` if the store is torn down.
    pub(crate) fn apply(&self, action: &A, mutator: Mutator<S>) -> Option<u64> {
        if self.cancel.is_cancelled() {
            return None;
        }

        let mut inner = self.lock();
        // Re-check under the lock so nothing lands after teardown finished
        if self.cancel.is_cancelled() {
            return None;
        }

        let next = VersionedState {
            set_by: SetBy::Action(action.clone()),
            state: mutator(&inner.current.state),
            version: inner.current.version + 1,
            applied_at: Utc::now(),
        };
        let version = next.version;

        inner.history.push(next.clone());
        inner.current = next.clone();
        // No receivers is fine
        let _ = self.states.send(next);
        drop(inner);

        debug!(version, "state applied");
        Some(version)
    }

    /// Broadcast a failure together with the state current right now.
    pub(crate) fn fail(&self, action: A, error: anyhow::Error) {
        if self.cancel.is_cancelled() {
            return;
        }
        let state = self.lock().current.state.clone();
        let _ = self.errors.send(ActionFailure {
            state,
            action,
            error: Arc::new(error),
        });
    }

    pub(crate) fn subscribe(&self) -> StateStream<S, A> {
        let inner = self.lock();
        StateStream {
            pending: Some(inner.current.clone()),
            receiver: self.states.subscribe(),
        }
    }

    pub(crate) fn subscribe_errors(&self) -> ErrorStream<S, A> {
        ErrorStream {
            receiver: self.errors.subscribe(),
        }
    }
}

// =============================================================================
// Streams
// =============================================================================

/// Replay-one subscription to state changes.
///
/// A subscriber that falls more than the channel capacity behind skips the
/// states it missed, with a warning, and resumes with the oldest state still
/// buffered. Versions it does see are always increasing.
///
/// Ends only when the store is gone.
pub struct StateStream<S, A> {
    pending: Option<VersionedState<S, A>>,
    receiver: broadcast::Receiver<VersionedState<S, A>>,
}

impl<S, A> StateStream<S, A>
where
    S: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    /// Next state, or `None` once the store has been dropped.
    pub async fn recv(&mut self) -> Option<VersionedState<S, A>> {
        if let Some(first) = self.pending.take() {
            return Some(first);
        }
        loop {
            match self.receiver.recv().await {
                Ok(state) => return Some(state),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "state subscriber lagged, skipping states");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = VersionedState<S, A>> {
        stream::unfold(self, |mut states| async move {
            states.recv().await.map(|state| (state, states))
        })
    }
}

/// Subscription to reducer and pipeline failures.
pub struct ErrorStream<S, A> {
    receiver: broadcast::Receiver<ActionFailure<S, A>>,
}

impl<S, A> ErrorStream<S, A>
where
    S: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    /// Next failure, or `None` once the store has been dropped.
    pub async fn recv(&mut self) -> Option<ActionFailure<S, A>> {
        loop {
            match self.receiver.recv().await {
                Ok(failure) => return Some(failure),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "error subscriber lagged, skipping failures");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ActionFailure<S, A>> {
        stream::unfold(self, |mut errors| async move {
            errors.recv().await.map(|failure| (failure, errors))
        })
    }
}
