//! Testing utilities for dataflow stores.
//!
//! Stores are asynchronous: `dispatch` returns before anything is applied.
//! These helpers let tests wait for outcomes instead of sleeping.
//!
//! # Quick Start
//!
//! ## Recording states
//!
//! ```ignore
//! use dataflow_testing::StateRecorder;
//!
//! let recorder = StateRecorder::start(&store);
//! store.dispatch(Action::Load)?;
//!
//! recorder
//!     .wait_for(Duration::from_secs(5), |v| v.state.loaded)
//!     .await?;
//! assert_eq!(recorder.versions(), vec![0, 1]);
//! ```
//!
//! ## Recording failures
//!
//! ```ignore
//! use dataflow_testing::ErrorRecorder;
//!
//! let errors = ErrorRecorder::start(&store);
//! store.dispatch(Action::Explode)?;
//!
//! let failure = errors.wait_for_count(1, Duration::from_secs(5)).await?;
//! assert!(matches!(failure[0].action, Action::Explode));
//! ```
//!
//! ## Counting scheduled jobs
//!
//! ```ignore
//! use dataflow_testing::CountingContext;
//!
//! let counting = CountingContext::current("io")?;
//! store.dispatch(Action::Fetch { context: counting.context() })?;
//! store.settled().await;
//! assert_eq!(counting.scheduled(), 1);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use dataflow_core::{
    Action, ActionFailure, DataflowError, ExecutionContext, Executor, Store, VersionedState,
};
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

// =============================================================================
// Recording Buffer
// =============================================================================

struct Recording<T> {
    items: Mutex<Vec<T>>,
    notify: Notify,
}

impl<T: Clone> Recording<T> {
    fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        match self.items.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("recording lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn push(&self, item: T) {
        self.lock().push(item);
        self.notify.notify_waiters();
    }

    fn snapshot(&self) -> Vec<T> {
        self.lock().clone()
    }

    /// Wait until `check` returns `Some`, re-checking after every push.
    async fn wait<R>(&self, timeout: Duration, check: impl Fn(&[T]) -> Option<R>) -> Option<R> {
        let wait = async {
            loop {
                // Register before checking so a push in between is not lost
                let notified = self.notify.notified();
                let found = {
                    let items = self.lock();
                    check(&items)
                };
                if let Some(found) = found {
                    return found;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    }
}

// =============================================================================
// State Recorder
// =============================================================================

/// Records every state a store publishes, starting with the current one.
///
/// Recording stops when the recorder is dropped or the store goes away.
pub struct StateRecorder<S, A> {
    recording: Arc<Recording<VersionedState<S, A>>>,
    task: JoinHandle<()>,
}

impl<S, A> StateRecorder<S, A>
where
    S: Clone + Send + Sync + 'static,
    A: Action,
{
    /// Subscribe to `store` and record in a background task.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(store: &Store<S, A>) -> Self {
        let recording = Arc::new(Recording::new());
        let mut states = store.state_stream();
        let sink = Arc::clone(&recording);

        let task = tokio::spawn(async move {
            while let Some(state) = states.recv().await {
                sink.push(state);
            }
        });

        Self { recording, task }
    }

    pub fn states(&self) -> Vec<VersionedState<S, A>> {
        self.recording.snapshot()
    }

    /// Recorded state values without metadata.
    pub fn values(&self) -> Vec<S> {
        self.recording.lock().iter().map(|v| v.state.clone()).collect()
    }

    pub fn versions(&self) -> Vec<u64> {
        self.recording.lock().iter().map(|v| v.version).collect()
    }

    pub fn len(&self) -> usize {
        self.recording.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the first recorded state matching `predicate`.
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> Result<VersionedState<S, A>>
    where
        F: Fn(&VersionedState<S, A>) -> bool,
    {
        self.recording
            .wait(timeout, |states| states.iter().find(|v| predicate(v)).cloned())
            .await
            .ok_or_else(|| anyhow!("no matching state recorded within {:?}", timeout))
    }

    /// Wait until at least `count` states are recorded.
    pub async fn wait_for_count(&self, count: usize, timeout: Duration) -> Result<Vec<VersionedState<S, A>>> {
        self.recording
            .wait(timeout, |states| (states.len() >= count).then(|| states.to_vec()))
            .await
            .ok_or_else(|| anyhow!("fewer than {} states recorded within {:?}", count, timeout))
    }
}

impl<S, A> Drop for StateRecorder<S, A> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// =============================================================================
// Error Recorder
// =============================================================================

/// Records every failure a store reports from now on.
pub struct ErrorRecorder<S, A> {
    recording: Arc<Recording<ActionFailure<S, A>>>,
    task: JoinHandle<()>,
}

impl<S, A> ErrorRecorder<S, A>
where
    S: Clone + Send + Sync + 'static,
    A: Action,
{
    /// Must be called inside a tokio runtime.
    pub fn start(store: &Store<S, A>) -> Self {
        let recording = Arc::new(Recording::new());
        let mut errors = store.error_stream();
        let sink = Arc::clone(&recording);

        let task = tokio::spawn(async move {
            while let Some(failure) = errors.recv().await {
                sink.push(failure);
            }
        });

        Self { recording, task }
    }

    pub fn failures(&self) -> Vec<ActionFailure<S, A>> {
        self.recording.snapshot()
    }

    /// Failed actions in report order.
    pub fn actions(&self) -> Vec<A> {
        self.recording.lock().iter().map(|f| f.action.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.recording.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn wait_for_count(&self, count: usize, timeout: Duration) -> Result<Vec<ActionFailure<S, A>>> {
        self.recording
            .wait(timeout, |failures| (failures.len() >= count).then(|| failures.to_vec()))
            .await
            .ok_or_else(|| anyhow!("fewer than {} failures recorded within {:?}", count, timeout))
    }
}

impl<S, A> Drop for ErrorRecorder<S, A> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// =============================================================================
// Counting Context
// =============================================================================

struct CountingExecutor {
    inner: ExecutionContext,
    scheduled: Arc<AtomicUsize>,
}

impl Executor for CountingExecutor {
    fn spawn(&self, job: BoxFuture<'static, ()>) {
        self.scheduled.fetch_add(1, Ordering::SeqCst);
        self.inner.spawn(job);
    }
}

/// An execution context that counts the jobs scheduled on it.
///
/// Jobs are forwarded to the wrapped context unchanged.
#[derive(Clone)]
pub struct CountingContext {
    context: ExecutionContext,
    scheduled: Arc<AtomicUsize>,
}

impl CountingContext {
    /// Count jobs forwarded to `inner`.
    pub fn wrapping(name: impl Into<String>, inner: ExecutionContext) -> Self {
        let scheduled = Arc::new(AtomicUsize::new(0));
        let context = ExecutionContext::new(
            name,
            CountingExecutor {
                inner,
                scheduled: Arc::clone(&scheduled),
            },
        );
        Self { context, scheduled }
    }

    /// Count jobs run on the caller's tokio runtime.
    pub fn current(name: impl Into<String>) -> Result<Self, DataflowError> {
        let name = name.into();
        let inner = ExecutionContext::current(name.clone())?;
        Ok(Self::wrapping(name, inner))
    }

    /// Count jobs run on a fresh serial context.
    pub fn serial(name: impl Into<String>) -> Result<Self, DataflowError> {
        let name = name.into();
        let inner = ExecutionContext::serial(name.clone())?;
        Ok(Self::wrapping(name, inner))
    }

    /// The context to hand to actions, composites or the store builder.
    pub fn context(&self) -> ExecutionContext {
        self.context.clone()
    }

    /// Jobs scheduled so far.
    pub fn scheduled(&self) -> usize {
        self.scheduled.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.scheduled.store(0, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for CountingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingContext")
            .field("name", &self.context.name())
            .field("scheduled", &self.scheduled())
            .finish()
    }
}
