//! The store: dispatch controller and public API.
//!
//! A [`Store`] owns the state cell, the primary queue and the controller
//! loop. The loop runs on the store's default context and is the only owner
//! of the primary queue:
//!
//! ```text
//! dispatch() ──► command channel ──► controller loop
//!                                      │ enqueue
//!                                      ▼
//!                             primary BoundedFifoQueue
//!                                      │ head changed
//!                        ┌─────────────┴──────────────┐
//!                     serial                      non-serial
//!                        │                            │
//!              start pipeline, wait          detach pipeline,
//!              for Advance, dequeue          dequeue immediately
//! ```
//!
//! # Guarantees
//!
//! - **Linearized admission**: concurrent callers are ordered by the command
//!   channel.
//! - **Serial heads block**: the next queued item starts only after a serial
//!   head completes or fails.
//! - **Clean teardown**: dropping the store (or [`Store::shutdown`]) cancels
//!   the loop and every pipeline; no mutation is applied afterwards and
//!   dispatching returns [`DataflowError::Stopped`].
//!
//! # Example
//!
//! ```ignore
//! use dataflow_core::{ReduceResult, Store};
//!
//! let store = Store::builder(Counter::default(), |action: &CounterAction, _: &Counter| {
//!     match action {
//!         CounterAction::Increment => ReduceResult::single(|c: &Counter| c.incremented()),
//!         CounterAction::Reset => ReduceResult::replace(Counter::default()),
//!     }
//! })
//! .with_initial_action(CounterAction::Reset)
//! .build()?;
//!
//! let mut states = store.state_stream();
//! store.dispatch(CounterAction::Increment)?;
//!
//! while let Some(versioned) = states.recv().await {
//!     println!("v{} {:?}", versioned.version, versioned.state);
//! }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::action::{Action, Dispatchable};
use crate::config::StoreConfig;
use crate::context::ExecutionContext;
use crate::error::DataflowError;
use crate::pipeline::{Engine, PipelineInfo, PipelineRegistry};
use crate::queue::BoundedFifoQueue;
use crate::reduce::Reducer;
use crate::state::{ErrorStream, StateCell, StateStream, VersionedState};

// =============================================================================
// Admission
// =============================================================================

pub(crate) enum Command<A> {
    Dispatch(Dispatchable<A>),
    /// The running serial head finished.
    Advance,
}

/// Entry point into the controller's command channel.
pub(crate) struct Admission<A> {
    commands: mpsc::UnboundedSender<Command<A>>,
    /// Dispatches accepted but not yet enqueued (timers included).
    pending: AtomicUsize,
    cancel: CancellationToken,
}

impl<A: Action> Admission<A> {
    fn new(commands: mpsc::UnboundedSender<Command<A>>, cancel: CancellationToken) -> Self {
        Self {
            commands,
            pending: AtomicUsize::new(0),
            cancel,
        }
    }

    pub(crate) fn admit(&self, action: Dispatchable<A>) -> Result<(), DataflowError> {
        self.reserve()?;
        self.send_reserved(action)
    }

    /// Count a dispatch that will be sent later.
    fn reserve(&self) -> Result<(), DataflowError> {
        if self.cancel.is_cancelled() {
            return Err(DataflowError::Stopped);
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn send_reserved(&self, action: Dispatchable<A>) -> Result<(), DataflowError> {
        debug!(action = %action.label(), "action admitted");
        if self.commands.send(Command::Dispatch(action)).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(DataflowError::Stopped);
        }
        Ok(())
    }

    pub(crate) fn advance(&self) {
        // Closed only after teardown
        let _ = self.commands.send(Command::Advance);
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn enqueued(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Cloneable handle that can dispatch into a store without owning it.
///
/// Outliving the store is fine: dispatch then returns
/// [`DataflowError::Stopped`].
pub struct Dispatcher<A> {
    admission: Arc<Admission<A>>,
}

impl<A> Clone for Dispatcher<A> {
    fn clone(&self) -> Self {
        Self {
            admission: Arc::clone(&self.admission),
        }
    }
}

impl<A: Action> Dispatcher<A> {
    pub fn dispatch(&self, action: impl Into<Dispatchable<A>>) -> Result<(), DataflowError> {
        self.admission.admit(action.into())
    }

    pub fn is_stopped(&self) -> bool {
        self.admission.cancel.is_cancelled()
    }
}

impl<A> fmt::Debug for Dispatcher<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("stopped", &self.admission.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Controller Loop
// =============================================================================

async fn control_loop<S, A>(engine: Arc<Engine<S, A>>, mut commands: mpsc::UnboundedReceiver<Command<A>>)
where
    S: Clone + Send + Sync + 'static,
    A: Action,
{
    let mut queue: BoundedFifoQueue<Dispatchable<A>> = BoundedFifoQueue::new();
    let mut heads = queue.head_changes();

    info!(context = engine.default_context.name(), "dataflow controller started");

    loop {
        tokio::select! {
            biased;

            _ = engine.cancel.cancelled() => break,

            Some(head) = heads.recv() => {
                if head.is_serial() {
                    engine.start_serial(head);
                } else {
                    engine.detach(head, None);
                    advance(&engine, &mut queue);
                }
            }

            command = commands.recv() => match command {
                Some(Command::Dispatch(action)) => {
                    queue.enqueue(action);
                    engine.queue_len.store(queue.len(), Ordering::SeqCst);
                    engine.admission.enqueued();
                    engine.activity.notify_waiters();
                }
                Some(Command::Advance) => advance(&engine, &mut queue),
                None => break,
            },
        }
    }

    info!(
        abandoned = queue.len(),
        in_flight = engine.registry.len(),
        "dataflow controller stopped"
    );
}

fn advance<S, A: Action>(engine: &Engine<S, A>, queue: &mut BoundedFifoQueue<Dispatchable<A>>) {
    if let Some(done) = queue.dequeue() {
        debug!(action = %done.label(), remaining = queue.len(), "queue advanced");
    }
    engine.queue_len.store(queue.len(), Ordering::SeqCst);
    engine.activity.notify_waiters();
}

// =============================================================================
// Store
// =============================================================================

/// Single-writer state container driven by dispatched actions.
pub struct Store<S, A> {
    engine: Arc<Engine<S, A>>,
}

impl<S, A> Store<S, A>
where
    S: Clone + Send + Sync + 'static,
    A: Action,
{
    /// Start configuring a store.
    pub fn builder(initial_state: S, reducer: impl Reducer<S, A>) -> StoreBuilder<S, A> {
        StoreBuilder::new(initial_state, reducer)
    }

    /// Build a store with default configuration.
    pub fn new(initial_state: S, reducer: impl Reducer<S, A>) -> Result<Self, DataflowError> {
        Self::builder(initial_state, reducer).build()
    }

    /// Enqueue an action. Returns once the action is admitted, not processed.
    pub fn dispatch(&self, action: impl Into<Dispatchable<A>>) -> Result<(), DataflowError> {
        self.engine.admission.admit(action.into())
    }

    /// Dispatch `action` after `delay`, unless the store is torn down first.
    ///
    /// The timer runs on the default context, which must be backed by a
    /// tokio runtime with the time driver enabled.
    pub fn dispatch_after(
        &self,
        delay: Duration,
        action: impl Into<Dispatchable<A>>,
    ) -> Result<(), DataflowError> {
        let action = action.into();
        let admission = Arc::clone(&self.engine.admission);
        admission.reserve()?;

        let cancel = self.engine.cancel.clone();
        self.engine.default_context.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = admission.send_reserved(action);
                }
            }
        });
        Ok(())
    }

    pub fn dispatcher(&self) -> Dispatcher<A> {
        Dispatcher {
            admission: Arc::clone(&self.engine.admission),
        }
    }

    /// Current state first, then every change in apply order.
    ///
    /// A subscriber that falls more than `state_channel_capacity` states
    /// behind skips the states it missed and resumes with the oldest one
    /// still buffered. See [`StoreConfig::with_state_channel_capacity`].
    pub fn state_stream(&self) -> StateStream<S, A> {
        self.engine.cell.subscribe()
    }

    /// Every reducer and pipeline failure from now on.
    ///
    /// Lagging subscribers skip failures the same way state subscribers do.
    pub fn error_stream(&self) -> ErrorStream<S, A> {
        self.engine.cell.subscribe_errors()
    }

    pub fn current_state(&self) -> VersionedState<S, A> {
        self.engine.cell.current()
    }

    /// Retained states, oldest first.
    pub fn history(&self) -> Vec<VersionedState<S, A>> {
        self.engine.cell.history()
    }

    /// Number of running pipelines that nothing else awaits.
    pub fn in_flight(&self) -> usize {
        self.engine.registry.len()
    }

    pub fn pipelines(&self) -> Vec<PipelineInfo> {
        self.engine.registry.snapshot()
    }

    /// Live length of the primary queue.
    pub fn queue_len(&self) -> usize {
        self.engine.queue_len.load(Ordering::SeqCst)
    }

    /// Wait until nothing is admitted, queued or running.
    ///
    /// Pending `dispatch_after` timers count as admitted. Returns immediately
    /// once the store is shut down.
    pub async fn settled(&self) {
        self.engine.settled().await
    }

    pub fn default_context(&self) -> &ExecutionContext {
        &self.engine.default_context
    }

    /// Stop processing. Queued and running actions are abandoned.
    pub fn shutdown(&self) {
        if !self.engine.cancel.is_cancelled() {
            info!("dataflow store shutting down");
            self.engine.cancel.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.engine.cancel.is_cancelled()
    }
}

impl<S, A> Drop for Store<S, A> {
    fn drop(&mut self) {
        self.engine.cancel.cancel();
    }
}

impl<S, A> fmt::Debug for Store<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("default_context", &self.engine.default_context)
            .field("queue_len", &self.engine.queue_len.load(Ordering::SeqCst))
            .field("in_flight", &self.engine.registry.len())
            .field("stopped", &self.engine.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Store`].
pub struct StoreBuilder<S, A> {
    initial_state: S,
    reducer: Arc<dyn Reducer<S, A>>,
    config: StoreConfig,
    default_context: Option<ExecutionContext>,
    initial_action: Option<Dispatchable<A>>,
}

impl<S, A> StoreBuilder<S, A>
where
    S: Clone + Send + Sync + 'static,
    A: Action,
{
    pub fn new(initial_state: S, reducer: impl Reducer<S, A>) -> Self {
        Self {
            initial_state,
            reducer: Arc::new(reducer),
            config: StoreConfig::default(),
            default_context: None,
            initial_action: None,
        }
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.config.history_capacity = capacity;
        self
    }

    /// Use `context` instead of a fresh serial context.
    pub fn with_default_context(mut self, context: ExecutionContext) -> Self {
        self.default_context = Some(context);
        self
    }

    /// Dispatch `action` as soon as the store is built.
    pub fn with_initial_action(mut self, action: impl Into<Dispatchable<A>>) -> Self {
        self.initial_action = Some(action.into());
        self
    }

    pub fn build(self) -> Result<Store<S, A>, DataflowError> {
        let default_context = match self.default_context {
            Some(context) => context,
            None => ExecutionContext::serial(self.config.default_context_name.clone())?,
        };

        let cancel = CancellationToken::new();
        let (commands, receiver) = mpsc::unbounded_channel();
        let cell = StateCell::new(
            self.initial_state,
            self.config.history_capacity,
            self.config.state_channel_capacity,
            self.config.error_channel_capacity,
            cancel.clone(),
        );

        let engine = Arc::new(Engine {
            reducer: self.reducer,
            cell,
            default_context,
            registry: PipelineRegistry::default(),
            admission: Arc::new(Admission::new(commands, cancel.clone())),
            queue_len: AtomicUsize::new(0),
            activity: Notify::new(),
            cancel,
        });

        engine
            .default_context
            .spawn(control_loop(Arc::clone(&engine), receiver));

        info!(
            context = engine.default_context.name(),
            history_capacity = self.config.history_capacity,
            "dataflow store built"
        );

        let store = Store { engine };
        if let Some(action) = self.initial_action {
            store.dispatch(action)?;
        }
        Ok(store)
    }
}

impl<S, A> fmt::Debug for StoreBuilder<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreBuilder")
            .field("config", &self.config)
            .field("default_context", &self.default_context)
            .field("has_initial_action", &self.initial_action.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduce::ReduceResult;
    use crate::action::SetBy;
    use anyhow::anyhow;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum CounterAction {
        Add(i64),
        Fail,
        Noop,
    }

    impl Action for CounterAction {}

    fn reduce(action: &CounterAction, _state: &i64) -> ReduceResult<i64> {
        match action {
            CounterAction::Add(n) => {
                let n = *n;
                ReduceResult::single(move |s: &i64| s + n)
            }
            CounterAction::Fail => ReduceResult::failure(anyhow!("counter refused")),
            CounterAction::Noop => ReduceResult::Empty,
        }
    }

    fn store() -> Store<i64, CounterAction> {
        Store::new(0, reduce).unwrap()
    }

    async fn settle(store: &Store<i64, CounterAction>) {
        tokio::time::timeout(Duration::from_secs(5), store.settled())
            .await
            .expect("store did not settle");
    }

    #[tokio::test]
    async fn test_initial_state() {
        let store = store();
        let current = store.current_state();

        assert_eq!(current.state, 0);
        assert_eq!(current.version, 0);
        assert_eq!(current.set_by, SetBy::Initialization);
        assert_eq!(store.history().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_applies_in_order() {
        let store = store();
        store.dispatch(CounterAction::Add(1)).unwrap();
        store.dispatch(CounterAction::Add(10)).unwrap();
        store.dispatch(CounterAction::Add(100)).unwrap();
        settle(&store).await;

        let current = store.current_state();
        assert_eq!(current.state, 111);
        assert_eq!(current.version, 3);
        assert_eq!(current.set_by, SetBy::Action(CounterAction::Add(100)));
    }

    #[tokio::test]
    async fn test_empty_result_does_not_bump_version() {
        let store = store();
        store.dispatch(CounterAction::Noop).unwrap();
        settle(&store).await;

        assert_eq!(store.current_state().version, 0);
    }

    #[tokio::test]
    async fn test_state_stream_replays_current_state() {
        let store = store();
        store.dispatch(CounterAction::Add(5)).unwrap();
        settle(&store).await;

        let mut states = store.state_stream();
        let first = states.recv().await.unwrap();
        assert_eq!(first.state, 5);
    }

    #[tokio::test]
    async fn test_failure_reported_and_queue_continues() {
        let store = store();
        let mut errors = store.error_stream();

        store.dispatch(CounterAction::Add(2)).unwrap();
        store.dispatch(CounterAction::Fail).unwrap();
        store.dispatch(CounterAction::Add(3)).unwrap();
        settle(&store).await;

        let failure = errors.recv().await.unwrap();
        assert_eq!(failure.action, CounterAction::Fail);
        assert_eq!(failure.state, 2);
        assert_eq!(failure.error.to_string(), "counter refused");
        assert_eq!(store.current_state().state, 5);
    }

    #[tokio::test]
    async fn test_initial_action_dispatched_on_build() {
        let store = Store::<i64, CounterAction>::builder(0, reduce)
            .with_initial_action(CounterAction::Add(42))
            .build()
            .unwrap();
        settle(&store).await;

        let history = store.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].state, 42);
    }

    #[tokio::test]
    async fn test_dispatcher_handle() {
        let store = store();
        let dispatcher = store.dispatcher();
        let clone = dispatcher.clone();

        dispatcher.dispatch(CounterAction::Add(1)).unwrap();
        clone.dispatch(CounterAction::Add(1)).unwrap();
        settle(&store).await;

        assert_eq!(store.current_state().state, 2);
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_is_stopped() {
        let store = store();
        let dispatcher = store.dispatcher();
        store.shutdown();

        assert!(store.is_stopped());
        assert!(matches!(
            store.dispatch(CounterAction::Add(1)),
            Err(DataflowError::Stopped)
        ));
        assert!(dispatcher.is_stopped());
    }

    #[tokio::test]
    async fn test_dispatcher_outlives_store() {
        let store = store();
        let dispatcher = store.dispatcher();
        drop(store);

        let err = dispatcher.dispatch(CounterAction::Add(1)).unwrap_err();
        assert!(err.is_stopped());
    }

    #[tokio::test]
    async fn test_dispatch_after_waits() {
        let store = store();
        store
            .dispatch_after(Duration::from_millis(50), CounterAction::Add(7))
            .unwrap();

        assert_eq!(store.current_state().state, 0);
        settle(&store).await;
        assert_eq!(store.current_state().state, 7);
    }

    #[tokio::test]
    async fn test_history_capacity_from_builder() {
        let store = Store::<i64, CounterAction>::builder(0, reduce)
            .with_history_capacity(3)
            .build()
            .unwrap();
        for _ in 0..10 {
            store.dispatch(CounterAction::Add(1)).unwrap();
        }
        settle(&store).await;

        let states: Vec<i64> = store.history().iter().map(|v| v.state).collect();
        assert_eq!(states, vec![8, 9, 10]);
    }

    #[tokio::test]
    async fn test_config_names_default_context() {
        let store = Store::<i64, CounterAction>::builder(0, reduce)
            .with_config(StoreConfig::default().with_default_context_name("counter-ctx"))
            .build()
            .unwrap();

        assert_eq!(store.default_context().name(), "counter-ctx");
    }

    #[tokio::test]
    async fn test_injected_default_context() {
        let context = ExecutionContext::current("test-runtime").unwrap();
        let store = Store::<i64, CounterAction>::builder(0, reduce)
            .with_default_context(context.clone())
            .build()
            .unwrap();

        store.dispatch(CounterAction::Add(4)).unwrap();
        settle(&store).await;

        assert!(store.default_context().same_as(&context));
        assert_eq!(store.current_state().state, 4);
    }

    #[tokio::test]
    async fn test_settled_on_idle_store_returns() {
        let store = store();
        settle(&store).await;
        assert_eq!(store.in_flight(), 0);
        assert_eq!(store.queue_len(), 0);
        assert!(store.pipelines().is_empty());
    }

    #[test]
    fn test_debug_impls() {
        let builder = Store::<i64, CounterAction>::builder(0, reduce).with_initial_action(CounterAction::Noop);
        let debug = format!("{:?}", builder);
        assert!(debug.contains("has_initial_action: true"));

        let store = builder.build().unwrap();
        let debug = format!("{:?}", store);
        assert!(debug.contains("Store"));
    }
}
