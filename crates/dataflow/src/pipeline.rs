//! Execution pipelines for simple and composite actions.
//!
//! A pipeline takes one [`Dispatchable`] from "picked up" to "done":
//!
//! ```text
//! Simple(action)
//!     │ resolve context: action's ─► enclosing composite's ─► store default
//!     ▼
//! context.run(job) ───────────────────────────────────────────────┐
//!     │ read state fresh, reducer.reduce(&action, &state)         │
//!     │ for each mutator: StateCell::apply (single critical sec.) │
//!     ▼                                                           │
//! Ok / Failed ◄───────────────────────────────────────────────────┘
//!
//! Composite(children)
//!     │ private BoundedFifoQueue seeded with the children
//!     ├─► serial child     ─► run(child) recursively, queue advances after
//!     ├─► non-serial child ─► detached pipeline, queue advances at once
//!     ▼
//! first failure: stop, dispatch fallback, propagate
//! ```
//!
//! Every pipeline that is not awaited by a parent (serial heads, detached
//! heads, detached composite children) is registered in the
//! [`PipelineRegistry`] for as long as it runs.
//!
//! # Failure path
//!
//! The failing *simple* action is reported on the error stream with the state
//! current at that moment. Every composite on the way up that declares a
//! fallback dispatches it as a new top-level action, innermost first.
//! Failures of detached children are reported but do not stop the composite.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::action::{Action, CompositeAction, Dispatchable};
use crate::context::ExecutionContext;
use crate::queue::BoundedFifoQueue;
use crate::reduce::Reducer;
use crate::state::StateCell;
use crate::store::Admission;

// =============================================================================
// Pipeline Registry
// =============================================================================

/// Generation number of a registered pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId(u64);

impl PipelineId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipeline-{}", self.0)
    }
}

/// Snapshot of one running pipeline.
#[derive(Debug, Clone)]
pub struct PipelineInfo {
    pub id: PipelineId,
    pub label: String,
    pub serial: bool,
    pub started_at: DateTime<Utc>,
}

/// In-flight pipelines keyed by generation.
#[derive(Default)]
pub(crate) struct PipelineRegistry {
    next_id: AtomicU64,
    entries: DashMap<PipelineId, PipelineInfo>,
}

impl PipelineRegistry {
    pub(crate) fn register(&self, label: String, serial: bool) -> PipelineId {
        let id = PipelineId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.entries.insert(
            id,
            PipelineInfo {
                id,
                label,
                serial,
                started_at: Utc::now(),
            },
        );
        id
    }

    pub(crate) fn remove(&self, id: PipelineId) -> Option<PipelineInfo> {
        self.entries.remove(&id).map(|(_, info)| info)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Running pipelines, oldest first.
    pub(crate) fn snapshot(&self) -> Vec<PipelineInfo> {
        let mut infos: Vec<PipelineInfo> = self.entries.iter().map(|e| e.value().clone()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}

/// RAII registration of a pipeline.
///
/// Dropping the guard (normally, on cancellation, or when an executor drops
/// the job) removes the entry and wakes `settled` waiters.
pub(crate) struct PipelineGuard<S, A> {
    engine: Arc<Engine<S, A>>,
    id: PipelineId,
}

impl<S, A> Drop for PipelineGuard<S, A> {
    fn drop(&mut self) {
        if let Some(info) = self.engine.registry.remove(self.id) {
            debug!(
                pipeline = %self.id,
                action = %info.label,
                elapsed_ms = (Utc::now() - info.started_at).num_milliseconds(),
                "pipeline finished"
            );
        }
        self.engine.activity.notify_waiters();
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Why a pipeline stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Halt {
    /// A simple action failed; already reported on the error stream.
    Failed,
    /// The store was torn down.
    Cancelled,
}

/// Everything pipelines share with the controller.
pub(crate) struct Engine<S, A> {
    pub(crate) reducer: Arc<dyn Reducer<S, A>>,
    pub(crate) cell: StateCell<S, A>,
    pub(crate) default_context: ExecutionContext,
    pub(crate) registry: PipelineRegistry,
    pub(crate) admission: Arc<Admission<A>>,
    /// Live length of the primary queue, published by the controller.
    pub(crate) queue_len: AtomicUsize,
    /// Woken whenever the queue or the registry shrinks.
    pub(crate) activity: Notify,
    pub(crate) cancel: CancellationToken,
}

impl<S, A> Engine<S, A>
where
    S: Clone + Send + Sync + 'static,
    A: Action,
{
    /// Start a serial queue head. The controller advances its queue once the
    /// pipeline finishes, unless the store was torn down.
    pub(crate) fn start_serial(self: &Arc<Self>, head: Dispatchable<A>) {
        let guard = self.register(&head, true);
        let engine = Arc::clone(self);

        self.default_context.spawn(async move {
            let outcome = Arc::clone(&engine).drive(head, None).await;
            drop(guard);
            if outcome != Err(Halt::Cancelled) {
                engine.admission.advance();
            }
        });
    }

    /// Run a pipeline nobody waits for.
    pub(crate) fn detach(self: &Arc<Self>, action: Dispatchable<A>, inherited: Option<ExecutionContext>) {
        let guard = self.register(&action, false);
        let engine = Arc::clone(self);

        self.default_context.spawn(async move {
            let _guard = guard;
            let _ = engine.drive(action, inherited).await;
        });
    }

    /// Whether nothing is admitted, queued or running.
    pub(crate) fn is_settled(&self) -> bool {
        // Read order matters: each counter is raised before the one read
        // after it is lowered.
        self.admission.pending() == 0
            && self.queue_len.load(Ordering::SeqCst) == 0
            && self.registry.is_empty()
    }

    pub(crate) async fn settled(&self) {
        loop {
            // Register before checking so a wake-up in between is not lost
            let notified = self.activity.notified();
            if self.is_settled() {
                return;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = notified => {}
            }
        }
    }

    fn register(self: &Arc<Self>, action: &Dispatchable<A>, serial: bool) -> PipelineGuard<S, A> {
        let label = action.label();
        let id = self.registry.register(label.clone(), serial);
        debug!(pipeline = %id, action = %label, serial, "pipeline started");
        PipelineGuard {
            engine: Arc::clone(self),
            id,
        }
    }

    /// Run a pipeline until it finishes or the store is torn down.
    async fn drive(
        self: Arc<Self>,
        action: Dispatchable<A>,
        inherited: Option<ExecutionContext>,
    ) -> Result<(), Halt> {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(Halt::Cancelled),
            outcome = self.run(action, inherited) => outcome,
        }
    }

    fn run(
        self: Arc<Self>,
        action: Dispatchable<A>,
        inherited: Option<ExecutionContext>,
    ) -> BoxFuture<'static, Result<(), Halt>> {
        async move {
            match action {
                Dispatchable::Simple(action) => self.run_simple(action, inherited).await,
                Dispatchable::Composite(composite) => {
                    self.run_composite(composite, inherited).await
                }
            }
        }
        .boxed()
    }

    async fn run_simple(
        self: &Arc<Self>,
        action: A,
        inherited: Option<ExecutionContext>,
    ) -> Result<(), Halt> {
        let context = action
            .execution_context()
            .or(inherited)
            .unwrap_or_else(|| self.default_context.clone());

        let engine = Arc::clone(self);
        let job_action = action.clone();
        let outcome = context
            .run(async move { engine.reduce_and_apply(&job_action).await })
            .await;

        let error = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(error)) => error,
            Err(engine_error) => engine_error.into(),
        };
        if self.cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }

        warn!(action = ?action, context = context.name(), error = %error, "action failed");
        self.cell.fail(action, error);
        Err(Halt::Failed)
    }

    /// Runs on the resolved context: reduce against fresh state, then apply
    /// every mutation in order.
    async fn reduce_and_apply(&self, action: &A) -> anyhow::Result<()> {
        let result = {
            let state = self.cell.current().state;
            self.reducer.reduce(action, &state)
        };
        debug!(action = ?action, result = result.kind(), "action reduced");

        let mut mutations = result.into_mutations();
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                next = mutations.next() => next,
            };
            match next {
                None => return Ok(()),
                Some(Ok(mutator)) => {
                    if self.cell.apply(action, mutator).is_none() {
                        return Ok(());
                    }
                }
                Some(Err(error)) => return Err(error),
            }
        }
    }

    async fn run_composite(
        self: &Arc<Self>,
        composite: CompositeAction<A>,
        inherited: Option<ExecutionContext>,
    ) -> Result<(), Halt> {
        let (children, fallback, context) = composite.into_parts();
        let scope = context.or(inherited);

        let mut queue = BoundedFifoQueue::new();
        for child in children {
            queue.enqueue(child);
        }

        while let Some(child) = queue.peek().cloned() {
            if child.is_serial() {
                if let Err(halt) = Arc::clone(self).run(child, scope.clone()).await {
                    if let (Halt::Failed, Some(fallback)) = (halt, fallback) {
                        self.dispatch_fallback(fallback);
                    }
                    return Err(halt);
                }
            } else {
                self.detach(child, scope.clone());
            }
            queue.dequeue();
        }

        Ok(())
    }

    fn dispatch_fallback(&self, fallback: Dispatchable<A>) {
        debug!(action = %fallback.label(), "dispatching fallback");
        if let Err(e) = self.admission.admit(fallback) {
            debug!(error = %e, "fallback not dispatched");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_ids_are_generations() {
        let registry = PipelineRegistry::default();
        let a = registry.register("a".to_string(), true);
        let b = registry.register("b".to_string(), false);

        assert_eq!(a.get(), 0);
        assert_eq!(b.get(), 1);
        assert_eq!(registry.len(), 2);
        assert_eq!(b.to_string(), "pipeline-1");
    }

    #[test]
    fn test_registry_snapshot_is_ordered() {
        let registry = PipelineRegistry::default();
        for label in ["first", "second", "third"] {
            registry.register(label.to_string(), true);
        }

        let labels: Vec<String> = registry.snapshot().into_iter().map(|i| i.label).collect();
        assert_eq!(labels, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_registry_remove() {
        let registry = PipelineRegistry::default();
        let id = registry.register("only".to_string(), false);

        let info = registry.remove(id).unwrap();
        assert!(!info.serial);
        assert!(registry.is_empty());
        assert!(registry.remove(id).is_none());
    }

    #[test]
    fn test_registry_ids_not_reused() {
        let registry = PipelineRegistry::default();
        let first = registry.register("x".to_string(), true);
        registry.remove(first);
        let second = registry.register("x".to_string(), true);

        assert_ne!(first, second);
    }
}
