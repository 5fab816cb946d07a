//! # Dataflow
//!
//! An in-process, unidirectional action-dispatch and state-reduction engine.
//! One authoritative state value changes only through dispatched actions;
//! each action is reduced by a pure reducer that may do asynchronous work
//! before producing zero or more mutations.
//!
//! ## Core Concepts
//!
//! - [`Action`] = what should happen (domain enum, serial or not)
//! - [`Reducer`] = how state changes, as a [`ReduceResult`] of mutations
//! - [`CompositeAction`] = an ordered group of actions with an optional
//!   fallback
//! - [`ExecutionContext`] = where a reducer runs
//!
//! ## Architecture
//!
//! ```text
//! Store::dispatch()
//!     │
//!     ▼ command channel
//! controller loop ──► primary queue ──► head changed
//!                                          │
//!                  ┌───────────────────────┴──────────────┐
//!                  │ serial                                │ non-serial
//!                  ▼                                       ▼
//!            pipeline (queue waits)              detached pipeline
//!                  │                                       │
//!                  └──────────────┬────────────────────────┘
//!                                 ▼
//!                    context.run(reduce + apply)
//!                                 │
//!                                 ▼
//!                 StateCell::apply ─► history ─► state stream
//!                       failure ───────────────► error stream
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One writer** - every mutation goes through one critical section
//! 2. **Fresh state** - reducers and mutators see the state current when
//!    they run, never a stale snapshot
//! 3. **Serial means serial** - a serial action completes before the next
//!    queued item starts
//! 4. **Bounded memory** - queue and history storage stay proportional to
//!    their live contents
//! 5. **Nothing after teardown** - a dropped store applies no mutation
//!
//! ## Guarantees
//!
//! - **Total order**: every observer sees versions 0, 1, 2, ... in order
//! - **Replay-one**: new state subscribers get the current state first
//! - **Lossy for laggards**: slow subscribers skip states rather than
//!   block the engine
//!
//! ## Example
//!
//! ```ignore
//! use dataflow_core::{composite, Action, ReduceResult, Store};
//!
//! #[derive(Debug, Clone)]
//! enum Upload {
//!     Start,
//!     Chunk(u64),
//!     Finish,
//!     Abort,
//! }
//! impl Action for Upload {}
//!
//! #[derive(Debug, Clone, Default)]
//! struct Progress {
//!     bytes: u64,
//!     done: bool,
//! }
//!
//! let store = Store::new(Progress::default(), |action: &Upload, _: &Progress| match action {
//!     Upload::Start | Upload::Abort => ReduceResult::replace(Progress::default()),
//!     Upload::Chunk(n) => {
//!         let n = *n;
//!         ReduceResult::single(move |p: &Progress| Progress { bytes: p.bytes + n, ..p.clone() })
//!     }
//!     Upload::Finish => ReduceResult::single(|p: &Progress| Progress { done: true, ..p.clone() }),
//! })?;
//!
//! store.dispatch(
//!     composite![Upload::Start, Upload::Chunk(512), Upload::Finish].with_fallback(Upload::Abort),
//! )?;
//! store.settled().await;
//! ```

mod action;
mod composite_macro;
mod config;
mod context;
mod error;
mod history;
mod pipeline;
mod queue;
mod reduce;
mod state;
mod store;


// Re-export action types
pub use action::{debug_label, Action, CompositeAction, Dispatchable, SetBy, LABEL_LIMIT};

// Re-export reducer contract
pub use reduce::{Mutator, MutatorStream, ReduceResult, Reducer};

// Re-export execution contexts
pub use context::{ExecutionContext, Executor};

// Re-export store types (primary entry point)
pub use store::{Dispatcher, Store, StoreBuilder};
pub use state::{ActionFailure, ErrorStream, StateStream, VersionedState};
pub use pipeline::{PipelineId, PipelineInfo};

// Re-export configuration and errors
pub use config::{StoreConfig, DEFAULT_CHANNEL_CAPACITY, DEFAULT_CONTEXT_NAME};
pub use error::DataflowError;

// Re-export bounded containers
pub use history::{BoundedHistoryLog, DEFAULT_HISTORY_CAPACITY};
pub use queue::BoundedFifoQueue;
