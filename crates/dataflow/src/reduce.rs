//! The reducer contract.
//!
//! A [`Reducer`] maps `(action, current state)` to a [`ReduceResult`]: no
//! change, one mutation, a stream of mutations, or a failure. Reducers must
//! not block; asynchronous work goes inside the returned stream.
//!
//! Mutations are closures over the state *at apply time*, not values computed
//! from the snapshot the reducer saw. A stream that sleeps between mutations
//! therefore never overwrites changes applied by other actions in between.
//!
//! # Example
//!
//! ```ignore
//! use dataflow_core::{ReduceResult, Reducer};
//!
//! fn reduce(action: &Download, _state: &Progress) -> ReduceResult<Progress> {
//!     match action {
//!         Download::Reset => ReduceResult::replace(Progress::default()),
//!         Download::Progress(pct) => {
//!             let pct = *pct;
//!             ReduceResult::single(move |state: &Progress| state.with_percent(pct))
//!         }
//!         Download::Start { url } => ReduceResult::from_stream(
//!             fetch_chunks(url.clone()),
//!             |state: &Progress, chunk: Chunk| state.add_bytes(chunk.len()),
//!         ),
//!         Download::Prefetch { .. } => ReduceResult::Empty,
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use futures::stream::{self, BoxStream, Stream, StreamExt};

/// One state transition, evaluated against the state current at apply time.
pub type Mutator<S> = Box<dyn FnOnce(&S) -> S + Send + 'static>;

/// Stream of mutations produced by a reducer.
pub type MutatorStream<S> = BoxStream<'static, anyhow::Result<Mutator<S>>>;

/// What a reducer produced for one action.
pub enum ReduceResult<S> {
    /// The action failed before producing any mutation.
    Failure(anyhow::Error),
    /// Exactly one mutation.
    Single(Mutator<S>),
    /// Zero or more mutations over time; an `Err` item ends the stream.
    Stream(MutatorStream<S>),
    /// Nothing to do.
    Empty,
}

impl<S: 'static> ReduceResult<S> {
    pub fn single<F>(mutator: F) -> Self
    where
        F: FnOnce(&S) -> S + Send + 'static,
    {
        ReduceResult::Single(Box::new(mutator))
    }

    /// Replace the state wholesale.
    pub fn replace(state: S) -> Self
    where
        S: Send,
    {
        Self::single(move |_: &S| state)
    }

    pub fn failure(error: impl Into<anyhow::Error>) -> Self {
        ReduceResult::Failure(error.into())
    }

    pub fn stream<St>(mutations: St) -> Self
    where
        St: Stream<Item = anyhow::Result<Mutator<S>>> + Send + 'static,
    {
        ReduceResult::Stream(mutations.boxed())
    }

    /// Build a stream result from any fallible value stream.
    ///
    /// Each value is folded into the state current at apply time with
    /// `combine`. The first `Err` value fails the action.
    pub fn from_stream<T, St, F>(source: St, combine: F) -> Self
    where
        T: Send + 'static,
        St: Stream<Item = anyhow::Result<T>> + Send + 'static,
        F: Fn(&S, T) -> S + Send + Sync + 'static,
    {
        let combine = Arc::new(combine);
        let mutations = source.map(move |item| {
            let combine = Arc::clone(&combine);
            item.map(|value| Box::new(move |state: &S| combine(state, value)) as Mutator<S>)
        });
        ReduceResult::Stream(mutations.boxed())
    }

    /// Normalise into a mutation stream.
    ///
    /// `Failure` becomes a single-error stream, `Empty` an empty one.
    pub fn into_mutations(self) -> MutatorStream<S> {
        match self {
            ReduceResult::Failure(error) => stream::iter(std::iter::once(Err(error))).boxed(),
            ReduceResult::Single(mutator) => stream::iter(std::iter::once(Ok(mutator))).boxed(),
            ReduceResult::Stream(mutations) => mutations,
            ReduceResult::Empty => stream::empty().boxed(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ReduceResult::Failure(_) => "failure",
            ReduceResult::Single(_) => "single",
            ReduceResult::Stream(_) => "stream",
            ReduceResult::Empty => "empty",
        }
    }
}

impl<S> fmt::Debug for ReduceResult<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReduceResult::Failure(error) => f.debug_tuple("Failure").field(error).finish(),
            ReduceResult::Single(_) => f.write_str("Single(..)"),
            ReduceResult::Stream(_) => f.write_str("Stream(..)"),
            ReduceResult::Empty => f.write_str("Empty"),
        }
    }
}

/// Pure mapping from action and state to mutations.
pub trait Reducer<S, A>: Send + Sync + 'static {
    fn reduce(&self, action: &A, state: &S) -> ReduceResult<S>;
}

impl<S, A, F> Reducer<S, A> for F
where
    F: Fn(&A, &S) -> ReduceResult<S> + Send + Sync + 'static,
{
    fn reduce(&self, action: &A, state: &S) -> ReduceResult<S> {
        self(action, state)
    }
}
