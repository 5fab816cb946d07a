//! Execution contexts: where reducer jobs and pipelines run.
//!
//! An [`ExecutionContext`] is a named handle to an [`Executor`]. The store
//! resolves one per simple action (the action's own, else the enclosing
//! composite's, else the store default) and runs the reducer plus every
//! mutation it yields on it.
//!
//! # Provided contexts
//!
//! - [`ExecutionContext::serial`] starts a dedicated worker thread with a
//!   current-thread tokio runtime. Jobs never run in parallel; they
//!   interleave at await points. Every store gets a fresh one as its default
//!   unless another is injected.
//! - [`ExecutionContext::from_handle`] / [`ExecutionContext::current`] spawn
//!   onto an existing tokio runtime, which may be multi-threaded.
//!
//! Any other scheduler (a UI main loop, a test harness) plugs in by
//! implementing [`Executor`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::DataflowError;

/// Something that can run a boxed future to completion.
///
/// Implementations must not block the caller of `spawn`.
pub trait Executor: Send + Sync + 'static {
    fn spawn(&self, job: BoxFuture<'static, ()>);
}

/// Named, cloneable handle to an executor.
#[derive(Clone)]
pub struct ExecutionContext {
    name: Arc<str>,
    executor: Arc<dyn Executor>,
}

impl ExecutionContext {
    /// Wrap a custom executor.
    pub fn new(name: impl Into<String>, executor: impl Executor) -> Self {
        Self::from_arc(name, Arc::new(executor))
    }

    /// Wrap an already shared executor.
    pub fn from_arc(name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        Self {
            name: Arc::from(name.into()),
            executor,
        }
    }

    /// Start a serial context on its own worker thread.
    ///
    /// The thread exits once every clone of the returned context is dropped.
    /// Jobs still pending at that point are dropped with the runtime.
    pub fn serial(name: impl Into<String>) -> Result<Self, DataflowError> {
        let name = name.into();
        let executor = SerialExecutor::start(&name).map_err(|source| {
            DataflowError::ContextSpawn {
                name: name.clone(),
                source,
            }
        })?;
        Ok(Self::new(name, executor))
    }

    /// Spawn jobs onto the runtime behind `handle`.
    pub fn from_handle(name: impl Into<String>, handle: Handle) -> Self {
        Self::new(name, TokioExecutor { handle })
    }

    /// Spawn jobs onto the runtime the caller is running in.
    pub fn current(name: impl Into<String>) -> Result<Self, DataflowError> {
        let name = name.into();
        match Handle::try_current() {
            Ok(handle) => Ok(Self::from_handle(name, handle)),
            Err(_) => Err(DataflowError::NoRuntime { name }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if both handles point at the same executor.
    pub fn same_as(&self, other: &ExecutionContext) -> bool {
        Arc::ptr_eq(&self.executor, &other.executor)
    }

    /// Fire-and-forget a future on this context.
    pub fn spawn<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.executor.spawn(job.boxed());
    }

    /// Run a future on this context and wait for its output.
    ///
    /// Fails with [`DataflowError::ContextUnavailable`] if the executor drops
    /// the job without running it to completion.
    pub async fn run<F, T>(&self, job: F) -> Result<T, DataflowError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.spawn(async move {
            let _ = tx.send(job.await);
        });

        rx.await.map_err(|_| {
            error!(context = %self.name, "execution context dropped a job");
            DataflowError::ContextUnavailable {
                context: self.name.to_string(),
            }
        })
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tokio runtime handle
// =============================================================================

struct TokioExecutor {
    handle: Handle,
}

impl Executor for TokioExecutor {
    fn spawn(&self, job: BoxFuture<'static, ()>) {
        self.handle.spawn(job);
    }
}

// =============================================================================
// Dedicated serial worker
// =============================================================================

struct SerialExecutor {
    jobs: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl SerialExecutor {
    fn start(name: &str) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (jobs, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        let thread_name = name.to_string();

        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(context = %thread_name, "serial context started");
                runtime.block_on(async move {
                    while let Some(job) = rx.recv().await {
                        tokio::spawn(job);
                    }
                });
                debug!(context = %thread_name, "serial context stopped");
            })?;

        Ok(Self { jobs })
    }
}

impl Executor for SerialExecutor {
    fn spawn(&self, job: BoxFuture<'static, ()>) {
        // A closed channel drops the job, which the caller observes as a
        // dropped completion channel.
        if self.jobs.send(job).is_err() {
            debug!("serial context is gone, job dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct DroppingExecutor;

    impl Executor for DroppingExecutor {
        fn spawn(&self, job: BoxFuture<'static, ()>) {
            drop(job);
        }
    }

    #[tokio::test]
    async fn test_serial_context_runs_jobs() {
        let ctx = ExecutionContext::serial("test-serial").unwrap();
        let value = ctx.run(async { 40 + 2 }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(ctx.name(), "test-serial");
    }

    #[tokio::test]
    async fn test_serial_context_never_runs_jobs_in_parallel() {
        let ctx = ExecutionContext::serial("test-exclusive").unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut waits = Vec::new();
        for _ in 0..8 {
            let active = active.clone();
            let max_seen = max_seen.clone();
            waits.push(ctx.run(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                // Busy section with no await point
                std::thread::sleep(Duration::from_millis(2));
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for result in futures::future::join_all(waits).await {
            result.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_serial_context_interleaves_at_await_points() {
        let ctx = ExecutionContext::serial("test-interleave").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let slow_log = log.clone();
        let slow = ctx.run(async move {
            slow_log.lock().unwrap().push("slow-start");
            tokio::time::sleep(Duration::from_millis(50)).await;
            slow_log.lock().unwrap().push("slow-end");
        });
        let fast_log = log.clone();
        let fast = ctx.run(async move {
            fast_log.lock().unwrap().push("fast");
        });

        let (a, b) = tokio::join!(slow, fast);
        a.unwrap();
        b.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["slow-start", "fast", "slow-end"]
        );
    }

    #[tokio::test]
    async fn test_current_context_uses_caller_runtime() {
        let ctx = ExecutionContext::current("caller").unwrap();
        let value = ctx.run(async { "ran" }).await.unwrap();
        assert_eq!(value, "ran");
    }

    #[test]
    fn test_current_context_outside_runtime_fails() {
        let err = ExecutionContext::current("nowhere").unwrap_err();
        assert!(matches!(err, DataflowError::NoRuntime { .. }));
    }

    #[tokio::test]
    async fn test_dropped_job_reports_context_unavailable() {
        let ctx = ExecutionContext::new("black-hole", DroppingExecutor);
        let err = ctx.run(async { 1 }).await.unwrap_err();

        match err {
            DataflowError::ContextUnavailable { context } => assert_eq!(context, "black-hole"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_same_as_compares_executor_identity() {
        let a = ExecutionContext::current("a").unwrap();
        let a2 = a.clone();
        let b = ExecutionContext::current("a").unwrap();

        assert!(a.same_as(&a2));
        assert!(!a.same_as(&b));
    }

    #[test]
    fn test_debug_shows_name() {
        let ctx = ExecutionContext::new("ui-main", DroppingExecutor);
        let debug = format!("{:?}", ctx);
        assert!(debug.contains("ui-main"));
    }
}
