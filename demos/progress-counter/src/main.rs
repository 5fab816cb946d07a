//! # Progress Counter Example
//!
//! Simulates a batch of downloads driven through a dataflow store:
//! streamed progress, a concurrent prefetch, and a composite that rolls
//! back when one of its steps fails.
//!
//! Run with `RUST_LOG=dataflow_core=debug` to see pipelines start and stop.

use std::time::Duration;

use anyhow::{anyhow, Result};
use dataflow_core::{composite, Action, ReduceResult, Store};
use futures::stream;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Default)]
struct Progress {
    file: Option<String>,
    bytes: u64,
    completed: Vec<String>,
    cached: Vec<String>,
}

// ============================================================================
// Actions
// ============================================================================

#[derive(Debug, Clone)]
enum Download {
    /// Stream chunks of `file` into the state
    Start { file: String, chunks: Vec<u64> },

    /// Mark the current file as done
    Finish,

    /// Warm a cache entry without holding up the queue
    Prefetch { file: String },

    /// Verify the current file; fails for anything named `*.broken`
    Verify,

    /// Forget the file in progress
    Reset,
}

impl Action for Download {
    fn is_serial(&self) -> bool {
        !matches!(self, Download::Prefetch { .. })
    }
}

// ============================================================================
// Reducer
// ============================================================================

fn reduce(action: &Download, state: &Progress) -> ReduceResult<Progress> {
    match action {
        Download::Start { file, chunks } => {
            let file = file.clone();
            let started = ReduceResult::<Progress>::single(move |p: &Progress| Progress {
                file: Some(file),
                bytes: 0,
                ..p.clone()
            });

            let chunks = chunks.clone();
            let arrivals = stream::unfold(chunks.into_iter(), |mut chunks| async move {
                let chunk = chunks.next()?;
                tokio::time::sleep(Duration::from_millis(20)).await;
                Some((Ok::<_, anyhow::Error>(chunk), chunks))
            });
            let progress = ReduceResult::from_stream(arrivals, |p: &Progress, chunk: u64| Progress {
                bytes: p.bytes + chunk,
                ..p.clone()
            });

            ReduceResult::stream(futures::StreamExt::chain(
                started.into_mutations(),
                progress.into_mutations(),
            ))
        }
        Download::Finish => ReduceResult::single(|p: &Progress| {
            let mut next = p.clone();
            if let Some(file) = next.file.take() {
                next.completed.push(file);
            }
            next
        }),
        Download::Prefetch { file } => {
            let file = file.clone();
            ReduceResult::from_stream(
                stream::once(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok::<_, anyhow::Error>(file)
                }),
                |p: &Progress, file: String| {
                    let mut next = p.clone();
                    next.cached.push(file);
                    next
                },
            )
        }
        Download::Verify => match &state.file {
            Some(file) if file.ends_with(".broken") => {
                ReduceResult::failure(anyhow!("checksum mismatch for {}", file))
            }
            Some(_) => ReduceResult::Empty,
            None => ReduceResult::failure(anyhow!("nothing to verify")),
        },
        Download::Reset => ReduceResult::single(|p: &Progress| Progress {
            file: None,
            bytes: 0,
            ..p.clone()
        }),
    }
}

fn fetch(file: &str, chunks: &[u64]) -> dataflow_core::CompositeAction<Download> {
    composite![
        Download::Start {
            file: file.to_string(),
            chunks: chunks.to_vec(),
        },
        Download::Verify,
        Download::Finish,
    ]
    .with_fallback(Download::Reset)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let store = Store::builder(Progress::default(), reduce)
        .with_history_capacity(20)
        .build()?;

    let mut states = store.state_stream();
    let printer = tokio::spawn(async move {
        while let Some(versioned) = states.recv().await {
            let state = &versioned.state;
            println!(
                "v{:<3} {:<12} {:>5} bytes  done={:?} cached={:?}",
                versioned.version,
                state.file.as_deref().unwrap_or("-"),
                state.bytes,
                state.completed,
                state.cached,
            );
        }
    });

    let mut errors = store.error_stream();
    let reporter = tokio::spawn(async move {
        while let Some(failure) = errors.recv().await {
            println!("failed {:?}: {}", failure.action, failure.error);
        }
    });

    store.dispatch(fetch("report.pdf", &[512, 512, 256]))?;
    store.dispatch(Download::Prefetch {
        file: "logo.png".to_string(),
    })?;
    store.dispatch(fetch("archive.broken", &[1024, 1024]))?;
    store.dispatch_after(
        Duration::from_millis(50),
        fetch("notes.txt", &[128]),
    )?;

    // The delayed dispatch is admitted before settled() can report idle
    store.settled().await;

    let last = store.current_state();
    info!(
        version = last.version,
        completed = ?last.state.completed,
        history = store.history().len(),
        "all downloads settled"
    );

    drop(store);
    let _ = printer.await;
    let _ = reporter.await;

    Ok(())
}
