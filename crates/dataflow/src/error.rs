//! Structured error types for the dataflow engine.
//!
//! `DataflowError` covers failures of the engine itself. Reducer failures are
//! plain `anyhow::Error` values and reach observers as
//! [`ActionFailure`](crate::ActionFailure) on the error stream.
//!
//! # The Error Boundary Rule
//!
//! > **`dispatch` never reports reducer errors.**
//!
//! - `anyhow` is internal transport (ergonomic for reducers)
//! - `ActionFailure` is the only externalized reducer error
//! - `DataflowError` is returned only when the engine cannot do its job
//!
//! # Example
//!
//! ```ignore
//! use dataflow_core::DataflowError;
//!
//! match store.dispatch(Action::Refresh) {
//!     Ok(()) => {}
//!     Err(DataflowError::Stopped) => tracing::debug!("store already shut down"),
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use thiserror::Error;

/// Structured error type for engine operations.
#[derive(Debug, Error)]
pub enum DataflowError {
    /// The store was dropped or shut down.
    #[error("store has been shut down")]
    Stopped,

    /// An execution context dropped a job before it produced a result.
    #[error("execution context {context} dropped a job before it completed")]
    ContextUnavailable {
        /// Name of the context.
        context: String,
    },

    /// The worker thread behind a serial context could not be started.
    #[error("failed to start execution context {name}")]
    ContextSpawn {
        /// Name of the context.
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A runtime-backed context was requested outside of a tokio runtime.
    #[error("no tokio runtime available for execution context {name}")]
    NoRuntime {
        /// Name of the context.
        name: String,
    },
}

impl DataflowError {
    /// Returns true if this error means the store is gone.
    pub fn is_stopped(&self) -> bool {
        matches!(self, DataflowError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopped_display() {
        let err = DataflowError::Stopped;
        assert!(err.to_string().contains("shut down"));
        assert!(err.is_stopped());
    }

    #[test]
    fn test_context_unavailable_display() {
        let err = DataflowError::ContextUnavailable {
            context: "ui".to_string(),
        };
        assert!(err.to_string().contains("ui"));
        assert!(!err.is_stopped());
    }

    #[test]
    fn test_context_spawn_keeps_source() {
        let err = DataflowError::ContextSpawn {
            name: "worker".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "no threads left"),
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("no threads left"));
    }

    #[test]
    fn test_downcast_from_anyhow() {
        let err: anyhow::Error = DataflowError::Stopped.into();

        match err.downcast_ref::<DataflowError>() {
            Some(DataflowError::Stopped) => {}
            other => panic!("expected Stopped, got {:?}", other),
        }
    }
}
