//! Cloner error types.

use thiserror::Error;

/// An error from a [`crate::BulkLoader`] implementation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct LoaderError {
    message: String,
}

impl LoaderError {
    /// Creates a loader error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// The final status of a failed clone.
#[derive(Debug, Clone, Error)]
pub enum CloneError {
    /// A source command failed past its phase's attempt budget.
    #[error("{phase} against the source failed after {attempts} attempt(s): {source}")]
    Source {
        /// The phase whose command failed.
        phase: &'static str,
        /// Attempts consumed, including the failing one.
        attempts: u32,
        /// The final error from the source.
        source: tessera_core::Error,
    },

    /// The source reported a negative document count.
    #[error("source reported a negative document count ({count})")]
    NegativeCount {
        /// The reported count.
        count: i64,
    },

    /// The bulk loader rejected an operation.
    #[error("bulk loader {operation} failed: {source}")]
    Loader {
        /// The loader operation that failed.
        operation: &'static str,
        /// The loader's error.
        source: LoaderError,
    },

    /// The cloner was shut down before completion.
    #[error("clone shut down: {reason}")]
    ShutDown {
        /// Why the clone stopped.
        reason: String,
    },
}
