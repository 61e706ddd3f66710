//! Error types for ditta.
//!
//! Library crates use [`DittaError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use crate::types::{BlockKind, EnrichField};

/// Top-level error type for all ditta operations.
#[derive(Debug, thiserror::Error)]
pub enum DittaError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while contacting an external target.
    #[error("network error: {0}")]
    Network(String),

    /// An external target blocked us (classified by the failure classifier).
    #[error("blocked by {target}: {kind}")]
    Blocked { kind: BlockKind, target: String },

    /// Malformed input record; never retried.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A field's time/cost budget was exhausted mid-waterfall.
    #[error("budget exceeded while resolving {field}")]
    Budget { field: EnrichField },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Language-model oracle error (transport or malformed completion).
    #[error("oracle error: {0}")]
    Oracle(String),

    /// Unexpected internal state.
    #[error("logic error: {0}")]
    Logic(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DittaError>;

impl DittaError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a logic error from any displayable message.
    pub fn logic(msg: impl Into<String>) -> Self {
        Self::Logic(msg.into())
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Transient errors are retried by the job queue's backoff policy;
    /// everything else fails fast.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Blocked { .. } | Self::Oracle(_) | Self::Storage(_)
        )
    }
}
