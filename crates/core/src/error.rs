//! Context error model.

use thiserror::Error;

/// Why a [`Context`](crate::Context) is done.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// The context (or the token it shares) was cancelled explicitly.
    #[error("context cancelled")]
    Cancelled,

    /// The context deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}
