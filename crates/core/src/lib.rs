//! `jobrelay-core`: primitives shared by every layer.
//!
//! This crate has no IO. It carries the request [`Context`] (trace id, deadline,
//! cancellation) that flows through lock acquisition, publishing and job handlers.

pub mod context;
pub mod error;
pub mod id;

pub use context::{CancellationToken, Context};
pub use error::ContextError;
pub use id::TraceId;
