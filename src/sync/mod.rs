//! Concurrency primitives (v0.1)
//!
//! Thin, cancellation-aware wrappers over `tokio::sync`: a semaphore with
//! guaranteed-release `with_permit`, and a FIFO queue with cooperative
//! abort on dispose.

mod queue;
mod semaphore;

pub use queue::{AbortSignal, DisposeOptions, Queue};
pub use semaphore::{Permit, Semaphore};
