//! Reusable worker threads for provider operations.
//!
//! Workers park between items and are handed work directly, so the pool
//! has no shared queue: when nothing is idle and the pool is at its
//! ceiling, [`ThreadPool::submit`] fails fast with
//! [`PoolError::InsufficientResources`].

mod error;
mod pool;
mod worker;

pub use error::PoolError;
pub use pool::ThreadPool;
