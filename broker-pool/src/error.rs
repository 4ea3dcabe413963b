use thiserror::Error;

/// Why a work item was not started.
#[derive(Error, Debug)]
pub enum PoolError {
    /// No idle worker and the pool is already at `max_threads`. Retry later.
    #[error("Insufficient resources: pool {pool} has {running} running and no idle workers")]
    InsufficientResources { pool: String, running: usize },

    /// The OS refused to create a worker thread.
    #[error("Worker setup failed: {0}")]
    SetupFailure(#[from] std::io::Error),

    /// The pool is shutting down.
    #[error("Pool {0} is shutting down")]
    Unavailable(String),
}

impl PoolError {
    /// Whether the caller may retry the same submit later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::InsufficientResources { .. })
    }
}
