//! Error types for the execution engine.

/// Failures of the execution substrate itself.
///
/// Exceptions raised by submitted code are never reported through this type;
/// they end up in [`crate::engine::Outcome::traceback`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Installing capture buffers or touching a reserved binding failed
    #[error("namespace bookkeeping failed: {0}")]
    Bookkeeping(String),
    /// The interpreter panicked; the executor thread caught it and keeps running
    #[error("interpreter panicked while {0}")]
    Panicked(String),
    /// The OS refused to start the executor thread
    #[error("cannot start executor thread: {0}")]
    Spawn(#[from] std::io::Error),
    /// The executor thread has stopped and can no longer accept jobs
    #[error("executor thread is not running")]
    ExecutorGone,
}
