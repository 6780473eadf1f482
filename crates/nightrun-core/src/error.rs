//! Error types for Nightrun.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("job '{job}' depends on job '{after}' which is not in today's plan")]
    UnknownDependency { job: String, after: String },

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
