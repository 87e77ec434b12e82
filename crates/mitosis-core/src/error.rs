use thiserror::Error;

use crate::client::ClientError;
use crate::ports::PortError;
use crate::server::ServerError;
use crate::worktree::WorktreeError;

/// Top-level error type for the mitosis-core library.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration parse or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Port allocation error.
    #[error(transparent)]
    Ports(#[from] PortError),

    /// Working-tree lifecycle error.
    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    /// Agent-server boot or shutdown error.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// Agent HTTP client error.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// One or more teardown steps failed; the rest were still attempted.
    #[error("teardown incomplete: {0}")]
    Teardown(String),

    /// Task-record parse error.
    #[error("task db error: {0}")]
    TaskDb(String),

    /// Report read/write error.
    #[error("report error: {0}")]
    Report(String),

    /// The per-task deadline expired.
    #[error("task deadline expired")]
    Timeout,

    /// Cooperative cancellation was observed.
    #[error("cancelled")]
    Cancelled,

    /// Wraps `std::io::Error`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Stable machine-readable kind for an error, used in results, reports
    /// and log fields. Kinds, not types: callers match on these strings.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "config.invalid",
            CoreError::Ports(PortError::Exhausted) => "ports.exhausted",
            CoreError::Ports(_) => "ports.invalid",
            CoreError::Worktree(WorktreeError::AlreadyExists { .. }) => "worktree.exists",
            CoreError::Worktree(WorktreeError::InvalidIdentifier { .. }) => "worktree.identifier",
            CoreError::Worktree(_) => "worktree.backend",
            CoreError::Server(ServerError::BootTimeout { .. }) => "server.boot-timeout",
            CoreError::Server(ServerError::Unhealthy { .. }) => "server.unhealthy",
            CoreError::Server(_) => "server.failed",
            CoreError::Client(_) => "client.request-failed",
            CoreError::Teardown(_) => "teardown.partial",
            CoreError::TaskDb(_) => "taskdb.invalid",
            CoreError::Report(_) => "report.io",
            CoreError::Timeout => "timeout",
            CoreError::Cancelled => "cancelled",
            CoreError::Io(_) => "io",
        }
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, CoreError>;
