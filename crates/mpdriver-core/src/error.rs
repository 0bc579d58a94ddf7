//! Error types for mpdriver-core.

use thiserror::Error;

/// Result type for mpdriver-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in mpdriver-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization error (IPC framing or task payloads).
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// IPC communication error with a worker process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// A worker failed to construct its work object.
    #[error("worker initialization failed: {0}")]
    WorkerInit(String),

    /// The work function failed for one task.
    #[error("task {index} failed: {message}")]
    Task { index: usize, message: String },

    /// The progress coordinator stopped answering.
    #[error("coordination lost: {0}")]
    CoordinationLost(String),

    /// The coordinator rejected a progress operation.
    #[error("progress error: {0}")]
    Progress(String),

    /// Colour name or hex string not recognized.
    #[error("invalid colour '{0}': expected one of black, red, green, yellow, blue, magenta, cyan, white or #rrggbb")]
    InvalidColour(String),

    /// The executor was interrupted earlier and its worker pool is gone.
    #[error("executor was cancelled")]
    Cancelled,

    /// Execution was aborted without a more specific cause.
    #[error("execution aborted")]
    Aborted,

    /// Invalid operation (e.g., executing on a shut down pool).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl Error {
    /// Whether this error means the progress coordinator is unreachable.
    pub fn is_coordination_lost(&self) -> bool {
        matches!(self, Error::CoordinationLost(_))
    }
}
