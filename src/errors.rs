use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Internal failures. None of these reach a caller of the request-level APIs
/// directly; they are folded into an `ExecutionResult` at the boundary.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Python not installed or not found in PATH")]
    PythonNotFound,

    #[error("Python grammar could not be loaded: {0}")]
    ParserUnavailable(String),

    #[error("Worker protocol error: {0}")]
    Protocol(String),

    #[error("Confinement setup failed: {0}")]
    Confinement(String),

    #[error("Dataset unavailable: {0}")]
    DatasetUnavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}
