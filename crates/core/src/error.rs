use thiserror::Error;

pub type ControlPlaneResult<T> = Result<T, ControlPlaneError>;

#[derive(Error, Debug)]
pub enum ControlPlaneError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Ledger store error: {0}")]
    Store(String),

    #[error("Infrastructure executor error: {0}")]
    Executor(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Write denied: {0}")]
    WriteDenied(String),

    #[error("Confirmation required: {0}")]
    ConfirmationRequired(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
