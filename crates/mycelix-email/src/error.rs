use mycelix_security::SecurityError;
use mycelix_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmailError {
    /// Mail store unreachable, login rejected, or folder selection failed.
    #[error("connection error: {0}")]
    Connection(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("folder `{0}` is a system folder and cannot be deleted")]
    ProtectedFolder(String),
    #[error("message build error: {0}")]
    Build(String),
    #[error("smtp error: {0}")]
    Smtp(String),
    #[error("background task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Security(#[from] SecurityError),
}

impl From<mailparse::MailParseError> for EmailError {
    fn from(err: mailparse::MailParseError) -> Self {
        Self::Parse(err.to_string())
    }
}
