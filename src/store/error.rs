use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend failure: {0}")]
    Backend(String),
    #[error("row serialization failed: {0}")]
    Serialization(String),
    #[error("commit failed after {attempts} attempts: {last_error}")]
    CommitFailed { attempts: u32, last_error: String },
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
