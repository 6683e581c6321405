// Camera Central Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    JobNotFound(i64),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("FFmpeg error: {0}")]
    FFmpeg(String),

    #[error("FFprobe error: {0}")]
    FFprobe(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl ConvertError {
    /// Store failures are transient: the caller discards the connection and
    /// polls again later instead of failing a job.
    pub fn is_store_error(&self) -> bool {
        matches!(self, ConvertError::Database(_))
    }
}

impl From<anyhow::Error> for ConvertError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<rusqlite::Error>() {
            Ok(db_err) => ConvertError::Database(db_err),
            Err(other) => ConvertError::Other(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConvertError>;
