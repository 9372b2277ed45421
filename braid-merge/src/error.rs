use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("design document revision mismatch")]
    RevisionMismatch,

    #[error("design document revision did not settle after {attempts} attempts")]
    RevisionSyncFailed { attempts: u32 },

    #[error("set view is outdated")]
    SetViewOutdated,

    #[error("merge queue shut down")]
    QueueShutdown,

    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index {index} failed: {reason}")]
    Index { index: String, reason: String },

    #[error("malformed merge response: {0}")]
    MalformedResponse(String),

    #[error("invalid merge request: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, MergeError>;
