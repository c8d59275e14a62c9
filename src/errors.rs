use reqwest::StatusCode;
use thiserror::Error;

/// Failures while building an uploader. These are fatal to the caller.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required option: {0}")]
    MissingOption(&'static str),

    #[error("Option {key} must be a {expected}")]
    WrongType {
        key: &'static str,
        expected: &'static str,
    },

    #[error("Bad value for channel type: {0}")]
    BadChannelType(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Failures of a single upload attempt. The buffer has already been rolled
/// back when one of these is returned.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Error from middleware ({status}): {message}")]
    Protocol { status: StatusCode, message: String },

    #[error("Sample buffer error: {0}")]
    Buffer(#[from] rusqlite::Error),

    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;
