use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error produced by a storage backend.
pub type StorageError = Arc<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("unable to parse configuration for experiment {experiment_key:?}")]
    ConfigurationParseError { experiment_key: String },
    #[error("storage error")]
    Storage(#[source] StorageError),
    #[error("assignment for {experiment_key:?}/{user_id:?} conflicted on insert but could not be fetched")]
    AssignmentVanished {
        experiment_key: String,
        user_id: String,
    },
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    #[error(transparent)]
    Io(Arc<std::io::Error>),
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
    #[error("poller thread panicked")]
    PollerThreadPanicked,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Self::Network(Arc::new(value.without_url()))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Storage(Arc::new(value))
    }
}
