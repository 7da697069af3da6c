//! Error types for chart resolution

use compositor_core::CoreError;
use thiserror::Error;

/// Chart resolution errors
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RepoError {
    // ============ Reference Errors ============
    #[error("Invalid chart URL: {url} - {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Unsupported chart reference: {reference}")]
    Unsupported { reference: String },

    // ============ Network Errors ============
    #[error("Not found: {url}")]
    NotFound { url: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    // ============ Authentication Errors ============
    #[error("Authentication failed: {message}")]
    AuthFailed { message: String },

    // ============ Index Errors ============
    #[error("Invalid index format: {message}")]
    InvalidIndex { message: String },

    #[error("Version not found: {name}@{version} in repository {repo}")]
    VersionNotFound {
        name: String,
        version: String,
        repo: String,
    },

    // ============ Archive Errors ============
    #[error("Archive of {size} bytes exceeds the limit of {limit} bytes")]
    SizeLimitExceeded { size: u64, limit: u64 },

    #[error("Integrity check failed for {name}: expected {expected}, got {actual}")]
    IntegrityCheckFailed {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid chart archive: {message}")]
    InvalidArchive { message: String },

    // ============ Serialization ============
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for RepoError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            RepoError::HttpError {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            RepoError::NetworkError {
                message: err.to_string(),
            }
        }
    }
}

impl From<url::ParseError> for RepoError {
    fn from(err: url::ParseError) -> Self {
        RepoError::InvalidUrl {
            url: String::new(),
            reason: err.to_string(),
        }
    }
}

impl From<RepoError> for CoreError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound { url } => CoreError::ChartNotFound { reference: url },
            RepoError::VersionNotFound {
                name,
                version,
                repo,
            } => CoreError::ChartNotFound {
                reference: format!("{}/{}@{}", repo.trim_end_matches('/'), name, version),
            },
            RepoError::AuthFailed { message } => CoreError::ChartAuth { message },
            RepoError::SizeLimitExceeded { size, limit } => {
                CoreError::ChartTooLarge { size, limit }
            }
            RepoError::InvalidArchive { message } => CoreError::InvalidChart { message },
            integrity @ RepoError::IntegrityCheckFailed { .. } => CoreError::InvalidChart {
                message: integrity.to_string(),
            },
            other => CoreError::ChartFetch {
                message: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, RepoError>;
