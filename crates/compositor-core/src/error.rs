//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CoreError {
    #[error("Chart not found: {reference}")]
    ChartNotFound { reference: String },

    #[error("Chart authentication failed: {message}")]
    ChartAuth { message: String },

    #[error("Chart archive too large: {size} bytes exceeds limit of {limit} bytes")]
    ChartTooLarge { size: u64, limit: u64 },

    #[error("Failed to fetch chart: {message}")]
    ChartFetch { message: String },

    #[error("Invalid chart: {message}")]
    InvalidChart { message: String },

    #[error("Invalid values schema: {message}")]
    InvalidSchema { message: String },

    #[error("Invalid API coordinates: {message}")]
    InvalidGvk { message: String },

    #[error("Invalid object: {message}")]
    InvalidObject { message: String },

    #[error("Failed to render manifests: {message}")]
    Render { message: String },

    #[error("Certificate error: {message}")]
    Certificate { message: String },

    #[error("RBAC could not be inferred for {} template(s): {}", files.len(), files.join(", "))]
    PartialRbac { files: Vec<String> },

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid version: {0}")]
    InvalidVersion(#[from] semver::Error),
}

impl CoreError {
    /// Whether this error comes from chart resolution or schema validation
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            CoreError::ChartNotFound { .. }
                | CoreError::ChartAuth { .. }
                | CoreError::ChartTooLarge { .. }
                | CoreError::ChartFetch { .. }
                | CoreError::InvalidChart { .. }
                | CoreError::InvalidSchema { .. }
                | CoreError::InvalidGvk { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
