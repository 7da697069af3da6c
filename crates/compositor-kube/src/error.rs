//! Error types for compositor-kube

use compositor_core::CoreError;
use thiserror::Error;

/// Result type for compositor-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors that can occur while reconciling a composition definition
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// Instances of the generated kind still exist
    #[error("{count} composition(s) of {gvr} still exist")]
    CompositionsStillExist { gvr: String, count: usize },

    /// Optimistic concurrency conflict reported by the mock or surfaced after retries
    #[error("conflict writing {resource}: {message}")]
    Conflict { resource: String, message: String },

    /// Object not found
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    /// The new version's spec schema cannot hold existing instances
    #[error("version {version} is incompatible with {previous}: {}", issues.join("; "))]
    IncompatibleSchema {
        version: String,
        previous: String,
        issues: Vec<String>,
    },

    /// A CRD version carries no schema
    #[error("CRD {crd} version {version} has no schema")]
    MissingSchema { crd: String, version: String },

    /// No version of the CRD declares a status schema
    #[error("CRD {crd} has no version with a status schema")]
    NoStatusVersion { crd: String },

    /// Chart, schema, render or certificate error
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Operation timed out
    #[error("operation timed out after {0}")]
    Timeout(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Discovery does not know the kind or resource
    #[error("unknown resource {0}")]
    UnknownKind(String),
}

impl From<serde_json::Error> for KubeError {
    fn from(e: serde_json::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for KubeError {
    fn from(e: serde_yaml::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl KubeError {
    /// Check if this is a Kubernetes 404 Not Found error
    pub fn is_not_found(&self) -> bool {
        match self {
            KubeError::Api(kube::Error::Api(resp)) => resp.code == 404,
            KubeError::NotFound { .. } => true,
            _ => false,
        }
    }

    /// Check if this is a conflict error (409)
    pub fn is_conflict(&self) -> bool {
        match self {
            KubeError::Api(kube::Error::Api(resp)) => resp.code == 409,
            KubeError::Conflict { .. } => true,
            _ => false,
        }
    }

    /// Instances still exist; the definition cannot be deleted yet
    pub fn is_blocking(&self) -> bool {
        matches!(self, KubeError::CompositionsStillExist { .. })
    }

    /// Worth another attempt later without any change to the definition
    pub fn is_retryable(&self) -> bool {
        match self {
            KubeError::CompositionsStillExist { .. }
            | KubeError::Conflict { .. }
            | KubeError::Timeout(_) => true,
            KubeError::Api(kube::Error::Api(resp)) => resp.code == 409 || resp.code >= 500,
            KubeError::Api(_) => true,
            KubeError::Core(e) => !e.is_resolution(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> KubeError {
        KubeError::Api(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    #[test]
    fn test_classification() {
        assert!(api_error(404).is_not_found());
        assert!(api_error(409).is_conflict());
        assert!(api_error(409).is_retryable());
        assert!(!api_error(422).is_retryable());

        let blocking = KubeError::CompositionsStillExist {
            gvr: "composition.krateo.io/v1-1-13, Resource=fireworksapps".to_string(),
            count: 2,
        };
        assert!(blocking.is_blocking());
        assert!(blocking.is_retryable());
        assert!(!blocking.is_not_found());
    }

    #[test]
    fn test_resolution_errors_are_not_retryable() {
        let err = KubeError::from(CoreError::ChartNotFound {
            reference: "https://example.com/app-1.0.0.tgz".to_string(),
        });
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_incompatible_message() {
        let err = KubeError::IncompatibleSchema {
            version: "v2".to_string(),
            previous: "v1".to_string(),
            issues: vec![
                "field spec.a removed".to_string(),
                "field spec.b changed type".to_string(),
            ],
        };
        assert_eq!(
            err.to_string(),
            "version v2 is incompatible with v1: field spec.a removed; field spec.b changed type"
        );
    }
}
