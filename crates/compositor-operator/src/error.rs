//! Startup errors, reported through miette

use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
pub enum OperatorError {
    #[error("Failed to connect to the Kubernetes API: {0}")]
    #[diagnostic(
        code(compositor::operator::kube),
        help("check KUBECONFIG or the in-cluster service account")
    )]
    Kube(#[from] kube::Error),

    #[error("Failed to load workload templates: {0}")]
    #[diagnostic(code(compositor::operator::templates))]
    Templates(#[from] compositor_engine::EngineError),

    #[error("Failed to initialize logging: {message}")]
    #[diagnostic(code(compositor::operator::logging), help("check RUST_LOG and --log-level"))]
    Logging { message: String },

    #[error("Failed to serialize CRD: {0}")]
    #[diagnostic(code(compositor::operator::crd))]
    Serialization(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, OperatorError>;
