//! Compositor Kube - Kubernetes integration for Compositor
//!
//! This crate provides:
//! - **CRD Version Engine**: One CRD per chart, one API version per chart version, around a `vacuum` storage version
//! - **Schema Compiler**: Chart value schemas to structural OpenAPI v3 CRD schemas
//! - **Cluster Access**: The `ClusterApi` trait, backed by `kube::Client` or an in-memory mock
//! - **Deployer & Drift Detection**: Install, remove and compare workload manifest sets
//! - **Reconciler**: The observe/create/update/delete state machine, version migration and deletion protocol
//! - **Certificates**: CA bundle for the conversion webhook

pub mod certs;
pub mod cluster;
pub mod crd;
pub mod deploy;
pub mod drift;
pub mod error;
pub mod finalizer;
pub mod reconciler;
pub mod retry;
pub mod testing;

pub use certs::FileCertificateManager;
pub use cluster::{ClusterApi, FIELD_MANAGER, KubeCluster, MockCluster, OperationCounts};
pub use crd::{
    CONVERSION_PATH, CrdApplyResult, CrdManager, OpenApiCompiler, SchemaIssue, append_version,
    generate_crd, gvr_from_generated_crd, set_served_storage, status_equal, update_status,
};
pub use deploy::{Deployer, OperationSummary};
pub use drift::{DriftDetector, DriftReport};
pub use error::{KubeError, Result};
pub use finalizer::{CLEANUP_FINALIZER, COMPOSITIONS_FINALIZER};
pub use reconciler::{Collaborators, MigrationSummary, Observation, Outcome, Reconciler};
pub use retry::{RetryPolicy, retry_on_conflict};
