//! CRD generation and version management
//!
//! - **compiler**: chart value schema to a single-version CRD
//! - **versions**: merging versions into one CRD around the `vacuum` storage version
//! - **compat**: breaking-change detection between consecutive versions
//! - **apply**: read-merge-write of CRDs against the cluster

pub mod apply;
pub mod compat;
pub mod compiler;
pub mod versions;

pub use apply::{CONVERSION_PATH, CrdApplyResult, CrdManager};
pub use compat::{SchemaIssue, check_compatibility, latest_real_version};
pub use compiler::{COMPOSITIONS_CATEGORY, OpenApiCompiler};
pub use versions::{
    append_version, generate_crd, gvr_from_generated_crd, has_version, set_served_storage,
    status_equal, storage_versions, update_status, vacuum_version, version_names,
};
