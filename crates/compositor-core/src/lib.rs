//! Compositor Core - Core types shared by every Compositor crate
//!
//! This crate provides the foundational types used throughout Compositor:
//! - `CompositionDefinition`: The user-facing resource (chart reference + status)
//! - `Gvk` / `Gvr`: API coordinates and the naming rules that derive them from a chart
//! - `Document`: Generic Kubernetes object with explicit accessors
//! - `ManifestSet`: Rendered workload objects, ordering rules and digests
//! - Collaborator traits: chart resolution, schema compilation, rendering, certificates

pub mod chart;
pub mod collab;
pub mod definition;
pub mod digest;
pub mod document;
pub mod error;
pub mod gvk;
pub mod labels;
pub mod manifest;

pub use chart::{ChartCredentials, ChartPackage, ChartRef, ResolvedCredentials, SecretKeyRef};
pub use collab::{
    CertificateManager, ChartResolver, ManifestRenderer, RenderRequest, Rendered, SchemaCompiler,
};
pub use definition::{
    CompositionDefinition, CompositionDefinitionSpec, CompositionDefinitionStatus,
    ConditionReason, Managed, NamespacedName, VersionDetail, READY_CONDITION,
};
pub use digest::{canonical_json, digest_bytes, digest_value};
pub use document::{Document, ObjectKey};
pub use error::{CoreError, Result};
pub use gvk::{COMPOSITION_GROUP, Gvk, Gvr, VACUUM_VERSION};
pub use manifest::{ManifestSet, ResourceCategory};
