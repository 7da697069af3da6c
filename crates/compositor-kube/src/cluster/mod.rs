//! Access to the Kubernetes API
//!
//! The reconciler never talks to `kube::Client` directly. Everything it needs
//! from the cluster goes through [`ClusterApi`], implemented by:
//! - **KubeCluster**: a live cluster through `kube::Client`
//! - **MockCluster**: an in-memory cluster for tests

mod live;
mod mock;

pub use live::{FIELD_MANAGER, KubeCluster};
pub use mock::{MockCluster, OperationCounts};

use async_trait::async_trait;
use compositor_core::{
    CompositionDefinition, CompositionDefinitionStatus, Document, Gvk, Gvr, NamespacedName,
    ObjectKey, SecretKeyRef,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

use crate::error::Result;

/// Cluster operations used by the reconciler
///
/// Implementations must be Send + Sync for use across async tasks.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Plural resource of a kind, if the API server serves it
    async fn resolve_plural(&self, gvk: &Gvk) -> Result<Option<Gvr>>;

    async fn get_crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>>;

    /// Create a CRD; fails with a conflict when it already exists
    async fn create_crd(&self, crd: &CustomResourceDefinition) -> Result<CustomResourceDefinition>;

    /// Replace a CRD; fails with a conflict when `metadata.resourceVersion` is stale
    async fn replace_crd(&self, crd: &CustomResourceDefinition) -> Result<CustomResourceDefinition>;

    /// Delete a CRD; returns false when it did not exist
    async fn delete_crd(&self, name: &str) -> Result<bool>;

    /// Server-side apply an object
    async fn apply_object(&self, object: &Document) -> Result<Document>;

    async fn get_object(&self, key: &ObjectKey) -> Result<Option<Document>>;

    /// Delete an object; returns false when it did not exist
    async fn delete_object(&self, key: &ObjectKey) -> Result<bool>;

    /// Custom resources of `gvr` in every namespace, optionally filtered by a
    /// `key=value` label selector. A resource the server does not serve has
    /// no instances.
    async fn list_instances(
        &self,
        gvr: &Gvr,
        label_selector: Option<&str>,
    ) -> Result<Vec<Document>>;

    /// Delete a custom resource; returns false when it did not exist
    async fn delete_instance(&self, gvr: &Gvr, namespace: Option<&str>, name: &str) -> Result<bool>;

    /// Set one label on a custom resource
    async fn set_instance_label(
        &self,
        gvr: &Gvr,
        namespace: Option<&str>,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()>;

    async fn list_definitions(&self) -> Result<Vec<CompositionDefinition>>;

    /// Write the status subresource of a definition
    ///
    /// A `None` field clears the stored value.
    async fn patch_definition_status(
        &self,
        definition: &NamespacedName,
        status: &CompositionDefinitionStatus,
    ) -> Result<()>;

    /// Replace the finalizer list of a definition
    async fn set_definition_finalizers(
        &self,
        definition: &NamespacedName,
        finalizers: &[String],
    ) -> Result<()>;

    /// Read one key of a Secret as UTF-8
    async fn read_secret_key(&self, secret: &SecretKeyRef) -> Result<String>;
}

/// Status as a merge patch body, with absent optional fields sent as null
pub(crate) fn status_patch(status: &CompositionDefinitionStatus) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(status)?;
    if let serde_json::Value::Object(map) = &mut value {
        for field in ["error", "digest", "packageURL"] {
            map.entry(field).or_insert(serde_json::Value::Null);
        }
    }
    Ok(serde_json::json!({ "status": value }))
}

/// Parse a `key=value` selector; anything else matches on key presence
pub(crate) fn selector_matches(selector: Option<&str>, object: &Document) -> bool {
    match selector {
        None => true,
        Some(sel) => match sel.split_once('=') {
            Some((key, value)) => object.label(key.trim()) == Some(value.trim()),
            None => object.label(sel.trim()).is_some(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_patch_clears_error() {
        let status = CompositionDefinitionStatus {
            digest: Some("abc".to_string()),
            ..Default::default()
        };
        let patch = status_patch(&status).unwrap();
        assert_eq!(patch["status"]["digest"], "abc");
        assert!(patch["status"]["error"].is_null());
        assert!(patch["status"].as_object().unwrap().contains_key("error"));
    }

    #[test]
    fn test_selector_matches() {
        let doc = Document::new(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "a", "labels": {"krateo.io/composition-version": "v1-1-13"}}
        }))
        .unwrap();
        assert!(selector_matches(None, &doc));
        assert!(selector_matches(Some("krateo.io/composition-version=v1-1-13"), &doc));
        assert!(!selector_matches(Some("krateo.io/composition-version=v1-1-14"), &doc));
        assert!(selector_matches(Some("krateo.io/composition-version"), &doc));
    }
}
