//! `ClusterApi` on top of `kube::Client`

use std::sync::Arc;

use async_trait::async_trait;
use compositor_core::{
    CompositionDefinition, CompositionDefinitionStatus, Document, Gvk, Gvr, NamespacedName,
    ObjectKey, SecretKeyRef,
};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    Client,
    api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    core::GroupVersionKind,
    discovery::{ApiCapabilities, ApiResource, Discovery, Scope},
};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::debug;

use super::{ClusterApi, status_patch};
use crate::error::{KubeError, Result};

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "compositor";

/// Live cluster access
///
/// API discovery runs lazily on first use and is refreshed when a kind or
/// resource is not found, since the controller keeps adding CRDs.
pub struct KubeCluster {
    client: Client,
    discovery: RwLock<Option<Arc<Discovery>>>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            discovery: RwLock::new(None),
        }
    }

    /// Get the underlying Kubernetes client
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn discovery(&self) -> Result<Arc<Discovery>> {
        if let Some(discovery) = self.discovery.read().await.as_ref() {
            return Ok(discovery.clone());
        }
        self.refresh_discovery().await
    }

    /// Re-run discovery (call after CRD changes)
    pub async fn refresh_discovery(&self) -> Result<Arc<Discovery>> {
        let mut slot = self.discovery.write().await;
        let discovery = Arc::new(Discovery::new(self.client.clone()).run().await?);
        debug!(groups = discovery.groups().count(), "Refreshed API discovery");
        *slot = Some(discovery.clone());
        Ok(discovery)
    }

    /// Resolve a kind, refreshing discovery once on a miss
    async fn resolve_gvk(
        &self,
        gvk: &GroupVersionKind,
    ) -> Result<Option<(ApiResource, ApiCapabilities)>> {
        if let Some(found) = self.discovery().await?.resolve_gvk(gvk) {
            return Ok(Some(found));
        }
        Ok(self.refresh_discovery().await?.resolve_gvk(gvk))
    }

    /// Resolve a resource, refreshing discovery once on a miss
    async fn resolve_gvr(&self, gvr: &Gvr) -> Result<Option<(ApiResource, ApiCapabilities)>> {
        if let Some(found) = find_gvr(&*self.discovery().await?, gvr) {
            return Ok(Some(found));
        }
        Ok(find_gvr(&*self.refresh_discovery().await?, gvr))
    }

    async fn api_for_object(&self, key: &ObjectKey) -> Result<Api<DynamicObject>> {
        let gvk = Gvk::from_api_version(&key.api_version, &key.kind)?;
        let gvk = GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
        let (ar, caps) = self
            .resolve_gvk(&gvk)
            .await?
            .ok_or_else(|| KubeError::UnknownKind(format!("{}/{}", key.api_version, key.kind)))?;
        Ok(self.scoped_api(&ar, &caps, key.namespace.as_deref()))
    }

    fn scoped_api(
        &self,
        ar: &ApiResource,
        caps: &ApiCapabilities,
        namespace: Option<&str>,
    ) -> Api<DynamicObject> {
        match (&caps.scope, namespace) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, ar),
            (Scope::Namespaced, None) => Api::default_namespaced_with(self.client.clone(), ar),
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), ar),
        }
    }

    fn crds(&self) -> Api<CustomResourceDefinition> {
        Api::all(self.client.clone())
    }

    fn definitions(&self, namespace: &str) -> Api<CompositionDefinition> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn find_gvr(discovery: &Discovery, gvr: &Gvr) -> Option<(ApiResource, ApiCapabilities)> {
    discovery
        .groups()
        .filter(|g| g.name() == gvr.group)
        .flat_map(|g| g.versioned_resources(&gvr.version))
        .find(|(ar, _)| ar.plural == gvr.resource)
}

fn to_document(obj: &DynamicObject) -> Result<Document> {
    Ok(Document::new(serde_json::to_value(obj)?)?)
}

/// Map 404 to `None`
fn optional<T>(result: std::result::Result<T, kube::Error>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(None),
        Err(e) => Err(KubeError::Api(e)),
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn resolve_plural(&self, gvk: &Gvk) -> Result<Option<Gvr>> {
        let key = GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
        Ok(self
            .resolve_gvk(&key)
            .await?
            .map(|(ar, _)| Gvr::new(ar.group, ar.version, ar.plural)))
    }

    async fn get_crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>> {
        Ok(self.crds().get_opt(name).await?)
    }

    async fn create_crd(&self, crd: &CustomResourceDefinition) -> Result<CustomResourceDefinition> {
        Ok(self.crds().create(&PostParams::default(), crd).await?)
    }

    async fn replace_crd(
        &self,
        crd: &CustomResourceDefinition,
    ) -> Result<CustomResourceDefinition> {
        let name = crd.metadata.name.as_deref().ok_or_else(|| {
            KubeError::Serialization("CRD missing metadata.name".to_string())
        })?;
        Ok(self.crds().replace(name, &PostParams::default(), crd).await?)
    }

    async fn delete_crd(&self, name: &str) -> Result<bool> {
        Ok(optional(self.crds().delete(name, &DeleteParams::default()).await)?.is_some())
    }

    async fn apply_object(&self, object: &Document) -> Result<Document> {
        let key = object.key()?;
        let api = self.api_for_object(&key).await?;
        let obj: DynamicObject = serde_json::from_value(object.to_value())?;

        let params = PatchParams::apply(FIELD_MANAGER).force();
        let applied = api.patch(&key.name, &params, &Patch::Apply(&obj)).await?;
        to_document(&applied)
    }

    async fn get_object(&self, key: &ObjectKey) -> Result<Option<Document>> {
        let api = match self.api_for_object(key).await {
            Ok(api) => api,
            Err(KubeError::UnknownKind(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        optional(api.get(&key.name).await)?
            .as_ref()
            .map(to_document)
            .transpose()
    }

    async fn delete_object(&self, key: &ObjectKey) -> Result<bool> {
        let api = match self.api_for_object(key).await {
            Ok(api) => api,
            Err(KubeError::UnknownKind(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(optional(api.delete(&key.name, &DeleteParams::background()).await)?.is_some())
    }

    async fn list_instances(
        &self,
        gvr: &Gvr,
        label_selector: Option<&str>,
    ) -> Result<Vec<Document>> {
        let Some((ar, _)) = self.resolve_gvr(gvr).await? else {
            return Ok(Vec::new());
        };
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }

        let Some(list) = optional(api.list(&params).await)? else {
            return Ok(Vec::new());
        };
        list.items
            .iter()
            .map(|item| {
                let mut doc = to_document(item)?;
                // List items omit their type
                if doc.api_version().is_none() {
                    let mut value = doc.into_value();
                    value["apiVersion"] = json!(ar.api_version);
                    value["kind"] = json!(ar.kind);
                    doc = Document::new(value)?;
                }
                Ok(doc)
            })
            .collect()
    }

    async fn delete_instance(
        &self,
        gvr: &Gvr,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        let Some((ar, caps)) = self.resolve_gvr(gvr).await? else {
            return Ok(false);
        };
        let api = self.scoped_api(&ar, &caps, namespace);
        Ok(optional(api.delete(name, &DeleteParams::default()).await)?.is_some())
    }

    async fn set_instance_label(
        &self,
        gvr: &Gvr,
        namespace: Option<&str>,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let (ar, caps) = self
            .resolve_gvr(gvr)
            .await?
            .ok_or_else(|| KubeError::UnknownKind(gvr.to_string()))?;
        let api = self.scoped_api(&ar, &caps, namespace);
        let patch = json!({"metadata": {"labels": {key: value}}});
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_definitions(&self) -> Result<Vec<CompositionDefinition>> {
        let api: Api<CompositionDefinition> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_definition_status(
        &self,
        definition: &NamespacedName,
        status: &CompositionDefinitionStatus,
    ) -> Result<()> {
        let patch = status_patch(status)?;
        self.definitions(&definition.namespace)
            .patch_status(&definition.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_definition_finalizers(
        &self,
        definition: &NamespacedName,
        finalizers: &[String],
    ) -> Result<()> {
        let patch = json!({"metadata": {"finalizers": finalizers}});
        self.definitions(&definition.namespace)
            .patch(&definition.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn read_secret_key(&self, secret: &SecretKeyRef) -> Result<String> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &secret.namespace);
        let found = api.get(&secret.name).await?;
        let bytes = found
            .data
            .as_ref()
            .and_then(|data| data.get(&secret.key))
            .ok_or_else(|| KubeError::NotFound {
                kind: "Secret key".to_string(),
                name: format!("{}/{}[{}]", secret.namespace, secret.name, secret.key),
            })?;
        String::from_utf8(bytes.0.clone())
            .map_err(|e| KubeError::Serialization(format!("secret value is not UTF-8: {}", e)))
    }
}
