//! In-memory cluster for testing
//!
//! Behaves like an API server where it matters to the reconciler: resource
//! versions are checked on replace, applied objects gain server-side fields,
//! instances carrying finalizers survive deletion, and definitions whose
//! last finalizer is removed during deletion disappear.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use compositor_core::{
    CompositionDefinition, CompositionDefinitionSpec, CompositionDefinitionStatus, Document, Gvk,
    Gvr, NamespacedName, ObjectKey, SecretKeyRef, labels::VERSION_LABEL,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use serde_json::{Value, json};

use super::{ClusterApi, selector_matches};
use crate::error::{KubeError, Result};
use crate::retry::conflict;

/// Custom resource identity: group, resource, namespace, name
type InstanceKey = (String, String, String, String);

#[derive(Default)]
struct State {
    crds: BTreeMap<String, CustomResourceDefinition>,
    objects: BTreeMap<ObjectKey, Document>,
    instances: BTreeMap<InstanceKey, Document>,
    definitions: BTreeMap<NamespacedName, CompositionDefinition>,
    secrets: BTreeMap<(String, String), BTreeMap<String, String>>,
    resource_version: u64,
    pending_crd_conflicts: u32,
    pending_apply_failures: u32,
    pending_delete_failures: u32,
}

impl State {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// In-memory `ClusterApi` for testing
#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<RwLock<State>>,
    /// Track operation counts for assertions
    operations: Arc<RwLock<OperationCounts>>,
}

/// Counts of operations performed for testing assertions
#[derive(Debug, Default, Clone)]
pub struct OperationCounts {
    pub crd_creates: usize,
    pub crd_replaces: usize,
    pub crd_deletes: usize,
    pub applies: usize,
    pub object_deletes: usize,
    pub instance_deletes: usize,
    pub relabels: usize,
    pub status_patches: usize,
}

impl MockCluster {
    /// Create a new empty mock cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Get operation counts for assertions
    pub fn operation_counts(&self) -> OperationCounts {
        self.operations.read().unwrap().clone()
    }

    /// Reset operation counts
    pub fn reset_counts(&self) {
        *self.operations.write().unwrap() = OperationCounts::default();
    }

    fn count(&self, f: impl FnOnce(&mut OperationCounts)) {
        f(&mut self.operations.write().unwrap());
    }

    /// Make the next `n` CRD replacements fail as if another writer got there first
    pub fn inject_crd_conflicts(&self, n: u32) {
        self.state.write().unwrap().pending_crd_conflicts = n;
    }

    /// Make the next `n` object applies time out
    pub fn inject_apply_failures(&self, n: u32) {
        self.state.write().unwrap().pending_apply_failures = n;
    }

    /// Make the next `n` object deletions time out
    pub fn inject_delete_failures(&self, n: u32) {
        self.state.write().unwrap().pending_delete_failures = n;
    }

    /// Change a live CRD behind the controller's back
    pub fn tamper_crd(&self, name: &str, f: impl FnOnce(&mut CustomResourceDefinition)) -> bool {
        let mut state = self.state.write().unwrap();
        let bumped = state.next_resource_version();
        let Some(crd) = state.crds.get_mut(name) else {
            return false;
        };
        f(crd);
        crd.metadata.resource_version = Some(bumped);
        true
    }

    pub fn add_definition(&self, definition: CompositionDefinition) {
        let mut state = self.state.write().unwrap();
        let mut definition = definition;
        definition.metadata.resource_version = Some(state.next_resource_version());
        state
            .definitions
            .insert(definition.namespaced_name(), definition);
    }

    pub fn definition(&self, name: &NamespacedName) -> Option<CompositionDefinition> {
        self.state.read().unwrap().definitions.get(name).cloned()
    }

    /// Replace the spec of a stored definition, keeping metadata and status
    pub fn update_definition_spec(&self, name: &NamespacedName, spec: CompositionDefinitionSpec) {
        if let Some(def) = self.state.write().unwrap().definitions.get_mut(name) {
            def.spec = spec;
        }
    }

    /// Mark a stored definition as being deleted
    pub fn mark_definition_deleting(&self, name: &NamespacedName) {
        if let Some(def) = self.state.write().unwrap().definitions.get_mut(name) {
            def.metadata.deletion_timestamp = Some(Time(Utc::now()));
        }
    }

    pub fn set_secret(&self, namespace: &str, name: &str, key: &str, value: &str) {
        self.state
            .write()
            .unwrap()
            .secrets
            .entry((namespace.to_string(), name.to_string()))
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    /// Create a custom resource of `gvr`, labelled with `version` when given
    pub fn add_instance(
        &self,
        gvr: &Gvr,
        kind: &str,
        namespace: &str,
        name: &str,
        version: Option<&str>,
        finalizers: &[&str],
    ) {
        let mut labels = serde_json::Map::new();
        if let Some(version) = version {
            labels.insert(VERSION_LABEL.to_string(), json!(version));
        }
        let doc = json!({
            "apiVersion": gvr.api_version(),
            "kind": kind,
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": labels,
                "finalizers": finalizers,
            },
            "spec": {}
        });
        let key = (
            gvr.group.clone(),
            gvr.resource.clone(),
            namespace.to_string(),
            name.to_string(),
        );
        if let Ok(doc) = Document::new(doc) {
            self.state.write().unwrap().instances.insert(key, doc);
        }
    }

    /// Custom resources of a group and resource, in every namespace
    pub fn instances(&self, group: &str, resource: &str) -> Vec<Document> {
        self.state
            .read()
            .unwrap()
            .instances
            .iter()
            .filter(|((g, r, _, _), _)| g == group && r == resource)
            .map(|(_, doc)| doc.clone())
            .collect()
    }

    /// Drop the finalizers of an instance, letting a pending deletion complete
    pub fn release_instance(&self, gvr: &Gvr, namespace: &str, name: &str) {
        let key = (
            gvr.group.clone(),
            gvr.resource.clone(),
            namespace.to_string(),
            name.to_string(),
        );
        let mut state = self.state.write().unwrap();
        if state
            .instances
            .get(&key)
            .map(|doc| is_terminating(doc))
            .unwrap_or(false)
        {
            state.instances.remove(&key);
        }
    }

    pub fn crd(&self, name: &str) -> Option<CustomResourceDefinition> {
        self.state.read().unwrap().crds.get(name).cloned()
    }

    pub fn object(&self, key: &ObjectKey) -> Option<Document> {
        self.state.read().unwrap().objects.get(key).cloned()
    }

    pub fn objects(&self) -> Vec<Document> {
        self.state.read().unwrap().objects.values().cloned().collect()
    }

    /// Change a live object behind the controller's back
    pub fn tamper_object(&self, key: &ObjectKey, f: impl FnOnce(&mut Value)) -> bool {
        let mut state = self.state.write().unwrap();
        let Some(doc) = state.objects.get(key) else {
            return false;
        };
        let mut value = doc.to_value();
        f(&mut value);
        match Document::new(value) {
            Ok(doc) => {
                state.objects.insert(key.clone(), doc);
                true
            }
            Err(_) => false,
        }
    }

    /// Remove a live object behind the controller's back
    pub fn remove_object(&self, key: &ObjectKey) -> bool {
        self.state.write().unwrap().objects.remove(key).is_some()
    }

    fn served_crd(state: &State, group: &str, resource: &str) -> bool {
        state
            .crds
            .values()
            .any(|crd| crd.spec.group == group && crd.spec.names.plural == resource)
    }
}

fn is_terminating(doc: &Document) -> bool {
    doc.get("metadata")
        .and_then(|m| m.get("deletionTimestamp"))
        .is_some()
}

fn instance_key(gvr: &Gvr, namespace: Option<&str>, name: &str) -> InstanceKey {
    (
        gvr.group.clone(),
        gvr.resource.clone(),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn resolve_plural(&self, gvk: &Gvk) -> Result<Option<Gvr>> {
        let state = self.state.read().unwrap();
        Ok(state
            .crds
            .values()
            .find(|crd| {
                crd.spec.group == gvk.group
                    && crd.spec.names.kind == gvk.kind
                    && crd
                        .spec
                        .versions
                        .iter()
                        .any(|v| v.name == gvk.version && v.served)
            })
            .map(|crd| gvk.to_gvr(crd.spec.names.plural.clone())))
    }

    async fn get_crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>> {
        Ok(self.state.read().unwrap().crds.get(name).cloned())
    }

    async fn create_crd(&self, crd: &CustomResourceDefinition) -> Result<CustomResourceDefinition> {
        self.count(|c| c.crd_creates += 1);
        let name = crd.name_any();
        let mut state = self.state.write().unwrap();
        if state.crds.contains_key(&name) {
            return Err(conflict(name, "already exists"));
        }
        let mut stored = crd.clone();
        stored.metadata.resource_version = Some(state.next_resource_version());
        stored.metadata.uid = Some(format!("uid-{}", name));
        state.crds.insert(name, stored.clone());
        Ok(stored)
    }

    async fn replace_crd(
        &self,
        crd: &CustomResourceDefinition,
    ) -> Result<CustomResourceDefinition> {
        self.count(|c| c.crd_replaces += 1);
        let name = crd.name_any();
        let mut state = self.state.write().unwrap();

        if state.pending_crd_conflicts > 0 {
            state.pending_crd_conflicts -= 1;
            let bumped = state.next_resource_version();
            if let Some(live) = state.crds.get_mut(&name) {
                live.metadata.resource_version = Some(bumped);
            }
            return Err(conflict(name, "the object has been modified"));
        }

        let live_version = state
            .crds
            .get(&name)
            .ok_or_else(|| KubeError::NotFound {
                kind: "CustomResourceDefinition".to_string(),
                name: name.clone(),
            })?
            .metadata
            .resource_version
            .clone();
        if live_version != crd.metadata.resource_version {
            return Err(conflict(name, "the object has been modified"));
        }

        let mut stored = crd.clone();
        stored.metadata.resource_version = Some(state.next_resource_version());
        state.crds.insert(name, stored.clone());
        Ok(stored)
    }

    async fn delete_crd(&self, name: &str) -> Result<bool> {
        self.count(|c| c.crd_deletes += 1);
        let mut state = self.state.write().unwrap();
        let Some(crd) = state.crds.remove(name) else {
            return Ok(false);
        };
        // Instances go with their CRD
        let group = crd.spec.group.clone();
        let plural = crd.spec.names.plural.clone();
        state
            .instances
            .retain(|(g, r, _, _), _| !(g == &group && r == &plural));
        Ok(true)
    }

    async fn apply_object(&self, object: &Document) -> Result<Document> {
        self.count(|c| c.applies += 1);
        let key = object.key()?;
        let mut state = self.state.write().unwrap();
        if state.pending_apply_failures > 0 {
            state.pending_apply_failures -= 1;
            return Err(KubeError::Timeout(format!("apply {}", key)));
        }
        let uid = state
            .objects
            .get(&key)
            .and_then(|existing| existing.get("metadata")?.get("uid").cloned())
            .unwrap_or_else(|| json!(format!("uid-{}", key)));

        let mut value = object.to_value();
        value["metadata"]["uid"] = uid;
        value["metadata"]["resourceVersion"] = json!(state.next_resource_version());
        if key.kind == "Deployment" {
            value["status"] = json!({"observedGeneration": 1, "readyReplicas": 1});
        }

        let stored = Document::new(value)?;
        state.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn get_object(&self, key: &ObjectKey) -> Result<Option<Document>> {
        Ok(self.state.read().unwrap().objects.get(key).cloned())
    }

    async fn delete_object(&self, key: &ObjectKey) -> Result<bool> {
        self.count(|c| c.object_deletes += 1);
        let mut state = self.state.write().unwrap();
        if state.pending_delete_failures > 0 {
            state.pending_delete_failures -= 1;
            return Err(KubeError::Timeout(format!("delete {}", key)));
        }
        Ok(state.objects.remove(key).is_some())
    }

    async fn list_instances(
        &self,
        gvr: &Gvr,
        label_selector: Option<&str>,
    ) -> Result<Vec<Document>> {
        let state = self.state.read().unwrap();
        if !Self::served_crd(&state, &gvr.group, &gvr.resource) {
            return Ok(Vec::new());
        }
        Ok(state
            .instances
            .iter()
            .filter(|((g, r, _, _), doc)| {
                g == &gvr.group && r == &gvr.resource && selector_matches(label_selector, doc)
            })
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn delete_instance(
        &self,
        gvr: &Gvr,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        self.count(|c| c.instance_deletes += 1);
        let key = instance_key(gvr, namespace, name);
        let mut state = self.state.write().unwrap();
        let Some(doc) = state.instances.get(&key) else {
            return Ok(false);
        };

        if doc.finalizers().is_empty() {
            state.instances.remove(&key);
        } else if !is_terminating(doc) {
            let mut value = doc.to_value();
            value["metadata"]["deletionTimestamp"] = json!("2024-01-01T00:00:00Z");
            let doc = Document::new(value)?;
            state.instances.insert(key, doc);
        }
        Ok(true)
    }

    async fn set_instance_label(
        &self,
        gvr: &Gvr,
        namespace: Option<&str>,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.count(|c| c.relabels += 1);
        let id = instance_key(gvr, namespace, name);
        let mut state = self.state.write().unwrap();
        let doc = state.instances.get_mut(&id).ok_or_else(|| KubeError::NotFound {
            kind: gvr.resource.clone(),
            name: name.to_string(),
        })?;
        doc.set_label(key, value);
        Ok(())
    }

    async fn list_definitions(&self) -> Result<Vec<CompositionDefinition>> {
        Ok(self
            .state
            .read()
            .unwrap()
            .definitions
            .values()
            .cloned()
            .collect())
    }

    async fn patch_definition_status(
        &self,
        definition: &NamespacedName,
        status: &CompositionDefinitionStatus,
    ) -> Result<()> {
        self.count(|c| c.status_patches += 1);
        let mut state = self.state.write().unwrap();
        let rv = state.next_resource_version();
        let stored = state
            .definitions
            .get_mut(definition)
            .ok_or_else(|| KubeError::NotFound {
                kind: "CompositionDefinition".to_string(),
                name: definition.to_string(),
            })?;
        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(rv);
        Ok(())
    }

    async fn set_definition_finalizers(
        &self,
        definition: &NamespacedName,
        finalizers: &[String],
    ) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let stored = state
            .definitions
            .get_mut(definition)
            .ok_or_else(|| KubeError::NotFound {
                kind: "CompositionDefinition".to_string(),
                name: definition.to_string(),
            })?;
        stored.metadata.finalizers = if finalizers.is_empty() {
            None
        } else {
            Some(finalizers.to_vec())
        };
        if stored.is_deleting() && finalizers.is_empty() {
            state.definitions.remove(definition);
        }
        Ok(())
    }

    async fn read_secret_key(&self, secret: &SecretKeyRef) -> Result<String> {
        self.state
            .read()
            .unwrap()
            .secrets
            .get(&(secret.namespace.clone(), secret.name.clone()))
            .and_then(|data| data.get(&secret.key))
            .cloned()
            .ok_or_else(|| KubeError::NotFound {
                kind: "Secret".to_string(),
                name: format!("{}/{}", secret.namespace, secret.name),
            })
    }
}
