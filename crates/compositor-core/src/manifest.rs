//! Rendered manifest sets
//!
//! A `ManifestSet` holds the objects that make up the workload for one API
//! version. Install order puts dependencies (RBAC, config) before workloads;
//! teardown order removes the workload first and the CRD last.

use serde::Deserialize;
use serde_json::Value;

use crate::digest::digest_bytes;
use crate::document::Document;
use crate::error::{CoreError, Result};

/// Resource category for ordering during installation
///
/// Resources are installed in order from lowest to highest category value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceCategory {
    /// CustomResourceDefinition - installed first
    Crd = 0,
    /// Namespace - created before namespace-scoped resources
    Namespace = 1,
    /// ServiceAccount - referenced by bindings and pods
    ServiceAccount = 5,
    /// ClusterRole, ClusterRoleBinding
    ClusterRbac = 10,
    /// Role, RoleBinding
    NamespacedRbac = 11,
    /// ConfigMap, Secret
    Config = 20,
    /// Service
    Network = 30,
    /// Deployment, StatefulSet, DaemonSet
    Workload = 40,
    /// Everything else
    Other = 100,
}

impl ResourceCategory {
    pub fn from_kind(kind: &str) -> Self {
        match kind {
            "CustomResourceDefinition" => Self::Crd,
            "Namespace" => Self::Namespace,
            "ServiceAccount" => Self::ServiceAccount,
            "ClusterRole" | "ClusterRoleBinding" => Self::ClusterRbac,
            "Role" | "RoleBinding" => Self::NamespacedRbac,
            "ConfigMap" | "Secret" => Self::Config,
            "Service" => Self::Network,
            "Deployment" | "StatefulSet" | "DaemonSet" => Self::Workload,
            _ => Self::Other,
        }
    }

    /// Position during teardown (lower goes first)
    ///
    /// Deployment, then RoleBindings/Roles, then ClusterRoleBindings/ClusterRoles,
    /// then the ServiceAccount, then config, and the CRD last.
    pub fn teardown_rank(kind: &str) -> u8 {
        match kind {
            "Deployment" | "StatefulSet" | "DaemonSet" => 0,
            "Service" => 1,
            "RoleBinding" => 2,
            "Role" => 3,
            "ClusterRoleBinding" => 4,
            "ClusterRole" => 5,
            "ServiceAccount" => 6,
            "ConfigMap" | "Secret" => 7,
            "CustomResourceDefinition" => u8::MAX,
            _ => 8,
        }
    }
}

/// An ordered collection of objects
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestSet {
    documents: Vec<Document>,
}

impl ManifestSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_documents(documents: Vec<Document>) -> Self {
        Self { documents }
    }

    /// Parse a multi-document YAML stream, skipping empty documents
    pub fn from_yaml_stream(yaml: &str) -> Result<Self> {
        let mut documents = Vec::new();
        for de in serde_yaml::Deserializer::from_str(yaml) {
            let value = Value::deserialize(de)?;
            match value {
                Value::Null => continue,
                other => documents.push(Document::new(other)?),
            }
        }
        Ok(Self { documents })
    }

    pub fn push(&mut self, doc: Document) {
        self.documents.push(doc);
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.documents.iter()
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    /// First document of the given kind
    pub fn find_kind(&self, kind: &str) -> Option<&Document> {
        self.documents.iter().find(|d| d.kind() == Some(kind))
    }

    /// Documents sorted for installation (stable within a category)
    pub fn install_order(&self) -> Vec<&Document> {
        let mut docs: Vec<&Document> = self.documents.iter().collect();
        docs.sort_by_key(|d| ResourceCategory::from_kind(d.kind().unwrap_or_default()));
        docs
    }

    /// Documents sorted for teardown
    pub fn teardown_order(&self) -> Vec<&Document> {
        let mut docs: Vec<&Document> = self.documents.iter().collect();
        docs.sort_by_key(|d| ResourceCategory::teardown_rank(d.kind().unwrap_or_default()));
        docs
    }

    /// Digest of the whole set
    ///
    /// Each object is digested on its own and the object digests are combined
    /// in identity order, so the result does not depend on document order.
    pub fn digest(&self) -> Result<String> {
        let mut entries = Vec::with_capacity(self.documents.len());
        for doc in &self.documents {
            let key = doc.key().map_err(|e| CoreError::InvalidObject {
                message: format!("cannot digest manifest set: {}", e),
            })?;
            entries.push((key, doc.digest()));
        }
        entries.sort();

        let combined = entries
            .iter()
            .map(|(key, digest)| format!("{}|{}|{}\n", key.api_version, key, digest))
            .collect::<String>();
        Ok(digest_bytes(combined.as_bytes()))
    }

    pub fn to_yaml(&self) -> Result<String> {
        let mut parts = Vec::with_capacity(self.documents.len());
        for doc in &self.documents {
            parts.push(doc.to_yaml()?);
        }
        Ok(parts.join("---\n"))
    }
}

impl IntoIterator for ManifestSet {
    type Item = Document;
    type IntoIter = std::vec::IntoIter<Document>;

    fn into_iter(self) -> Self::IntoIter {
        self.documents.into_iter()
    }
}

impl FromIterator<Document> for ManifestSet {
    fn from_iter<I: IntoIterator<Item = Document>>(iter: I) -> Self {
        Self {
            documents: iter.into_iter().collect(),
        }
    }
}
