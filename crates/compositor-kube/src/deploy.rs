//! Installing, removing and observing a version's workload
//!
//! The workload of one API version is the manifest set rendered from that
//! version's chart: RBAC, a ConfigMap and the Deployment that reconciles
//! instances. Installation applies the set in dependency order; removal walks
//! it in teardown order and ends with the CRD unless another definition
//! still serves it.

use std::sync::Arc;

use compositor_core::{Document, Gvr, ManifestSet};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::error::Result;

/// Summary of install/undeploy operations
#[derive(Debug, Clone, Default)]
pub struct OperationSummary {
    /// Objects applied or deleted
    pub succeeded: Vec<String>,
    /// Objects that were already gone
    pub skipped: Vec<String>,
}

impl OperationSummary {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.skipped.len()
    }

    /// Format as human-readable summary
    pub fn summary(&self) -> String {
        match (self.succeeded.len(), self.skipped.len()) {
            (0, 0) => "No resources processed".to_string(),
            (done, 0) => format!("{} succeeded", done),
            (done, skipped) => format!("{} succeeded, {} skipped", done, skipped),
        }
    }
}

/// Applies and removes manifest sets
#[derive(Clone)]
pub struct Deployer {
    cluster: Arc<dyn ClusterApi>,
}

impl Deployer {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// Server-side apply every object, in install order
    ///
    /// Stops at the first failure; objects applied before it stay applied.
    pub async fn install(&self, manifests: &ManifestSet) -> Result<OperationSummary> {
        let mut summary = OperationSummary::default();
        for doc in manifests.install_order() {
            let key = doc.key()?;
            self.cluster.apply_object(doc).await?;
            debug!(object = %key, "Applied");
            summary.succeeded.push(key.to_string());
        }
        info!(objects = summary.total(), "Installed manifest set");
        Ok(summary)
    }

    /// Delete the workload of `gvr`'s version, then the CRD unless `skip_crd`
    ///
    /// Objects that no longer exist are skipped.
    pub async fn undeploy(
        &self,
        gvr: &Gvr,
        manifests: &ManifestSet,
        skip_crd: bool,
    ) -> Result<OperationSummary> {
        let mut summary = OperationSummary::default();
        for doc in manifests.teardown_order() {
            let key = doc.key()?;
            if self.cluster.delete_object(&key).await? {
                debug!(object = %key, "Deleted");
                summary.succeeded.push(key.to_string());
            } else {
                summary.skipped.push(key.to_string());
            }
        }

        if skip_crd {
            debug!(gvr = %gvr, "CRD kept, still served by another definition");
        } else {
            let crd = gvr.crd_name();
            if self.cluster.delete_crd(&crd).await? {
                info!(crd = %crd, "Deleted CRD");
                summary.succeeded.push(format!("CustomResourceDefinition/{}", crd));
            } else {
                summary.skipped.push(format!("CustomResourceDefinition/{}", crd));
            }
        }

        info!(gvr = %gvr, result = %summary.summary(), "Undeployed workload");
        Ok(summary)
    }

    /// The live counterpart of every rendered object, restricted to the rendered fields
    ///
    /// Missing objects are represented by a placeholder carrying only their
    /// identity, so the digest of the result equals the digest of `rendered`
    /// only when every object exists with the rendered content.
    pub async fn lookup(&self, rendered: &ManifestSet) -> Result<ManifestSet> {
        let mut observed = ManifestSet::new();
        for doc in rendered.iter() {
            let key = doc.key()?;
            match self.cluster.get_object(&key).await? {
                Some(live) => observed.push(live.project_onto(doc)),
                None => {
                    warn!(object = %key, "Rendered object missing from the cluster");
                    observed.push(Document::new(json!({
                        "apiVersion": key.api_version,
                        "kind": key.kind,
                        "metadata": {
                            "name": key.name,
                            "namespace": key.namespace,
                        },
                    }))?);
                }
            }
        }
        Ok(observed)
    }
}
