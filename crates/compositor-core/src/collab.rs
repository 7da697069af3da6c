//! Collaborator contracts
//!
//! The reconciliation core only talks to chart resolution, schema compilation,
//! manifest rendering and certificate handling through these traits. Each one
//! has a concrete implementation in a sibling crate and an in-memory double
//! for tests.

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

use crate::chart::{ChartPackage, ChartRef, ResolvedCredentials};
use crate::definition::NamespacedName;
use crate::error::{CoreError, Result};
use crate::gvk::{Gvk, Gvr};
use crate::manifest::ManifestSet;

/// Fetches and unpacks charts
#[async_trait]
pub trait ChartResolver: Send + Sync {
    /// Fetch the chart `chart` points at
    ///
    /// `credentials` carries the password already read from the referenced
    /// Secret, when the chart declares credentials.
    async fn resolve(
        &self,
        chart: &ChartRef,
        credentials: Option<&ResolvedCredentials>,
    ) -> Result<ChartPackage>;
}

/// Turns a JSON value schema into a single-version CRD
pub trait SchemaCompiler: Send + Sync {
    /// Build a CRD declaring exactly one version, `gvk.version`
    ///
    /// With `schema` set to `None` the version carries empty `spec` and
    /// `status` schemas; only the names (plural, singular, list kind) matter.
    fn compile(&self, gvk: &Gvk, schema: Option<&[u8]>) -> Result<CustomResourceDefinition>;
}

/// Input to a render call
#[derive(Debug, Clone, Copy)]
pub struct RenderRequest<'a> {
    /// Resource the workload reconciles
    pub gvr: &'a Gvr,
    /// Definition owning the workload
    pub definition: &'a NamespacedName,
    /// Chart the version was cut from
    pub chart: &'a ChartRef,
    /// The unpacked chart
    pub package: &'a ChartPackage,
}

/// Output of a render call
#[derive(Debug, Clone, Default)]
pub struct Rendered {
    pub manifests: ManifestSet,
    /// Template files whose resources could not be determined
    pub rbac_gaps: Vec<String>,
}

impl Rendered {
    /// A `PartialRbac` error when some templates could not be inspected
    pub fn partial_rbac_error(&self) -> Option<CoreError> {
        if self.rbac_gaps.is_empty() {
            None
        } else {
            Some(CoreError::PartialRbac {
                files: self.rbac_gaps.clone(),
            })
        }
    }
}

/// Renders the workload manifests for one API version
pub trait ManifestRenderer: Send + Sync {
    fn render(&self, request: &RenderRequest<'_>) -> Result<Rendered>;
}

/// Provides the TLS material for the conversion webhook
#[async_trait]
pub trait CertificateManager: Send + Sync {
    /// Make sure certificates for serving `gvr` conversions are in place
    async fn manage_certificates(&self, gvr: &Gvr) -> Result<()>;

    /// PEM encoded CA bundle
    async fn ca_bundle(&self) -> Result<Vec<u8>>;

    fn service_name(&self) -> &str;

    fn service_namespace(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_rbac_error() {
        let mut rendered = Rendered::default();
        assert!(rendered.partial_rbac_error().is_none());

        rendered.rbac_gaps.push("app/templates/dynamic.yaml".to_string());
        let err = rendered.partial_rbac_error().unwrap();
        assert!(err.to_string().contains("app/templates/dynamic.yaml"));
    }
}
