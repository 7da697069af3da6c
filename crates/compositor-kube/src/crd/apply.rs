//! Applying CRD versions to the cluster
//!
//! The live CRD is read, the new version merged in and the result written
//! back with the observed `resourceVersion`. Concurrent writers make the
//! write fail with a conflict; the whole read-merge-write is then retried.

use std::sync::Arc;

use compositor_core::CertificateManager;
use k8s_openapi::ByteString;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceConversion, CustomResourceDefinition, CustomResourceDefinitionVersion,
    ServiceReference, WebhookClientConfig, WebhookConversion,
};
use tracing::{debug, info, warn};

use super::compat::{SchemaIssue, check_compatibility, latest_real_version};
use super::versions::{append_version, crd_name, has_version, update_status};
use crate::cluster::ClusterApi;
use crate::error::{KubeError, Result};
use crate::retry::{RetryPolicy, retry_on_conflict};

/// Path the conversion webhook is served on
pub const CONVERSION_PATH: &str = "/convert";

const CONVERSION_PORT: i32 = 443;

/// Manager for CRD operations
pub struct CrdManager {
    cluster: Arc<dyn ClusterApi>,
    certs: Arc<dyn CertificateManager>,
    retry: RetryPolicy,
    strict_compatibility: bool,
}

/// Result of applying a CRD version
#[derive(Debug, Clone)]
pub struct CrdApplyResult {
    /// The CRD as stored after the operation
    pub crd: CustomResourceDefinition,
    /// Whether it was created (true) or merged into an existing CRD (false)
    pub created: bool,
    /// Whether anything was written
    pub changed: bool,
    /// Compatibility problems found against the previous version
    pub issues: Vec<SchemaIssue>,
}

impl CrdApplyResult {
    /// Get a display message for this result
    pub fn message(&self) -> String {
        let name = crd_name(&self.crd);
        match (self.created, self.changed) {
            (true, _) => format!("created CRD {}", name),
            (false, true) => format!("updated CRD {}", name),
            (false, false) => format!("CRD {} unchanged", name),
        }
    }
}

impl CrdManager {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        certs: Arc<dyn CertificateManager>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            cluster,
            certs,
            retry,
            strict_compatibility: false,
        }
    }

    /// Reject versions that break existing instances instead of warning
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict_compatibility = strict;
        self
    }

    /// Merge the single version of `fragment` into the live CRD
    ///
    /// Creates the CRD when it does not exist. Otherwise appends the version
    /// (see [`append_version`]), propagates the fragment's status schema to
    /// every version and wires the conversion webhook once the CRD has more
    /// than one version.
    pub async fn apply_version(
        &self,
        fragment: &CustomResourceDefinition,
    ) -> Result<CrdApplyResult> {
        let name = crd_name(fragment);
        retry_on_conflict(&self.retry, &format!("apply CRD {}", name), || {
            self.apply_once(&name, fragment)
        })
        .await
    }

    async fn apply_once(
        &self,
        name: &str,
        fragment: &CustomResourceDefinition,
    ) -> Result<CrdApplyResult> {
        let version = fragment.spec.versions.first().ok_or_else(|| KubeError::MissingSchema {
            crd: name.to_string(),
            version: String::new(),
        })?;

        let Some(live) = self.cluster.get_crd(name).await? else {
            let crd = self.cluster.create_crd(fragment).await?;
            info!(crd = %name, version = %version.name, "Created CRD");
            return Ok(CrdApplyResult {
                crd,
                created: true,
                changed: true,
                issues: Vec::new(),
            });
        };

        let issues = if has_version(&live, &version.name) {
            Vec::new()
        } else {
            self.check_compatibility(name, &live, version)?
        };

        let mut merged = append_version(&live, fragment);
        update_status(&mut merged, version)?;
        if merged.spec.versions.len() > 1 {
            self.inject_conversion(&mut merged).await?;
        }

        if merged == live {
            debug!(crd = %name, "CRD already up to date");
            return Ok(CrdApplyResult {
                crd: live,
                created: false,
                changed: false,
                issues,
            });
        }

        let crd = self.cluster.replace_crd(&merged).await?;
        info!(
            crd = %name,
            version = %version.name,
            versions = crd.spec.versions.len(),
            "Updated CRD"
        );
        Ok(CrdApplyResult {
            crd,
            created: false,
            changed: true,
            issues,
        })
    }

    fn check_compatibility(
        &self,
        name: &str,
        live: &CustomResourceDefinition,
        version: &CustomResourceDefinitionVersion,
    ) -> Result<Vec<SchemaIssue>> {
        let Some(previous) = latest_real_version(live) else {
            return Ok(Vec::new());
        };
        let issues = check_compatibility(previous, version);
        if issues.is_empty() {
            return Ok(issues);
        }

        for issue in &issues {
            warn!(
                crd = %name,
                previous = %previous.name,
                version = %version.name,
                %issue,
                "Incompatible schema change"
            );
        }
        if self.strict_compatibility {
            return Err(KubeError::IncompatibleSchema {
                version: version.name.clone(),
                previous: previous.name.clone(),
                issues: issues.iter().map(ToString::to_string).collect(),
            });
        }
        Ok(issues)
    }

    /// Point the CRD's conversion at the webhook service, with the current CA bundle
    async fn inject_conversion(&self, crd: &mut CustomResourceDefinition) -> Result<()> {
        let ca_bundle = self.certs.ca_bundle().await?;
        crd.spec.conversion = Some(CustomResourceConversion {
            strategy: "Webhook".to_string(),
            webhook: Some(WebhookConversion {
                client_config: Some(WebhookClientConfig {
                    ca_bundle: Some(ByteString(ca_bundle)),
                    service: Some(ServiceReference {
                        name: self.certs.service_name().to_string(),
                        namespace: self.certs.service_namespace().to_string(),
                        path: Some(CONVERSION_PATH.to_string()),
                        port: Some(CONVERSION_PORT),
                    }),
                    url: None,
                }),
                conversion_review_versions: vec!["v1".to_string()],
            }),
        });
        Ok(())
    }
}
