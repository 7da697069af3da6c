//! Drift detection
//!
//! A definition is up to date only when two digests both equal the digest
//! recorded in `status.digest` by the last create or update:
//! - the digest of the manifest set rendered now (definition drift: the
//!   chart or the renderer changed)
//! - the digest of the live objects, projected onto the rendered fields
//!   (deployment drift: someone changed or removed the workload)

use compositor_core::ManifestSet;
use similar::{ChangeTag, TextDiff};
use tracing::{debug, info};

use crate::deploy::Deployer;
use crate::error::Result;

/// Outcome of both drift checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftReport {
    /// Digest recorded by the last create or update
    pub recorded: Option<String>,
    /// Digest of the freshly rendered manifest set
    pub desired: String,
    /// Digest of the live objects
    pub observed: String,
}

impl DriftReport {
    /// The rendered set differs from what was last installed
    pub fn definition_drift(&self) -> bool {
        self.recorded.as_deref() != Some(self.desired.as_str())
    }

    /// The live objects differ from what was last installed
    pub fn deployment_drift(&self) -> bool {
        self.recorded.as_deref() != Some(self.observed.as_str())
    }

    pub fn is_up_to_date(&self) -> bool {
        !self.definition_drift() && !self.deployment_drift()
    }
}

/// Compares rendered and live manifest sets against the recorded digest
#[derive(Clone)]
pub struct DriftDetector {
    deployer: Deployer,
}

impl DriftDetector {
    pub fn new(deployer: Deployer) -> Self {
        Self { deployer }
    }

    /// Run both checks for a rendered manifest set; reads the cluster, never writes
    pub async fn check(
        &self,
        rendered: &ManifestSet,
        recorded: Option<&str>,
    ) -> Result<DriftReport> {
        let desired = rendered.digest()?;
        let observed_set = self.deployer.lookup(rendered).await?;
        let observed = observed_set.digest()?;

        let report = DriftReport {
            recorded: recorded.map(str::to_string),
            desired,
            observed,
        };

        if report.definition_drift() {
            info!(
                recorded = recorded.unwrap_or("<none>"),
                desired = %report.desired,
                "Definition drift"
            );
        }
        if report.deployment_drift() {
            info!(
                recorded = recorded.unwrap_or("<none>"),
                observed = %report.observed,
                "Deployment drift"
            );
            for line in diff_lines(&rendered.to_yaml()?, &observed_set.to_yaml()?) {
                debug!(change = %line, "Live workload differs");
            }
        }
        Ok(report)
    }
}

/// Changed lines between two YAML texts, prefixed with `-` or `+`
pub fn diff_lines(expected: &str, actual: &str) -> Vec<String> {
    TextDiff::from_lines(expected, actual)
        .iter_all_changes()
        .filter_map(|change| {
            let sign = match change.tag() {
                ChangeTag::Delete => '-',
                ChangeTag::Insert => '+',
                ChangeTag::Equal => return None,
            };
            Some(format!("{}{}", sign, change.value().trim_end()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockCluster;
    use compositor_core::ObjectKey;
    use serde_json::json;
    use std::sync::Arc;

    fn rendered() -> ManifestSet {
        ManifestSet::from_yaml_stream(
            r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: fireworksapps-v1-1-13-controller
  namespace: krateo-system
data:
  resource: fireworksapps
"#,
        )
        .unwrap()
    }

    fn key() -> ObjectKey {
        ObjectKey::new("v1", "ConfigMap", Some("krateo-system"), "fireworksapps-v1-1-13-controller")
    }

    async fn setup() -> (MockCluster, DriftDetector, String) {
        let cluster = MockCluster::new();
        let deployer = Deployer::new(Arc::new(cluster.clone()));
        deployer.install(&rendered()).await.unwrap();
        let digest = rendered().digest().unwrap();
        (cluster, DriftDetector::new(deployer), digest)
    }

    #[tokio::test]
    async fn test_no_drift_after_install() {
        let (_, detector, digest) = setup().await;
        let report = detector.check(&rendered(), Some(&digest)).await.unwrap();
        assert!(report.is_up_to_date());
    }

    #[tokio::test]
    async fn test_server_side_fields_are_not_drift() {
        let (cluster, detector, digest) = setup().await;
        cluster.tamper_object(&key(), |v| {
            v["metadata"]["annotations"] = json!({"kubectl.kubernetes.io/last-applied": "x"});
        });
        let report = detector.check(&rendered(), Some(&digest)).await.unwrap();
        assert!(report.is_up_to_date());
    }

    #[tokio::test]
    async fn test_deployment_drift() {
        let (cluster, detector, digest) = setup().await;
        cluster.tamper_object(&key(), |v| v["data"]["resource"] = json!("other"));
        let report = detector.check(&rendered(), Some(&digest)).await.unwrap();
        assert!(!report.definition_drift());
        assert!(report.deployment_drift());
    }

    #[tokio::test]
    async fn test_definition_drift_without_recorded_digest() {
        let (_, detector, _) = setup().await;
        let report = detector.check(&rendered(), None).await.unwrap();
        assert!(report.definition_drift());
        assert!(!report.is_up_to_date());
    }

    #[test]
    fn test_diff_lines() {
        let lines = diff_lines("a: 1\nb: 2\n", "a: 1\nb: 3\n");
        assert_eq!(lines, vec!["-b: 2", "+b: 3"]);
    }
}
