//! Moving a definition from one API version to the next
//!
//! The superseded version keeps its row in the CRD (instances written under
//! it stay readable through `vacuum`), but its workload is removed and
//! instances labelled with it are relabelled to the new version.

use compositor_core::{CompositionDefinition, Gvk, Gvr, labels::VERSION_LABEL};
use tracing::{debug, info, warn};

use super::Reconciler;
use crate::error::Result;

/// What a migration did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    /// Workloads of the previous version that were undeployed
    pub undeployed: usize,
    /// Instances moved to the new version label
    pub relabelled: usize,
}

impl Reconciler {
    pub(super) async fn migrate(
        &self,
        def: &CompositionDefinition,
        previous_gvk: &Gvk,
        previous_gvr: &Gvr,
        current_gvk: &Gvk,
        current_gvr: &Gvr,
    ) -> Result<MigrationSummary> {
        let mut summary = MigrationSummary::default();

        let snapshots: Vec<_> = def
            .status
            .as_ref()
            .map(|s| s.version_info())
            .unwrap_or_default()
            .iter()
            .filter(|detail| detail.version == previous_gvk.version)
            .filter_map(|detail| detail.chart.clone())
            .collect();
        if snapshots.is_empty() {
            warn!(
                version = %previous_gvk.version,
                "No chart recorded for the previous version, its workload is left in place"
            );
        }

        for chart in &snapshots {
            let package = self.fetch(chart).await?;
            let rendered = self.render_package(def, &package, chart, previous_gvr)?;
            self.deployer
                .undeploy(previous_gvr, &rendered.manifests, true)
                .await?;
            info!(
                gvr = %previous_gvr,
                chart = %chart.display_ref(),
                "Undeployed previous workload"
            );
            summary.undeployed += 1;
        }

        if previous_gvk.same_group_kind(current_gvk) {
            let selector = format!("{}={}", VERSION_LABEL, previous_gvk.version);
            for instance in self.cluster.list_instances(current_gvr, Some(&selector)).await? {
                let Some(name) = instance.name() else {
                    continue;
                };
                self.cluster
                    .set_instance_label(
                        current_gvr,
                        instance.namespace(),
                        name,
                        VERSION_LABEL,
                        &current_gvk.version,
                    )
                    .await?;
                debug!(instance = %name, version = %current_gvk.version, "Relabelled");
                summary.relabelled += 1;
            }
        }

        Ok(summary)
    }
}
