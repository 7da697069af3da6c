//! Reconciliation of CompositionDefinitions
//!
//! Each pass runs one of four transitions:
//! - **observe**: decide whether the generated type and its workload match
//!   the chart (CRD present, version present, same status schema, no drift)
//! - **create**: first installation of the CRD and the workload
//! - **update**: merge the new version into the CRD, reinstall the workload
//!   and migrate away from the previous version when it changed
//! - **delete**: remove instances, the workload and the CRD, then release
//!   the definition
//!
//! Status is written back after every transition. The new API version,
//! digest and chart snapshot are committed only once the whole transition
//! succeeded. A failed pass leaves its error in `status.error` and on the
//! Ready condition of the status the pass started from.

mod migration;

pub use migration::MigrationSummary;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use compositor_core::{
    CertificateManager, ChartPackage, ChartRef, ChartResolver, CompositionDefinition,
    CompositionDefinitionStatus, ConditionReason, Document, Gvk, Gvr, ManifestRenderer,
    RenderRequest, Rendered, ResolvedCredentials, SchemaCompiler, gvk::plural_for_kind,
    labels::VERSION_LABEL,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::crd::{
    CrdApplyResult, CrdManager, generate_crd, gvr_from_generated_crd, has_version, status_equal,
};
use crate::deploy::Deployer;
use crate::drift::DriftDetector;
use crate::error::{KubeError, Result};
use crate::finalizer::{self, CLEANUP_FINALIZER, COMPOSITIONS_FINALIZER};
use crate::retry::RetryPolicy;

/// What a reconciliation pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    UpToDate,
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UpToDate => "up to date",
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        })
    }
}

/// Result of the observe transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// The CRD of the generated type exists
    pub exists: bool,
    /// CRD and workload match the chart
    pub up_to_date: bool,
}

/// The services a reconciler depends on besides the cluster
#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<dyn ChartResolver>,
    pub compiler: Arc<dyn SchemaCompiler>,
    pub renderer: Arc<dyn ManifestRenderer>,
    pub certs: Arc<dyn CertificateManager>,
}

/// A chart resolved into the API type it defines
struct Resolved {
    package: ChartPackage,
    gvk: Gvk,
    gvr: Gvr,
    fragment: CustomResourceDefinition,
}

/// Workload and CRD written for a version, not yet recorded in status
struct Installed {
    rendered: Rendered,
    applied: CrdApplyResult,
    digest: String,
}

/// Drives CompositionDefinitions through observe/create/update/delete
pub struct Reconciler {
    cluster: Arc<dyn ClusterApi>,
    resolver: Arc<dyn ChartResolver>,
    compiler: Arc<dyn SchemaCompiler>,
    renderer: Arc<dyn ManifestRenderer>,
    certs: Arc<dyn CertificateManager>,
    crds: CrdManager,
    deployer: Deployer,
    drift: DriftDetector,
}

impl Reconciler {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        collaborators: Collaborators,
        retry: RetryPolicy,
    ) -> Self {
        let deployer = Deployer::new(cluster.clone());
        Self {
            crds: CrdManager::new(cluster.clone(), collaborators.certs.clone(), retry),
            drift: DriftDetector::new(deployer.clone()),
            deployer,
            cluster,
            resolver: collaborators.resolver,
            compiler: collaborators.compiler,
            renderer: collaborators.renderer,
            certs: collaborators.certs,
        }
    }

    /// Reject schema versions that break existing instances
    pub fn strict_compatibility(mut self, strict: bool) -> Self {
        self.crds = self.crds.strict(strict);
        self
    }

    /// Run one reconciliation pass
    pub async fn reconcile(&self, definition: &CompositionDefinition) -> Result<Outcome> {
        let mut def = definition.clone();
        let nn = def.namespaced_name();

        let result = if def.is_deleting() {
            self.delete(&mut def).await
        } else {
            self.apply(&mut def).await
        };

        match result {
            Ok(outcome) => {
                info!(name = %nn.name, namespace = %nn.namespace, %outcome, "Reconciled");
                Ok(outcome)
            }
            Err(e) => {
                self.record_error(definition, &e).await;
                Err(e)
            }
        }
    }

    async fn apply(&self, def: &mut CompositionDefinition) -> Result<Outcome> {
        self.ensure_finalizer(def, CLEANUP_FINALIZER).await?;

        let chart = def.spec.chart.clone();
        let resolved = self.resolve(&chart).await?;
        let observation = self.observe(def, &resolved).await?;

        if !observation.exists {
            self.create(def, &resolved).await?;
            Ok(Outcome::Created)
        } else if !observation.up_to_date {
            self.update(def, &resolved).await?;
            Ok(Outcome::Updated)
        } else {
            Ok(Outcome::UpToDate)
        }
    }

    /// Compare the cluster with what the chart defines
    pub async fn observe_definition(
        &self,
        definition: &CompositionDefinition,
    ) -> Result<Observation> {
        let mut def = definition.clone();
        let chart = def.spec.chart.clone();
        let resolved = self.resolve(&chart).await?;
        self.observe(&mut def, &resolved).await
    }

    async fn observe(
        &self,
        def: &mut CompositionDefinition,
        resolved: &Resolved,
    ) -> Result<Observation> {
        let gvk = &resolved.gvk;
        let gvr = &resolved.gvr;
        let crd_name = gvr.crd_name();

        let Some(live) = self.cluster.get_crd(&crd_name).await? else {
            debug!(crd = %crd_name, "CRD not found");
            def.status_mut().set_condition(
                ConditionReason::Unavailable,
                format!("CRD {} not found", crd_name),
            );
            self.write_status(def).await?;
            return Ok(Observation {
                exists: false,
                up_to_date: false,
            });
        };

        def.status_mut().refresh_version_flags(
            live.spec
                .versions
                .iter()
                .map(|v| (v.name.as_str(), v.served, v.storage)),
        );

        if !self.cluster.list_instances(gvr, None).await?.is_empty() {
            self.ensure_finalizer(def, COMPOSITIONS_FINALIZER).await?;
        }

        let not_current = Observation {
            exists: true,
            up_to_date: false,
        };

        if !has_version(&live, &gvk.version) {
            info!(crd = %crd_name, version = %gvk.version, "Version not served yet");
            return Ok(not_current);
        }
        if !status_equal(&live, &resolved.fragment)? {
            info!(crd = %crd_name, "Status schema changed");
            return Ok(not_current);
        }

        let rendered = self.render(def, resolved, &def.spec.chart, gvr)?;
        let recorded = def.status.as_ref().and_then(|s| s.digest.clone());
        let report = self.drift.check(&rendered.manifests, recorded.as_deref()).await?;
        if !report.is_up_to_date() {
            return Ok(not_current);
        }

        let status = def.status_mut();
        status.set_api(gvk, gvr);
        status.package_url = Some(resolved.package.package_url.clone());
        status.error = rendered.partial_rbac_error().map(|e| e.to_string());
        status.set_condition(ConditionReason::Available, format!("{} is available", gvk));
        self.write_status(def).await?;

        Ok(Observation {
            exists: true,
            up_to_date: true,
        })
    }

    async fn create(&self, def: &mut CompositionDefinition, resolved: &Resolved) -> Result<()> {
        info!(gvk = %resolved.gvk, "Creating");
        def.status_mut()
            .set_condition(ConditionReason::Creating, format!("Creating {}", resolved.gvk));
        self.write_status(def).await?;

        let installed = self.install(def, resolved).await?;
        commit(def, resolved, &installed);
        self.write_status(def).await
    }

    async fn update(&self, def: &mut CompositionDefinition, resolved: &Resolved) -> Result<()> {
        info!(gvk = %resolved.gvk, "Updating");
        let previous = self.previous_api(def);
        def.status_mut()
            .set_condition(ConditionReason::Updating, format!("Updating {}", resolved.gvk));
        self.write_status(def).await?;

        let installed = self.install(def, resolved).await?;

        if let Some((previous_gvk, previous_gvr)) = previous
            && previous_gvk.version != resolved.gvk.version
        {
            let summary = self
                .migrate(def, &previous_gvk, &previous_gvr, &resolved.gvk, &resolved.gvr)
                .await?;
            info!(
                from = %previous_gvk.version,
                to = %resolved.gvk.version,
                undeployed = summary.undeployed,
                relabelled = summary.relabelled,
                "Migrated"
            );
        }

        commit(def, resolved, &installed);
        self.write_status(def).await
    }

    /// Merge the CRD version and install the workload
    async fn install(&self, def: &CompositionDefinition, resolved: &Resolved) -> Result<Installed> {
        let applied = self.crds.apply_version(&resolved.fragment).await?;
        info!(result = %applied.message(), "Applied CRD");
        self.certs.manage_certificates(&resolved.gvr).await?;

        let rendered = self.render(def, resolved, &def.spec.chart, &resolved.gvr)?;
        self.deployer.install(&rendered.manifests).await?;
        let digest = rendered.manifests.digest()?;

        Ok(Installed {
            rendered,
            applied,
            digest,
        })
    }

    async fn delete(&self, def: &mut CompositionDefinition) -> Result<Outcome> {
        let nn = def.namespaced_name();
        info!(name = %nn.name, namespace = %nn.namespace, "Deleting");
        def.status_mut()
            .set_condition(ConditionReason::Deleting, "Removing generated API and workload");
        self.write_status(def).await?;

        let chart = def.spec.chart.clone();
        let resolved = self.resolve(&chart).await?;
        let gvr = &resolved.gvr;

        if self.cluster.get_crd(&gvr.crd_name()).await?.is_some() {
            let owned = self.owned_instances(gvr, &resolved.gvk.version).await?;
            for instance in &owned {
                if let Some(name) = instance.name() {
                    self.cluster
                        .delete_instance(gvr, instance.namespace(), name)
                        .await?;
                }
            }

            let remaining = self.owned_instances(gvr, &resolved.gvk.version).await?;
            if !remaining.is_empty() {
                return Err(KubeError::CompositionsStillExist {
                    gvr: gvr.to_string(),
                    count: remaining.len(),
                });
            }
        }

        let siblings = self.sibling_versions(def, &resolved.gvk).await?;
        if siblings.contains(&resolved.gvk.version) {
            info!(gvr = %gvr, "Workload shared with another definition, keeping it");
        } else {
            let rendered = self.render(def, &resolved, &chart, gvr)?;
            self.deployer
                .undeploy(gvr, &rendered.manifests, !siblings.is_empty())
                .await?;
        }

        if let Some(next) = finalizer::remove(def.finalizers_list(), &finalizer::owned()) {
            self.cluster.set_definition_finalizers(&nn, &next).await?;
            def.metadata.finalizers = Some(next);
        }
        Ok(Outcome::Deleted)
    }

    /// Fetch the chart and derive the API type it defines
    async fn resolve(&self, chart: &ChartRef) -> Result<Resolved> {
        let package = self.fetch(chart).await?;
        let gvk = Gvk::for_chart(&package.name, &package.version)?;
        let fragment = generate_crd(self.compiler.as_ref(), package.values_schema()?, &gvk)?;

        let gvr = match self.cluster.resolve_plural(&gvk).await? {
            Some(gvr) => gvr,
            None => gvr_from_generated_crd(self.compiler.as_ref(), &gvk)?,
        };
        debug!(chart = %chart.display_ref(), gvk = %gvk, gvr = %gvr, "Resolved chart");

        Ok(Resolved {
            package,
            gvk,
            gvr,
            fragment,
        })
    }

    /// Fetch a chart, reading its password from the referenced Secret
    async fn fetch(&self, chart: &ChartRef) -> Result<ChartPackage> {
        let credentials = match &chart.credentials {
            Some(creds) => Some(ResolvedCredentials {
                username: creds.username.clone(),
                password: self.cluster.read_secret_key(&creds.password_ref).await?,
            }),
            None => None,
        };
        Ok(self.resolver.resolve(chart, credentials.as_ref()).await?)
    }

    fn render(
        &self,
        def: &CompositionDefinition,
        resolved: &Resolved,
        chart: &ChartRef,
        gvr: &Gvr,
    ) -> Result<Rendered> {
        self.render_package(def, &resolved.package, chart, gvr)
    }

    fn render_package(
        &self,
        def: &CompositionDefinition,
        package: &ChartPackage,
        chart: &ChartRef,
        gvr: &Gvr,
    ) -> Result<Rendered> {
        let nn = def.namespaced_name();
        let rendered = self.renderer.render(&RenderRequest {
            gvr,
            definition: &nn,
            chart,
            package,
        })?;
        if !rendered.rbac_gaps.is_empty() {
            warn!(files = ?rendered.rbac_gaps, "RBAC inferred from a partial view of the chart");
        }
        Ok(rendered)
    }

    /// Instances written under `version`, or carrying no version label
    async fn owned_instances(&self, gvr: &Gvr, version: &str) -> Result<Vec<Document>> {
        Ok(self
            .cluster
            .list_instances(gvr, None)
            .await?
            .into_iter()
            .filter(|doc| doc.label(VERSION_LABEL).is_none_or(|v| v == version))
            .collect())
    }

    /// Versions recorded by other definitions managing the same group and kind
    ///
    /// A sibling whose version is not recorded yet still counts, under the
    /// empty version.
    async fn sibling_versions(
        &self,
        def: &CompositionDefinition,
        gvk: &Gvk,
    ) -> Result<BTreeSet<String>> {
        let nn = def.namespaced_name();
        let target = (gvk.group.clone(), gvk.kind.clone());
        Ok(self
            .cluster
            .list_definitions()
            .await?
            .iter()
            .filter(|other| {
                other.namespaced_name() != nn
                    && other.managed_group_kind().as_ref() == Some(&target)
            })
            .map(|other| other.recorded_gvk().map(|g| g.version).unwrap_or_default())
            .collect())
    }

    /// API type recorded by the last create or update
    fn previous_api(&self, def: &CompositionDefinition) -> Option<(Gvk, Gvr)> {
        let gvk = def.recorded_gvk()?;
        let resource = def
            .status
            .as_ref()
            .and_then(|s| s.resource.clone())
            .unwrap_or_else(|| plural_for_kind(&gvk.kind));
        let gvr = gvk.to_gvr(resource);
        Some((gvk, gvr))
    }

    async fn ensure_finalizer(&self, def: &mut CompositionDefinition, name: &str) -> Result<()> {
        if let Some(next) = finalizer::ensure(def.finalizers_list(), name) {
            self.cluster
                .set_definition_finalizers(&def.namespaced_name(), &next)
                .await?;
            debug!(finalizer = %name, "Added finalizer");
            def.metadata.finalizers = Some(next);
        }
        Ok(())
    }

    async fn write_status(&self, def: &CompositionDefinition) -> Result<()> {
        let empty = CompositionDefinitionStatus::default();
        self.cluster
            .patch_definition_status(&def.namespaced_name(), def.status.as_ref().unwrap_or(&empty))
            .await
    }

    /// Put a failed pass into the status it started from
    ///
    /// Anything the pass recorded before failing is dropped, so the next pass
    /// still sees the previous API version and retries the whole transition.
    async fn record_error(&self, definition: &CompositionDefinition, error: &KubeError) {
        let mut def = definition.clone();
        let message = error.to_string();
        let status = def.status_mut();
        status.error = Some(message.clone());
        if error.is_blocking() {
            info!(error = %message, "Waiting before deletion can proceed");
        } else {
            status.set_condition(ConditionReason::ReconcileError, message);
        }

        if let Err(e) = self.write_status(&def).await {
            if !e.is_not_found() {
                warn!(error = %e, "Failed to record reconcile error in status");
            }
        }
    }
}

/// Record an installed version as the current API of the definition
fn commit(def: &mut CompositionDefinition, resolved: &Resolved, installed: &Installed) {
    let chart = def.spec.chart.clone();
    let status = def.status_mut();
    status.digest = Some(installed.digest.clone());
    status.record_version(&resolved.gvk.version, Some(&chart));
    status.refresh_version_flags(
        installed
            .applied
            .crd
            .spec
            .versions
            .iter()
            .map(|v| (v.name.as_str(), v.served, v.storage)),
    );
    status.set_api(&resolved.gvk, &resolved.gvr);
    status.package_url = Some(resolved.package.package_url.clone());
    status.error = install_notes(&installed.rendered, &installed.applied);
    status.set_condition(
        ConditionReason::Available,
        format!("{} installed", resolved.gvk),
    );
}

/// Non-fatal problems of an install, for `status.error`
fn install_notes(rendered: &Rendered, applied: &CrdApplyResult) -> Option<String> {
    let mut notes = Vec::new();
    if let Some(e) = rendered.partial_rbac_error() {
        notes.push(e.to_string());
    }
    if !applied.issues.is_empty() {
        let issues: Vec<String> = applied.issues.iter().map(ToString::to_string).collect();
        notes.push(format!("Incompatible schema change: {}", issues.join("; ")));
    }
    if notes.is_empty() {
        None
    } else {
        Some(notes.join("; "))
    }
}
