//! In-memory collaborators for tests
//!
//! Paired with [`MockCluster`](crate::cluster::MockCluster) these run the
//! whole reconciler without a cluster, a chart repository or certificates.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use compositor_core::chart::{CHART_FILE, VALUES_SCHEMA_FILE};
use compositor_core::labels::{DEFINITION_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use compositor_core::{
    CertificateManager, ChartPackage, ChartRef, ChartResolver, CompositionDefinition,
    CompositionDefinitionSpec, CoreError, Document, Gvr, ManifestRenderer, ManifestSet,
    RenderRequest, Rendered, ResolvedCredentials,
};
use serde_json::json;

/// Chart name used by the fixtures
pub const FIREWORKS_CHART: &str = "fireworks-app";

/// Repository the fixture archives are served from
pub const FIREWORKS_REPO: &str = "https://charts.krateo.io";

/// Archive URL of a fixture chart version
pub fn fireworks_url(version: &str) -> String {
    format!("{}/{}-{}.tgz", FIREWORKS_REPO, FIREWORKS_CHART, version)
}

/// Value schema of the fixture chart
///
/// The breaking variant turns `app.service.port` into a string and drops
/// `git.toRepo`, which instances of the regular variant may carry.
pub fn fireworks_schema(breaking: bool) -> String {
    let port_type = if breaking { "string" } else { "integer" };
    let mut git = json!({
        "type": "object",
        "properties": {
            "fromRepo": {"type": "object", "properties": {"name": {"type": "string"}}},
            "toRepo": {"type": "object", "properties": {"name": {"type": "string"}}}
        }
    });
    if breaking && let Some(props) = git["properties"].as_object_mut() {
        props.remove("toRepo");
    }
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["app"],
        "properties": {
            "app": {
                "type": "object",
                "properties": {
                    "service": {
                        "type": "object",
                        "properties": {
                            "type": {"type": "string", "enum": ["NodePort", "LoadBalancer"]},
                            "port": {"type": port_type}
                        }
                    }
                }
            },
            "git": git
        }
    })
    .to_string()
}

/// An unpacked fixture chart
pub fn fireworks_package(version: &str) -> ChartPackage {
    let root = FIREWORKS_CHART.to_string();
    let mut files = BTreeMap::new();
    files.insert(
        format!("{}/{}", root, CHART_FILE),
        format!("apiVersion: v2\nname: {}\nversion: {}\n", FIREWORKS_CHART, version).into_bytes(),
    );
    files.insert(
        format!("{}/{}", root, VALUES_SCHEMA_FILE),
        fireworks_schema(false).into_bytes(),
    );
    files.insert(
        format!("{}/templates/service.yaml", root),
        b"apiVersion: v1\nkind: Service\nmetadata:\n  name: {{ .Release.Name }}\n".to_vec(),
    );
    ChartPackage {
        name: FIREWORKS_CHART.to_string(),
        version: version.to_string(),
        root,
        package_url: fireworks_url(version),
        files,
    }
}

/// A definition pointing at a fixture chart version
pub fn fireworks_definition(name: &str, namespace: &str, version: &str) -> CompositionDefinition {
    let mut def = CompositionDefinition::new(
        name,
        CompositionDefinitionSpec {
            chart: ChartRef::new(fireworks_url(version), version),
        },
    );
    def.metadata.namespace = Some(namespace.to_string());
    def
}

/// `ChartResolver` serving packages registered by URL and version
#[derive(Default)]
pub struct MockChartResolver {
    charts: Mutex<HashMap<(String, String), ChartPackage>>,
    credentials: Mutex<Vec<Option<ResolvedCredentials>>>,
    calls: AtomicUsize,
}

impl MockChartResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver serving the given versions of the fixture chart
    pub fn fireworks(versions: &[&str]) -> Self {
        let resolver = Self::new();
        for version in versions {
            resolver.add(&fireworks_url(version), version, fireworks_package(version));
        }
        resolver
    }

    pub fn add(&self, url: &str, version: &str, package: ChartPackage) {
        self.charts
            .lock()
            .unwrap()
            .insert((url.to_string(), version.to_string()), package);
    }

    /// Number of resolve calls
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Credentials passed to each resolve call, in order
    pub fn seen_credentials(&self) -> Vec<Option<ResolvedCredentials>> {
        self.credentials.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChartResolver for MockChartResolver {
    async fn resolve(
        &self,
        chart: &ChartRef,
        credentials: Option<&ResolvedCredentials>,
    ) -> compositor_core::Result<ChartPackage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.credentials.lock().unwrap().push(credentials.cloned());
        self.charts
            .lock()
            .unwrap()
            .get(&(chart.url.clone(), chart.version.clone()))
            .cloned()
            .ok_or_else(|| CoreError::ChartNotFound {
                reference: chart.display_ref(),
            })
    }
}

/// Renderer producing a fixed workload per API version
///
/// Objects are named `<resource>-<version>-controller` in the definition's
/// namespace: ServiceAccount, ClusterRole, ClusterRoleBinding, Deployment.
#[derive(Default)]
pub struct StaticRenderer {
    rbac_gaps: Vec<String>,
}

impl StaticRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report these template files as not inspectable
    pub fn with_rbac_gaps(gaps: &[&str]) -> Self {
        Self {
            rbac_gaps: gaps.iter().map(|g| g.to_string()).collect(),
        }
    }
}

/// Name of the workload objects of one API version
pub fn workload_name(gvr: &Gvr) -> String {
    format!("{}-{}-controller", gvr.resource, gvr.version)
}

impl ManifestRenderer for StaticRenderer {
    fn render(&self, request: &RenderRequest<'_>) -> compositor_core::Result<Rendered> {
        let name = workload_name(request.gvr);
        let namespace = &request.definition.namespace;
        let labels = json!({
            MANAGED_BY_LABEL: MANAGED_BY_VALUE,
            DEFINITION_LABEL: request.definition.name,
        });

        let documents = vec![
            json!({
                "apiVersion": "v1",
                "kind": "ServiceAccount",
                "metadata": {"name": name, "namespace": namespace, "labels": labels},
            }),
            json!({
                "apiVersion": "rbac.authorization.k8s.io/v1",
                "kind": "ClusterRole",
                "metadata": {"name": name, "labels": labels},
                "rules": [{
                    "apiGroups": [request.gvr.group],
                    "resources": [request.gvr.resource, format!("{}/status", request.gvr.resource)],
                    "verbs": ["*"],
                }],
            }),
            json!({
                "apiVersion": "rbac.authorization.k8s.io/v1",
                "kind": "ClusterRoleBinding",
                "metadata": {"name": name, "labels": labels},
                "roleRef": {"apiGroup": "rbac.authorization.k8s.io", "kind": "ClusterRole", "name": name},
                "subjects": [{"kind": "ServiceAccount", "name": name, "namespace": namespace}],
            }),
            json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": name, "namespace": namespace, "labels": labels},
                "spec": {
                    "replicas": 1,
                    "template": {"spec": {
                        "serviceAccountName": name,
                        "containers": [{
                            "name": "controller",
                            "env": [
                                {"name": "COMPOSITION_RESOURCE", "value": request.gvr.resource},
                                {"name": "COMPOSITION_VERSION", "value": request.gvr.version},
                                {"name": "CHART_URL", "value": request.chart.url},
                                {"name": "CHART_VERSION", "value": request.package.version},
                            ],
                        }],
                    }},
                },
            }),
        ];

        let documents = documents
            .into_iter()
            .map(Document::new)
            .collect::<compositor_core::Result<Vec<_>>>()?;
        Ok(Rendered {
            manifests: ManifestSet::from_documents(documents),
            rbac_gaps: self.rbac_gaps.clone(),
        })
    }
}

/// `CertificateManager` with a fixed CA bundle
pub struct MockCertificateManager {
    ca_bundle: Vec<u8>,
    managed: Mutex<Vec<Gvr>>,
}

impl Default for MockCertificateManager {
    fn default() -> Self {
        Self {
            ca_bundle: b"-----BEGIN CERTIFICATE-----\nmock\n-----END CERTIFICATE-----\n".to_vec(),
            managed: Mutex::new(Vec::new()),
        }
    }
}

impl MockCertificateManager {
    /// Resources certificates were requested for
    pub fn managed(&self) -> Vec<Gvr> {
        self.managed.lock().unwrap().clone()
    }
}

#[async_trait]
impl CertificateManager for MockCertificateManager {
    async fn manage_certificates(&self, gvr: &Gvr) -> compositor_core::Result<()> {
        self.managed.lock().unwrap().push(gvr.clone());
        Ok(())
    }

    async fn ca_bundle(&self) -> compositor_core::Result<Vec<u8>> {
        Ok(self.ca_bundle.clone())
    }

    fn service_name(&self) -> &str {
        "compositor-webhook"
    }

    fn service_namespace(&self) -> &str {
        "krateo-system"
    }
}

/// Handles to a reconciler wired entirely with in-memory doubles
pub struct TestHarness {
    pub cluster: crate::cluster::MockCluster,
    pub resolver: Arc<MockChartResolver>,
    pub certs: Arc<MockCertificateManager>,
    pub reconciler: crate::reconciler::Reconciler,
}

impl TestHarness {
    /// Harness serving the given fixture chart versions
    pub fn fireworks(versions: &[&str]) -> Self {
        Self::with_renderer(versions, StaticRenderer::new())
    }

    pub fn with_renderer(versions: &[&str], renderer: StaticRenderer) -> Self {
        let cluster = crate::cluster::MockCluster::new();
        let resolver = Arc::new(MockChartResolver::fireworks(versions));
        let certs = Arc::new(MockCertificateManager::default());
        let reconciler = crate::reconciler::Reconciler::new(
            Arc::new(cluster.clone()),
            crate::reconciler::Collaborators {
                resolver: resolver.clone(),
                compiler: Arc::new(crate::crd::OpenApiCompiler::new()),
                renderer: Arc::new(renderer),
                certs: certs.clone(),
            },
            crate::retry::RetryPolicy::immediate(5),
        );
        Self {
            cluster,
            resolver,
            certs,
            reconciler,
        }
    }
}
