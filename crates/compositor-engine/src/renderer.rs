//! Workload manifests for one API version
//!
//! Every API version of a composition resource gets its own dynamic
//! controller: a ServiceAccount, cluster and namespaced RBAC, a ConfigMap
//! telling the controller what to serve, and the Deployment running it. All
//! objects are named `<resource>-<version>-controller`.

use compositor_core::labels::{DEFINITION_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use compositor_core::{Document, ManifestRenderer, ManifestSet, RenderRequest, Rendered};
use minijinja::{AutoEscape, Environment};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::{EngineError, Result};
use crate::filters;
use crate::rbac::{PolicyRule, infer_rules};

/// Image used when none is configured
pub const DEFAULT_CONTROLLER_IMAGE: &str =
    "ghcr.io/krateoplatformops/composition-dynamic-controller";

const NAME_LABEL: &str = "app.kubernetes.io/name";

/// Templates in install order
const TEMPLATES: &[(&str, &str)] = &[
    ("serviceaccount.yaml", include_str!("templates/serviceaccount.yaml")),
    ("clusterrole.yaml", include_str!("templates/clusterrole.yaml")),
    ("clusterrolebinding.yaml", include_str!("templates/clusterrolebinding.yaml")),
    ("role.yaml", include_str!("templates/role.yaml")),
    ("rolebinding.yaml", include_str!("templates/rolebinding.yaml")),
    ("configmap.yaml", include_str!("templates/configmap.yaml")),
    ("deployment.yaml", include_str!("templates/deployment.yaml")),
];

/// Name shared by every workload object of one API version
pub fn workload_name(resource: &str, version: &str) -> String {
    format!("{}-{}-controller", resource, version)
}

#[derive(Debug, Serialize)]
struct WorkloadContext<'a> {
    name: String,
    namespace: &'a str,
    labels: BTreeMap<&'static str, String>,
    selector: BTreeMap<&'static str, String>,
    image: &'a str,
    group: &'a str,
    version: &'a str,
    resource: &'a str,
    chart_url: &'a str,
    chart_version: &'a str,
    chart_repo: Option<&'a str>,
    chart_insecure: String,
    cluster_rules: &'a [PolicyRule],
}

/// [`ManifestRenderer`] backed by embedded MiniJinja templates
pub struct TemplateRenderer {
    env: Environment<'static>,
    image: String,
}

impl TemplateRenderer {
    /// Renderer deploying `image` (a full image reference, tag included)
    pub fn new(image: impl Into<String>) -> Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        // Values are quoted explicitly with `tojson`
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.add_filter("tojson", filters::tojson);
        for (name, source) in TEMPLATES {
            env.add_template(name, source)
                .map_err(|e| EngineError::template(name, e))?;
        }
        Ok(Self {
            env,
            image: image.into(),
        })
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Render the workload, returning the RBAC gaps next to the manifests
    pub fn render_workload(&self, request: &RenderRequest<'_>) -> Result<Rendered> {
        let gvr = request.gvr;
        let inference = infer_rules(gvr, request.package);
        let name = workload_name(&gvr.resource, &gvr.version);

        let mut labels = BTreeMap::new();
        labels.insert(NAME_LABEL, name.clone());
        labels.insert(MANAGED_BY_LABEL, MANAGED_BY_VALUE.to_string());
        labels.insert(DEFINITION_LABEL, request.definition.name.clone());

        let mut selector = BTreeMap::new();
        selector.insert(NAME_LABEL, name.clone());

        let context = WorkloadContext {
            name,
            namespace: &request.definition.namespace,
            labels,
            selector,
            image: &self.image,
            group: &gvr.group,
            version: &gvr.version,
            resource: &gvr.resource,
            chart_url: &request.chart.url,
            chart_version: &request.chart.version,
            chart_repo: request.chart.repo.as_deref(),
            chart_insecure: request.chart.insecure_skip_verify_tls.to_string(),
            cluster_rules: &inference.rules,
        };

        let mut manifests = ManifestSet::new();
        for (template, _) in TEMPLATES {
            manifests.push(self.render_one(template, &context)?);
        }

        tracing::debug!(
            gvr = %gvr,
            objects = manifests.len(),
            rbac_gaps = inference.gaps.len(),
            "Rendered workload"
        );

        Ok(Rendered {
            manifests,
            rbac_gaps: inference.gaps,
        })
    }

    fn render_one(&self, template: &str, context: &WorkloadContext<'_>) -> Result<Document> {
        let output = self
            .env
            .get_template(template)
            .and_then(|t| t.render(context))
            .map_err(|e| EngineError::template(template, e))?;
        Document::from_yaml(&output).map_err(|e| EngineError::InvalidOutput {
            name: template.to_string(),
            message: e.to_string(),
        })
    }
}

impl ManifestRenderer for TemplateRenderer {
    fn render(&self, request: &RenderRequest<'_>) -> compositor_core::Result<Rendered> {
        Ok(self.render_workload(request)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compositor_core::{ChartPackage, ChartRef, Gvr, NamespacedName};

    fn package() -> ChartPackage {
        let mut files = BTreeMap::new();
        files.insert(
            "fireworks-app/templates/deployment.yaml".to_string(),
            b"apiVersion: apps/v1\nkind: Deployment\n".to_vec(),
        );
        files.insert(
            "fireworks-app/templates/extra.yaml".to_string(),
            b"{{ include \"fireworks.extra\" . }}\n".to_vec(),
        );
        ChartPackage {
            name: "fireworks-app".to_string(),
            version: "1.1.13".to_string(),
            root: "fireworks-app".to_string(),
            files,
            ..Default::default()
        }
    }

    fn render(version: &str) -> Rendered {
        let renderer = TemplateRenderer::new("ghcr.io/example/controller:0.1.0").unwrap();
        let gvr = Gvr::new("composition.krateo.io", version, "fireworksapps");
        let definition = NamespacedName::new("fireworks", "demo");
        let chart = ChartRef::new("https://charts.krateo.io", "1.1.13").with_repo("fireworks-app");
        let package = package();
        renderer
            .render_workload(&RenderRequest {
                gvr: &gvr,
                definition: &definition,
                chart: &chart,
                package: &package,
            })
            .unwrap()
    }

    #[test]
    fn test_workload_objects() {
        let rendered = render("v1-1-13");
        let kinds: Vec<&str> = rendered.manifests.iter().filter_map(|d| d.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "ServiceAccount",
                "ClusterRole",
                "ClusterRoleBinding",
                "Role",
                "RoleBinding",
                "ConfigMap",
                "Deployment"
            ]
        );
        for doc in rendered.manifests.iter() {
            assert_eq!(doc.name(), Some("fireworksapps-v1-1-13-controller"));
            assert_eq!(doc.label(MANAGED_BY_LABEL), Some(MANAGED_BY_VALUE));
            assert_eq!(doc.label(DEFINITION_LABEL), Some("fireworks"));
        }
        assert_eq!(
            rendered.manifests.find_kind("ClusterRole").unwrap().namespace(),
            None
        );
        assert_eq!(
            rendered.manifests.find_kind("Deployment").unwrap().namespace(),
            Some("demo")
        );
    }

    #[test]
    fn test_configmap_describes_the_api() {
        let rendered = render("v1-1-13");
        let config_map = rendered.manifests.find_kind("ConfigMap").unwrap();
        let data = config_map.get("data").unwrap().clone();
        assert_eq!(data["COMPOSITION_GROUP"], "composition.krateo.io");
        assert_eq!(data["COMPOSITION_VERSION"], "v1-1-13");
        assert_eq!(data["COMPOSITION_RESOURCE"], "fireworksapps");
        assert_eq!(data["CHART_URL"], "https://charts.krateo.io");
        assert_eq!(data["CHART_REPO"], "fireworks-app");
        assert_eq!(data["CHART_INSECURE_SKIP_VERIFY_TLS"], "false");
    }

    #[test]
    fn test_cluster_role_carries_inferred_rules() {
        let rendered = render("v1-1-13");
        let cluster_role = rendered.manifests.find_kind("ClusterRole").unwrap();
        let rules = cluster_role.get("rules").unwrap().clone();
        let rules = rules.as_array().unwrap();
        assert_eq!(rules[0]["apiGroups"][0], "composition.krateo.io");
        assert_eq!(rules[0]["resources"][1], "fireworksapps/status");
        assert!(
            rules
                .iter()
                .any(|r| r["apiGroups"][0] == "apps" && r["resources"][0] == "deployments")
        );
        assert_eq!(rendered.rbac_gaps, vec!["fireworks-app/templates/extra.yaml"]);
    }

    #[test]
    fn test_values_are_quoted() {
        let renderer = TemplateRenderer::new("ghcr.io/example/controller:0.1.0").unwrap();
        let gvr = Gvr::new("composition.krateo.io", "v1-1-13", "fireworksapps");
        let definition = NamespacedName::new("fireworks", "demo");
        let chart = ChartRef::new("https://charts.krateo.io/app.tgz?ref=a: b", "1.1.13");
        let package = package();
        let rendered = renderer
            .render_workload(&RenderRequest {
                gvr: &gvr,
                definition: &definition,
                chart: &chart,
                package: &package,
            })
            .unwrap();

        let config_map = rendered.manifests.find_kind("ConfigMap").unwrap();
        let data = config_map.get("data").unwrap();
        assert_eq!(data["CHART_URL"], "https://charts.krateo.io/app.tgz?ref=a: b");
        assert!(data.get("CHART_REPO").is_none());
        let deployment = rendered.manifests.find_kind("Deployment").unwrap();
        assert_eq!(
            deployment.spec().unwrap()["template"]["spec"]["containers"][0]["image"],
            "ghcr.io/example/controller:0.1.0"
        );
    }

    #[test]
    fn test_versions_get_distinct_workloads() {
        let a = render("v1-1-13");
        let b = render("v1-1-14");
        assert_eq!(a.manifests.digest().unwrap(), render("v1-1-13").manifests.digest().unwrap());
        assert_ne!(a.manifests.digest().unwrap(), b.manifests.digest().unwrap());
        assert_eq!(
            b.manifests.find_kind("Deployment").unwrap().name(),
            Some("fireworksapps-v1-1-14-controller")
        );
    }
}
