//! RBAC inference from chart templates
//!
//! Templates are not rendered. Each YAML document is scanned for top-level
//! `apiVersion` and `kind` lines; documents whose kind is templated or
//! missing are reported as gaps so the caller can surface a partial result.

use compositor_core::gvk::plural_for_kind;
use compositor_core::{ChartPackage, Gvr};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

static API_VERSION_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^apiVersion:\s*(.+?)\s*$").expect("valid regex"));
static KIND_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^kind:\s*(.+?)\s*$").expect("valid regex"));
static DOCUMENT_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^---[ \t]*$").expect("valid regex"));

/// Verbs granted on resources found in chart templates
pub const MANAGE_VERBS: &[&str] = &["get", "list", "watch", "create", "update", "patch", "delete"];

/// Verbs granted on secrets and events
pub const READ_VERBS: &[&str] = &["get", "list", "watch"];

/// Kinds whose plural does not follow the suffix rules
const IRREGULAR_PLURALS: &[(&str, &str)] = &[("Endpoints", "endpoints")];

/// One RBAC policy rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub api_groups: Vec<String>,
    pub resources: Vec<String>,
    pub verbs: Vec<String>,
}

impl PolicyRule {
    fn new(group: &str, resources: impl IntoIterator<Item = String>, verbs: &[&str]) -> Self {
        Self {
            api_groups: vec![group.to_string()],
            resources: resources.into_iter().collect(),
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// Rules a dynamic controller needs, plus the templates that could not be read
#[derive(Debug, Clone, Default)]
pub struct RbacInference {
    pub rules: Vec<PolicyRule>,
    pub gaps: Vec<String>,
}

/// A resource type declared by a template
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Declared {
    group: String,
    resource: String,
}

enum Scan {
    Found(Declared),
    Opaque,
    Empty,
}

/// Build the rules for the controller serving `gvr` from `package`'s templates
pub fn infer_rules(gvr: &Gvr, package: &ChartPackage) -> RbacInference {
    let mut by_group: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut gaps = Vec::new();

    for (path, content) in package.templates() {
        if !is_manifest_template(path) {
            continue;
        }
        let text = String::from_utf8_lossy(content);
        let mut opaque = false;
        for document in DOCUMENT_SEPARATOR.split(&text) {
            match scan_document(document) {
                Scan::Found(declared) => {
                    by_group
                        .entry(declared.group)
                        .or_default()
                        .insert(declared.resource);
                }
                Scan::Opaque => opaque = true,
                Scan::Empty => {}
            }
        }
        if opaque {
            tracing::debug!(template = %path, "Could not determine resource kinds");
            gaps.push(path.to_string());
        }
    }

    let mut rules = vec![
        PolicyRule::new(
            &gvr.group,
            [gvr.resource.clone(), format!("{}/status", gvr.resource)],
            &["*"],
        ),
        PolicyRule::new("", ["secrets".to_string()], READ_VERBS),
        PolicyRule::new("", ["events".to_string()], READ_VERBS),
    ];
    rules.extend(
        by_group
            .into_iter()
            .map(|(group, resources)| PolicyRule::new(&group, resources, MANAGE_VERBS)),
    );

    RbacInference { rules, gaps }
}

/// Helpers (`_*.tpl`), notes and tests do not produce objects
fn is_manifest_template(path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or(path);
    if file.starts_with('_') || file.eq_ignore_ascii_case("NOTES.txt") {
        return false;
    }
    !path.contains("/templates/tests/")
}

fn scan_document(document: &str) -> Scan {
    let kind = KIND_LINE
        .captures(document)
        .map(|c| unquote(&c[1]).to_string());
    let api_version = API_VERSION_LINE
        .captures(document)
        .map(|c| unquote(&c[1]).to_string());

    match (api_version, kind) {
        (Some(api_version), Some(kind)) => {
            if is_templated(&api_version) || is_templated(&kind) {
                return Scan::Opaque;
            }
            let group = match api_version.rsplit_once('/') {
                Some((group, _)) => group.to_string(),
                None => String::new(),
            };
            Scan::Found(Declared {
                group,
                resource: resource_for_kind(&kind),
            })
        }
        (None, None) if !document.contains("{{") => Scan::Empty,
        _ => Scan::Opaque,
    }
}

fn resource_for_kind(kind: &str) -> String {
    IRREGULAR_PLURALS
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, plural)| plural.to_string())
        .unwrap_or_else(|| plural_for_kind(kind))
}

fn is_templated(value: &str) -> bool {
    value.contains("{{") || value.contains("{%")
}

fn unquote(value: &str) -> &str {
    value.trim_matches(|c| c == '"' || c == '\'')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Files;

    fn package(templates: &[(&str, &str)]) -> ChartPackage {
        let mut files = Files::new();
        for (name, content) in templates {
            files.insert(format!("app/templates/{}", name), content.as_bytes().to_vec());
        }
        ChartPackage {
            name: "app".to_string(),
            version: "1.0.0".to_string(),
            root: "app".to_string(),
            files,
            ..Default::default()
        }
    }

    fn gvr() -> Gvr {
        Gvr::new("composition.krateo.io", "v1-0-0", "apps")
    }

    #[test]
    fn test_rules_grouped_by_api_group() {
        let pkg = package(&[
            (
                "workload.yaml",
                "apiVersion: apps/v1\nkind: Deployment\n---\napiVersion: v1\nkind: Service\n",
            ),
            ("config.yaml", "apiVersion: \"v1\"\nkind: ConfigMap\n"),
            (
                "ingress.yaml",
                "{{- if .Values.ingress.enabled }}\napiVersion: networking.k8s.io/v1\nkind: Ingress\n{{- end }}\n",
            ),
            ("_helpers.tpl", "{{- define \"app.name\" -}}app{{- end }}"),
        ]);

        let inference = infer_rules(&gvr(), &pkg);
        assert!(inference.gaps.is_empty());

        let core = inference
            .rules
            .iter()
            .find(|r| r.api_groups == vec![""] && r.verbs.len() == MANAGE_VERBS.len())
            .unwrap();
        assert_eq!(core.resources, vec!["configmaps", "services"]);

        let networking = inference
            .rules
            .iter()
            .find(|r| r.api_groups == vec!["networking.k8s.io"])
            .unwrap();
        assert_eq!(networking.resources, vec!["ingresses"]);
    }

    #[test]
    fn test_own_resource_and_read_access_always_granted() {
        let inference = infer_rules(&gvr(), &package(&[]));
        assert_eq!(inference.rules.len(), 3);
        assert_eq!(inference.rules[0].api_groups, vec!["composition.krateo.io"]);
        assert_eq!(inference.rules[0].resources, vec!["apps", "apps/status"]);
        assert_eq!(inference.rules[0].verbs, vec!["*"]);
        assert!(inference.rules.iter().any(|r| r.resources == vec!["secrets"]
            && r.verbs == vec!["get", "list", "watch"]));
        assert!(inference.rules.iter().any(|r| r.resources == vec!["events"]));
    }

    #[test]
    fn test_templated_kinds_are_gaps() {
        let pkg = package(&[
            ("dynamic.yaml", "apiVersion: v1\nkind: {{ .Values.kind }}\n"),
            ("include.yaml", "{{ include \"app.resources\" . }}\n"),
            ("static.yaml", "apiVersion: v1\nkind: Secret\n"),
        ]);

        let inference = infer_rules(&gvr(), &pkg);
        assert_eq!(
            inference.gaps,
            vec!["app/templates/dynamic.yaml", "app/templates/include.yaml"]
        );
        assert!(inference.rules.iter().any(|r| r.resources == vec!["secrets"]
            && r.verbs.len() == MANAGE_VERBS.len()));
    }

    #[test]
    fn test_irregular_and_suffix_plurals() {
        assert_eq!(resource_for_kind("Endpoints"), "endpoints");
        assert_eq!(resource_for_kind("NetworkPolicy"), "networkpolicies");
        assert_eq!(resource_for_kind("Ingress"), "ingresses");
    }

    #[test]
    fn test_notes_and_tests_are_skipped() {
        let pkg = package(&[
            ("NOTES.txt", "Thanks for installing {{ .Chart.Name }}"),
            ("tests/test-connection.yaml", "apiVersion: v1\nkind: {{ .Values.kind }}\n"),
        ]);
        assert!(infer_rules(&gvr(), &pkg).gaps.is_empty());
    }
}
