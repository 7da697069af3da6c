//! Chart references and resolved chart packages

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CoreError, Result};

/// File holding the chart's JSON value schema
pub const VALUES_SCHEMA_FILE: &str = "values.schema.json";

/// Chart metadata file
pub const CHART_FILE: &str = "Chart.yaml";

/// Where to fetch a chart from
///
/// Also used as the chart snapshot stored next to every API version, so a
/// superseded version can be undeployed with the chart it was built from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChartRef {
    /// Archive URL (`.tgz`) or Helm repository URL
    pub url: String,

    /// Chart version
    pub version: String,

    /// Chart name inside the repository (required for repository URLs)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,

    /// Basic-auth credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<ChartCredentials>,

    /// Skip TLS certificate verification
    #[serde(default, rename = "insecureSkipVerifyTLS")]
    pub insecure_skip_verify_tls: bool,
}

impl ChartRef {
    pub fn new(url: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = Some(repo.into());
        self
    }

    /// Whether `url` points directly at a chart archive
    pub fn is_archive_url(&self) -> bool {
        let path = self.url.split(['?', '#']).next().unwrap_or_default();
        path.ends_with(".tgz") || path.ends_with(".tar.gz")
    }

    /// Whether `url` is an OCI registry reference
    pub fn is_oci(&self) -> bool {
        self.url.starts_with("oci://")
    }

    /// Short human-readable reference for logs and errors
    pub fn display_ref(&self) -> String {
        match &self.repo {
            Some(repo) => format!("{}/{}@{}", self.url.trim_end_matches('/'), repo, self.version),
            None => format!("{}@{}", self.url, self.version),
        }
    }
}

/// Basic-auth credentials with the password stored in a Secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChartCredentials {
    pub username: String,
    pub password_ref: SecretKeyRef,
}

/// Reference to a key inside a Secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    pub namespace: String,
    pub key: String,
}

/// Credentials with the password read from the cluster
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for ResolvedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A fetched and unpacked chart, held in memory
#[derive(Debug, Clone, Default)]
pub struct ChartPackage {
    /// Chart name from Chart.yaml
    pub name: String,
    /// Chart version from Chart.yaml
    pub version: String,
    /// Root directory inside the archive (usually the chart name)
    pub root: String,
    /// URL the archive was downloaded from
    pub package_url: String,
    /// Archive files keyed by path relative to the archive root
    pub files: BTreeMap<String, Vec<u8>>,
}

impl ChartPackage {
    /// Read a file relative to the chart root
    pub fn file(&self, relative: &str) -> Option<&[u8]> {
        self.files
            .get(&self.rooted(relative))
            .map(Vec::as_slice)
    }

    /// The chart's JSON value schema
    pub fn values_schema(&self) -> Result<&[u8]> {
        self.file(VALUES_SCHEMA_FILE)
            .ok_or_else(|| CoreError::InvalidChart {
                message: format!(
                    "chart '{}' ({}) has no {}",
                    self.name, self.version, VALUES_SCHEMA_FILE
                ),
            })
    }

    /// Template files (`templates/**`), with paths relative to the chart root
    pub fn templates(&self) -> impl Iterator<Item = (&str, &[u8])> {
        let prefix = self.rooted("templates/");
        self.files.iter().filter_map(move |(path, content)| {
            path.strip_prefix(&prefix)
                .filter(|rest| !rest.is_empty())
                .map(|_| (path.as_str(), content.as_slice()))
        })
    }

    fn rooted(&self, relative: &str) -> String {
        if self.root.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", self.root.trim_end_matches('/'), relative)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package() -> ChartPackage {
        let mut files = BTreeMap::new();
        files.insert("fireworks-app/Chart.yaml".to_string(), b"name: fireworks-app".to_vec());
        files.insert("fireworks-app/values.schema.json".to_string(), b"{}".to_vec());
        files.insert(
            "fireworks-app/templates/deployment.yaml".to_string(),
            b"kind: Deployment".to_vec(),
        );
        files.insert("fireworks-app/templates/_helpers.tpl".to_string(), b"".to_vec());
        ChartPackage {
            name: "fireworks-app".to_string(),
            version: "1.1.13".to_string(),
            root: "fireworks-app".to_string(),
            package_url: "https://charts.example.com/fireworks-app-1.1.13.tgz".to_string(),
            files,
        }
    }

    #[test]
    fn test_values_schema() {
        assert_eq!(package().values_schema().unwrap(), b"{}");

        let mut missing = package();
        missing.files.remove("fireworks-app/values.schema.json");
        assert!(matches!(
            missing.values_schema(),
            Err(CoreError::InvalidChart { .. })
        ));
    }

    #[test]
    fn test_templates() {
        let pkg = package();
        let names: Vec<&str> = pkg.templates().map(|(p, _)| p).collect();
        assert_eq!(
            names,
            vec![
                "fireworks-app/templates/_helpers.tpl",
                "fireworks-app/templates/deployment.yaml"
            ]
        );
    }

    #[test]
    fn test_chart_ref_kinds() {
        let archive = ChartRef::new("https://example.com/charts/app-1.0.0.tgz", "1.0.0");
        assert!(archive.is_archive_url());
        assert!(!archive.is_oci());

        let repo = ChartRef::new("https://charts.example.com", "1.0.0").with_repo("app");
        assert!(!repo.is_archive_url());
        assert_eq!(repo.display_ref(), "https://charts.example.com/app@1.0.0");

        let oci = ChartRef::new("oci://registry.example.com/app", "1.0.0");
        assert!(oci.is_oci());
    }

    #[test]
    fn test_chart_ref_serde_field_names() {
        let json = serde_json::json!({
            "url": "https://example.com/app-1.0.0.tgz",
            "version": "1.0.0",
            "insecureSkipVerifyTLS": true,
            "credentials": {
                "username": "bot",
                "passwordRef": {"name": "repo-secret", "namespace": "krateo-system", "key": "token"}
            }
        });
        let chart: ChartRef = serde_json::from_value(json).unwrap();
        assert!(chart.insecure_skip_verify_tls);
        assert_eq!(chart.credentials.unwrap().password_ref.key, "token");
    }

    #[test]
    fn test_resolved_credentials_debug_redacts_password() {
        let creds = ResolvedCredentials {
            username: "bot".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
