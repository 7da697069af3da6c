//! Helm repository index (`index.yaml`)

use serde::Deserialize;
use std::collections::HashMap;
use url::Url;

use crate::error::{RepoError, Result};

/// Index file name below the repository URL
pub const INDEX_FILE: &str = "index.yaml";

/// The parts of a Helm repository index chart resolution needs
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryIndex {
    #[serde(default)]
    pub api_version: String,

    /// Chart versions keyed by chart name
    #[serde(default)]
    pub entries: HashMap<String, Vec<ChartEntry>>,
}

/// One chart version in the index
#[derive(Debug, Clone, Deserialize)]
pub struct ChartEntry {
    pub name: String,
    pub version: String,
    /// Download URLs, absolute or relative to the repository URL
    #[serde(default)]
    pub urls: Vec<String>,
    /// SHA256 of the archive
    #[serde(default)]
    pub digest: Option<String>,
}

impl RepositoryIndex {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_yaml::from_slice(bytes).map_err(|e| RepoError::InvalidIndex {
            message: e.to_string(),
        })
    }

    /// The entry of `name` at exactly `version`
    pub fn get_version(&self, name: &str, version: &str) -> Option<&ChartEntry> {
        self.entries
            .get(name)?
            .iter()
            .find(|entry| entry.version == version)
    }
}

impl ChartEntry {
    /// First download URL, resolved against the repository URL
    pub fn download_url(&self, repo_url: &str) -> Result<Url> {
        let first = self.urls.first().ok_or_else(|| RepoError::InvalidIndex {
            message: format!("{}@{} has no download URL", self.name, self.version),
        })?;
        if let Ok(absolute) = Url::parse(first) {
            return Ok(absolute);
        }
        Ok(index_base(repo_url)?.join(first)?)
    }
}

/// Repository URL with a trailing slash, so relative joins stay below it
pub fn index_base(repo_url: &str) -> Result<Url> {
    let base = format!("{}/", repo_url.trim_end_matches('/'));
    Url::parse(&base).map_err(|e| RepoError::InvalidUrl {
        url: repo_url.to_string(),
        reason: e.to_string(),
    })
}

/// URL of the index file of a repository
pub fn index_url(repo_url: &str) -> Result<Url> {
    Ok(index_base(repo_url)?.join(INDEX_FILE)?)
}
