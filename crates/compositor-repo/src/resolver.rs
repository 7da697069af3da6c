//! `ChartResolver` over HTTP(S)

use async_trait::async_trait;
use compositor_core::{ChartPackage, ChartRef, ChartResolver, ResolvedCredentials};
use std::time::Duration;

use crate::archive;
use crate::client::{ChartHttpClient, ClientOptions};
use crate::error::{RepoError, Result};
use crate::index::{RepositoryIndex, index_url};

/// Unpacked archives may be this many times larger than the download limit
const UNPACK_RATIO: u64 = 16;

/// Resolves chart archives and Helm repository entries over HTTP(S)
#[derive(Debug, Clone)]
pub struct HttpChartResolver {
    max_size: u64,
    timeout: Duration,
}

impl Default for HttpChartResolver {
    fn default() -> Self {
        Self::new(crate::DEFAULT_MAX_CHART_SIZE)
    }
}

impl HttpChartResolver {
    pub fn new(max_size: u64) -> Self {
        Self {
            max_size,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fetch and unpack `chart`
    pub async fn fetch(
        &self,
        chart: &ChartRef,
        credentials: Option<&ResolvedCredentials>,
    ) -> Result<ChartPackage> {
        if chart.is_oci() {
            return Err(RepoError::Unsupported {
                reference: chart.display_ref(),
            });
        }
        if !(chart.url.starts_with("http://") || chart.url.starts_with("https://")) {
            return Err(RepoError::InvalidUrl {
                url: chart.url.clone(),
                reason: "expected an http(s) URL".to_string(),
            });
        }

        let options = ClientOptions {
            max_size: self.max_size,
            timeout: self.timeout,
            insecure_skip_verify_tls: chart.insecure_skip_verify_tls,
        };
        let client = ChartHttpClient::new(&options, credentials.cloned())?;

        let (package_url, digest) = if chart.is_archive_url() {
            (chart.url.clone(), None)
        } else {
            self.locate_in_index(&client, chart).await?
        };

        tracing::debug!(url = %package_url, "Downloading chart");
        let data = client.get_bytes(&package_url).await?;

        if let Some(expected) = digest {
            let actual = compute_digest(&data);
            if !digest_matches(&expected, &actual) {
                return Err(RepoError::IntegrityCheckFailed {
                    name: chart.display_ref(),
                    expected,
                    actual,
                });
            }
        }

        let package = archive::extract(
            &data,
            &package_url,
            self.max_size.saturating_mul(UNPACK_RATIO),
        )?;
        tracing::info!(
            chart = %package.name,
            version = %package.version,
            url = %package_url,
            "Resolved chart"
        );
        Ok(package)
    }

    /// Download URL and digest of `repo@version` from the repository index
    async fn locate_in_index(
        &self,
        client: &ChartHttpClient,
        chart: &ChartRef,
    ) -> Result<(String, Option<String>)> {
        let name = chart.repo.as_deref().ok_or_else(|| RepoError::InvalidUrl {
            url: chart.url.clone(),
            reason: "repository URLs need the chart name in `repo`".to_string(),
        })?;

        let index_url = index_url(&chart.url)?;
        tracing::debug!(url = %index_url, "Fetching repository index");
        let index = RepositoryIndex::from_bytes(&client.get_bytes(index_url.as_str()).await?)?;

        let entry =
            index
                .get_version(name, &chart.version)
                .ok_or_else(|| RepoError::VersionNotFound {
                    name: name.to_string(),
                    version: chart.version.clone(),
                    repo: chart.url.clone(),
                })?;
        Ok((
            entry.download_url(&chart.url)?.to_string(),
            entry.digest.clone(),
        ))
    }
}

#[async_trait]
impl ChartResolver for HttpChartResolver {
    async fn resolve(
        &self,
        chart: &ChartRef,
        credentials: Option<&ResolvedCredentials>,
    ) -> compositor_core::Result<ChartPackage> {
        let package = self.fetch(chart, credentials).await?;
        // Schema presence is part of a successful resolution
        package.values_schema()?;
        Ok(package)
    }
}

/// SHA256 of data, hex encoded
fn compute_digest(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

/// Compare digests, tolerating a `sha256:` prefix and case
fn digest_matches(expected: &str, actual: &str) -> bool {
    let normalize = |d: &str| {
        d.trim()
            .to_lowercase()
            .trim_start_matches("sha256:")
            .to_string()
    };
    normalize(expected) == normalize(actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_matches() {
        let digest = compute_digest(b"chart");
        assert!(digest_matches(&digest, &digest));
        assert!(digest_matches(&format!("sha256:{}", digest.to_uppercase()), &digest));
        assert!(!digest_matches("deadbeef", &digest));
    }

    #[tokio::test]
    async fn test_oci_is_unsupported() {
        let chart = ChartRef::new("oci://registry.example.com/charts/app", "1.0.0");
        let err = HttpChartResolver::default().fetch(&chart, None).await.unwrap_err();
        assert!(matches!(err, RepoError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_repository_url_needs_chart_name() {
        let chart = ChartRef::new("https://charts.example.com", "1.0.0");
        let err = HttpChartResolver::default().fetch(&chart, None).await.unwrap_err();
        assert!(matches!(err, RepoError::InvalidUrl { .. }));
    }
}
