//! In-memory chart archive extraction

use compositor_core::ChartPackage;
use compositor_core::chart::CHART_FILE;
use flate2::read::GzDecoder;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Component;
use tar::{Archive, EntryType};

use crate::error::{RepoError, Result};

/// Fields of `Chart.yaml` the resolver reads
#[derive(Debug, Clone, Deserialize)]
pub struct ChartMetadata {
    pub name: String,
    pub version: String,
}

/// Unpack a `.tgz` chart archive into a [`ChartPackage`]
///
/// Only regular files are kept. The chart root is the directory holding the
/// shallowest `Chart.yaml`. `max_unpacked` bounds the total size of the
/// extracted files.
pub fn extract(data: &[u8], package_url: &str, max_unpacked: u64) -> Result<ChartPackage> {
    let mut archive = Archive::new(GzDecoder::new(data));
    let mut files = BTreeMap::new();
    let mut unpacked: u64 = 0;

    for entry in archive.entries().map_err(invalid)? {
        let mut entry = entry.map_err(invalid)?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }

        let path = entry.path().map_err(invalid)?.into_owned();
        if path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(RepoError::InvalidArchive {
                message: format!("unsafe path in archive: {}", path.display()),
            });
        }
        let key = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");

        unpacked += entry.size();
        if unpacked > max_unpacked {
            return Err(RepoError::SizeLimitExceeded {
                size: unpacked,
                limit: max_unpacked,
            });
        }

        let mut content = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut content)?;
        files.insert(key, content);
    }

    let root = detect_root(&files)?;
    let chart_file = if root.is_empty() {
        CHART_FILE.to_string()
    } else {
        format!("{}/{}", root, CHART_FILE)
    };
    let raw = files.get(&chart_file).map(Vec::as_slice).unwrap_or_default();
    let metadata: ChartMetadata =
        serde_yaml::from_slice(raw).map_err(|e| RepoError::InvalidArchive {
            message: format!("{}: {}", chart_file, e),
        })?;

    tracing::debug!(
        chart = %metadata.name,
        version = %metadata.version,
        files = files.len(),
        "Extracted chart archive"
    );

    Ok(ChartPackage {
        name: metadata.name,
        version: metadata.version,
        root,
        package_url: package_url.to_string(),
        files,
    })
}

fn detect_root(files: &BTreeMap<String, Vec<u8>>) -> Result<String> {
    files
        .keys()
        .filter_map(|path| match path.rsplit_once('/') {
            Some((dir, CHART_FILE)) => Some(dir.to_string()),
            None if path == CHART_FILE => Some(String::new()),
            _ => None,
        })
        .min_by_key(|dir| (dir.matches('/').count() + usize::from(!dir.is_empty()), dir.clone()))
        .ok_or_else(|| RepoError::InvalidArchive {
            message: format!("no {} in archive", CHART_FILE),
        })
}

fn invalid(err: std::io::Error) -> RepoError {
    RepoError::InvalidArchive {
        message: err.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    /// Build a `.tgz` from (path, content) pairs
    pub(crate) fn tgz(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_extract_chart() {
        let data = tgz(&[
            ("fireworks-app/Chart.yaml", "apiVersion: v2\nname: fireworks-app\nversion: 1.1.13\n"),
            ("fireworks-app/values.schema.json", "{\"type\": \"object\"}"),
            ("fireworks-app/templates/service.yaml", "kind: Service"),
            ("fireworks-app/charts/sub/Chart.yaml", "name: sub\nversion: 0.1.0\n"),
        ]);

        let package =
            extract(&data, "https://example.com/fireworks-app-1.1.13.tgz", 1 << 20).unwrap();
        assert_eq!(package.name, "fireworks-app");
        assert_eq!(package.version, "1.1.13");
        assert_eq!(package.root, "fireworks-app");
        assert_eq!(package.values_schema().unwrap(), b"{\"type\": \"object\"}");
        assert_eq!(package.templates().count(), 1);
    }

    #[test]
    fn test_extract_flat_archive() {
        let data = tgz(&[("Chart.yaml", "name: flat\nversion: 2.0.0\n")]);
        let package = extract(&data, "https://example.com/flat.tgz", 1 << 20).unwrap();
        assert_eq!(package.root, "");
        assert_eq!(package.name, "flat");
    }

    #[test]
    fn test_missing_chart_file() {
        let data = tgz(&[("app/values.yaml", "a: 1")]);
        assert!(matches!(
            extract(&data, "u", 1 << 20),
            Err(RepoError::InvalidArchive { .. })
        ));
    }

    #[test]
    fn test_unpacked_limit() {
        let big = "x".repeat(4096);
        let data = tgz(&[("app/Chart.yaml", "name: app\nversion: 1.0.0\n"), ("app/blob", &big)]);
        assert!(matches!(
            extract(&data, "u", 1024),
            Err(RepoError::SizeLimitExceeded { limit: 1024, .. })
        ));
    }

    #[test]
    fn test_not_gzip() {
        assert!(extract(b"definitely not a tarball", "u", 1 << 20).is_err());
    }
}
