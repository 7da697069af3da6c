//! Conversion webhook certificates read from disk
//!
//! The serving certificate is provisioned outside the controller (cert-manager
//! or a mounted Secret). The controller only needs the CA bundle to inject
//! into CRDs, and checks the material is present before relying on it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use compositor_core::{CertificateManager, CoreError, Gvr};
use tracing::debug;

/// CA bundle file name
pub const CA_FILE: &str = "ca.crt";

/// Serving certificate, used as CA when no separate CA file exists
pub const CERT_FILE: &str = "tls.crt";

const PEM_CERTIFICATE: &str = "-----BEGIN CERTIFICATE-----";

/// `CertificateManager` backed by a certificate directory
#[derive(Debug, Clone)]
pub struct FileCertificateManager {
    dir: PathBuf,
    service_name: String,
    service_namespace: String,
}

impl FileCertificateManager {
    pub fn new(
        dir: impl Into<PathBuf>,
        service_name: impl Into<String>,
        service_namespace: impl Into<String>,
    ) -> Self {
        Self {
            dir: dir.into(),
            service_name: service_name.into(),
            service_namespace: service_namespace.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_bundle(&self) -> compositor_core::Result<Vec<u8>> {
        for file in [CA_FILE, CERT_FILE] {
            let path = self.dir.join(file);
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    if !String::from_utf8_lossy(&bytes).contains(PEM_CERTIFICATE) {
                        return Err(CoreError::Certificate {
                            message: format!("{} is not a PEM certificate", path.display()),
                        });
                    }
                    debug!(path = %path.display(), "Loaded CA bundle");
                    return Ok(bytes);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(CoreError::Certificate {
                        message: format!("failed to read {}: {}", path.display(), e),
                    });
                }
            }
        }
        Err(CoreError::Certificate {
            message: format!(
                "no {} or {} in {}",
                CA_FILE,
                CERT_FILE,
                self.dir.display()
            ),
        })
    }
}

#[async_trait]
impl CertificateManager for FileCertificateManager {
    async fn manage_certificates(&self, gvr: &Gvr) -> compositor_core::Result<()> {
        self.read_bundle().await?;
        debug!(gvr = %gvr, "Conversion certificates in place");
        Ok(())
    }

    async fn ca_bundle(&self) -> compositor_core::Result<Vec<u8>> {
        self.read_bundle().await
    }

    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn service_namespace(&self) -> &str {
        &self.service_namespace
    }
}
