//! Operator configuration from flags and environment

use clap::{Parser, ValueEnum};
use compositor_engine::DEFAULT_CONTROLLER_IMAGE;
use compositor_repo::DEFAULT_MAX_CHART_SIZE;
use std::path::PathBuf;
use std::time::Duration;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Compositor - turns Helm charts into versioned Kubernetes APIs
#[derive(Parser, Debug, Clone)]
#[command(name = "compositor", version, about, long_about = None)]
pub struct OperatorConfig {
    /// Namespace to watch for CompositionDefinitions (empty for all)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    pub namespace: String,

    /// Seconds between reconciliations of a healthy definition
    #[arg(long, env = "COMPOSITOR_POLL_INTERVAL", default_value_t = 180)]
    pub poll_interval: u64,

    /// Seconds before retrying a failed reconciliation
    #[arg(long, env = "COMPOSITOR_ERROR_BACKOFF", default_value_t = 15)]
    pub error_backoff: u64,

    /// Seconds one reconciliation may take
    #[arg(long, env = "COMPOSITOR_RECONCILE_TIMEOUT", default_value_t = 120)]
    pub reconcile_timeout: u64,

    /// Attempts for CRD writes that hit a conflict
    #[arg(long, env = "COMPOSITOR_MAX_RETRIES", default_value_t = 5)]
    pub max_retries: u32,

    /// Service fronting the conversion webhook
    #[arg(long, env = "COMPOSITOR_WEBHOOK_SERVICE_NAME", default_value = "compositor-webhook")]
    pub webhook_service_name: String,

    /// Namespace of the conversion webhook service
    #[arg(long, env = "COMPOSITOR_WEBHOOK_SERVICE_NAMESPACE", default_value = "krateo-system")]
    pub webhook_service_namespace: String,

    /// Directory holding the webhook TLS material
    #[arg(
        long,
        env = "COMPOSITOR_TLS_CERT_DIR",
        default_value = "/tmp/k8s-webhook-server/serving-certs"
    )]
    pub tls_cert_dir: PathBuf,

    /// Image of the per-version dynamic controller
    #[arg(long, env = "COMPOSITOR_CONTROLLER_IMAGE", default_value = DEFAULT_CONTROLLER_IMAGE)]
    pub controller_image: String,

    /// Tag of the dynamic controller image
    #[arg(long, env = "COMPOSITOR_CONTROLLER_IMAGE_TAG", default_value = "latest")]
    pub controller_image_tag: String,

    /// Largest chart archive accepted, in bytes
    #[arg(long, env = "COMPOSITOR_MAX_CHART_SIZE", default_value_t = DEFAULT_MAX_CHART_SIZE)]
    pub max_chart_size: u64,

    /// Reject chart versions whose schema is incompatible with the previous one
    #[arg(long, env = "COMPOSITOR_STRICT_COMPATIBILITY")]
    pub strict_compatibility: bool,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, env = "COMPOSITOR_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "COMPOSITOR_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Print the CompositionDefinition CRD and exit
    #[arg(long)]
    pub print_crd: bool,
}

impl OperatorConfig {
    /// `None` when watching every namespace
    pub fn watch_namespace(&self) -> Option<&str> {
        let ns = self.namespace.trim();
        (!ns.is_empty()).then_some(ns)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout)
    }

    /// Full reference of the dynamic controller image
    pub fn controller_image_ref(&self) -> String {
        format!("{}:{}", self.controller_image, self.controller_image_tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::try_parse_from(["compositor"]).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(180));
        assert_eq!(config.error_backoff(), Duration::from_secs(15));
        assert_eq!(config.reconcile_timeout(), Duration::from_secs(120));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.max_chart_size, 10 * 1024 * 1024);
        assert!(!config.strict_compatibility);
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_flags() {
        let config = OperatorConfig::try_parse_from([
            "compositor",
            "--namespace",
            "krateo-system",
            "--controller-image",
            "ghcr.io/example/controller",
            "--controller-image-tag",
            "0.4.1",
            "--strict-compatibility",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(config.watch_namespace(), Some("krateo-system"));
        assert_eq!(config.controller_image_ref(), "ghcr.io/example/controller:0.4.1");
        assert!(config.strict_compatibility);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_blank_namespace_watches_everything() {
        let config = OperatorConfig::try_parse_from(["compositor", "--namespace", " "]).unwrap();
        assert_eq!(config.watch_namespace(), None);
    }
}
