//! Compositor Repo - Chart resolution
//!
//! Fetches the chart a `CompositionDefinition` points at:
//! - **Archives**: `http(s)://.../<chart>-<version>.tgz`, downloaded as is
//! - **Helm repositories**: `index.yaml` lookup of `repo` at an exact version
//! - **Security**: credentials scoped to the origin, size limits, optional TLS skip
//!
//! Archives are unpacked in memory into a [`compositor_core::ChartPackage`].

pub mod archive;
pub mod client;
pub mod error;
pub mod index;
pub mod resolver;

pub use client::{ChartHttpClient, ClientOptions};
pub use error::{RepoError, Result};
pub use index::{ChartEntry, RepositoryIndex};
pub use resolver::HttpChartResolver;

/// Default limit on downloaded chart archives (10 MiB)
pub const DEFAULT_MAX_CHART_SIZE: u64 = 10 * 1024 * 1024;
