//! API coordinates and the naming rules that derive them from a chart
//!
//! A chart named `fireworks-app` at version `1.1.13` produces the API type
//! `composition.krateo.io/v1-1-13, Kind=FireworksApp`, served under the
//! plural resource `fireworksapps`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};

/// API group of every generated composition type
pub const COMPOSITION_GROUP: &str = "composition.krateo.io";

/// Name of the synthetic storage version
pub const VACUUM_VERSION: &str = "vacuum";

/// Group-Version-Kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Derive the composition type for a chart name and chart version
    pub fn for_chart(chart_name: &str, chart_version: &str) -> Result<Self> {
        Ok(Self {
            group: COMPOSITION_GROUP.to_string(),
            version: version_for_chart(chart_version)?,
            kind: kind_for_chart(chart_name)?,
        })
    }

    /// Parse from an `apiVersion` string (`group/version` or core `version`) and a kind
    pub fn from_api_version(api_version: &str, kind: &str) -> Result<Self> {
        if api_version.is_empty() || kind.is_empty() {
            return Err(CoreError::InvalidGvk {
                message: format!("apiVersion '{}' / kind '{}' incomplete", api_version, kind),
            });
        }
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version),
        };
        Ok(Self::new(group, version, kind))
    }

    /// `group/version`, or just `version` for the core group
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Same group and kind, regardless of version
    pub fn same_group_kind(&self, other: &Gvk) -> bool {
        self.group == other.group && self.kind == other.kind
    }

    /// Attach a plural resource name
    pub fn to_gvr(&self, plural: impl Into<String>) -> Gvr {
        Gvr::new(self.group.clone(), self.version.clone(), plural)
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

/// Group-Version-Resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvr {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl Gvr {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Name of the CRD that declares this resource (`<plural>.<group>`)
    pub fn crd_name(&self) -> String {
        format!("{}.{}", self.resource, self.group)
    }

    pub fn with_version(&self, version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..self.clone()
        }
    }
}

impl fmt::Display for Gvr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Resource={}", self.api_version(), self.resource)
    }
}

/// Convert a chart version into an API version name
///
/// `1.1.13` becomes `v1-1-13`; pre-release and build separators become dashes.
pub fn version_for_chart(chart_version: &str) -> Result<String> {
    let trimmed = chart_version.trim().trim_start_matches('v');
    let parsed = semver::Version::parse(trimmed)?;
    let normalized: String = parsed
        .to_string()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    Ok(format!("v{}", normalized.trim_end_matches('-')))
}

/// Convert a chart name into a Kind (`fireworks-app` becomes `FireworksApp`)
pub fn kind_for_chart(chart_name: &str) -> Result<String> {
    let kind: String = chart_name
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();

    match kind.chars().next() {
        Some(c) if c.is_ascii_alphabetic() => Ok(kind),
        _ => Err(CoreError::InvalidGvk {
            message: format!("chart name '{}' does not yield a valid kind", chart_name),
        }),
    }
}

/// Guess the plural resource name for a kind, following English suffix rules
pub fn plural_for_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s')
        || lower.ends_with('x')
        || lower.ends_with('z')
        || lower.ends_with("ch")
        || lower.ends_with("sh")
    {
        format!("{}es", lower)
    } else if lower.ends_with('y')
        && !lower.ends_with("ay")
        && !lower.ends_with("ey")
        && !lower.ends_with("oy")
        && !lower.ends_with("uy")
    {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}
