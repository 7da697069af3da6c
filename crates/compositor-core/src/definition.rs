//! The CompositionDefinition resource
//!
//! A CompositionDefinition points at a chart. The controller derives an API
//! type from the chart's value schema, installs a CRD for it and deploys the
//! workload that reconciles instances of that type. Everything the controller
//! learns is written back into `status`.

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::chart::ChartRef;
use crate::error::Result;
use crate::gvk::{Gvk, Gvr};

/// Condition type carrying the lifecycle reason
pub const READY_CONDITION: &str = "Ready";

#[derive(CustomResource, Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "core.krateo.io",
    version = "v1alpha1",
    kind = "CompositionDefinition",
    shortname = "compdef",
    namespaced,
    status = "CompositionDefinitionStatus",
    printcolumn = r#"{"name": "API Version", "type": "string", "jsonPath": ".status.apiVersion"}"#,
    printcolumn = r#"{"name": "Kind", "type": "string", "jsonPath": ".status.kind"}"#,
    printcolumn = r#"{"name": "Ready", "type": "string", "jsonPath": ".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CompositionDefinitionSpec {
    pub chart: ChartRef,
}

/// Observed state written by the controller
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompositionDefinitionStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// apiVersion of the generated type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Kind of the generated type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Plural resource name of the generated type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed: Option<Managed>,

    #[serde(default, rename = "packageURL", skip_serializing_if = "Option::is_none")]
    pub package_url: Option<String>,

    /// Digest of the last successfully applied manifest set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The API type managed on behalf of a definition
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Managed {
    pub group: String,
    pub kind: String,
    #[serde(default)]
    pub version_info: Vec<VersionDetail>,
}

/// One API version produced by a definition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VersionDetail {
    pub version: String,
    pub served: bool,
    pub stored: bool,
    /// Chart the version was cut from (absent for the synthetic storage version)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartRef>,
}

/// Reason attached to the Ready condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionReason {
    Available,
    Unavailable,
    Creating,
    Updating,
    Deleting,
    ReconcileError,
}

impl ConditionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Unavailable => "Unavailable",
            Self::Creating => "Creating",
            Self::Updating => "Updating",
            Self::Deleting => "Deleting",
            Self::ReconcileError => "ReconcileError",
        }
    }

    fn status(&self) -> &'static str {
        match self {
            Self::Available => "True",
            _ => "False",
        }
    }
}

impl fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name and namespace of an object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub name: String,
    pub namespace: String,
}

impl NamespacedName {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl CompositionDefinition {
    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName::new(self.name_any(), self.namespace().unwrap_or_default())
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn finalizers_list(&self) -> &[String] {
        self.metadata.finalizers.as_deref().unwrap_or_default()
    }

    /// Status, created on first access
    pub fn status_mut(&mut self) -> &mut CompositionDefinitionStatus {
        self.status.get_or_insert_with(Default::default)
    }

    /// The API type recorded by the last successful create or update
    pub fn recorded_gvk(&self) -> Option<Gvk> {
        let status = self.status.as_ref()?;
        Gvk::from_api_version(status.api_version.as_deref()?, status.kind.as_deref()?).ok()
    }

    /// Group and kind this definition manages, from `status.managed` or `status.kind`
    pub fn managed_group_kind(&self) -> Option<(String, String)> {
        let status = self.status.as_ref()?;
        if let Some(managed) = &status.managed {
            return Some((managed.group.clone(), managed.kind.clone()));
        }
        self.recorded_gvk().map(|gvk| (gvk.group, gvk.kind))
    }
}

impl CompositionDefinitionStatus {
    /// Record the API coordinates of the generated type
    pub fn set_api(&mut self, gvk: &Gvk, gvr: &Gvr) {
        self.api_version = Some(gvk.api_version());
        self.kind = Some(gvk.kind.clone());
        self.resource = Some(gvr.resource.clone());
        let managed = self.managed.get_or_insert_with(Default::default);
        managed.group = gvk.group.clone();
        managed.kind = gvk.kind.clone();
    }

    pub fn version_info(&self) -> &[VersionDetail] {
        self.managed
            .as_ref()
            .map(|m| m.version_info.as_slice())
            .unwrap_or_default()
    }

    /// Append a version entry; existing entries are never replaced or removed
    ///
    /// An entry first seen on the live CRD has no chart snapshot yet; it gains
    /// the one recorded here. A snapshot already present is kept.
    pub fn record_version(&mut self, version: &str, chart: Option<&ChartRef>) {
        let managed = self.managed.get_or_insert_with(Default::default);
        if let Some(existing) = managed.version_info.iter_mut().find(|v| v.version == version) {
            if existing.chart.is_none() {
                existing.chart = chart.cloned();
            }
            return;
        }
        managed.version_info.push(VersionDetail {
            version: version.to_string(),
            served: true,
            stored: false,
            chart: chart.cloned(),
        });
    }

    /// Refresh served/stored flags from the live CRD versions
    ///
    /// Versions the CRD carries but the status does not know yet are appended
    /// without a chart snapshot.
    pub fn refresh_version_flags<'a>(
        &mut self,
        live: impl IntoIterator<Item = (&'a str, bool, bool)>,
    ) {
        let managed = self.managed.get_or_insert_with(Default::default);
        for (name, served, storage) in live {
            match managed.version_info.iter_mut().find(|v| v.version == name) {
                Some(detail) => {
                    detail.served = served;
                    detail.stored = storage;
                }
                None => managed.version_info.push(VersionDetail {
                    version: name.to_string(),
                    served,
                    stored: storage,
                    chart: None,
                }),
            }
        }
    }

    pub fn ready_condition(&self) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == READY_CONDITION)
    }

    /// Set the Ready condition, keeping the transition time when the status is unchanged
    pub fn set_condition(&mut self, reason: ConditionReason, message: impl Into<String>) {
        let status = reason.status();
        let message = message.into();
        let now = Time(Utc::now());

        match self.conditions.iter_mut().find(|c| c.type_ == READY_CONDITION) {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status.to_string();
                existing.reason = reason.as_str().to_string();
                existing.message = message;
            }
            None => self.conditions.push(Condition {
                type_: READY_CONDITION.to_string(),
                status: status.to_string(),
                reason: reason.as_str().to_string(),
                message,
                last_transition_time: now,
                observed_generation: None,
            }),
        }
    }

    pub fn is_available(&self) -> bool {
        self.ready_condition()
            .map(|c| c.reason == ConditionReason::Available.as_str())
            .unwrap_or(false)
    }
}

/// Parse a YAML CompositionDefinition
pub fn parse_definition(yaml: &str) -> Result<CompositionDefinition> {
    Ok(serde_yaml::from_str(yaml)?)
}
