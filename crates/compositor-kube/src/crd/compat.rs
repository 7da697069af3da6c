//! Backward compatibility between spec schemas of consecutive versions
//!
//! Conversion between versions copies fields verbatim, so an instance written
//! under the previous version must still be valid under the next one. This
//! check reports the changes that break that: removed fields, changed types
//! and fields that became required.

use std::collections::BTreeSet;
use std::fmt;

use compositor_core::VACUUM_VERSION;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionVersion, JSONSchemaProps,
    JSONSchemaPropsOrArray,
};

/// A change that breaks existing instances
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaIssue {
    FieldRemoved { path: String },
    TypeChanged { path: String, from: String, to: String },
    NewlyRequired { path: String },
}

impl fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FieldRemoved { path } => write!(f, "field {} removed", path),
            Self::TypeChanged { path, from, to } => {
                write!(f, "field {} changed type from {} to {}", path, from, to)
            }
            Self::NewlyRequired { path } => write!(f, "field {} is now required", path),
        }
    }
}

/// The most recently appended real version
pub fn latest_real_version(
    crd: &CustomResourceDefinition,
) -> Option<&CustomResourceDefinitionVersion> {
    crd.spec
        .versions
        .iter()
        .rev()
        .find(|v| v.name != VACUUM_VERSION)
}

/// Compare the `spec` schemas of two versions
pub fn check_compatibility(
    previous: &CustomResourceDefinitionVersion,
    next: &CustomResourceDefinitionVersion,
) -> Vec<SchemaIssue> {
    let mut issues = Vec::new();
    if let (Some(old), Some(new)) = (spec_schema(previous), spec_schema(next)) {
        compare(old, new, "spec", &mut issues);
    }
    issues
}

fn spec_schema(version: &CustomResourceDefinitionVersion) -> Option<&JSONSchemaProps> {
    version
        .schema
        .as_ref()?
        .open_api_v3_schema
        .as_ref()?
        .properties
        .as_ref()?
        .get("spec")
}

fn compare(
    old: &JSONSchemaProps,
    new: &JSONSchemaProps,
    path: &str,
    issues: &mut Vec<SchemaIssue>,
) {
    // Unknown fields are kept; nothing below can break
    if new.x_kubernetes_preserve_unknown_fields == Some(true) && new.properties.is_none() {
        return;
    }

    if let (Some(from), Some(to)) = (&old.type_, &new.type_) {
        if from != to {
            issues.push(SchemaIssue::TypeChanged {
                path: path.to_string(),
                from: from.clone(),
                to: to.clone(),
            });
            return;
        }
    }

    let old_required: BTreeSet<&String> = old.required.iter().flatten().collect();
    for field in new.required.iter().flatten() {
        if !old_required.contains(field) {
            issues.push(SchemaIssue::NewlyRequired {
                path: format!("{}.{}", path, field),
            });
        }
    }

    if let Some(old_props) = &old.properties {
        let new_props = new.properties.as_ref();
        for (name, old_child) in old_props {
            let child_path = format!("{}.{}", path, name);
            match new_props.and_then(|p| p.get(name)) {
                Some(new_child) => compare(old_child, new_child, &child_path, issues),
                None => issues.push(SchemaIssue::FieldRemoved { path: child_path }),
            }
        }
    }

    if let (
        Some(JSONSchemaPropsOrArray::Schema(old_items)),
        Some(JSONSchemaPropsOrArray::Schema(new_items)),
    ) = (&old.items, &new.items)
    {
        compare(old_items, new_items, &format!("{}[]", path), issues);
    }
}
