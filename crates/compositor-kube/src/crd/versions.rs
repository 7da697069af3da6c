//! Multi-version CRD merging
//!
//! Every chart version becomes one API version of the same CRD. The first
//! version is created on its own; once a second one is appended the CRD gets
//! a synthetic `vacuum` version that is the sole storage version from then
//! on. Real versions are served but never stored, so instances written under
//! any of them survive the arrival of the next one.

use std::collections::BTreeMap;

use compositor_core::{Gvk, Gvr, SchemaCompiler, VACUUM_VERSION, digest_value};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionVersion, CustomResourceSubresourceStatus,
    CustomResourceSubresources, CustomResourceValidation, JSONSchemaProps,
};
use serde_json::Value;

use crate::error::{KubeError, Result};

/// Build the single-version CRD for a chart's value schema
pub fn generate_crd(
    compiler: &dyn SchemaCompiler,
    schema: &[u8],
    gvk: &Gvk,
) -> Result<CustomResourceDefinition> {
    Ok(compiler.compile(gvk, Some(schema))?)
}

/// Learn the plural resource name of `gvk` without a value schema
///
/// Used when discovery does not know the type yet.
pub fn gvr_from_generated_crd(compiler: &dyn SchemaCompiler, gvk: &Gvk) -> Result<Gvr> {
    let crd = compiler.compile(gvk, None)?;
    Ok(gvk.to_gvr(crd.spec.names.plural))
}

/// The permissive storage version
pub fn vacuum_version() -> CustomResourceDefinitionVersion {
    CustomResourceDefinitionVersion {
        name: VACUUM_VERSION.to_string(),
        served: false,
        storage: true,
        schema: Some(CustomResourceValidation {
            open_api_v3_schema: Some(JSONSchemaProps {
                type_: Some("object".to_string()),
                x_kubernetes_preserve_unknown_fields: Some(true),
                ..Default::default()
            }),
        }),
        subresources: Some(CustomResourceSubresources {
            status: Some(CustomResourceSubresourceStatus(Value::Object(Default::default()))),
            scale: None,
        }),
        ..Default::default()
    }
}

/// Names of the versions the CRD declares, in order
pub fn version_names(crd: &CustomResourceDefinition) -> Vec<&str> {
    crd.spec.versions.iter().map(|v| v.name.as_str()).collect()
}

pub fn has_version(crd: &CustomResourceDefinition, name: &str) -> bool {
    crd.spec.versions.iter().any(|v| v.name == name)
}

/// Merge the version(s) of `fragment` into `existing`
///
/// Idempotent: when every fragment version already exists the CRD is returned
/// unchanged. Otherwise new versions are appended, `vacuum` is added if
/// missing, and every real version is set to served and not stored. Versions
/// are never removed.
pub fn append_version(
    existing: &CustomResourceDefinition,
    fragment: &CustomResourceDefinition,
) -> CustomResourceDefinition {
    let new_versions: Vec<&CustomResourceDefinitionVersion> = fragment
        .spec
        .versions
        .iter()
        .filter(|v| !has_version(existing, &v.name))
        .collect();

    if new_versions.is_empty() {
        return existing.clone();
    }

    let mut merged = existing.clone();
    merged
        .spec
        .versions
        .extend(new_versions.into_iter().cloned());

    if !has_version(&merged, VACUUM_VERSION) {
        merged.spec.versions.push(vacuum_version());
    }

    for version in &mut merged.spec.versions {
        if version.name == VACUUM_VERSION {
            version.served = false;
            version.storage = true;
        } else {
            version.served = true;
            version.storage = false;
        }
    }

    merged
}

/// Copy the `status` schema of `fragment`'s version onto every version of `crd`
pub fn update_status(
    crd: &mut CustomResourceDefinition,
    fragment: &CustomResourceDefinitionVersion,
) -> Result<()> {
    let status = fragment
        .schema
        .as_ref()
        .and_then(|s| s.open_api_v3_schema.as_ref())
        .and_then(|s| s.properties.as_ref())
        .and_then(|p| p.get("status"))
        .cloned()
        .ok_or_else(|| KubeError::MissingSchema {
            crd: crd_name(crd),
            version: fragment.name.clone(),
        })?;

    for version in &mut crd.spec.versions {
        let validation = version
            .schema
            .get_or_insert_with(CustomResourceValidation::default);
        let root = validation
            .open_api_v3_schema
            .get_or_insert_with(|| JSONSchemaProps {
                type_: Some("object".to_string()),
                ..Default::default()
            });
        root.properties
            .get_or_insert_with(BTreeMap::new)
            .insert("status".to_string(), status.clone());
    }

    Ok(())
}

/// Compare the status schemas of two CRDs
///
/// Each side uses its first version that declares a `status` property. The
/// schemas are compared by digest, with `required` lists sorted so ordering
/// does not matter.
pub fn status_equal(a: &CustomResourceDefinition, b: &CustomResourceDefinition) -> Result<bool> {
    Ok(status_digest(a)? == status_digest(b)?)
}

fn status_digest(crd: &CustomResourceDefinition) -> Result<String> {
    let status = crd
        .spec
        .versions
        .iter()
        .filter_map(|v| {
            v.schema
                .as_ref()?
                .open_api_v3_schema
                .as_ref()?
                .properties
                .as_ref()?
                .get("status")
        })
        .next()
        .ok_or_else(|| KubeError::NoStatusVersion { crd: crd_name(crd) })?;

    let mut value = serde_json::to_value(status)?;
    sort_required(&mut value);
    Ok(digest_value(&value))
}

fn sort_required(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if key == "required" {
                    if let Value::Array(items) = child {
                        items.sort_by_key(|v| v.as_str().map(str::to_string));
                    }
                } else {
                    sort_required(child);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(sort_required),
        _ => {}
    }
}

/// Set the flags of one version; absent versions are ignored
pub fn set_served_storage(
    crd: &mut CustomResourceDefinition,
    version: &str,
    served: bool,
    storage: bool,
) {
    if let Some(v) = crd.spec.versions.iter_mut().find(|v| v.name == version) {
        v.served = served;
        v.storage = storage;
    }
}

/// Versions flagged as storage
pub fn storage_versions(crd: &CustomResourceDefinition) -> Vec<&str> {
    crd.spec
        .versions
        .iter()
        .filter(|v| v.storage)
        .map(|v| v.name.as_str())
        .collect()
}

pub(crate) fn crd_name(crd: &CustomResourceDefinition) -> String {
    crd.metadata
        .name
        .clone()
        .unwrap_or_else(|| format!("{}.{}", crd.spec.names.plural, crd.spec.group))
}
