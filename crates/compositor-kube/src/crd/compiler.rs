//! JSON Schema to CRD compilation
//!
//! A chart's `values.schema.json` becomes the `spec` schema of one CRD
//! version. Keywords the API server refuses in structural schemas are
//! rewritten or dropped; the `status` schema is the same for every
//! composition type.

use compositor_core::gvk::plural_for_kind;
use compositor_core::labels::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use compositor_core::{CoreError, Gvk, SchemaCompiler};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceColumnDefinition, CustomResourceDefinition, CustomResourceDefinitionNames,
    CustomResourceDefinitionSpec, CustomResourceDefinitionVersion,
    CustomResourceSubresourceStatus, CustomResourceSubresources, CustomResourceValidation,
    JSONSchemaProps,
};
use kube::api::ObjectMeta;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

/// Category every generated type is listed under (`kubectl get compositions`)
pub const COMPOSITIONS_CATEGORY: &str = "compositions";

/// Keywords dropped from chart schemas
const UNSUPPORTED_KEYWORDS: &[&str] = &[
    "$schema",
    "$id",
    "$comment",
    "$defs",
    "definitions",
    "additionalItems",
    "examples",
    "readOnly",
    "writeOnly",
];

/// Schema compiler producing OpenAPI v3 CRD versions
#[derive(Debug, Clone, Default)]
pub struct OpenApiCompiler;

impl OpenApiCompiler {
    pub fn new() -> Self {
        Self
    }

    /// Parse, validate and sanitize a chart value schema
    fn spec_schema(&self, raw: &[u8]) -> compositor_core::Result<JSONSchemaProps> {
        let mut schema: Value =
            serde_json::from_slice(raw).map_err(|e| CoreError::InvalidSchema {
                message: format!("values schema is not valid JSON: {}", e),
            })?;

        if !schema.is_object() {
            return Err(CoreError::InvalidSchema {
                message: "values schema must be a JSON object".to_string(),
            });
        }

        jsonschema::validator_for(&schema).map_err(|e| CoreError::InvalidSchema {
            message: format!("Invalid schema: {}", e),
        })?;

        sanitize(&mut schema);
        if let Value::Object(root) = &mut schema {
            root.entry("type").or_insert_with(|| json!("object"));
        }

        serde_json::from_value(schema).map_err(|e| CoreError::InvalidSchema {
            message: format!("values schema cannot be expressed as OpenAPI v3: {}", e),
        })
    }
}

impl SchemaCompiler for OpenApiCompiler {
    fn compile(
        &self,
        gvk: &Gvk,
        schema: Option<&[u8]>,
    ) -> compositor_core::Result<CustomResourceDefinition> {
        let (spec, status) = match schema {
            Some(raw) => (self.spec_schema(raw)?, status_schema()?),
            None => (preserve_unknown(), preserve_unknown()),
        };

        let root = JSONSchemaProps {
            type_: Some("object".to_string()),
            properties: Some(BTreeMap::from([
                ("spec".to_string(), spec),
                ("status".to_string(), status),
            ])),
            ..Default::default()
        };

        let plural = plural_for_kind(&gvk.kind);
        let version = CustomResourceDefinitionVersion {
            name: gvk.version.clone(),
            served: true,
            storage: true,
            schema: Some(CustomResourceValidation {
                open_api_v3_schema: Some(root),
            }),
            subresources: Some(CustomResourceSubresources {
                status: Some(CustomResourceSubresourceStatus(Value::Object(Map::new()))),
                scale: None,
            }),
            additional_printer_columns: Some(vec![
                printer_column("Ready", "string", ".status.conditions[?(@.type=='Ready')].status"),
                printer_column("Age", "date", ".metadata.creationTimestamp"),
            ]),
            ..Default::default()
        };

        Ok(CustomResourceDefinition {
            metadata: ObjectMeta {
                name: Some(format!("{}.{}", plural, gvk.group)),
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    MANAGED_BY_VALUE.to_string(),
                )])),
                ..Default::default()
            },
            spec: CustomResourceDefinitionSpec {
                group: gvk.group.clone(),
                names: CustomResourceDefinitionNames {
                    kind: gvk.kind.clone(),
                    list_kind: Some(format!("{}List", gvk.kind)),
                    singular: Some(gvk.kind.to_lowercase()),
                    plural,
                    categories: Some(vec![COMPOSITIONS_CATEGORY.to_string()]),
                    short_names: None,
                },
                scope: "Namespaced".to_string(),
                versions: vec![version],
                conversion: None,
                preserve_unknown_fields: None,
            },
            status: None,
        })
    }
}

fn printer_column(name: &str, type_: &str, path: &str) -> CustomResourceColumnDefinition {
    CustomResourceColumnDefinition {
        name: name.to_string(),
        type_: type_.to_string(),
        json_path: path.to_string(),
        ..Default::default()
    }
}

fn preserve_unknown() -> JSONSchemaProps {
    JSONSchemaProps {
        type_: Some("object".to_string()),
        x_kubernetes_preserve_unknown_fields: Some(true),
        ..Default::default()
    }
}

/// Status reported by the workload controller for every composition
fn status_schema() -> compositor_core::Result<JSONSchemaProps> {
    let schema = json!({
        "type": "object",
        "properties": {
            "conditions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["type", "status", "lastTransitionTime"],
                    "properties": {
                        "type": {"type": "string"},
                        "status": {"type": "string"},
                        "reason": {"type": "string"},
                        "message": {"type": "string"},
                        "lastTransitionTime": {"type": "string", "format": "date-time"}
                    }
                }
            },
            "failedObjectRef": {
                "type": "object",
                "properties": {
                    "apiVersion": {"type": "string"},
                    "kind": {"type": "string"},
                    "name": {"type": "string"},
                    "namespace": {"type": "string"}
                }
            },
            "helmChartUrl": {"type": "string"},
            "helmChartVersion": {"type": "string"},
            "digest": {"type": "string"},
            "managed": {
                "type": "array",
                "items": {
                    "type": "object",
                    "x-kubernetes-preserve-unknown-fields": true
                }
            }
        }
    });
    Ok(serde_json::from_value(schema)?)
}

/// Rewrite a JSON Schema into the subset structural CRD schemas accept
fn sanitize(value: &mut Value) {
    let Value::Object(map) = value else {
        return;
    };

    for keyword in UNSUPPORTED_KEYWORDS {
        map.remove(*keyword);
    }

    if let Some(constant) = map.remove("const") {
        map.insert("enum".to_string(), Value::Array(vec![constant]));
    }

    // ["string", "null"] becomes a nullable string
    if let Some(Value::Array(types)) = map.get("type").cloned() {
        let nullable = types.iter().any(|t| t == "null");
        match types.into_iter().find(|t| t != "null") {
            Some(t) => {
                map.insert("type".to_string(), t);
            }
            None => {
                map.remove("type");
            }
        }
        if nullable {
            map.insert("nullable".to_string(), Value::Bool(true));
        }
    }

    if map.contains_key("properties") && map.contains_key("additionalProperties") {
        map.remove("additionalProperties");
    }

    if let Some(Value::Object(properties)) = map.get_mut("properties") {
        properties.values_mut().for_each(sanitize);
    }
    if let Some(items) = map.get_mut("items") {
        match items {
            Value::Array(list) => list.iter_mut().for_each(sanitize),
            other => sanitize(other),
        }
    }
    if let Some(additional) = map.get_mut("additionalProperties") {
        sanitize(additional);
    }
    for combinator in ["allOf", "anyOf", "oneOf"] {
        if let Some(Value::Array(list)) = map.get_mut(combinator) {
            list.iter_mut().for_each(sanitize);
        }
    }
    if let Some(not) = map.get_mut("not") {
        sanitize(not);
    }
}
