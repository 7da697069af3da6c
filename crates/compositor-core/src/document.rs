//! Generic Kubernetes objects
//!
//! Objects of arbitrary kinds (rendered manifests, live objects, composition
//! instances) are handled as a `Document`: a JSON object with accessors for
//! the handful of fields the controller actually reads or writes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::digest::digest_value;
use crate::error::{CoreError, Result};

/// A Kubernetes object of any kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Document(Map<String, Value>);

/// Identity of an object: apiVersion, kind, namespace and name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", ns, self.kind, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

impl TryFrom<Value> for Document {
    type Error = CoreError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(CoreError::InvalidObject {
                message: format!("expected a JSON object, got {}", type_name(&other)),
            }),
        }
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Object(doc.0)
    }
}

impl Document {
    pub fn new(value: Value) -> Result<Self> {
        Self::try_from(value)
    }

    /// Parse a single YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(yaml)?;
        Self::new(value)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn api_version(&self) -> Option<&str> {
        self.0.get("apiVersion").and_then(Value::as_str)
    }

    pub fn kind(&self) -> Option<&str> {
        self.0.get("kind").and_then(Value::as_str)
    }

    fn metadata(&self) -> Option<&Map<String, Value>> {
        self.0.get("metadata").and_then(Value::as_object)
    }

    fn metadata_mut(&mut self) -> &mut Map<String, Value> {
        let entry = self
            .0
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        match entry {
            Value::Object(map) => map,
            _ => unreachable!("metadata was just set to an object"),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata()?.get("name").and_then(Value::as_str)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata()?.get("namespace").and_then(Value::as_str)
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        self.metadata_mut()
            .insert("namespace".to_string(), Value::String(namespace.to_string()));
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata()
            .and_then(|m| m.get("labels"))
            .and_then(Value::as_object)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata()?
            .get("labels")?
            .as_object()?
            .get(key)?
            .as_str()
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        let metadata = self.metadata_mut();
        let labels = metadata
            .entry("labels")
            .or_insert_with(|| Value::Object(Map::new()));
        if !labels.is_object() {
            *labels = Value::Object(Map::new());
        }
        if let Value::Object(labels) = labels {
            labels.insert(key.to_string(), Value::String(value.to_string()));
        }
    }

    pub fn remove_label(&mut self, key: &str) -> Option<String> {
        let labels = self.metadata_mut().get_mut("labels")?.as_object_mut()?;
        labels.remove(key).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn finalizers(&self) -> Vec<String> {
        self.metadata()
            .and_then(|m| m.get("finalizers"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn spec(&self) -> Option<&Value> {
        self.0.get("spec")
    }

    pub fn status(&self) -> Option<&Value> {
        self.0.get("status")
    }

    /// Identity of the object
    pub fn key(&self) -> Result<ObjectKey> {
        let missing = |field: &str| CoreError::InvalidObject {
            message: format!("object is missing {}", field),
        };
        Ok(ObjectKey {
            api_version: self.api_version().ok_or_else(|| missing("apiVersion"))?.to_string(),
            kind: self.kind().ok_or_else(|| missing("kind"))?.to_string(),
            namespace: self.namespace().map(str::to_string),
            name: self.name().ok_or_else(|| missing("metadata.name"))?.to_string(),
        })
    }

    /// Restrict this object to the fields present in `shape`
    ///
    /// Used to compare a live object with the object that was applied: fields
    /// the server adds (status, uid, defaults) are dropped, fields the shape
    /// carries are kept with their live values. Arrays of equal length are
    /// projected element by element; other arrays are kept as they are.
    pub fn project_onto(&self, shape: &Document) -> Document {
        Document(project_map(&self.0, &shape.0))
    }

    /// Content digest, independent of key order
    pub fn digest(&self) -> String {
        digest_value(&Value::Object(self.0.clone()))
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.0)?)
    }
}

fn project_map(live: &Map<String, Value>, shape: &Map<String, Value>) -> Map<String, Value> {
    shape
        .iter()
        .filter_map(|(key, shape_value)| {
            live.get(key)
                .map(|live_value| (key.clone(), project_value(live_value, shape_value)))
        })
        .collect()
}

fn project_value(live: &Value, shape: &Value) -> Value {
    match (live, shape) {
        (Value::Object(l), Value::Object(s)) => Value::Object(project_map(l, s)),
        (Value::Array(l), Value::Array(s)) if l.len() == s.len() => Value::Array(
            l.iter()
                .zip(s.iter())
                .map(|(lv, sv)| project_value(lv, sv))
                .collect(),
        ),
        _ => live.clone(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment() -> Document {
        Document::from_yaml(
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: fireworksapps-v1-1-13-controller
  namespace: krateo-system
  labels:
    app.kubernetes.io/managed-by: compositor
spec:
  replicas: 1
  template:
    spec:
      containers:
        - name: controller
          image: ghcr.io/krateoplatformops/composition-dynamic-controller:0.1.0
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_non_objects() {
        assert!(Document::new(json!([1, 2])).is_err());
        assert!(Document::from_yaml("just a string").is_err());
    }

    #[test]
    fn test_accessors() {
        let doc = deployment();
        assert_eq!(doc.api_version(), Some("apps/v1"));
        assert_eq!(doc.kind(), Some("Deployment"));
        assert_eq!(doc.namespace(), Some("krateo-system"));
        assert_eq!(doc.label("app.kubernetes.io/managed-by"), Some("compositor"));

        let key = doc.key().unwrap();
        assert_eq!(
            key.to_string(),
            "krateo-system/Deployment/fireworksapps-v1-1-13-controller"
        );
    }

    #[test]
    fn test_labels_roundtrip() {
        let mut doc = Document::new(json!({"apiVersion": "v1", "kind": "ConfigMap"})).unwrap();
        doc.set_label("krateo.io/composition-version", "v1-1-13");
        assert_eq!(doc.label("krateo.io/composition-version"), Some("v1-1-13"));
        assert_eq!(
            doc.remove_label("krateo.io/composition-version").as_deref(),
            Some("v1-1-13")
        );
        assert!(doc.labels().is_empty());
    }

    #[test]
    fn test_key_requires_name() {
        let doc = Document::new(json!({"apiVersion": "v1", "kind": "ConfigMap"})).unwrap();
        assert!(doc.key().is_err());
    }

    #[test]
    fn test_project_onto_drops_server_fields() {
        let desired = deployment();
        let mut live_value = desired.to_value();
        live_value["metadata"]["uid"] = json!("1234");
        live_value["metadata"]["resourceVersion"] = json!("99");
        live_value["spec"]["template"]["spec"]["containers"][0]["imagePullPolicy"] =
            json!("IfNotPresent");
        live_value["status"] = json!({"readyReplicas": 1});
        let live = Document::new(live_value).unwrap();

        let projected = live.project_onto(&desired);
        assert_eq!(projected, desired);
        assert_eq!(projected.digest(), desired.digest());
    }

    #[test]
    fn test_project_onto_keeps_changed_values() {
        let desired = deployment();
        let mut live_value = desired.to_value();
        live_value["spec"]["replicas"] = json!(3);
        let live = Document::new(live_value).unwrap();

        let projected = live.project_onto(&desired);
        assert_ne!(projected.digest(), desired.digest());
    }

    #[test]
    fn test_serde_transparent() {
        let doc = deployment();
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["kind"], "Deployment");
        let back: Document = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
    }
}
