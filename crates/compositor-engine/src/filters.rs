//! Template filters used by the workload manifests

use minijinja::{Error, ErrorKind, Value};

/// Convert a value to a single-line JSON literal
///
/// JSON is valid YAML, so `{{ value | tojson }}` quotes and escapes anything
/// placed in a manifest.
pub fn tojson(value: Value) -> Result<String, Error> {
    let json_value: serde_json::Value = serde_json::to_value(&value)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;

    serde_json::to_string(&json_value)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::Environment;
    use serde_json::json;

    #[test]
    fn test_tojson_scalars() {
        assert_eq!(tojson(Value::from("a: b")).unwrap(), r#""a: b""#);
        assert_eq!(tojson(Value::from(true)).unwrap(), "true");
        assert_eq!(tojson(Value::from(3)).unwrap(), "3");
    }

    #[test]
    fn test_tojson_in_template() {
        let mut env = Environment::new();
        env.add_filter("tojson", tojson);
        let out = env
            .render_str(
                "rules: {{ rules | tojson }}",
                json!({"rules": [{"apiGroups": [""], "verbs": ["get"]}]}),
            )
            .unwrap();
        assert_eq!(out, r#"rules: [{"apiGroups":[""],"verbs":["get"]}]"#);
    }
}
