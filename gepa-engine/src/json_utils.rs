//! JSON helpers shared by the state snapshot, run artifacts, and result serialization.

use std::fmt::Debug;
use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::error::{Error, ErrorDetails};

/// Recursively sorts all object keys in a JSON value.
///
/// `serde_json` preserves insertion order in this workspace, so this is what makes
/// two serializations of equal data byte-identical regardless of how they were built.
pub fn sort_json_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, sort_json_keys(value)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_json_keys).collect()),
        other => other,
    }
}

/// Converts an evaluation output into JSON.
///
/// Outputs that `serde_json` cannot represent (e.g. maps with non-string keys) fall back to
/// a type-tagged object holding the type name and its `Debug` rendering.
pub fn output_to_json<O: Serialize + Debug>(output: &O) -> Value {
    match serde_json::to_value(output) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!("Output is not directly JSON-serializable ({e}); using tagged form");
            json!({
                "type": std::any::type_name::<O>(),
                "repr": format!("{output:?}"),
            })
        }
    }
}

/// Writes `value` as pretty JSON, creating parent directories as needed.
pub fn write_json_file(path: &Path, value: &Value) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            Error::new(ErrorDetails::FileWrite {
                message: format!("Failed to create directory: {e}"),
                file_path: parent.display().to_string(),
            })
        })?;
    }
    let contents = serde_json::to_string_pretty(value).map_err(|e| {
        Error::new(ErrorDetails::Serialization {
            message: e.to_string(),
        })
    })?;
    std::fs::write(path, contents).map_err(|e| {
        Error::new(ErrorDetails::FileWrite {
            message: e.to_string(),
            file_path: path.display().to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_sort_json_keys_nested_and_arrays() {
        let input = json!({
            "zeta": {"b": 1, "a": [{"y": 1, "x": 2}]},
            "alpha": 0
        });

        let sorted = sort_json_keys(input);

        let outer: Vec<_> = sorted.as_object().unwrap().keys().collect();
        assert_eq!(outer, vec!["alpha", "zeta"]);

        let inner: Vec<_> = sorted["zeta"].as_object().unwrap().keys().collect();
        assert_eq!(inner, vec!["a", "b"]);

        let in_array: Vec<_> = sorted["zeta"]["a"][0].as_object().unwrap().keys().collect();
        assert_eq!(in_array, vec!["x", "y"]);
    }

    #[test]
    fn test_sort_json_keys_primitives_unchanged() {
        assert_eq!(sort_json_keys(json!(1.5)), json!(1.5));
        assert_eq!(sort_json_keys(json!("text")), json!("text"));
        assert_eq!(sort_json_keys(json!(null)), json!(null));
    }

    #[test]
    fn test_output_to_json_serializable() {
        assert_eq!(output_to_json(&"answer"), json!("answer"));
        assert_eq!(output_to_json(&vec![1, 2]), json!([1, 2]));
    }

    #[test]
    fn test_output_to_json_falls_back_to_tagged_form() {
        let output: HashMap<(u8, u8), u8> = HashMap::from([((1, 2), 3)]);
        let value = output_to_json(&output);

        let type_name = value["type"].as_str().unwrap();
        assert!(type_name.contains("HashMap"));
        assert!(value["repr"].as_str().unwrap().contains("(1, 2)"));
    }

    #[test]
    fn test_write_json_file_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.json");

        write_json_file(&path, &json!({"ok": true})).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed, json!({"ok": true}));
    }
}
