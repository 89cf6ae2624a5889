//! Loading a resolved configuration mapping from JSON.
//!
//! Nested objects flatten into dotted keys, so
//! `{"reduce": {"trace": {"degree": 4}}}` yields `reduce.trace.degree = 4`.

use std::path::Path;

use serde_json::Value;

use crate::config::{ConfigMap, ConfigValue};
use crate::error::ReduceError;

pub fn read_config_json(path: &Path) -> Result<ConfigMap, ReduceError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ReduceError::io(format!("failed to read config '{}'", path.display()), e))?;
    parse_config_json(&text).map_err(|e| match e {
        ReduceError::Format { message, .. } => ReduceError::format(path.display().to_string(), message),
        other => other,
    })
}

pub fn parse_config_json(text: &str) -> Result<ConfigMap, ReduceError> {
    let value: Value = serde_json::from_str(text).map_err(|e| ReduceError::format("config", e))?;
    let mut map = ConfigMap::new();
    match value {
        Value::Object(_) => flatten("", &value, &mut map)?,
        _ => return Err(ReduceError::format("config", "top level must be an object")),
    }
    Ok(map)
}

fn flatten(prefix: &str, value: &Value, out: &mut ConfigMap) -> Result<(), ReduceError> {
    let key = prefix.to_string();
    match value {
        Value::Object(entries) => {
            for (k, v) in entries {
                let nested = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                flatten(&nested, v, out)?;
            }
        }
        Value::Bool(b) => {
            out.insert(key, ConfigValue::Bool(*b));
        }
        Value::Number(n) => {
            let v = match n.as_i64() {
                Some(i) => ConfigValue::Int(i),
                None => ConfigValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            };
            out.insert(key, v);
        }
        Value::String(s) => {
            out.insert(key, ConfigValue::Text(s.clone()));
        }
        Value::Array(items) => {
            let list = items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    other => Err(ReduceError::format(
                        "config",
                        format!("`{prefix}` lists must hold strings, found {other}"),
                    )),
                })
                .collect::<Result<Vec<_>, _>>()?;
            out.insert(key, ConfigValue::List(list));
        }
        Value::Null => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_objects_become_dotted_keys() {
        let map = parse_config_json(
            r#"{
                "data": {"exptime_key": "EXPOSURE"},
                "reduce": {
                    "trace": {"degree": 4, "separation": "500:26, 1500:15", "filling": 0.4},
                    "bias": {"smooth": true},
                    "skip": null
                },
                "instruments": ["hrs", "foces"]
            }"#,
        )
        .unwrap();
        assert_eq!(map["reduce.trace.degree"], ConfigValue::Int(4));
        assert_eq!(map["reduce.trace.filling"], ConfigValue::Float(0.4));
        assert_eq!(map["reduce.bias.smooth"], ConfigValue::Bool(true));
        assert_eq!(map["data.exptime_key"], ConfigValue::Text("EXPOSURE".into()));
        assert_eq!(
            map["instruments"],
            ConfigValue::List(vec!["hrs".into(), "foces".into()])
        );
        assert!(!map.contains_key("reduce.skip"));
    }

    #[test]
    fn non_object_top_level_is_rejected() {
        assert!(parse_config_json("[1, 2]").is_err());
        assert!(parse_config_json(r#"{"a": [1]}"#).is_err());
    }
}
