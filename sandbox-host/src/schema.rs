//! Structural validation of tool arguments against the tool's input schema.
//!
//! Lightweight subset of JSON Schema: `type` (single or list), `required`,
//! `properties`, `additionalProperties: false`, `enum`, `items`, plus the
//! numeric and length bounds. Nested schemas are validated recursively and
//! errors carry the JSON path of the offending value.

use serde_json::{Map, Value};

/// Validate `input` against `schema`.
///
/// Non-object schemas (and unknown keywords) are accepted as-is.
pub fn validate_arguments(input: &Value, schema: &Value) -> Result<(), String> {
    validate_at(input, schema, "$")
}

fn validate_at(input: &Value, schema: &Value, path: &str) -> Result<(), String> {
    let schema_obj = match schema.as_object() {
        Some(o) => o,
        None => return Ok(()),
    };

    check_type(input, schema_obj, path)?;

    if let Some(Value::Array(allowed)) = schema_obj.get("enum") {
        if !allowed.contains(input) {
            return Err(format!("{path} must be one of {}", Value::Array(allowed.clone())));
        }
    }

    match input {
        Value::Object(input_obj) => check_object(input_obj, schema_obj, path)?,
        Value::Array(items) => {
            if let Some(item_schema) = schema_obj.get("items") {
                for (i, item) in items.iter().enumerate() {
                    validate_at(item, item_schema, &format!("{path}[{i}]"))?;
                }
            }
            check_length(items.len(), schema_obj, "minItems", "maxItems", path)?;
        }
        Value::String(s) => {
            check_length(s.chars().count(), schema_obj, "minLength", "maxLength", path)?;
        }
        Value::Number(n) => {
            if let Some(value) = n.as_f64() {
                if let Some(min) = schema_obj.get("minimum").and_then(Value::as_f64) {
                    if value < min {
                        return Err(format!("{path} must be >= {min}"));
                    }
                }
                if let Some(max) = schema_obj.get("maximum").and_then(Value::as_f64) {
                    if value > max {
                        return Err(format!("{path} must be <= {max}"));
                    }
                }
            }
        }
        _ => {}
    }

    Ok(())
}

fn check_type(input: &Value, schema_obj: &Map<String, Value>, path: &str) -> Result<(), String> {
    let expected: Vec<&str> = match schema_obj.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(types)) => types.iter().filter_map(Value::as_str).collect(),
        _ => return Ok(()),
    };
    if expected.is_empty() || expected.iter().any(|t| matches_type(input, t)) {
        return Ok(());
    }
    Err(format!("{path} must be of type {}", expected.join(" or ")))
}

fn matches_type(input: &Value, expected: &str) -> bool {
    match expected {
        "object" => input.is_object(),
        "array" => input.is_array(),
        "string" => input.is_string(),
        "boolean" => input.is_boolean(),
        "null" => input.is_null(),
        "number" => input.is_number(),
        "integer" => match input {
            Value::Number(n) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            _ => false,
        },
        // Unknown type: pass
        _ => true,
    }
}

fn check_object(
    input_obj: &Map<String, Value>,
    schema_obj: &Map<String, Value>,
    path: &str,
) -> Result<(), String> {
    if let Some(Value::Array(required)) = schema_obj.get("required") {
        for field_name in required.iter().filter_map(Value::as_str) {
            if !input_obj.contains_key(field_name) {
                return Err(format!("{path}: missing required field '{field_name}'"));
            }
        }
    }

    let properties = schema_obj.get("properties").and_then(Value::as_object);
    if let Some(properties) = properties {
        for (field_name, field_schema) in properties {
            if let Some(field_value) = input_obj.get(field_name) {
                validate_at(field_value, field_schema, &format!("{path}.{field_name}"))?;
            }
        }
    }

    match schema_obj.get("additionalProperties") {
        Some(Value::Bool(false)) => {
            for field_name in input_obj.keys() {
                let declared = properties.is_some_and(|p| p.contains_key(field_name));
                if !declared {
                    return Err(format!("{path}: unexpected field '{field_name}'"));
                }
            }
        }
        Some(extra_schema @ Value::Object(_)) => {
            for (field_name, field_value) in input_obj {
                let declared = properties.is_some_and(|p| p.contains_key(field_name));
                if !declared {
                    validate_at(field_value, extra_schema, &format!("{path}.{field_name}"))?;
                }
            }
        }
        _ => {}
    }

    Ok(())
}

fn check_length(
    len: usize,
    schema_obj: &Map<String, Value>,
    min_key: &str,
    max_key: &str,
    path: &str,
) -> Result<(), String> {
    if let Some(min) = schema_obj.get(min_key).and_then(Value::as_u64) {
        if (len as u64) < min {
            return Err(format!("{path} must have at least {min} element(s)"));
        }
    }
    if let Some(max) = schema_obj.get(max_key).and_then(Value::as_u64) {
        if (len as u64) > max {
            return Err(format!("{path} must have at most {max} element(s)"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn weather_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "city": { "type": "string", "minLength": 1 },
                "units": { "type": "string", "enum": ["metric", "imperial"] },
                "days": { "type": "integer", "minimum": 1, "maximum": 14 },
                "tags": { "type": "array", "items": { "type": "string" } },
                "filter": {
                    "type": "object",
                    "properties": { "min_temp": { "type": "number" } },
                    "additionalProperties": false
                }
            },
            "required": ["city"],
            "additionalProperties": false
        })
    }

    #[test]
    fn accepts_valid_arguments() {
        let args = json!({
            "city": "Oslo",
            "units": "metric",
            "days": 3,
            "tags": ["a", "b"],
            "filter": { "min_temp": -2.5 }
        });
        assert!(validate_arguments(&args, &weather_schema()).is_ok());
    }

    #[test]
    fn rejects_missing_required() {
        let err = validate_arguments(&json!({"units": "metric"}), &weather_schema()).unwrap_err();
        assert!(err.contains("city"));
    }

    #[test]
    fn rejects_wrong_type_and_enum() {
        assert!(validate_arguments(&json!({"city": 5}), &weather_schema()).is_err());
        let err = validate_arguments(&json!({"city": "x", "units": "kelvin"}), &weather_schema()).unwrap_err();
        assert!(err.contains("$.units"));
    }

    #[test]
    fn rejects_non_integer_and_out_of_range() {
        assert!(validate_arguments(&json!({"city": "x", "days": 1.5}), &weather_schema()).is_err());
        assert!(validate_arguments(&json!({"city": "x", "days": 30}), &weather_schema()).is_err());
        assert!(validate_arguments(&json!({"city": "x", "days": 2.0}), &weather_schema()).is_ok());
    }

    #[test]
    fn rejects_additional_properties_at_any_depth() {
        let err = validate_arguments(&json!({"city": "x", "extra": true}), &weather_schema()).unwrap_err();
        assert!(err.contains("extra"));
        let err = validate_arguments(
            &json!({"city": "x", "filter": {"max_temp": 3}}),
            &weather_schema(),
        )
        .unwrap_err();
        assert!(err.contains("$.filter"));
    }

    #[test]
    fn validates_array_items_with_index() {
        let err = validate_arguments(&json!({"city": "x", "tags": ["ok", 3]}), &weather_schema()).unwrap_err();
        assert!(err.contains("$.tags[1]"));
    }

    #[test]
    fn accepts_type_lists() {
        let schema = json!({"type": ["string", "null"]});
        assert!(validate_arguments(&Value::Null, &schema).is_ok());
        assert!(validate_arguments(&json!("x"), &schema).is_ok());
        assert!(validate_arguments(&json!(1), &schema).is_err());
    }

    #[test]
    fn non_object_schema_is_permissive() {
        assert!(validate_arguments(&json!({"anything": 1}), &json!(true)).is_ok());
    }
}
