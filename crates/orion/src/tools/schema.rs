//! Argument checks against a tool's JSON schema.
//!
//! Only the keywords tools actually use are enforced: `type`, `properties`, `required`,
//! `enum`, `items` and `additionalProperties: false`. Anything else in the schema is ignored.
use serde_json::{Map, Value};

use crate::errors::{AgentError, AgentResult};

pub fn validate(schema: &Value, value: &Value) -> AgentResult<()> {
    check(schema, value, "$").map_err(AgentError::InvalidToolArguments)
}

fn check(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    let schema = match schema.as_object() {
        Some(schema) => schema,
        None => return Ok(()),
    };

    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(kind) => vec![kind.as_str()],
            Value::Array(kinds) => kinds.iter().filter_map(|k| k.as_str()).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|kind| has_type(value, kind)) {
            return Err(format!(
                "{} should be {}, got {}",
                path,
                allowed.join(" or "),
                type_name(value)
            ));
        }
    }

    if let Some(Value::Array(options)) = schema.get("enum") {
        if !options.contains(value) {
            return Err(format!("{} must be one of {}", path, Value::Array(options.clone())));
        }
    }

    if let Value::Object(object) = value {
        check_object(schema, object, path)?;
    }

    if let (Value::Array(items), Some(item_schema)) = (value, schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            check(item_schema, item, &format!("{}[{}]", path, i))?;
        }
    }

    Ok(())
}

fn check_object(schema: &Map<String, Value>, object: &Map<String, Value>, path: &str) -> Result<(), String> {
    if let Some(Value::Array(required)) = schema.get("required") {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !object.contains_key(key) {
                return Err(format!("{} is missing required property '{}'", path, key));
            }
        }
    }

    let properties = schema.get("properties").and_then(|p| p.as_object());
    let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));

    for (key, field) in object {
        match properties.and_then(|p| p.get(key)) {
            Some(field_schema) => check(field_schema, field, &format!("{}.{}", path, key))?,
            None if closed => {
                return Err(format!("{} has unexpected property '{}'", path, key));
            }
            None => {}
        }
    }
    Ok(())
}

fn has_type(value: &Value, kind: &str) -> bool {
    match kind {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false)
        }
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
