//! Argument checks run before a tool handler sees a call.

use serde_json::{json, Map, Value};

use super::types::ToolParameters;

/// Check the arguments of a call to `tool` against its declared parameters.
///
/// Only the top level is inspected: object shape, required keys, primitive
/// types and string enums. Every violation is reported, so the model can fix
/// the call in one retry. The error is the tool-result payload to hand back.
pub fn validate_arguments(tool: &str, parameters: &ToolParameters, args: &Value) -> Result<(), Value> {
    let violations = violations(&parameters.schema, args);
    if violations.is_empty() {
        return Ok(());
    }
    Err(json!({
        "error": format!("invalid arguments for {tool}: {}", violations.join("; ")),
        "violations": violations,
    }))
}

fn violations(schema: &Value, args: &Value) -> Vec<String> {
    let Some(fields) = args.as_object() else {
        return if schema.get("type").and_then(Value::as_str) == Some("object") {
            vec![format!("arguments must be an object, got {}", kind(args))]
        } else {
            Vec::new()
        };
    };

    let mut found: Vec<String> = schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .filter(|name| !fields.contains_key(*name))
        .map(|name| format!("missing required field '{name}'"))
        .collect();

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        found.extend(field_violations(properties, fields));
    }
    found
}

fn field_violations(properties: &Map<String, Value>, fields: &Map<String, Value>) -> Vec<String> {
    let mut found = Vec::new();
    for (name, value) in fields {
        let Some(property) = properties.get(name) else {
            continue;
        };
        if let Some(expected) = property.get("type").and_then(Value::as_str) {
            if !has_type(value, expected) {
                found.push(format!("field '{name}' expects {expected}, got {}", kind(value)));
                continue;
            }
        }
        let allowed = property.get("enum").and_then(Value::as_array);
        if let (Some(allowed), Some(text)) = (allowed, value.as_str()) {
            if !allowed.iter().any(|option| option.as_str() == Some(text)) {
                let options: Vec<&str> = allowed.iter().filter_map(Value::as_str).collect();
                found.push(format!("field '{name}' must be one of: {}", options.join(", ")));
            }
        }
    }
    found
}

fn has_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
