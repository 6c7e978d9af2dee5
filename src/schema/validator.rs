//! Hand-rolled JSON Schema (draft-07 subset) parameter validator.
//!
//! Dropped the `jsonschema` crate here (see DESIGN.md): the spec requires a
//! specific error ordering and a "you provided" rendering that the crate
//! doesn't surface in this shape, so the walk is written directly against
//! `serde_json::Value`.

use serde_json::Value;
use std::fmt::Write as _;

/// Result of validating a parameter object against a tool's input schema.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    pub type_mismatch: Vec<String>,
}

/// Validate `params` against `schema`. Error messages are ordered missing
/// first, unexpected second, type mismatches third, everything else last.
pub fn validate(schema: &Value, params: &Value) -> ValidationResult {
    let mut missing = Vec::new();
    let mut unexpected = Vec::new();
    let mut type_mismatch = Vec::new();
    let mut other = Vec::new();

    walk("", schema, params, &mut missing, &mut unexpected, &mut type_mismatch, &mut other);

    let mut errors = Vec::with_capacity(missing.len() + unexpected.len() + type_mismatch.len() + other.len());
    errors.extend(missing.iter().cloned());
    errors.extend(unexpected.iter().cloned());
    errors.extend(type_mismatch.iter().cloned());
    errors.extend(other.iter().cloned());

    ValidationResult {
        valid: errors.is_empty(),
        missing,
        unexpected,
        type_mismatch,
    }
}

#[allow(clippy::too_many_arguments)]
fn walk(
    path: &str,
    schema: &Value,
    value: &Value,
    missing: &mut Vec<String>,
    unexpected: &mut Vec<String>,
    type_mismatch: &mut Vec<String>,
    other: &mut Vec<String>,
) {
    let Some(schema_obj) = schema.as_object() else {
        return;
    };

    // `enum`
    if let Some(allowed) = schema_obj.get("enum").and_then(Value::as_array)
        && !allowed.contains(value)
    {
        other.push(format!(
            "parameter '{}' must be one of {} (you provided: {})",
            display_path(path),
            render_json(&Value::Array(allowed.clone())),
            render_json(value)
        ));
        return;
    }

    // `type` (string or array of strings == union)
    if let Some(type_val) = schema_obj.get("type")
        && !type_matches(type_val, value)
    {
        type_mismatch.push(format!(
            "parameter '{}' must be of type {} (you provided: {})",
            display_path(path),
            describe_type(type_val),
            render_json(value)
        ));
        return;
    }

    match value {
        Value::Object(obj) => {
            if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
                for req in required {
                    if let Some(name) = req.as_str()
                        && !obj.contains_key(name)
                    {
                        missing.push(format!(
                            "missing required parameter '{}'",
                            display_path(&join_path(path, name))
                        ));
                    }
                }
            }

            if let Some(props) = schema_obj.get("properties").and_then(Value::as_object) {
                let additional_allowed = schema_obj
                    .get("additionalProperties")
                    .map(|v| v.as_bool().unwrap_or(true))
                    .unwrap_or(true);

                for (key, val) in obj {
                    match props.get(key) {
                        Some(prop_schema) => {
                            walk(
                                &join_path(path, key),
                                prop_schema,
                                val,
                                missing,
                                unexpected,
                                type_mismatch,
                                other,
                            );
                        }
                        None if !additional_allowed => {
                            unexpected.push(format!(
                                "unexpected parameter '{}' (you provided: {})",
                                display_path(&join_path(path, key)),
                                render_json(val)
                            ));
                        }
                        None => {}
                    }
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = schema_obj.get("items") {
                for (i, item) in items.iter().enumerate() {
                    walk(
                        &format!("{path}[{i}]"),
                        item_schema,
                        item,
                        missing,
                        unexpected,
                        type_mismatch,
                        other,
                    );
                }
            }
        }
        Value::Number(n) => {
            if let Some(min) = schema_obj.get("minimum").and_then(Value::as_f64)
                && n.as_f64().is_some_and(|v| v < min)
            {
                other.push(format!(
                    "parameter '{}' must be >= {} (you provided: {})",
                    display_path(path),
                    min,
                    render_json(value)
                ));
            }
            if let Some(max) = schema_obj.get("maximum").and_then(Value::as_f64)
                && n.as_f64().is_some_and(|v| v > max)
            {
                other.push(format!(
                    "parameter '{}' must be <= {} (you provided: {})",
                    display_path(path),
                    max,
                    render_json(value)
                ));
            }
        }
        Value::String(s) => {
            if let Some(min_len) = schema_obj.get("minLength").and_then(Value::as_u64)
                && (s.chars().count() as u64) < min_len
            {
                other.push(format!(
                    "parameter '{}' must be at least {} characters (you provided: {})",
                    display_path(path),
                    min_len,
                    render_json(value)
                ));
            }
            if let Some(max_len) = schema_obj.get("maxLength").and_then(Value::as_u64)
                && (s.chars().count() as u64) > max_len
            {
                other.push(format!(
                    "parameter '{}' must be at most {} characters (you provided: {})",
                    display_path(path),
                    max_len,
                    render_json(value)
                ));
            }
            if let Some(pattern) = schema_obj.get("pattern").and_then(Value::as_str)
                && let Ok(re) = regex::Regex::new(pattern)
                && !re.is_match(s)
            {
                other.push(format!(
                    "parameter '{}' must match pattern {} (you provided: {})",
                    display_path(path),
                    pattern,
                    render_json(value)
                ));
            }
        }
        _ => {}
    }
}

fn join_path(base: &str, key: &str) -> String {
    if base.is_empty() {
        key.to_string()
    } else {
        format!("{base}.{key}")
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() { "(root)" } else { path }
}

fn render_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "?".to_string())
}

fn describe_type(type_val: &Value) -> String {
    match type_val {
        Value::String(s) => s.clone(),
        Value::Array(types) => {
            let mut out = String::new();
            for (i, t) in types.iter().enumerate() {
                if i > 0 {
                    let _ = write!(out, " | ");
                }
                if let Some(s) = t.as_str() {
                    out.push_str(s);
                }
            }
            out
        }
        _ => "unknown".to_string(),
    }
}

fn type_matches(type_val: &Value, value: &Value) -> bool {
    match type_val {
        Value::String(t) => single_type_matches(t, value),
        Value::Array(types) => types
            .iter()
            .any(|t| t.as_str().is_some_and(|t| single_type_matches(t, value))),
        _ => true,
    }
}

fn single_type_matches(t: &str, value: &Value) -> bool {
    match t {
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

#[cfg(test)]
mod tests;
