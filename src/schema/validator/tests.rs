use super::*;
use serde_json::json;

#[test]
fn missing_required_param() {
    let schema = json!({
        "type": "object",
        "required": ["param1"],
        "properties": {"param1": {"type": "string"}}
    });
    let result = validate(&schema, &json!({}));
    assert!(!result.valid);
    assert_eq!(result.missing.len(), 1);
    assert!(result.missing[0].contains("param1"));
}

#[test]
fn unexpected_param_rejected_when_additional_properties_false() {
    let schema = json!({
        "type": "object",
        "properties": {"a": {"type": "string"}},
        "additionalProperties": false
    });
    let result = validate(&schema, &json!({"a": "x", "b": "y"}));
    assert!(!result.valid);
    assert_eq!(result.unexpected.len(), 1);
    assert!(result.unexpected[0].contains('b'));
}

#[test]
fn additional_properties_allowed_by_default() {
    let schema = json!({
        "type": "object",
        "properties": {"a": {"type": "string"}}
    });
    let result = validate(&schema, &json!({"a": "x", "b": "y"}));
    assert!(result.valid);
}

#[test]
fn type_mismatch_reported() {
    let schema = json!({"type": "object", "properties": {"n": {"type": "integer"}}});
    let result = validate(&schema, &json!({"n": "not a number"}));
    assert!(!result.valid);
    assert_eq!(result.type_mismatch.len(), 1);
}

#[test]
fn integer_distinct_from_number() {
    let schema = json!({"type": "object", "properties": {"n": {"type": "integer"}}});
    let result = validate(&schema, &json!({"n": 3.5}));
    assert!(!result.valid);
}

#[test]
fn number_accepts_integer_and_float() {
    let schema = json!({"type": "object", "properties": {"n": {"type": "number"}}});
    assert!(validate(&schema, &json!({"n": 3})).valid);
    assert!(validate(&schema, &json!({"n": 3.5})).valid);
}

#[test]
fn error_ordering_missing_then_unexpected_then_type() {
    let schema = json!({
        "type": "object",
        "required": ["missing_one"],
        "properties": {"num": {"type": "integer"}},
        "additionalProperties": false
    });
    let result = validate(&schema, &json!({"num": "bad", "extra": true}));
    assert!(!result.errors[0].contains("unexpected"));
    assert!(result.errors[0].contains("missing"));
}

#[test]
fn enum_violation() {
    let schema = json!({"type": "object", "properties": {"color": {"enum": ["red", "blue"]}}});
    let result = validate(&schema, &json!({"color": "green"}));
    assert!(!result.valid);
}

#[test]
fn min_max_length_and_pattern() {
    let schema = json!({
        "type": "object",
        "properties": {"s": {"type": "string", "minLength": 2, "maxLength": 4, "pattern": "^[a-z]+$"}}
    });
    assert!(!validate(&schema, &json!({"s": "a"})).valid);
    assert!(!validate(&schema, &json!({"s": "abcde"})).valid);
    assert!(!validate(&schema, &json!({"s": "AB"})).valid);
    assert!(validate(&schema, &json!({"s": "abcd"})).valid);
}

#[test]
fn nested_object_and_array_items() {
    let schema = json!({
        "type": "object",
        "properties": {
            "items": {
                "type": "array",
                "items": {"type": "object", "required": ["id"], "properties": {"id": {"type": "string"}}}
            }
        }
    });
    let result = validate(&schema, &json!({"items": [{"id": "x"}, {}]}));
    assert!(!result.valid);
    assert_eq!(result.missing.len(), 1);
}

#[test]
fn valid_params_pass() {
    let schema = json!({
        "type": "object",
        "required": ["path"],
        "properties": {"path": {"type": "string"}}
    });
    let result = validate(&schema, &json!({"path": "/tmp"}));
    assert!(result.valid);
    assert!(result.errors.is_empty());
}
