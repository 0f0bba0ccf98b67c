use chrono::DateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

/// Extracted fields in source order. Parsers are tried in a fixed
/// priority until one yields at least one field:
///   1. JSON object, recursively flattened with `.`-joined paths
///   2. key=value pairs (whitespace or comma separated, quoted values ok)
///   3. `key: value` lines
///   4. positional whitespace tokens named field_1..field_n
pub fn extract_fields(payload: &str) -> Vec<(String, String)> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let fields = json_fields(trimmed);
    if !fields.is_empty() {
        return fields;
    }

    let fields = key_value_fields(trimmed);
    if !fields.is_empty() {
        return fields;
    }

    let fields = colon_fields(trimmed);
    if !fields.is_empty() {
        return fields;
    }

    positional_fields(trimmed)
}

/// Linear lookup; extracted field lists are small.
pub fn field_value<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn json_fields(payload: &str) -> Vec<(String, String)> {
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(_) => return Vec::new(),
    };

    let mut fields = Vec::new();
    if let Value::Object(map) = value {
        for (key, value) in map {
            flatten_json(&key, &value, &mut fields);
        }
    }
    fields
}

fn flatten_json(path: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_json(&format!("{}.{}", path, key), child, out);
            }
        }
        Value::String(s) => out.push((path.to_string(), s.clone())),
        Value::Null => out.push((path.to_string(), "null".to_string())),
        // Arrays keep their JSON form; there is no positional path scheme
        other => out.push((path.to_string(), other.to_string())),
    }
}

fn kv_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z0-9_.\-]+)=(?:"([^"]*)"|'([^']*)'|([^\s,]*))"#)
            .unwrap()
    })
}

fn key_value_fields(payload: &str) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    for caps in kv_regex().captures_iter(payload) {
        let key = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let value = caps
            .get(2)
            .or_else(|| caps.get(3))
            .or_else(|| caps.get(4))
            .map(|m| m.as_str())
            .unwrap_or_default();
        fields.push((key.to_string(), value.to_string()));
    }
    fields
}

fn colon_fields(payload: &str) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    for line in payload.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if key.is_empty() || key.contains(char::is_whitespace) {
                continue;
            }
            fields.push((key.to_string(), value.trim().to_string()));
        }
    }
    fields
}

fn positional_fields(payload: &str) -> Vec<(String, String)> {
    payload
        .split_whitespace()
        .enumerate()
        .map(|(i, token)| (format!("field_{}", i + 1), token.to_string()))
        .collect()
}

/// Inferred field type for template learning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
}

fn int_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[-+]?\d+$").unwrap())
}

fn float_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[-+]?\d+\.\d+([eE][-+]?\d+)?$").unwrap())
}

// Plausible epoch window: 2000-01-01 .. 2100-01-01, in seconds or millis
const EPOCH_MIN_SECS: i64 = 946_684_800;
const EPOCH_MAX_SECS: i64 = 4_102_444_800;

/// Infer the type of a field value. Timestamps are recognized before
/// plain integers so epoch values in the plausible window classify as
/// timestamps rather than ints.
pub fn infer_type(value: &str) -> FieldType {
    let value = value.trim();

    if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("false") {
        return FieldType::Bool;
    }
    if is_timestamp(value) {
        return FieldType::Timestamp;
    }
    if int_regex().is_match(value) {
        return FieldType::Int;
    }
    if float_regex().is_match(value) {
        return FieldType::Float;
    }
    FieldType::String
}

fn is_timestamp(value: &str) -> bool {
    if DateTime::parse_from_rfc3339(value).is_ok() {
        return true;
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if chrono::NaiveDateTime::parse_from_str(value, format).is_ok() {
            return true;
        }
    }
    if let Ok(n) = value.parse::<i64>() {
        if (EPOCH_MIN_SECS..EPOCH_MAX_SECS).contains(&n) {
            return true;
        }
        // Millisecond epochs land three orders of magnitude higher
        if (EPOCH_MIN_SECS * 1000..EPOCH_MAX_SECS * 1000).contains(&n) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_object_flattened_with_dotted_paths() {
        let fields = extract_fields(r#"{"a": 1, "b": {"c": "x", "d": true}}"#);
        assert_eq!(
            fields,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b.c".to_string(), "x".to_string()),
                ("b.d".to_string(), "true".to_string()),
            ]
        );
    }

    #[test]
    fn test_json_array_value_kept_verbatim() {
        let fields = extract_fields(r#"{"tags": [1, 2]}"#);
        assert_eq!(fields, vec![("tags".to_string(), "[1,2]".to_string())]);
    }

    #[test]
    fn test_json_scalar_falls_through_to_positional() {
        // "42" parses as JSON but is not an object
        let fields = extract_fields("42");
        assert_eq!(fields, vec![("field_1".to_string(), "42".to_string())]);
    }

    #[test]
    fn test_key_value_pairs() {
        let fields = extract_fields("level=INFO msg=hi user=alice");
        assert_eq!(
            fields,
            vec![
                ("level".to_string(), "INFO".to_string()),
                ("msg".to_string(), "hi".to_string()),
                ("user".to_string(), "alice".to_string()),
            ]
        );
    }

    #[test]
    fn test_key_value_quoted_and_comma_separated() {
        let fields = extract_fields(r#"name="John Smith",age=42,city='New York'"#);
        assert_eq!(
            fields,
            vec![
                ("name".to_string(), "John Smith".to_string()),
                ("age".to_string(), "42".to_string()),
                ("city".to_string(), "New York".to_string()),
            ]
        );
    }

    #[test]
    fn test_colon_lines() {
        let fields = extract_fields("Status: OK\nLatency: 12ms");
        assert_eq!(
            fields,
            vec![
                ("Status".to_string(), "OK".to_string()),
                ("Latency".to_string(), "12ms".to_string()),
            ]
        );
    }

    #[test]
    fn test_positional_fallback() {
        let fields = extract_fields("alpha beta gamma");
        assert_eq!(
            fields,
            vec![
                ("field_1".to_string(), "alpha".to_string()),
                ("field_2".to_string(), "beta".to_string()),
                ("field_3".to_string(), "gamma".to_string()),
            ]
        );
    }

    #[test]
    fn test_empty_payload_yields_nothing() {
        assert!(extract_fields("").is_empty());
        assert!(extract_fields("   ").is_empty());
    }

    #[test]
    fn test_field_value_lookup() {
        let fields = extract_fields("level=INFO msg=hi");
        assert_eq!(field_value(&fields, "level"), Some("INFO"));
        assert_eq!(field_value(&fields, "missing"), None);
    }

    #[test]
    fn test_infer_int_and_float() {
        assert_eq!(infer_type("42"), FieldType::Int);
        assert_eq!(infer_type("-7"), FieldType::Int);
        assert_eq!(infer_type("+3"), FieldType::Int);
        assert_eq!(infer_type("3.14"), FieldType::Float);
        assert_eq!(infer_type("-1.5e10"), FieldType::Float);
        assert_eq!(infer_type("1."), FieldType::String);
    }

    #[test]
    fn test_infer_bool_case_insensitive() {
        assert_eq!(infer_type("true"), FieldType::Bool);
        assert_eq!(infer_type("FALSE"), FieldType::Bool);
        assert_eq!(infer_type("truthy"), FieldType::String);
    }

    #[test]
    fn test_infer_timestamp_iso_and_epoch() {
        assert_eq!(infer_type("2026-03-01T10:00:00Z"), FieldType::Timestamp);
        assert_eq!(infer_type("2026-03-01 10:00:00"), FieldType::Timestamp);
        // Epoch seconds within the plausible window beat plain ints
        assert_eq!(infer_type("1700000000"), FieldType::Timestamp);
        // Small and huge integers stay ints
        assert_eq!(infer_type("42"), FieldType::Int);
        assert_eq!(infer_type("99999999999999999"), FieldType::Int);
    }

    #[test]
    fn test_infer_string_fallback() {
        assert_eq!(infer_type("hello"), FieldType::String);
        assert_eq!(infer_type("12ab"), FieldType::String);
    }
}
