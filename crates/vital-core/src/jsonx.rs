//! Tolerant JSON extraction for model output.
//!
//! Models asked for strict JSON still wrap payloads in markdown fences or
//! prefix them with prose; every JSON-consuming call site strips that here.

use serde_json::Value;

/// Parse model output into a JSON value, stripping ``` fences and an optional
/// `json` language tag. Returns None when nothing parseable remains.
pub fn parse_loose_json(text: &str) -> Option<Value> {
    let mut payload = text.trim();
    if payload.contains("```") {
        let mut parts = payload.split("```");
        parts.next();
        payload = parts.next().unwrap_or("").trim();
        if let Some(stripped) = payload.strip_prefix("json") {
            payload = stripped.trim();
        }
    }
    serde_json::from_str(payload).ok()
}

/// Like [`parse_loose_json`] but only accepts objects.
pub fn parse_loose_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    match parse_loose_json(text)? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

pub fn as_f64(value: Option<&Value>) -> Option<f64> {
    let value = value?;
    if let Some(n) = value.as_f64() {
        return Some(n);
    }
    value.as_str()?.trim().parse().ok()
}

pub fn as_i64(value: Option<&Value>) -> Option<i64> {
    let value = value?;
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    if let Some(f) = value.as_f64() {
        return Some(f as i64);
    }
    value.as_str()?.trim().parse().ok()
}

/// Collect an array of non-empty strings from a JSON field.
pub fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_markdown_fences() {
        let out = parse_loose_json("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(out, json!({"a": 1}));
    }

    #[test]
    fn plain_json_passes_through() {
        assert_eq!(parse_loose_json("{\"a\": 1}").unwrap(), json!({"a": 1}));
        assert!(parse_loose_json("not json").is_none());
    }

    #[test]
    fn object_filter_rejects_arrays() {
        assert!(parse_loose_object("[1, 2]").is_none());
        assert!(parse_loose_object("{\"k\": true}").is_some());
    }

    #[test]
    fn numeric_coercions_accept_strings() {
        assert_eq!(as_f64(Some(&json!("0.8"))), Some(0.8));
        assert_eq!(as_f64(Some(&json!(0.5))), Some(0.5));
        assert_eq!(as_i64(Some(&json!(3.9))), Some(3));
        assert_eq!(as_i64(Some(&json!("7"))), Some(7));
        assert_eq!(as_f64(Some(&json!(null))), None);
    }
}
