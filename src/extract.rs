//! Optional-field extraction over loosely typed tool output.
//!
//! Tool JSON drifts between versions: fields get renamed, numbers turn into
//! strings or into `{"value": n}` objects, whole documents get wrapped in a
//! device-keyed object. Nothing here assumes a shape; every accessor returns
//! `None` when the field is absent or unreadable and the caller picks the
//! default.

use serde_json::Value;

use crate::error::ToolError;

/// Parse one JSON document, keeping the raw text on failure.
pub fn parse_json(tool: &str, raw: &str) -> Result<Value, ToolError> {
    let start = raw.find(|c: char| c == '{' || c == '[').ok_or_else(|| {
        ToolError::malformed(tool, "no JSON document in output", raw)
    })?;
    serde_json::from_str(&raw[start..])
        .map_err(|e| ToolError::malformed(tool, e.to_string(), raw))
}

/// Consecutive JSON documents in one output stream (e.g. periodic status
/// reports). Leading non-JSON chatter is skipped; parsing stops at the first
/// broken document and whatever parsed before it is kept.
pub fn json_documents(raw: &str) -> Vec<Value> {
    let Some(start) = raw.find('{') else {
        return Vec::new();
    };
    serde_json::Deserializer::from_str(&raw[start..])
        .into_iter::<Value>()
        .map_while(Result::ok)
        .collect()
}

/// Walk `path` through nested objects.
pub fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(key))
}

/// Numeric reading of a loosely typed value: a JSON number, a string that
/// starts with a number (`"38 C"`, `"0x1f"`), or an object carrying `value`.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_leading_number(s),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Object(map) => map.get("value").and_then(as_f64),
        _ => None,
    }
}

pub fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        _ => as_f64(value).filter(|f| *f >= 0.0).map(|f| f as u64),
    }
}

fn parse_leading_number(s: &str) -> Option<f64> {
    let t = s.trim();
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        let digits: String = hex.chars().take_while(|c| c.is_ascii_hexdigit()).collect();
        return u64::from_str_radix(&digits, 16).ok().map(|v| v as f64);
    }
    let end = t
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || *c == ',' || (*i == 0 && (*c == '-' || *c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(t.len());
    t[..end].replace(',', "").parse::<f64>().ok()
}

/// First of several alternative field names that yields a number.
pub fn first_f64(value: &Value, names: &[&str]) -> Option<f64> {
    names.iter().find_map(|n| value.get(n).and_then(as_f64))
}

pub fn first_u64(value: &Value, names: &[&str]) -> Option<u64> {
    names.iter().find_map(|n| value.get(n).and_then(as_u64))
}

/// Trimmed, non-empty string field.
pub fn text(value: &Value, name: &str) -> Option<String> {
    value
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// The object holding `marker`: the value itself, or one level down when the
/// tool keyed its report by device name.
pub fn unwrap_keyed<'a>(value: &'a Value, marker: &str) -> Option<&'a Value> {
    if value.get(marker).is_some() {
        return Some(value);
    }
    value
        .as_object()?
        .values()
        .find(|v| v.get(marker).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_in_many_disguises() {
        assert_eq!(as_f64(&json!(42)), Some(42.0));
        assert_eq!(as_f64(&json!("38 C")), Some(38.0));
        assert_eq!(as_f64(&json!("0x1f")), Some(31.0));
        assert_eq!(as_f64(&json!("1,024")), Some(1024.0));
        assert_eq!(as_f64(&json!({"value": 3})), Some(3.0));
        assert_eq!(as_f64(&json!(null)), None);
        assert_eq!(as_f64(&json!("n/a")), None);
    }

    #[test]
    fn alternative_field_names() {
        let v = json!({"percent_used": 7});
        assert_eq!(first_u64(&v, &["percentage_used", "percent_used"]), Some(7));
        assert_eq!(first_u64(&v, &["missing"]), None);
    }

    #[test]
    fn document_stream_skips_chatter_and_keeps_prefix() {
        let raw = "note: something\n{\"a\":1}\n{\"a\":2}\n{\"a\":";
        let docs = json_documents(raw);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1]["a"], 2);
    }

    #[test]
    fn parse_json_preserves_raw_on_failure() {
        let err = parse_json("nvme", "Error: no device").unwrap_err();
        assert_eq!(err.raw_output(), Some("Error: no device"));
    }

    #[test]
    fn keyed_reports_are_unwrapped() {
        let v = json!({"nvme0": {"sstat": 1}});
        assert_eq!(unwrap_keyed(&v, "sstat"), Some(&json!({"sstat": 1})));
        assert_eq!(lookup(&v, &["nvme0", "sstat"]), Some(&json!(1)));
    }
}
