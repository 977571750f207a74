//! Salvage of structured payloads from raw model text, and the schema
//! shape that tells a backend adapter where units and anchors live.
//!
//! The session itself is schema-opaque; everything schema-specific is
//! confined to this module and the backend adapters that use it.

use anchorstitch_core::{CallOutcome, Error, Result};
use serde_json::Value;

/// Field names for unpacking a provider payload into a [`CallOutcome`].
#[derive(Debug, Clone)]
pub struct SchemaShape {
    /// Top-level array of structural units.
    pub units_key: String,
    /// Per-unit field holding the unit's verbatim start phrase.
    pub anchor_key: String,
    /// Optional top-level field carrying an explicit next-boundary
    /// anchor; when present it wins over the last unit's start phrase.
    pub explicit_next_key: Option<String>,
}

impl Default for SchemaShape {
    fn default() -> Self {
        Self {
            units_key: "topic_chunks".to_string(),
            anchor_key: "start_anchor".to_string(),
            explicit_next_key: None,
        }
    }
}

/// User-turn assembly shared by all backends: the slice (and optional
/// helper context) in delimited blocks.
pub fn user_message(slice: &str, helper: Option<&str>) -> String {
    let mut msg = format!("Transcript:\n<<<\n{slice}\n>>>");
    if let Some(helper) = helper {
        msg.push_str(&format!("\nHelper:\n<<<\n{helper}\n>>>"));
    }
    msg
}

/// Drop a reasoning preamble: everything up to and including a
/// `</think>` tag, when one is present.
pub fn clean_think(text: &str) -> &str {
    match text.find("</think>") {
        Some(pos) => &text[pos + "</think>".len()..],
        None => text,
    }
}

/// Best-effort JSON recovery from model text: direct parse, then a
/// fenced ```json block, then the outermost brace pair. Anything less
/// is a formatting error (retryable upstream).
pub fn extract_json(text: &str) -> Result<Value> {
    let text = clean_think(text).trim();
    if let Ok(v) = serde_json::from_str::<Value>(text) {
        return Ok(v);
    }

    if let Some(fence) = text.find("```") {
        let rest = &text[fence + 3..];
        let rest = rest
            .strip_prefix("json")
            .or_else(|| rest.strip_prefix("JSON"))
            .unwrap_or(rest);
        if let Some(end) = rest.find("```") {
            if let Ok(v) = serde_json::from_str::<Value>(rest[..end].trim()) {
                return Ok(v);
            }
        }
    }

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if end > start {
            if let Ok(v) = serde_json::from_str::<Value>(&text[start..=end]) {
                return Ok(v);
            }
        }
    }

    Err(Error::Format("no valid JSON found in model output".to_string()))
}

/// Unpack raw provider text into a [`CallOutcome`] according to `shape`.
pub fn parse_outcome(raw_text: &str, usage_tokens: u64, shape: &SchemaShape) -> Result<CallOutcome> {
    let payload = extract_json(raw_text)?;
    let units: Vec<Value> = payload
        .get(&shape.units_key)
        .and_then(|v| v.as_array())
        .cloned()
        .ok_or_else(|| Error::Format(format!("payload is missing array {:?}", shape.units_key)))?;

    let explicit = shape
        .explicit_next_key
        .as_deref()
        .and_then(|k| payload.get(k))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let next_anchor = explicit.or_else(|| {
        units
            .last()
            .and_then(|u| u.get(&shape.anchor_key))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    });

    Ok(CallOutcome {
        units,
        next_anchor,
        usage_tokens,
        raw_text: raw_text.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_think_strips_reasoning_preamble() {
        assert_eq!(clean_think("blah blah</think>{\"a\":1}"), "{\"a\":1}");
        assert_eq!(clean_think("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn extract_json_accepts_fenced_blocks() {
        let v = extract_json("here you go:\n```json\n{\"a\": 1}\n```\nthanks").unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn extract_json_falls_back_to_outermost_braces() {
        let v = extract_json("Sure! {\"a\": {\"b\": 2}} hope that helps").unwrap();
        assert_eq!(v["a"]["b"], 2);
    }

    #[test]
    fn extract_json_surfaces_format_error() {
        let err = extract_json("I could not produce JSON, sorry").unwrap_err();
        assert!(err.is_retryable(), "format errors must be retryable: {err}");
    }

    #[test]
    fn parse_outcome_takes_anchor_from_last_unit() {
        let raw = r#"{"topic_chunks": [
            {"topic_label": "gold", "start_anchor": "今天谈黄金"},
            {"topic_label": "oil", "start_anchor": "明天谈原油"}
        ]}"#;
        let out = parse_outcome(raw, 7, &SchemaShape::default()).unwrap();
        assert_eq!(out.units.len(), 2);
        assert_eq!(out.next_anchor.as_deref(), Some("明天谈原油"));
        assert_eq!(out.usage_tokens, 7);
    }

    #[test]
    fn parse_outcome_prefers_explicit_next_anchor() {
        let shape = SchemaShape {
            explicit_next_key: Some("end_anchor".to_string()),
            ..SchemaShape::default()
        };
        let raw = r#"{"end_anchor": "下一段", "topic_chunks": [
            {"topic_label": "a", "start_anchor": "第一段"}
        ]}"#;
        let out = parse_outcome(raw, 0, &shape).unwrap();
        assert_eq!(out.next_anchor.as_deref(), Some("下一段"));
    }

    #[test]
    fn parse_outcome_missing_units_is_format_error() {
        let err = parse_outcome(r#"{"something_else": []}"#, 0, &SchemaShape::default()).unwrap_err();
        assert!(err.is_retryable());
    }
}
