//! Recover a JSON object from free-form model replies.
//!
//! Models asked for "JSON ONLY" still wrap it in prose or code fences. The
//! recovery order is:
//!
//! 1. the span from the first `{` to the last `}` (greedy, across newlines)
//! 2. the whole reply
//! 3. give up: the reply becomes a [`RawFallback`] with an
//!    [`ModelError::InvalidOutput`] reason
//!
//! The greedy span means two separate objects in one reply
//! (`{"a":1} and {"b":2}`) do not parse; that is deliberate, since picking
//! one of them would silently drop data.

use crate::error::ModelError;
use crate::output::{RawFallback, StageOutput};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

static RE_JSON_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{.*\}").unwrap());

/// The first-`{`-to-last-`}` span of `reply`, if it has one.
pub fn locate_json_block(reply: &str) -> Option<&str> {
    RE_JSON_BLOCK.find(reply).map(|m| m.as_str())
}

/// Parse `reply` into a JSON value, trying the brace span first.
///
/// Returns the parser's message on failure.
pub fn parse_json_reply(reply: &str) -> Result<Value, String> {
    if let Some(block) = locate_json_block(reply) {
        match serde_json::from_str::<Value>(block) {
            Ok(value) => return Ok(value),
            Err(e) => debug!("Brace span is not valid JSON ({}); trying whole reply", e),
        }
    }
    serde_json::from_str::<Value>(reply).map_err(|e| e.to_string())
}

/// Parse a model reply into a typed record, or a fallback carrying the
/// verbatim reply.
pub fn parse_reply<T: DeserializeOwned>(model: &str, reply: &str) -> StageOutput<T> {
    let invalid = |detail: String| {
        StageOutput::Fallback(RawFallback::from_reply(
            reply,
            ModelError::InvalidOutput {
                model: model.to_string(),
                detail,
            },
        ))
    };

    let value = match parse_json_reply(reply) {
        Ok(v) => v,
        Err(detail) => return invalid(detail),
    };
    if !value.is_object() {
        return invalid(format!("expected a JSON object, got {}", kind_of(&value)));
    }
    match serde_json::from_value::<T>(value) {
        Ok(record) => StageOutput::Parsed(record),
        Err(e) => invalid(e.to_string()),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{AnalysisRecord, StructuredRecord};
    use serde_json::json;

    #[test]
    fn prose_around_object_is_stripped() {
        let v = parse_json_reply("noise before {\"a\":1} noise after").unwrap();
        assert_eq!(v, json!({"a": 1}));
    }

    #[test]
    fn code_fences_are_stripped() {
        let reply = "Here you go:\n```json\n{\n  \"summary\": \"ok\"\n}\n```\nHope this helps.";
        let out: StageOutput<AnalysisRecord> = parse_reply("m", reply);
        assert_eq!(out.parsed().unwrap().summary.as_deref(), Some("ok"));
    }

    #[test]
    fn nested_objects_survive_greedy_match() {
        let v = parse_json_reply(r#"x {"meta": {"age": "42"}, "tests": []} y"#).unwrap();
        assert_eq!(v["meta"]["age"], "42");
    }

    #[test]
    fn no_braces_becomes_fallback_with_verbatim_reply() {
        let out: StageOutput<StructuredRecord> = parse_reply("gemma:2b", "I cannot help");
        let fb = out.fallback().expect("fallback");
        assert_eq!(fb.raw, "I cannot help");
        assert!(matches!(fb.error, ModelError::InvalidOutput { .. }));
        assert!(fb.error.to_string().contains("invalid json"));
    }

    #[test]
    fn two_objects_do_not_parse() {
        let out: StageOutput<AnalysisRecord> = parse_reply("m", r#"{"a":1} and {"b":2}"#);
        assert!(out.is_fallback());
    }

    #[test]
    fn whole_reply_is_tried_when_span_fails() {
        let v = parse_json_reply(r#""{not json}""#).unwrap();
        assert_eq!(v, json!("{not json}"));
    }

    #[test]
    fn non_object_json_is_a_fallback() {
        let out: StageOutput<AnalysisRecord> = parse_reply("m", "[1, 2, 3]");
        let fb = out.fallback().expect("fallback");
        assert!(fb.error.to_string().contains("an array"));
    }

    #[test]
    fn empty_reply_is_a_fallback() {
        let out: StageOutput<StructuredRecord> = parse_reply("m", "");
        assert_eq!(out.fallback().unwrap().raw, "");
    }
}
