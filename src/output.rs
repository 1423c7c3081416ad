//! Result types produced by the pipeline.
//!
//! Every language-model stage yields a [`StageOutput`]: either the typed
//! record it asked for, or a [`RawFallback`] carrying whatever came back and
//! why it could not be used. Callers pattern-match on the variant instead of
//! probing an untyped map for an `error` key.
//!
//! ## Leniency
//!
//! Models routinely answer `"age": 45` where the template says `"age": ""`,
//! or return a list where a sentence was expected. Record fields therefore
//! decode leniently (see [`lenient`]) and unknown keys are kept in `extra`.
//! No schema validation happens here: a syntactically valid object of the
//! wrong shape is accepted as-is.

use crate::error::ModelError;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Outcome of one language-model stage.
///
/// Serialises untagged: a parsed record looks exactly like the record, a
/// fallback looks like `{"raw": "...", "error": {"kind": ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StageOutput<T> {
    /// Unparseable or undeliverable model output.
    ///
    /// Listed first so that deserialising a stored result only picks this
    /// variant when both `raw` and a tagged `error` are present.
    Fallback(RawFallback),
    /// The model answered with a JSON object.
    Parsed(T),
}

impl<T> StageOutput<T> {
    pub fn parsed(&self) -> Option<&T> {
        match self {
            StageOutput::Parsed(record) => Some(record),
            StageOutput::Fallback(_) => None,
        }
    }

    pub fn fallback(&self) -> Option<&RawFallback> {
        match self {
            StageOutput::Parsed(_) => None,
            StageOutput::Fallback(fb) => Some(fb),
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, StageOutput::Fallback(_))
    }
}

/// Degraded stage result.
///
/// `raw` is the model's unparsed reply for [`ModelError::InvalidOutput`], or
/// the transport error description when no reply arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFallback {
    pub raw: String,
    pub error: ModelError,
}

impl RawFallback {
    /// Build a fallback for a call that never produced a reply.
    pub fn from_transport(error: ModelError) -> Self {
        Self {
            raw: error.to_string(),
            error,
        }
    }

    /// Build a fallback for a reply that could not be parsed.
    pub fn from_reply(raw: impl Into<String>, error: ModelError) -> Self {
        Self {
            raw: raw.into(),
            error,
        }
    }
}

// ── Structured extraction record ─────────────────────────────────────────

/// Report header fields. Every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportMeta {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub hospital: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub address: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub report_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub patient_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub age: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub gender: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub doctor: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub additional_info: Option<String>,
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

/// One laboratory measurement as transcribed by the extraction model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabTest {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub value: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub unit: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub reference_range: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub status: Option<String>,
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

/// Output of the structured extraction stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredRecord {
    #[serde(default, deserialize_with = "lenient::object")]
    pub meta: ReportMeta,
    #[serde(default, deserialize_with = "lenient::seq")]
    pub tests: Vec<LabTest>,
    /// Verbatim OCR text the record was extracted from.
    #[serde(default, deserialize_with = "lenient::string")]
    pub raw_text: String,
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

// ── Clinical analysis record ─────────────────────────────────────────────

/// One out-of-range result with the model's interpretation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbnormalFinding {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub test: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub value: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub normal_range: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub interpretation: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub possible_causes: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub recommended_actions: Option<String>,
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

/// Output of the clinical analysis stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub summary: Option<String>,
    #[serde(default, deserialize_with = "lenient::seq")]
    pub abnormal_findings: Vec<AbnormalFinding>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub general_health_advice: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub when_to_see_doctor: Option<String>,
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

// ── Pipeline result ──────────────────────────────────────────────────────

/// The sole artifact returned by [`crate::run::Pipeline::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub structured: StageOutput<StructuredRecord>,
    pub analysis: StageOutput<AnalysisRecord>,
    /// Local wall-clock time the run finished, RFC 3339 / ISO-8601 on the wire.
    pub time: DateTime<Local>,
}

impl PipelineResult {
    /// True when at least one model stage fell back to raw output.
    pub fn is_degraded(&self) -> bool {
        self.structured.is_fallback() || self.analysis.is_fallback()
    }
}

/// Tolerant field decoders for model-authored JSON.
pub mod lenient {
    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;
    use tracing::debug;

    /// Render any JSON value as display text.
    ///
    /// Scalars become their natural text, arrays of scalars are joined with
    /// `"; "`, anything else is kept as compact JSON.
    pub fn value_to_text(value: &Value) -> Option<String> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Array(items) if items.iter().all(is_scalar) => Some(
                items
                    .iter()
                    .filter_map(value_to_text)
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            other => Some(other.to_string()),
        }
    }

    fn is_scalar(value: &Value) -> bool {
        !matches!(value, Value::Array(_) | Value::Object(_))
    }

    pub fn opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(value_to_text(&value))
    }

    pub fn string<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(opt_string(deserializer)?.unwrap_or_default())
    }

    /// Decode a nested record; a non-object value yields the default.
    pub fn object<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned + Default,
    {
        let value = Value::deserialize(deserializer)?;
        if !value.is_object() {
            debug!("expected an object, got {value}; using defaults");
            return Ok(T::default());
        }
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    /// Decode an array of records, skipping items that are not objects.
    pub fn seq<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        let value = Value::deserialize(deserializer)?;
        let items = match value {
            Value::Array(items) => items,
            Value::Null => return Ok(Vec::new()),
            other => {
                debug!("expected an array, got {other}; treating as empty");
                return Ok(Vec::new());
            }
        };
        Ok(items
            .into_iter()
            .filter(Value::is_object)
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_record_from_template_shape() {
        let v = json!({
            "meta": {
                "hospital": "City Lab",
                "address": "",
                "report_type": "CBC",
                "patient_name": "Jane Doe",
                "age": 45,
                "gender": "F",
                "doctor": null,
                "additional_info": ""
            },
            "tests": [
                {"name": "Hemoglobin", "value": 13.5, "unit": "g/dL",
                 "reference_range": "12-16", "status": "Normal"}
            ],
            "raw_text": "Hemoglobin 13.5 g/dL Normal"
        });
        let record: StructuredRecord = serde_json::from_value(v).unwrap();
        assert_eq!(record.meta.age.as_deref(), Some("45"));
        assert_eq!(record.meta.doctor, None);
        assert_eq!(record.tests.len(), 1);
        assert_eq!(record.tests[0].value.as_deref(), Some("13.5"));
        assert!(record.extra.is_empty());
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let v = json!({"tests": [], "raw_text": "", "lab_id": "X-1"});
        let record: StructuredRecord = serde_json::from_value(v).unwrap();
        assert_eq!(record.extra.get("lab_id"), Some(&json!("X-1")));
        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["lab_id"], "X-1");
    }

    #[test]
    fn wrong_shapes_are_tolerated() {
        let v = json!({"meta": "n/a", "tests": "none", "raw_text": null});
        let record: StructuredRecord = serde_json::from_value(v).unwrap();
        assert_eq!(record.meta, ReportMeta::default());
        assert!(record.tests.is_empty());
        assert_eq!(record.raw_text, "");
    }

    #[test]
    fn non_object_test_entries_are_skipped() {
        let v = json!({"tests": ["Hemoglobin", {"name": "WBC"}]});
        let record: StructuredRecord = serde_json::from_value(v).unwrap();
        assert_eq!(record.tests.len(), 1);
        assert_eq!(record.tests[0].name.as_deref(), Some("WBC"));
    }

    #[test]
    fn list_fields_are_joined() {
        let v = json!({
            "summary": "Mild anaemia",
            "abnormal_findings": [{
                "test": "Hemoglobin",
                "possible_causes": ["iron deficiency", "blood loss"],
                "recommended_actions": {"diet": "iron-rich"}
            }]
        });
        let record: AnalysisRecord = serde_json::from_value(v).unwrap();
        let finding = &record.abnormal_findings[0];
        assert_eq!(
            finding.possible_causes.as_deref(),
            Some("iron deficiency; blood loss")
        );
        assert_eq!(
            finding.recommended_actions.as_deref(),
            Some(r#"{"diet":"iron-rich"}"#)
        );
    }

    #[test]
    fn fallback_serialises_with_raw_and_error() {
        let out: StageOutput<AnalysisRecord> = StageOutput::Fallback(RawFallback::from_reply(
            "not json",
            ModelError::InvalidOutput {
                model: "m".into(),
                detail: "d".into(),
            },
        ));
        let v = serde_json::to_value(&out).unwrap();
        assert_eq!(v["raw"], "not json");
        assert_eq!(v["error"]["kind"], "invalid_output");
    }

    #[test]
    fn stage_output_deserialises_to_the_right_variant() {
        let parsed: StageOutput<AnalysisRecord> =
            serde_json::from_value(json!({"summary": "ok", "abnormal_findings": []})).unwrap();
        assert_eq!(parsed.parsed().and_then(|r| r.summary.as_deref()), Some("ok"));

        let fallback: StageOutput<AnalysisRecord> = serde_json::from_value(json!({
            "raw": "oops",
            "error": {"kind": "timeout", "model": "m", "secs": 30}
        }))
        .unwrap();
        assert!(fallback.is_fallback());
    }

    #[test]
    fn transport_fallback_carries_description() {
        let fb = RawFallback::from_transport(ModelError::Transport {
            model: "gemma:2b".into(),
            detail: "connection refused".into(),
        });
        assert!(fb.raw.contains("connection refused"));
    }
}
