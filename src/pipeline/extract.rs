//! Structured extraction: OCR text → [`StructuredRecord`].

use crate::config::PipelineConfig;
use crate::output::{StageOutput, StructuredRecord};
use crate::pipeline::llm::{self, GenerateRequest, LanguageModel};
use crate::prompts;
use tracing::{debug, warn};

/// Ask the extraction model to transcribe `text` into a [`StructuredRecord`].
///
/// On success `raw_text` always equals `text` byte for byte, whatever the
/// model wrote there. Empty text is still sent; the model then usually
/// returns the empty template.
pub async fn extract_structured(
    client: &dyn LanguageModel,
    text: &str,
    config: &PipelineConfig,
) -> StageOutput<StructuredRecord> {
    if text.is_empty() {
        warn!("OCR produced no text; sending an empty report to the extraction model");
    }

    let prompt = prompts::extraction_prompt(text);
    let request = GenerateRequest {
        model: &config.extraction_model,
        prompt: &prompt,
        temperature: config.temperature,
    };

    let mut output = llm::request_record::<StructuredRecord>(client, &request, config).await;
    if let StageOutput::Parsed(record) = &mut output {
        if record.raw_text != text {
            debug!("Extraction model altered raw_text; restoring OCR text");
            record.raw_text = text.to_string();
        }
        debug!(
            "Extracted {} tests (patient: {})",
            record.tests.len(),
            record.meta.patient_name.as_deref().unwrap_or("?")
        );
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::pipeline::llm::MockLanguageModel;

    fn config() -> PipelineConfig {
        PipelineConfig::default()
    }

    #[tokio::test]
    async fn parses_reply_and_restores_raw_text() {
        let mock = MockLanguageModel::new().with_reply(
            "gemma:2b",
            r#"```json
{"meta": {"patient_name": "A. Patient", "age": 45},
 "tests": [{"name": "Hemoglobin", "value": 13.5, "unit": "g/dL", "reference_range": "12-16", "status": "normal"}],
 "raw_text": "Hemoglobin 13.5"}
```"#,
        );
        let text = "Hemoglobin 13.5 g/dL 12-16";
        let out = extract_structured(&mock, text, &config()).await;
        let record = out.parsed().expect("parsed");
        assert_eq!(record.raw_text, text);
        assert_eq!(record.meta.age.as_deref(), Some("45"));
        assert_eq!(record.tests.len(), 1);
        assert_eq!(record.tests[0].value.as_deref(), Some("13.5"));
    }

    #[tokio::test]
    async fn prompt_goes_to_extraction_model() {
        let mock = MockLanguageModel::new().with_reply("gemma:2b", "{}");
        extract_structured(&mock, "WBC 7.2", &config()).await;
        let calls = mock.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "gemma:2b");
        assert!(calls[0].1.contains("WBC 7.2"));
    }

    #[tokio::test]
    async fn missing_raw_text_is_filled_in() {
        let mock = MockLanguageModel::new().with_reply("gemma:2b", r#"{"tests": []}"#);
        let out = extract_structured(&mock, "Glucose 90", &config()).await;
        assert_eq!(out.parsed().unwrap().raw_text, "Glucose 90");
    }

    #[tokio::test]
    async fn non_json_reply_falls_back() {
        let mock = MockLanguageModel::new().with_reply("gemma:2b", "I cannot read this report.");
        let out = extract_structured(&mock, "???", &config()).await;
        let fb = out.fallback().expect("fallback");
        assert_eq!(fb.raw, "I cannot read this report.");
        assert!(matches!(fb.error, ModelError::InvalidOutput { .. }));
    }

    #[tokio::test]
    async fn empty_text_still_calls_model() {
        let mock = MockLanguageModel::new().with_reply("gemma:2b", r#"{"meta": {}, "tests": []}"#);
        let out = extract_structured(&mock, "", &config()).await;
        assert_eq!(mock.calls().len(), 1);
        assert_eq!(out.parsed().unwrap().raw_text, "");
    }
}
