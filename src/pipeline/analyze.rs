//! Clinical analysis: structured record → [`AnalysisRecord`].

use crate::config::PipelineConfig;
use crate::output::{AnalysisRecord, StageOutput, StructuredRecord};
use crate::pipeline::llm::{self, GenerateRequest, LanguageModel};
use crate::prompts;
use tracing::{debug, warn};

/// Ask the analysis model to interpret the extraction result.
///
/// The upstream value is forwarded whatever its variant: a fallback is
/// serialised as `{"raw": …, "error": …}` and the model gets to make what it
/// can of it.
pub async fn analyze(
    client: &dyn LanguageModel,
    structured: &StageOutput<StructuredRecord>,
    config: &PipelineConfig,
) -> StageOutput<AnalysisRecord> {
    if structured.is_fallback() {
        debug!("Analysing a degraded extraction result");
    }

    let structured_json = serde_json::to_string(structured).unwrap_or_else(|e| {
        warn!("Could not serialise extraction result: {}", e);
        String::from("{}")
    });
    let prompt = prompts::analysis_prompt(&structured_json);
    let request = GenerateRequest {
        model: &config.analysis_model,
        prompt: &prompt,
        temperature: config.temperature,
    };

    llm::request_record::<AnalysisRecord>(client, &request, config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::output::{LabTest, RawFallback};
    use crate::pipeline::llm::MockLanguageModel;

    const MODEL: &str = "OussamaELALLAM/MedExpert";

    #[tokio::test]
    async fn forwards_parsed_record() {
        let mock = MockLanguageModel::new().with_reply(
            MODEL,
            r#"{"summary": "Mild anaemia", "abnormal_findings": [{"test": "Hemoglobin", "value": "10.1"}],
                "general_health_advice": ["Eat iron-rich food", "Hydrate"], "when_to_see_doctor": "Within a week"}"#,
        );
        let structured = StageOutput::Parsed(StructuredRecord {
            tests: vec![LabTest {
                name: Some("Hemoglobin".into()),
                value: Some("10.1".into()),
                ..Default::default()
            }],
            raw_text: "Hemoglobin 10.1".into(),
            ..Default::default()
        });

        let out = analyze(&mock, &structured, &PipelineConfig::default()).await;
        let record = out.parsed().expect("parsed");
        assert_eq!(record.summary.as_deref(), Some("Mild anaemia"));
        assert_eq!(record.abnormal_findings.len(), 1);
        assert_eq!(
            record.general_health_advice.as_deref(),
            Some("Eat iron-rich food; Hydrate")
        );

        let calls = mock.calls();
        assert_eq!(calls[0].0, MODEL);
        assert!(calls[0].1.contains(r#""raw_text":"Hemoglobin 10.1""#));
    }

    #[tokio::test]
    async fn forwards_fallback_verbatim() {
        let mock = MockLanguageModel::new().with_reply(MODEL, r#"{"summary": "unreadable"}"#);
        let structured = StageOutput::Fallback(RawFallback::from_reply(
            "I cannot help",
            ModelError::InvalidOutput {
                model: "gemma:2b".into(),
                detail: "no json".into(),
            },
        ));

        let out = analyze(&mock, &structured, &PipelineConfig::default()).await;
        assert!(!out.is_fallback());
        let prompt = &mock.calls()[0].1;
        assert!(prompt.contains(r#""raw":"I cannot help""#));
        assert!(prompt.contains("invalid_output"));
    }

    #[tokio::test]
    async fn transport_failure_is_a_fallback() {
        let mock = MockLanguageModel::new().with_transport_failure(MODEL, "connection refused");
        let out = analyze(
            &mock,
            &StageOutput::Parsed(StructuredRecord::default()),
            &PipelineConfig::default(),
        )
        .await;
        assert!(out.fallback().unwrap().error.is_transport());
    }
}
