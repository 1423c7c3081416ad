//! Prompt templates for the two language-model stages.
//!
//! Both templates end with a literal JSON skeleton so the model copies the
//! field names verbatim. Keeping them here means prompt changes never touch
//! the call or parsing code, and tests can inspect the exact text sent.

/// Build the structured extraction prompt.
///
/// `text` appears twice: once as prose for the model to read, and once as
/// the pre-filled `raw_text` value, encoded as a JSON string literal so
/// quotes and newlines in OCR output cannot break the skeleton.
pub fn extraction_prompt(text: &str) -> String {
    let raw_text_literal = serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"
Extract ALL information from this medical report text:

{text}

Return JSON ONLY:
{{
  "meta": {{
    "hospital": "",
    "address": "",
    "report_type": "",
    "patient_name": "",
    "age": "",
    "gender": "",
    "doctor": "",
    "additional_info": ""
  }},
  "tests": [
    {{ "name": "", "value": "", "unit": "", "reference_range": "", "status": "" }}
  ],
  "raw_text": {raw_text_literal}

}}
"#
    )
}

/// Build the clinical analysis prompt around the serialised upstream value.
///
/// `structured_json` is embedded as-is; it may be a parsed record or a raw
/// fallback object, and no validation is applied.
pub fn analysis_prompt(structured_json: &str) -> String {
    format!(
        r#"
You are a medical expert. Analyze this structured JSON:

{structured_json}

Return JSON with:
{{
 "summary": "",
 "abnormal_findings": [
   {{
     "test": "",
     "value": "",
     "normal_range": "",
     "interpretation": "",
     "possible_causes": "",
     "recommended_actions": ""
   }}
 ],
 "general_health_advice": "",
 "when_to_see_doctor": ""
}}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_prompt_embeds_text_and_literal() {
        let p = extraction_prompt("Hemoglobin 13.5 g/dL");
        assert!(p.contains("\nHemoglobin 13.5 g/dL\n"));
        assert!(p.contains(r#""raw_text": "Hemoglobin 13.5 g/dL""#));
        for field in [
            "hospital",
            "address",
            "report_type",
            "patient_name",
            "age",
            "gender",
            "doctor",
            "additional_info",
            "reference_range",
        ] {
            assert!(p.contains(&format!("\"{field}\"")), "missing {field}");
        }
    }

    #[test]
    fn extraction_prompt_escapes_quotes() {
        let p = extraction_prompt("Dr. \"House\"\nline2");
        assert!(p.contains(r#""raw_text": "Dr. \"House\"\nline2""#));
    }

    #[test]
    fn extraction_prompt_with_empty_text() {
        let p = extraction_prompt("");
        assert!(p.contains(r#""raw_text": """#));
    }

    #[test]
    fn analysis_prompt_embeds_json() {
        let p = analysis_prompt(r#"{"tests":[]}"#);
        assert!(p.starts_with("\nYou are a medical expert."));
        assert!(p.contains(r#"{"tests":[]}"#));
        assert!(p.contains("\"when_to_see_doctor\""));
    }
}
