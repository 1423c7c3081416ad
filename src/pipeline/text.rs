//! Confidence filtering: OCR tokens → plain report text.
//!
//! A token survives when its confidence is strictly above the threshold and
//! its text is not blank after trimming. Survivors keep engine order and are
//! joined with single spaces, so layout (line breaks, columns) is lost here
//! by construction.

use crate::error::PipelineError;
use crate::pipeline::normalize::NormalizedImage;
use crate::pipeline::ocr::{OcrEngine, TokenSample};
use std::sync::Arc;
use tracing::debug;

/// Minimum confidence (exclusive) for a token to be kept.
pub const DEFAULT_CONFIDENCE_THRESHOLD: i32 = 30;

/// Tokens that pass the confidence and blank-text filters, in input order.
pub fn retain_confident(
    tokens: &[TokenSample],
    threshold: i32,
) -> impl Iterator<Item = &TokenSample> + '_ {
    tokens
        .iter()
        .filter(move |t| t.confidence > threshold && !t.text.trim().is_empty())
}

/// Join the confident tokens with single spaces.
///
/// Token text is used as the engine reported it; only blank tokens are
/// dropped.
pub fn join_confident(tokens: &[TokenSample], threshold: i32) -> String {
    retain_confident(tokens, threshold)
        .map(|t| t.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run `engine` over `image` and return the filtered text.
pub fn extract_text(
    engine: &dyn OcrEngine,
    image: &NormalizedImage,
    threshold: i32,
) -> Result<String, PipelineError> {
    let tokens = engine.recognize(image)?;
    let text = join_confident(&tokens, threshold);
    debug!(
        "{}: kept {} of {} tokens above confidence {} ({} chars)",
        engine.name(),
        retain_confident(&tokens, threshold).count(),
        tokens.len(),
        threshold,
        text.len()
    );
    Ok(text)
}

/// [`extract_text`] on the blocking thread pool.
pub async fn extract_text_async(
    engine: Arc<dyn OcrEngine>,
    image: NormalizedImage,
    threshold: i32,
) -> Result<String, PipelineError> {
    tokio::task::spawn_blocking(move || extract_text(engine.as_ref(), &image, threshold))
        .await
        .map_err(|e| PipelineError::Internal(format!("OCR task panicked: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ocr::MockOcrEngine;
    use image::{GrayImage, Luma};

    fn tok(text: &str, confidence: i32) -> TokenSample {
        TokenSample::new(text, confidence)
    }

    #[test]
    fn empty_input_gives_empty_text() {
        assert_eq!(join_confident(&[], DEFAULT_CONFIDENCE_THRESHOLD), "");
    }

    #[test]
    fn threshold_is_exclusive() {
        let tokens = [tok("low", 30), tok("high", 31)];
        assert_eq!(join_confident(&tokens, 30), "high");
    }

    #[test]
    fn structural_and_blank_rows_are_dropped() {
        let tokens = [
            tok("", -1),
            tok("Hemoglobin", 95),
            tok("   ", 99),
            tok("13.5", 90),
            tok("\t", 80),
            tok("g/dL", 88),
        ];
        assert_eq!(join_confident(&tokens, 30), "Hemoglobin 13.5 g/dL");
    }

    #[test]
    fn order_is_preserved() {
        let tokens = [tok("c", 90), tok("a", 90), tok("b", 90)];
        assert_eq!(join_confident(&tokens, 30), "c a b");
    }

    #[test]
    fn raising_threshold_only_removes_tokens() {
        let tokens = [tok("a", 35), tok("b", 60), tok("c", 95), tok("d", 50)];
        let loose: Vec<_> = retain_confident(&tokens, 30).collect();
        let strict: Vec<_> = retain_confident(&tokens, 55).collect();
        assert!(strict.len() <= loose.len());
        assert!(strict.iter().all(|t| loose.contains(t)));
        assert_eq!(join_confident(&tokens, 55), "b c");
    }

    #[test]
    fn extract_text_uses_engine() {
        let engine = MockOcrEngine::from_tokens(vec![tok("WBC", 91), tok("smudge", 12)]);
        let image = NormalizedImage::from_gray(GrayImage::from_pixel(2, 2, Luma([0])));
        assert_eq!(extract_text(&engine, &image, 30).unwrap(), "WBC");
    }

    #[test]
    fn extract_text_async_propagates_engine_errors() {
        let engine: Arc<dyn OcrEngine> = Arc::new(MockOcrEngine::failing("boom"));
        let image = NormalizedImage::from_gray(GrayImage::from_pixel(2, 2, Luma([0])));
        let err = tokio_test::block_on(extract_text_async(engine, image, 30)).unwrap_err();
        assert!(matches!(err, PipelineError::OcrFailed(_)));
    }
}
