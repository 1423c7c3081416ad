//! Error types for the medreport library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`]: **Fatal**: the run cannot proceed at all (missing
//!   image, undecodable bytes, no OCR engine). Returned as
//!   `Err(PipelineError)` from the top-level `run*` functions.
//!
//! * [`ModelError`]: **Non-fatal**: a language-model call failed or its
//!   reply could not be read as JSON. Stored inside
//!   [`crate::output::RawFallback`] so the caller still receives a
//!   best-effort [`crate::output::PipelineResult`] with the failure reason
//!   attached, instead of losing the whole report to one bad reply.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the medreport library.
///
/// Model-level failures use [`ModelError`] and are stored in-band rather
/// than propagated here.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Image errors ──────────────────────────────────────────────────────
    /// Input image was not found at the given path.
    #[error("Image file not found: '{path}'\nCheck the path exists and is readable.")]
    ImageNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a decodable image.
    #[error("Could not decode image '{path}': {detail}")]
    ImageDecode { path: PathBuf, detail: String },

    // ── OCR errors ────────────────────────────────────────────────────────
    /// The OCR engine could not be started (binary missing, no tessdata …).
    #[error("OCR engine '{engine}' is unavailable: {detail}\n{hint}")]
    OcrUnavailable {
        engine: String,
        detail: String,
        hint: String,
    },

    /// The OCR engine ran but failed on this image.
    #[error("OCR failed: {0}")]
    OcrFailed(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configured provider could not be constructed.
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output JSON file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// True for the errors that mean "the image itself could not be read".
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            PipelineError::ImageNotFound { .. }
                | PipelineError::PermissionDenied { .. }
                | PipelineError::ImageDecode { .. }
        )
    }
}

/// A non-fatal error from one language-model stage.
///
/// Stored inside [`crate::output::RawFallback`]; serialised with a `kind`
/// tag so stored results stay inspectable.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelError {
    /// The endpoint was unreachable or answered with something that is not
    /// a well-formed generate response.
    #[error("model '{model}': transport error: {detail}")]
    Transport { model: String, detail: String },

    /// The call did not complete within the configured timeout.
    #[error("model '{model}': no response after {secs}s")]
    Timeout { model: String, secs: u64 },

    /// A reply arrived but no JSON object could be recovered from it.
    #[error("model '{model}': invalid json: {detail}")]
    InvalidOutput { model: String, detail: String },
}

impl ModelError {
    /// Transport-class failures (the only ones worth retrying).
    pub fn is_transport(&self) -> bool {
        matches!(self, ModelError::Transport { .. } | ModelError::Timeout { .. })
    }

    /// The model identifier the failing call was addressed to.
    pub fn model(&self) -> &str {
        match self {
            ModelError::Transport { model, .. }
            | ModelError::Timeout { model, .. }
            | ModelError::InvalidOutput { model, .. } => model,
        }
    }
}
