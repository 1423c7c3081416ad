//! OCR engines: normalised bitmap → per-token text and confidence.
//!
//! Engines sit behind the [`OcrEngine`] trait so the pipeline never knows
//! which one it is talking to. Three are provided:
//!
//! | Engine | When | How |
//! |--------|------|-----|
//! | [`TesseractCommand`] | default | spawns the `tesseract` CLI, PNG on stdin, TSV on stdout |
//! | `BundledTesseract`   | `ocr` feature + tessdata dir | links libtesseract through the `tesseract` crate |
//! | [`MockOcrEngine`]    | tests | returns scripted tokens |
//!
//! Every engine reports the same shape: one [`TokenSample`] per TSV row,
//! including structural rows (page/block/line) whose confidence is `-1` and
//! whose text is empty. Filtering happens in [`crate::pipeline::text`].

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::pipeline::normalize::NormalizedImage;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

const TESSERACT_INSTALL_HINT: &str = "Install Tesseract OCR:\n  \
    macOS:   brew install tesseract\n  \
    Debian:  apt-get install tesseract-ocr\n  \
    Windows: https://github.com/UB-Mannheim/tesseract/wiki\n\
    or point --tesseract / MEDREPORT_TESSERACT at the binary.";

/// One recognised token with its engine confidence (0–100, `-1` for
/// structural rows).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSample {
    pub text: String,
    pub confidence: i32,
}

impl TokenSample {
    pub fn new(text: impl Into<String>, confidence: i32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// Word-level recognition over a normalised bitmap.
///
/// Implementations are synchronous and may block; the pipeline calls them
/// from the blocking thread pool.
pub trait OcrEngine: Send + Sync {
    /// Short engine name for logs and error messages.
    fn name(&self) -> &str;

    /// Recognise `image`, returning tokens in engine reading order.
    fn recognize(&self, image: &NormalizedImage) -> Result<Vec<TokenSample>, PipelineError>;
}

// ═══════════════════════════════════════════════════════════
// Tesseract CLI
// ═══════════════════════════════════════════════════════════

/// Runs the `tesseract` executable once per image.
#[derive(Debug, Clone)]
pub struct TesseractCommand {
    program: String,
    language: String,
    tessdata_dir: Option<PathBuf>,
}

impl TesseractCommand {
    pub fn new(program: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            language: language.into(),
            tessdata_dir: None,
        }
    }

    pub fn with_tessdata_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tessdata_dir = Some(dir.into());
        self
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            program: config.tesseract_cmd.clone(),
            language: config.ocr_language.clone(),
            tessdata_dir: config.tessdata_dir.clone(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("stdin").arg("stdout").arg("-l").arg(&self.language);
        if let Some(dir) = &self.tessdata_dir {
            cmd.arg("--tessdata-dir").arg(dir);
        }
        cmd.arg("tsv")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl OcrEngine for TesseractCommand {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn recognize(&self, image: &NormalizedImage) -> Result<Vec<TokenSample>, PipelineError> {
        let png = image
            .to_png()
            .map_err(|e| PipelineError::Internal(format!("PNG encoding failed: {}", e)))?;

        let mut child = self.command().spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound => PipelineError::OcrUnavailable {
                engine: self.program.clone(),
                detail: "executable not found".into(),
                hint: TESSERACT_INSTALL_HINT.into(),
            },
            _ => PipelineError::OcrUnavailable {
                engine: self.program.clone(),
                detail: e.to_string(),
                hint: TESSERACT_INSTALL_HINT.into(),
            },
        })?;

        // Feed stdin from a separate thread so a large TSV on stdout cannot
        // deadlock against a full stdin pipe.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| PipelineError::Internal("tesseract stdin was not piped".into()))?;
        let writer = std::thread::spawn(move || stdin.write_all(&png));

        let output = child
            .wait_with_output()
            .map_err(|e| PipelineError::OcrFailed(format!("waiting for tesseract: {}", e)))?;

        match writer.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Writing image to tesseract stdin failed: {}", e),
            Err(_) => warn!("tesseract stdin writer panicked"),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::OcrFailed(format!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let tsv = String::from_utf8_lossy(&output.stdout);
        let tokens = parse_tsv(&tsv);
        debug!(
            "tesseract ({}) returned {} rows for {}x{} image",
            self.language,
            tokens.len(),
            image.width(),
            image.height()
        );
        Ok(tokens)
    }
}

// ═══════════════════════════════════════════════════════════
// Linked libtesseract
// ═══════════════════════════════════════════════════════════

/// Recognition through libtesseract, without spawning a process.
///
/// Only compiled with the `ocr` feature; needs the Tesseract and Leptonica
/// development libraries at build time.
#[cfg(feature = "ocr")]
#[derive(Debug, Clone)]
pub struct BundledTesseract {
    language: String,
    tessdata_dir: Option<PathBuf>,
}

#[cfg(feature = "ocr")]
impl BundledTesseract {
    pub fn new(language: impl Into<String>, tessdata_dir: Option<PathBuf>) -> Self {
        Self {
            language: language.into(),
            tessdata_dir,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.ocr_language.clone(), config.tessdata_dir.clone())
    }
}

#[cfg(feature = "ocr")]
impl OcrEngine for BundledTesseract {
    fn name(&self) -> &str {
        "libtesseract"
    }

    fn recognize(&self, image: &NormalizedImage) -> Result<Vec<TokenSample>, PipelineError> {
        let png = image
            .to_png()
            .map_err(|e| PipelineError::Internal(format!("PNG encoding failed: {}", e)))?;

        let datapath = self.tessdata_dir.as_deref().and_then(|p| p.to_str());
        let tess = tesseract::Tesseract::new(datapath, Some(self.language.as_str())).map_err(|e| {
            PipelineError::OcrUnavailable {
                engine: "libtesseract".into(),
                detail: format!("{:?}", e),
                hint: format!(
                    "Check that {}.traineddata exists in the tessdata directory.",
                    self.language
                ),
            }
        })?;

        let mut tess = tess
            .set_image_from_mem(&png)
            .map_err(|e| PipelineError::OcrFailed(format!("set image: {:?}", e)))?;

        // Runs recognition; the TSV call below reuses the result.
        tess.get_text()
            .map_err(|e| PipelineError::OcrFailed(format!("recognition: {:?}", e)))?;
        let tsv = tess
            .get_tsv_text(0)
            .map_err(|e| PipelineError::OcrFailed(format!("tsv output: {:?}", e)))?;

        Ok(parse_tsv(&tsv))
    }
}

// ═══════════════════════════════════════════════════════════
// Mock
// ═══════════════════════════════════════════════════════════

/// Scripted engine for tests and offline runs.
#[derive(Debug, Clone, Default)]
pub struct MockOcrEngine {
    tokens: Vec<TokenSample>,
    failure: Option<String>,
}

impl MockOcrEngine {
    /// Split `text` on whitespace; every word gets `confidence`.
    pub fn new(text: &str, confidence: i32) -> Self {
        Self {
            tokens: text
                .split_whitespace()
                .map(|w| TokenSample::new(w, confidence))
                .collect(),
            failure: None,
        }
    }

    pub fn from_tokens(tokens: Vec<TokenSample>) -> Self {
        Self {
            tokens,
            failure: None,
        }
    }

    /// An engine whose every call fails with [`PipelineError::OcrFailed`].
    pub fn failing(detail: impl Into<String>) -> Self {
        Self {
            tokens: Vec::new(),
            failure: Some(detail.into()),
        }
    }
}

impl OcrEngine for MockOcrEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn recognize(&self, _image: &NormalizedImage) -> Result<Vec<TokenSample>, PipelineError> {
        match &self.failure {
            Some(detail) => Err(PipelineError::OcrFailed(detail.clone())),
            None => Ok(self.tokens.clone()),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// TSV
// ═══════════════════════════════════════════════════════════

/// Parse Tesseract TSV output into tokens.
///
/// Columns: `level page_num block_num par_num line_num word_num left top
/// width height conf text`. The header row (and anything else whose first
/// column is not a number) is skipped. Confidence is truncated towards zero;
/// rows without a text column get empty text.
pub fn parse_tsv(tsv: &str) -> Vec<TokenSample> {
    tsv.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 11 {
                return None;
            }
            fields[0].trim().parse::<u32>().ok()?;
            let confidence = fields[10].trim().parse::<f32>().ok()? as i32;
            let text = fields.get(11).copied().unwrap_or_default();
            Some(TokenSample::new(text, confidence))
        })
        .collect()
}
