//! # medreport
//!
//! Turn a photographed or scanned medical lab report into a structured
//! record and a plain-language clinical analysis.
//!
//! ## Why this crate?
//!
//! Lab reports arrive as phone photos: skewed lighting, sensor noise, faint
//! print. Raw OCR on such images is poor, and raw OCR text is still not
//! something a program can act on. This crate cleans the image, keeps only
//! the words the OCR engine is confident about, and then asks two language
//! models in turn to (1) transcribe the text into a fixed JSON shape and
//! (2) interpret the results like a clinician would.
//!
//! ## Pipeline Overview
//!
//! ```text
//! image
//!  │
//!  ├─ 1. Normalize  grayscale → NL-means denoise → sharpen → CLAHE
//!  ├─ 2. OCR        tesseract word tokens with confidence
//!  ├─ 3. Filter     keep tokens with confidence > 30, join with spaces
//!  ├─ 4. Extract    LLM → { meta, tests[], raw_text }
//!  ├─ 5. Analyze    LLM → { summary, abnormal_findings[], advice, … }
//!  └─ 6. Output     PipelineResult { structured, analysis, time }
//! ```
//!
//! Model stages never fail a run: a refused connection or a non-JSON reply
//! is recorded as a [`RawFallback`] inside the result.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use medreport::{run, PipelineConfig, StageOutput};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Ollama on localhost:11434 with gemma:2b and OussamaELALLAM/MedExpert pulled
//!     let config = PipelineConfig::default();
//!     let result = run("report.jpg", &config).await?;
//!     match &result.structured {
//!         StageOutput::Parsed(record) => println!("{} tests found", record.tests.len()),
//!         StageOutput::Fallback(fb) => eprintln!("extraction degraded: {}", fb.error),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `medreport` binary (clap + anyhow + tracing-subscriber + indicatif) |
//! | `ocr`   | off     | Links libtesseract via the `tesseract` crate instead of spawning the executable |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! medreport = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod run;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{ModelError, PipelineError};
pub use output::{
    AbnormalFinding, AnalysisRecord, LabTest, PipelineResult, RawFallback, ReportMeta,
    StageOutput, StructuredRecord,
};
pub use pipeline::llm::{LanguageModel, MockLanguageModel, OllamaClient, ProviderModel};
pub use pipeline::normalize::NormalizedImage;
pub use pipeline::ocr::{MockOcrEngine, OcrEngine, TesseractCommand, TokenSample};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback, Stage};
pub use run::{run, run_from_bytes, run_sync, run_to_file, Pipeline};
pub use stream::{run_stream, RunStream};
