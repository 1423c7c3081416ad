//! Configuration types for the report pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. The config is an explicit value handed to
//! [`crate::run::Pipeline::new`]; nothing is read from globals, so tests can
//! inject doubles and one process can talk to several model endpoints.

use crate::error::PipelineError;
use crate::pipeline::llm::LanguageModel;
use crate::pipeline::ocr::OcrEngine;
use crate::progress::ProgressCallback;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Default Ollama endpoint.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Model used to turn OCR text into a [`crate::output::StructuredRecord`].
pub const DEFAULT_EXTRACTION_MODEL: &str = "gemma:2b";

/// Medical model used for the clinical analysis stage.
pub const DEFAULT_ANALYSIS_MODEL: &str = "OussamaELALLAM/MedExpert";

/// Configuration for a report pipeline.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use medreport::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .ollama_url("http://gpu-box:11434")
///     .extraction_model("llama3.2")
///     .api_timeout_secs(120)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Base URL of the Ollama server. Default: `http://localhost:11434`.
    pub ollama_url: String,

    /// Model identifier for the structured extraction stage. Default: `gemma:2b`.
    pub extraction_model: String,

    /// Model identifier for the clinical analysis stage.
    /// Default: `OussamaELALLAM/MedExpert`.
    pub analysis_model: String,

    /// Sampling temperature for both model calls. Default: 0.2.
    ///
    /// Low temperature keeps the reply close to the JSON template.
    pub temperature: f32,

    /// OCR tokens must score strictly above this (0–100). Default: 30.
    pub confidence_threshold: i32,

    /// Per-model-call timeout in seconds. Default: `None` (wait indefinitely).
    pub api_timeout_secs: Option<u64>,

    /// Retries on transport failures. Default: 0.
    ///
    /// Unparseable replies are never retried.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Tesseract language spec, e.g. `eng` or `eng+fra`. Default: `eng`.
    pub ocr_language: String,

    /// Program spawned by [`crate::pipeline::ocr::TesseractCommand`]. Default: `tesseract`.
    pub tesseract_cmd: String,

    /// Directory holding `*.traineddata`. `None` lets tesseract use its own default.
    pub tessdata_dir: Option<PathBuf>,

    /// Route model calls through an `edgequake_llm` provider (`openai`,
    /// `anthropic`, `gemini`, …) instead of the Ollama endpoint.
    pub provider_name: Option<String>,

    /// Pre-constructed model client. Takes precedence over `provider_name`.
    pub model_client: Option<Arc<dyn LanguageModel>>,

    /// Pre-constructed OCR engine. Takes precedence over the tesseract settings.
    pub ocr_engine: Option<Arc<dyn OcrEngine>>,

    /// Maximum simultaneous runs in [`crate::stream::run_stream`]. Default: 4.
    pub concurrency: usize,

    /// Receives stage events while a run progresses.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            extraction_model: DEFAULT_EXTRACTION_MODEL.to_string(),
            analysis_model: DEFAULT_ANALYSIS_MODEL.to_string(),
            temperature: 0.2,
            confidence_threshold: 30,
            api_timeout_secs: None,
            max_retries: 0,
            retry_backoff_ms: 500,
            ocr_language: "eng".to_string(),
            tesseract_cmd: "tesseract".to_string(),
            tessdata_dir: None,
            provider_name: None,
            model_client: None,
            ocr_engine: None,
            concurrency: 4,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("ollama_url", &self.ollama_url)
            .field("extraction_model", &self.extraction_model)
            .field("analysis_model", &self.analysis_model)
            .field("temperature", &self.temperature)
            .field("confidence_threshold", &self.confidence_threshold)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("ocr_language", &self.ocr_language)
            .field("tesseract_cmd", &self.tesseract_cmd)
            .field("tessdata_dir", &self.tessdata_dir)
            .field("provider_name", &self.provider_name)
            .field(
                "model_client",
                &self.model_client.as_ref().map(|_| "<dyn LanguageModel>"),
            )
            .field(
                "ocr_engine",
                &self.ocr_engine.as_ref().map(|_| "<dyn OcrEngine>"),
            )
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn ollama_url(mut self, url: impl Into<String>) -> Self {
        self.config.ollama_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn extraction_model(mut self, model: impl Into<String>) -> Self {
        self.config.extraction_model = model.into();
        self
    }

    pub fn analysis_model(mut self, model: impl Into<String>) -> Self {
        self.config.analysis_model = model.into();
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn confidence_threshold(mut self, threshold: i32) -> Self {
        self.config.confidence_threshold = threshold;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = Some(secs);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn ocr_language(mut self, lang: impl Into<String>) -> Self {
        self.config.ocr_language = lang.into();
        self
    }

    pub fn tesseract_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.config.tesseract_cmd = cmd.into();
        self
    }

    pub fn tessdata_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.tessdata_dir = Some(dir.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn model_client(mut self, client: Arc<dyn LanguageModel>) -> Self {
        self.config.model_client = Some(client);
        self
    }

    pub fn ocr_engine(mut self, engine: Arc<dyn OcrEngine>) -> Self {
        self.config.ocr_engine = Some(engine);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if !(0..=100).contains(&c.confidence_threshold) {
            return Err(PipelineError::InvalidConfig(format!(
                "Confidence threshold must be 0–100, got {}",
                c.confidence_threshold
            )));
        }
        if c.model_client.is_none()
            && c.provider_name.is_none()
            && !(c.ollama_url.starts_with("http://") || c.ollama_url.starts_with("https://"))
        {
            return Err(PipelineError::InvalidConfig(format!(
                "Ollama URL must start with http:// or https://, got '{}'",
                c.ollama_url
            )));
        }
        if c.extraction_model.trim().is_empty() || c.analysis_model.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "Model identifiers must not be empty".into(),
            ));
        }
        if c.api_timeout_secs == Some(0) {
            return Err(PipelineError::InvalidConfig(
                "API timeout must be ≥ 1 second".into(),
            ));
        }
        Ok(self.config)
    }
}
