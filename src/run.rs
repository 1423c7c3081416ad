//! Run entry points: one report image in, one [`PipelineResult`] out.
//!
//! A run is strictly sequential (normalize → OCR → extraction → analysis)
//! because every stage consumes the previous one's output. Use
//! [`crate::stream::run_stream`] to process several images at once.
//!
//! ## Failure model
//!
//! Only the image stages can fail a run: an unreadable file or a broken OCR
//! engine returns `Err(PipelineError)`. Model stages never do; a refused
//! connection or a chatty reply becomes a [`crate::output::RawFallback`] in
//! the result and the run carries on.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::output::{AnalysisRecord, PipelineResult, StageOutput, StructuredRecord};
use crate::pipeline::llm::{LanguageModel, OllamaClient, ProviderModel};
use crate::pipeline::normalize::{self, NormalizedImage};
use crate::pipeline::ocr::{OcrEngine, TesseractCommand};
use crate::pipeline::{analyze, extract, text};
use crate::progress::{PipelineProgressCallback, Stage};
use chrono::Local;
use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A configured pipeline with its model client and OCR engine resolved.
///
/// Cheap to share behind an [`Arc`]; all runs through one instance reuse the
/// same HTTP connection pool.
pub struct Pipeline {
    config: PipelineConfig,
    model: Arc<dyn LanguageModel>,
    ocr: Arc<dyn OcrEngine>,
}

impl Pipeline {
    /// Resolve the model client and OCR engine from `config`.
    ///
    /// Model client, most specific first: `model_client`, then
    /// `provider_name` through `edgequake_llm`, then the Ollama endpoint.
    /// OCR engine: `ocr_engine`, then linked libtesseract (with the `ocr`
    /// feature and a tessdata directory), then the `tesseract` executable.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        let model = resolve_model(&config)?;
        let ocr = resolve_ocr(&config);
        Ok(Self { config, model, ocr })
    }

    /// Build from explicit components, ignoring the client fields of `config`.
    pub fn with_components(
        config: PipelineConfig,
        model: Arc<dyn LanguageModel>,
        ocr: Arc<dyn OcrEngine>,
    ) -> Self {
        Self { config, model, ocr }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process one report image.
    ///
    /// # Errors
    /// Returns `Err(PipelineError)` only when the image cannot be decoded or
    /// the OCR engine fails. Model failures are reported inside the result.
    pub async fn run(&self, image: impl AsRef<Path>) -> Result<PipelineResult, PipelineError> {
        let image = image.as_ref();
        let total_start = Instant::now();
        info!("Processing report: {}", image.display());
        self.notify(|cb| cb.on_run_start(image));

        let text = self.read_text(image).await?;

        let structured = self
            .model_stage(
                Stage::Extraction,
                extract::extract_structured(self.model.as_ref(), &text, &self.config),
            )
            .await;
        let analysis = self
            .model_stage(
                Stage::Analysis,
                analyze::analyze(self.model.as_ref(), &structured, &self.config),
            )
            .await;

        let result = PipelineResult {
            structured,
            analysis,
            time: Local::now(),
        };

        let degraded = result.is_degraded();
        if degraded {
            warn!(
                "{}: finished with degraded output in {}ms",
                image.display(),
                total_start.elapsed().as_millis()
            );
        } else {
            info!(
                "{}: finished in {}ms",
                image.display(),
                total_start.elapsed().as_millis()
            );
        }
        self.notify(|cb| cb.on_run_complete(image, degraded));
        Ok(result)
    }

    /// Normalise and OCR `image`, returning the filtered text without
    /// calling any model.
    pub async fn read_text(&self, image: impl AsRef<Path>) -> Result<String, PipelineError> {
        let image = image.as_ref();

        let normalized = self
            .image_stage(Stage::Normalize, normalize::normalize_async(image.to_path_buf()))
            .await?;
        debug!(
            "Normalised {} to {}x{}",
            image.display(),
            normalized.width(),
            normalized.height()
        );

        self.ocr_text(normalized).await
    }

    /// OCR an already normalised bitmap.
    pub async fn ocr_text(&self, image: NormalizedImage) -> Result<String, PipelineError> {
        let text = self
            .image_stage(
                Stage::Ocr,
                text::extract_text_async(
                    Arc::clone(&self.ocr),
                    image,
                    self.config.confidence_threshold,
                ),
            )
            .await?;
        debug!("OCR text: {} chars", text.len());
        Ok(text)
    }

    /// Run only the structured extraction stage.
    pub async fn extract_structured(&self, text: &str) -> StageOutput<StructuredRecord> {
        extract::extract_structured(self.model.as_ref(), text, &self.config).await
    }

    /// Run only the clinical analysis stage.
    pub async fn analyze(
        &self,
        structured: &StageOutput<StructuredRecord>,
    ) -> StageOutput<AnalysisRecord> {
        analyze::analyze(self.model.as_ref(), structured, &self.config).await
    }

    async fn image_stage<T, F>(&self, stage: Stage, work: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, PipelineError>>,
    {
        self.notify(|cb| cb.on_stage_start(stage));
        let start = Instant::now();
        let out = work.await?;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        debug!("Stage {} took {}ms", stage, elapsed_ms);
        self.notify(|cb| cb.on_stage_complete(stage, elapsed_ms));
        Ok(out)
    }

    async fn model_stage<T, F>(&self, stage: Stage, work: F) -> StageOutput<T>
    where
        F: Future<Output = StageOutput<T>>,
    {
        self.notify(|cb| cb.on_stage_start(stage));
        let start = Instant::now();
        let out = work.await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        if let Some(fb) = out.fallback() {
            self.notify(|cb| cb.on_stage_degraded(stage, &fb.error));
        }
        debug!("Stage {} took {}ms", stage, elapsed_ms);
        self.notify(|cb| cb.on_stage_complete(stage, elapsed_ms));
        out
    }

    fn notify(&self, event: impl FnOnce(&dyn PipelineProgressCallback)) {
        if let Some(cb) = &self.config.progress_callback {
            event(cb.as_ref());
        }
    }
}

/// Process one report image with a freshly built [`Pipeline`].
///
/// # Example
/// ```rust,no_run
/// use medreport::{run, PipelineConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let result = run("scan.jpg", &PipelineConfig::default()).await?;
/// println!("{}", serde_json::to_string_pretty(&result)?);
/// # Ok(())
/// # }
/// ```
pub async fn run(
    image: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<PipelineResult, PipelineError> {
    Pipeline::new(config.clone())?.run(image).await
}

/// Synchronous wrapper around [`run`].
///
/// Creates a temporary tokio runtime internally.
pub fn run_sync(
    image: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<PipelineResult, PipelineError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| PipelineError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(run(image, config))
}

/// Process an image held in memory.
///
/// The bytes are written to a managed [`tempfile`] that is removed when the
/// call returns. The format is sniffed from content, so no extension is
/// needed.
pub async fn run_from_bytes(
    bytes: &[u8],
    config: &PipelineConfig,
) -> Result<PipelineResult, PipelineError> {
    let mut tmp = tempfile::NamedTempFile::new()
        .map_err(|e| PipelineError::Internal(format!("tempfile: {e}")))?;
    tmp.write_all(bytes)
        .map_err(|e| PipelineError::Internal(format!("tempfile write: {e}")))?;
    // `tmp` is dropped (and the file deleted) when `run` returns
    run(tmp.path(), config).await
}

/// Process an image and write the result as pretty JSON.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
pub async fn run_to_file(
    image: impl AsRef<Path>,
    output_path: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<PipelineResult, PipelineError> {
    let result = run(image, config).await?;
    write_result(&result, output_path.as_ref()).await?;
    Ok(result)
}

/// Atomically write `result` as pretty JSON to `path`.
pub async fn write_result(result: &PipelineResult, path: &Path) -> Result<(), PipelineError> {
    let json = serde_json::to_string_pretty(result)
        .map_err(|e| PipelineError::Internal(format!("serialising result: {e}")))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PipelineError::OutputWriteFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
    }

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, json)
        .await
        .map_err(|e| PipelineError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        tokio::fs::remove_file(&tmp_path).await.ok();
        return Err(PipelineError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        });
    }
    Ok(())
}

// ── Internal helpers ─────────────────────────────────────────────────────

fn resolve_model(config: &PipelineConfig) -> Result<Arc<dyn LanguageModel>, PipelineError> {
    if let Some(client) = &config.model_client {
        return Ok(Arc::clone(client));
    }
    if let Some(name) = &config.provider_name {
        debug!("Using edgequake_llm provider '{}'", name);
        let models = [config.extraction_model.as_str(), config.analysis_model.as_str()];
        return Ok(Arc::new(ProviderModel::connect(name, &models)?));
    }
    debug!("Using Ollama at {}", config.ollama_url);
    Ok(Arc::new(OllamaClient::new(&config.ollama_url)?))
}

fn resolve_ocr(config: &PipelineConfig) -> Arc<dyn OcrEngine> {
    if let Some(engine) = &config.ocr_engine {
        return Arc::clone(engine);
    }
    #[cfg(feature = "ocr")]
    if config.tessdata_dir.is_some() {
        return Arc::new(crate::pipeline::ocr::BundledTesseract::from_config(config));
    }
    Arc::new(TesseractCommand::from_config(config))
}
