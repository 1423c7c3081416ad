//! Batch API: process many report images, yielding results as they finish.
//!
//! Runs are independent, so up to `config.concurrency` of them proceed at
//! once. Results arrive in completion order, each tagged with its input
//! path; one bad image never stops the others.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::output::PipelineResult;
use crate::run::Pipeline;
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tracing::info;

/// One finished run: the input path and its outcome.
pub type RunItem = (PathBuf, Result<PipelineResult, PipelineError>);

/// A boxed stream of finished runs.
pub type RunStream = Pin<Box<dyn Stream<Item = RunItem> + Send>>;

/// Process `images`, building the pipeline from `config`.
///
/// # Returns
/// - `Ok(RunStream)`: one item per input image, in completion order
/// - `Err(PipelineError)`: the pipeline could not be built (bad provider)
///
/// # Example
/// ```rust,no_run
/// use futures::StreamExt;
/// use medreport::{run_stream, PipelineConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let images = vec!["a.jpg".into(), "b.png".into()];
/// let mut results = run_stream(images, &PipelineConfig::default())?;
/// while let Some((path, result)) = results.next().await {
///     match result {
///         Ok(r) => println!("{}: degraded={}", path.display(), r.is_degraded()),
///         Err(e) => eprintln!("{}: {e}", path.display()),
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub fn run_stream(
    images: Vec<PathBuf>,
    config: &PipelineConfig,
) -> Result<RunStream, PipelineError> {
    let pipeline = Arc::new(Pipeline::new(config.clone())?);
    Ok(stream_with(pipeline, images))
}

/// Process `images` through an existing pipeline.
pub fn stream_with(pipeline: Arc<Pipeline>, images: Vec<PathBuf>) -> RunStream {
    let concurrency = pipeline.config().concurrency.max(1);
    info!(
        "Processing {} images, up to {} at a time",
        images.len(),
        concurrency
    );

    let s = stream::iter(images.into_iter().map(move |path| {
        let pipeline = Arc::clone(&pipeline);
        async move {
            let result = pipeline.run(&path).await;
            (path, result)
        }
    }))
    .buffer_unordered(concurrency);

    Box::pin(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::llm::MockLanguageModel;
    use crate::pipeline::ocr::MockOcrEngine;
    use image::{DynamicImage, Rgb, RgbImage};
    use std::collections::HashMap;

    #[tokio::test]
    async fn every_image_yields_one_item() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.png");
        DynamicImage::ImageRgb8(RgbImage::from_pixel(24, 24, Rgb([255, 255, 255])))
            .save_with_format(&good, image::ImageFormat::Png)
            .unwrap();
        let missing = dir.path().join("missing.png");

        let model = MockLanguageModel::new()
            .with_reply("gemma:2b", "{}")
            .with_reply("OussamaELALLAM/MedExpert", "{}");
        let pipeline = Arc::new(Pipeline::with_components(
            PipelineConfig::builder().concurrency(2).build().unwrap(),
            Arc::new(model),
            Arc::new(MockOcrEngine::new("Glucose 90", 80)),
        ));

        let items: HashMap<PathBuf, bool> =
            stream_with(pipeline, vec![good.clone(), missing.clone()])
                .map(|(path, result)| (path, result.is_ok()))
                .collect()
                .await;

        assert_eq!(items.len(), 2);
        assert!(items[&good]);
        assert!(!items[&missing]);
    }

    #[tokio::test]
    async fn empty_input_is_an_empty_stream() {
        let pipeline = Arc::new(Pipeline::with_components(
            PipelineConfig::default(),
            Arc::new(MockLanguageModel::new()),
            Arc::new(MockOcrEngine::default()),
        ));
        assert_eq!(stream_with(pipeline, Vec::new()).count().await, 0);
    }
}
