//! Progress-callback trait for per-stage pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as a run moves through its four stages. The trait is
//! `Send + Sync` because [`crate::stream::run_stream`] drives several runs
//! at once and they all share the same callback.
//!
//! # Example
//!
//! ```rust
//! use medreport::{PipelineConfig, PipelineProgressCallback, Stage};
//! use std::sync::Arc;
//!
//! struct StderrProgress;
//!
//! impl PipelineProgressCallback for StderrProgress {
//!     fn on_stage_complete(&self, stage: Stage, elapsed_ms: u64) {
//!         eprintln!("{stage} finished in {elapsed_ms}ms");
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(StderrProgress))
//!     .build()
//!     .unwrap();
//! ```

use crate::error::ModelError;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// The four stages of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Normalize,
    Ocr,
    Extraction,
    Analysis,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Normalize, Stage::Ocr, Stage::Extraction, Stage::Analysis];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Normalize => "normalize",
            Stage::Ocr => "ocr",
            Stage::Extraction => "extraction",
            Stage::Analysis => "analysis",
        };
        f.write_str(name)
    }
}

/// Called by the pipeline as a run progresses.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once before the image is opened.
    fn on_run_start(&self, image: &Path) {
        let _ = image;
    }

    fn on_stage_start(&self, stage: Stage) {
        let _ = stage;
    }

    /// Called when a stage finished, including stages that fell back to raw
    /// output (those also get [`Self::on_stage_degraded`] first).
    fn on_stage_complete(&self, stage: Stage, elapsed_ms: u64) {
        let _ = (stage, elapsed_ms);
    }

    /// Called when a model stage returned a [`crate::output::RawFallback`].
    fn on_stage_degraded(&self, stage: Stage, error: &ModelError) {
        let _ = (stage, error);
    }

    /// Called once after the result has been assembled.
    ///
    /// # Arguments
    /// * `image`   : the input path
    /// * `degraded`: true if any model stage fell back
    fn on_run_complete(&self, image: &Path, degraded: bool) {
        let _ = (image, degraded);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl PipelineProgressCallback for Recorder {
        fn on_stage_start(&self, stage: Stage) {
            self.events.lock().unwrap().push(format!("start:{stage}"));
        }

        fn on_stage_degraded(&self, stage: Stage, _error: &ModelError) {
            self.events.lock().unwrap().push(format!("degraded:{stage}"));
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_run_start(Path::new("scan.png"));
        cb.on_stage_start(Stage::Ocr);
        cb.on_stage_complete(Stage::Ocr, 12);
        cb.on_run_complete(Path::new("scan.png"), false);
    }

    #[test]
    fn recorder_receives_events() {
        let rec = Recorder::default();
        rec.on_stage_start(Stage::Extraction);
        rec.on_stage_degraded(
            Stage::Extraction,
            &ModelError::Timeout {
                model: "m".into(),
                secs: 1,
            },
        );
        rec.on_stage_complete(Stage::Extraction, 5);
        assert_eq!(
            *rec.events.lock().unwrap(),
            vec!["start:extraction", "degraded:extraction"]
        );
    }

    #[test]
    fn stage_order_and_names() {
        let names: Vec<String> = Stage::ALL.iter().map(|s| s.to_string()).collect();
        assert_eq!(names, ["normalize", "ocr", "extraction", "analysis"]);
    }
}
