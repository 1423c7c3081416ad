//! CLI binary for medreport.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `PipelineConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use medreport::config::{DEFAULT_ANALYSIS_MODEL, DEFAULT_EXTRACTION_MODEL, DEFAULT_OLLAMA_URL};
use medreport::run::write_result;
use medreport::stream::stream_with;
use medreport::{
    ModelError, Pipeline, PipelineConfig, PipelineProgressCallback, PipelineResult,
    ProgressCallback, Stage,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner that shows the current stage and counts finished images.
struct CliProgressCallback {
    bar: ProgressBar,
    degraded: AtomicUsize,
}

impl CliProgressCallback {
    fn new(total: usize) -> Arc<Self> {
        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  {pos}/{len} reports  {msg}  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Reading");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            degraded: AtomicUsize::new(0),
        })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: Stage) {
        let msg = match stage {
            Stage::Normalize => "cleaning image…",
            Stage::Ocr => "running OCR…",
            Stage::Extraction => "extracting fields…",
            Stage::Analysis => "analysing results…",
        };
        self.bar.set_message(msg);
    }

    fn on_stage_degraded(&self, stage: Stage, error: &ModelError) {
        self.bar
            .println(format!("  {} {} degraded: {}", yellow("⚠"), stage, error));
    }

    fn on_run_complete(&self, image: &Path, degraded: bool) {
        if degraded {
            self.degraded.fetch_add(1, Ordering::Relaxed);
        }
        let mark = if degraded { yellow("⚠") } else { green("✓") };
        self.bar.println(format!("  {} {}", mark, image.display()));
        self.bar.inc(1);
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # One report, pretty JSON on stdout
  medreport scan.jpg

  # Write the result to a file
  medreport scan.jpg -o result.json

  # Several reports: one JSON object per line
  medreport reports/*.png > results.jsonl

  # Several reports, one file each in a directory
  medreport reports/*.png -o results/

  # Only print the OCR text (no model calls)
  medreport --text-only scan.jpg

  # Use other local models
  medreport --extraction-model llama3.2 --analysis-model meditron scan.jpg

  # Use a hosted provider through edgequake-llm
  medreport --provider openai --extraction-model gpt-4.1-mini \
            --analysis-model gpt-4.1 scan.jpg

REQUIREMENTS:
  tesseract     on PATH (or --tesseract /path/to/tesseract)
  Ollama        running at --ollama-url with both models pulled:
                  ollama pull gemma:2b
                  ollama pull OussamaELALLAM/MedExpert

ENVIRONMENT VARIABLES:
  Every flag has a MEDREPORT_* counterpart (see --help).
  RUST_LOG                 Override log filter (e.g. medreport=debug)
  OPENAI_API_KEY, ANTHROPIC_API_KEY, GEMINI_API_KEY
                           Credentials for --provider
"#;

/// Turn scanned medical reports into structured JSON with OCR and LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "medreport",
    version,
    about = "Turn scanned medical reports into structured JSON with OCR and LLMs",
    long_about = "Clean up a photographed or scanned lab report, OCR it with Tesseract, and ask \
two language models to (1) extract patient details and test results into JSON and (2) write a \
plain-language clinical analysis. Models run on a local Ollama server by default.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Report image(s): PNG, JPEG, TIFF or BMP.
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Output file (one image) or directory (several images).
    #[arg(short, long, env = "MEDREPORT_OUTPUT")]
    output: Option<PathBuf>,

    /// Ollama base URL.
    #[arg(long, env = "MEDREPORT_OLLAMA_URL", default_value = DEFAULT_OLLAMA_URL)]
    ollama_url: String,

    /// Model for structured extraction.
    #[arg(long, env = "MEDREPORT_EXTRACTION_MODEL", default_value = DEFAULT_EXTRACTION_MODEL)]
    extraction_model: String,

    /// Model for clinical analysis.
    #[arg(long, env = "MEDREPORT_ANALYSIS_MODEL", default_value = DEFAULT_ANALYSIS_MODEL)]
    analysis_model: String,

    /// Hosted provider instead of Ollama: openai, anthropic, gemini, …
    #[arg(long, env = "MEDREPORT_PROVIDER")]
    provider: Option<String>,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "MEDREPORT_TEMPERATURE", default_value_t = 0.2)]
    temperature: f32,

    /// Keep OCR tokens with confidence strictly above this (0–100).
    #[arg(long, env = "MEDREPORT_MIN_CONFIDENCE", default_value_t = 30,
          value_parser = clap::value_parser!(i32).range(0..=100))]
    min_confidence: i32,

    /// Tesseract language(s), e.g. eng or eng+fra.
    #[arg(long, env = "MEDREPORT_LANG", default_value = "eng")]
    lang: String,

    /// Tesseract executable.
    #[arg(long, env = "MEDREPORT_TESSERACT", default_value = "tesseract")]
    tesseract: String,

    /// Directory containing *.traineddata files.
    #[arg(long, env = "MEDREPORT_TESSDATA_DIR")]
    tessdata_dir: Option<PathBuf>,

    /// Per-model-call timeout in seconds (default: wait indefinitely).
    #[arg(long, env = "MEDREPORT_API_TIMEOUT")]
    api_timeout: Option<u64>,

    /// Retries on model transport failures.
    #[arg(long, env = "MEDREPORT_MAX_RETRIES", default_value_t = 0)]
    max_retries: u32,

    /// Reports processed at the same time.
    #[arg(short, long, env = "MEDREPORT_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Print the filtered OCR text and stop.
    #[arg(long)]
    text_only: bool,

    /// Disable progress display.
    #[arg(long, env = "MEDREPORT_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "MEDREPORT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "MEDREPORT_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress display replaces INFO-level logs; verbose always wins.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.text_only;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress = if show_progress {
        Some(CliProgressCallback::new(cli.images.len()))
    } else {
        None
    };
    let config = build_config(&cli, progress.clone().map(|p| p as ProgressCallback))?;
    let pipeline = Arc::new(Pipeline::new(config).context("Could not set up the pipeline")?);

    if cli.text_only {
        return print_text(&pipeline, &cli.images).await;
    }

    let failures = if cli.images.len() == 1 {
        run_single(&pipeline, &cli.images[0], cli.output.as_deref()).await
    } else {
        run_many(&pipeline, &cli, progress.as_deref()).await?
    };

    if let Some(p) = &progress {
        p.finish();
        if !cli.quiet {
            summarise(cli.images.len(), failures, p.degraded.load(Ordering::Relaxed));
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {} reports could not be processed", cli.images.len());
    }
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .ollama_url(&cli.ollama_url)
        .extraction_model(&cli.extraction_model)
        .analysis_model(&cli.analysis_model)
        .temperature(cli.temperature)
        .confidence_threshold(cli.min_confidence)
        .max_retries(cli.max_retries)
        .ocr_language(&cli.lang)
        .tesseract_cmd(&cli.tesseract)
        .concurrency(cli.concurrency);

    if let Some(secs) = cli.api_timeout {
        builder = builder.api_timeout_secs(secs);
    }
    if let Some(dir) = &cli.tessdata_dir {
        builder = builder.tessdata_dir(dir);
    }
    if let Some(name) = &cli.provider {
        builder = builder.provider_name(name);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

async fn print_text(pipeline: &Pipeline, images: &[PathBuf]) -> Result<()> {
    let stdout = io::stdout();
    for image in images {
        let text = pipeline
            .read_text(image)
            .await
            .with_context(|| format!("OCR failed for {}", image.display()))?;
        let mut handle = stdout.lock();
        if images.len() > 1 {
            writeln!(handle, "==> {} <==", image.display())?;
        }
        writeln!(handle, "{text}")?;
    }
    Ok(())
}

/// One image: pretty JSON to stdout or `output`. Returns the failure count.
async fn run_single(pipeline: &Pipeline, image: &Path, output: Option<&Path>) -> usize {
    let result = match pipeline.run(image).await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{} {}: {}", red("✘"), image.display(), e);
            return 1;
        }
    };

    let written = match output {
        Some(path) => write_result(&result, path).await.map_err(anyhow::Error::from),
        None => print_pretty(&result),
    };
    match written {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{} {}: {:#}", red("✘"), image.display(), e);
            1
        }
    }
}

fn print_pretty(result: &PipelineResult) -> Result<()> {
    let json = serde_json::to_string_pretty(result)?;
    let mut handle = io::stdout().lock();
    writeln!(handle, "{json}")?;
    Ok(())
}

/// Several images: JSON lines on stdout, or one file per image when
/// `--output` names a directory. Returns the failure count.
async fn run_many(
    pipeline: &Arc<Pipeline>,
    cli: &Cli,
    progress: Option<&CliProgressCallback>,
) -> Result<usize> {
    let mut targets = HashMap::new();
    if let Some(dir) = &cli.output {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
        targets = output_paths(dir, &cli.images);
    }

    let mut failures = 0;
    let mut results = stream_with(Arc::clone(pipeline), cli.images.clone());
    while let Some((image, outcome)) = results.next().await {
        let result = match outcome {
            Ok(r) => r,
            Err(e) => {
                failures += 1;
                let line = format!("{} {}: {}", red("✘"), image.display(), e);
                match progress {
                    Some(p) => {
                        p.bar.println(line);
                        p.bar.inc(1);
                    }
                    None => eprintln!("{line}"),
                }
                continue;
            }
        };

        match &cli.output {
            Some(dir) => {
                let path = targets
                    .get_mut(&image)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or_else(|| dir.join("report.json"));
                if let Err(e) = write_result(&result, &path).await {
                    failures += 1;
                    eprintln!("{} {}: {}", red("✘"), image.display(), e);
                }
            }
            None => {
                let line = serde_json::json!({ "image": image, "result": result });
                let mut handle = io::stdout().lock();
                writeln!(handle, "{line}")?;
            }
        }
    }
    Ok(failures)
}

/// One `<stem>.json` per input under `dir`. Inputs sharing a stem get
/// `-2`, `-3`, ... suffixes in input order. Results arrive in completion
/// order, so each input path maps to a queue of targets.
fn output_paths(dir: &Path, images: &[PathBuf]) -> HashMap<PathBuf, VecDeque<PathBuf>> {
    let stems: Vec<String> = images
        .iter()
        .map(|image| {
            image
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "report".to_string())
        })
        .collect();
    // A literal `scan-2` input must not be shadowed by a suffixed `scan`.
    let mut taken: HashSet<String> = HashSet::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut names = Vec::with_capacity(stems.len());
    for stem in &stems {
        let name = if seen.insert(stem.as_str()) && !taken.contains(stem) {
            stem.clone()
        } else {
            (2..)
                .map(|n| format!("{stem}-{n}"))
                .find(|candidate| !taken.contains(candidate) && !stems.contains(candidate))
                .unwrap_or_else(|| stem.clone())
        };
        taken.insert(name.clone());
        names.push(name);
    }

    let mut targets: HashMap<PathBuf, VecDeque<PathBuf>> = HashMap::new();
    for (image, name) in images.iter().zip(names) {
        targets
            .entry(image.clone())
            .or_default()
            .push_back(dir.join(format!("{name}.json")));
    }
    targets
}

fn summarise(total: usize, failed: usize, degraded: usize) {
    let ok = total.saturating_sub(failed);
    if failed == 0 && degraded == 0 {
        eprintln!("{} {} reports processed", green("✔"), bold(&ok.to_string()));
    } else {
        eprintln!(
            "{} {}/{} reports processed  ({} degraded, {} failed)",
            if failed == total { red("✘") } else { yellow("⚠") },
            bold(&ok.to_string()),
            total,
            degraded,
            red(&failed.to_string()),
        );
    }
}
