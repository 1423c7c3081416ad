//! Pipeline stages for scanned-report processing.
//!
//! Each submodule implements exactly one transformation step, so each is
//! testable on its own and engines can be swapped (CLI tesseract vs linked
//! libtesseract, Ollama vs a hosted provider) without touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! image ──▶ normalize ──▶ ocr ──▶ text ──▶ extract ──▶ analyze
//! (path)    (grayscale,   (tokens  (filter  (LLM →      (LLM →
//!            denoise,      + conf)  + join)  structured) clinical)
//!            CLAHE)
//! ```
//!
//! 1. [`normalize`]: decode and clean the bitmap; CPU-bound, runs in
//!    `spawn_blocking`
//! 2. [`ocr`]: word tokens with confidence from a pluggable engine
//! 3. [`text`]: drop low-confidence tokens and join the rest
//! 4. [`extract`]: first model call: text → [`crate::output::StructuredRecord`]
//! 5. [`analyze`]: second model call: record → [`crate::output::AnalysisRecord`]
//!
//! [`llm`] and [`parse`] are shared by the two model stages: the first owns
//! transport (timeout, retry), the second recovers JSON from chatty replies.
//! Only stages 1–3 can fail the run; the model stages degrade instead.

pub mod analyze;
pub mod extract;
pub mod llm;
pub mod normalize;
pub mod ocr;
pub mod parse;
pub mod text;
