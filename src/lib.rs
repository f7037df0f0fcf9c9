//! # edgequake-pdfdiff
//!
//! Verify a structured extraction of a PDF against the rendered pages using
//! Vision Language Models.
//!
//! ## Why this crate?
//!
//! Structuring pipelines (OCR, layout models, LLM extractors) fail quietly: a
//! table row disappears, a figure caption is paraphrased, a paragraph is
//! invented. Comparing text with text cannot catch what neither side
//! contains, so this crate shows a VLM the rendered page next to the
//! structured text and asks it what is missing or unsupported, page by page.
//!
//! ## Pipeline Overview
//!
//! ```text
//! work id
//!  │
//!  ├─ 1. Resolve    find the stored original (cwd, install dir, its parent)
//!  ├─ 2. Extract    pdfium text layer + structured output, normalised
//!  ├─ 3. Reconcile  align pages 1..=max across both sides
//!  ├─ 4. Rasterize  reuse page images or render once per run (self-healing)
//!  ├─ 5. Vision     per-page discrepancy narrative, degraded on failure
//!  └─ 6. Report     ordered page reports + run stats
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdfdiff::{AnalysisConfig, JsonDirStructuredSource, JsonWorkUnitRegistry, Reconciler};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = JsonWorkUnitRegistry::load(Path::new("work_units.json")).await?;
//!     let reconciler = Reconciler::builder(AnalysisConfig::default())
//!         .work_units(Arc::new(registry))
//!         .structured_source(Arc::new(JsonDirStructuredSource::new("structured/")))
//!         .build()?;
//!
//!     let report = reconciler.analyze("w-42", "alice", None).await?;
//!     println!("{report}");
//!     eprintln!("{} of {} pages degraded",
//!         report.stats.degraded_pages,
//!         report.stats.reported_pages);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdfdiff` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! ## Runtime requirements
//!
//! * `libpdfium` for text extraction (`PDFIUM_LIB_PATH` or the system library)
//! * `python3` with PyMuPDF, or `pdftoppm`, for rasterisation; both are
//!   installed on demand when missing and the process has the rights to do so

// ── Modules ──────────────────────────────────────────────────────────────

pub mod analyze;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod report;
pub mod stream;
pub mod workunit;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use analyze::{resolve_provider, Reconciler, ReconcilerBuilder};
pub use config::{AnalysisConfig, AnalysisConfigBuilder, RasterFormat};
pub use error::{CollaboratorError, DegradedReason, PdfDiffError, VisionError};
pub use pipeline::bootstrap::{BootstrapReport, EnvironmentBootstrap, ProbeOutcome};
pub use pipeline::extract::{PageTextExtractor, PdfiumTextExtractor};
pub use pipeline::rasterize::{RasterJob, RasterOutcome, Rasterizer};
pub use pipeline::reconcile::{LineDelta, PageNumber};
pub use pipeline::structured::{
    HttpStructuredSource, JsonDirStructuredSource, StructuredOutput, StructuredOutputSource,
};
pub use pipeline::vision::{VisionModel, VisionResponse};
pub use progress::{AnalysisProgressCallback, NoopProgressCallback, ProgressCallback};
pub use report::{AnalysisReport, AnalysisStats, PageDiffReport, PageStatus};
pub use stream::PageDiffStream;
pub use workunit::{JsonWorkUnitRegistry, WorkUnit, WorkUnitStore};
