//! Eager (whole-document) analysis entry point.
//!
//! ## Why a `Reconciler` value?
//!
//! An analysis talks to six collaborators (work-unit store, text extractor,
//! structured-output source, vision model, rasteriser, bootstrapper). They are
//! wired once into a [`Reconciler`] and shared by every run; each call to
//! [`Reconciler::analyze`] creates its own [`RunContext`], so concurrent runs
//! never share mutable state.
//!
//! Use [`Reconciler::analyze_stream`](crate::stream) to receive page reports
//! as they finish instead of waiting for the whole document.

use crate::config::AnalysisConfig;
use crate::error::PdfDiffError;
use crate::pipeline::bootstrap::{EnvironmentBootstrap, NoBootstrap, SystemBootstrap};
use crate::pipeline::extract::{PageTextExtractor, PdfiumTextExtractor};
use crate::pipeline::rasterize::{RasterState, Rasterizer, RunContext, ScriptRasterizer};
use crate::pipeline::reconcile::{reconcile, LineDelta, PageNumber, ReconciledDocument};
use crate::pipeline::resolve::PathResolver;
use crate::pipeline::structured::{StructuredOutput, StructuredOutputSource};
use crate::pipeline::vision::{LlmVisionModel, VisionModel, VisionReporter};
use crate::report::{AnalysisReport, AnalysisStats, PageDiffReport, PageStatus};
use crate::workunit::WorkUnitStore;
use edgequake_llm::{LLMProvider, ProviderFactory};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

/// The reconciliation pipeline with its collaborators.
///
/// Built via [`Reconciler::builder`].
#[derive(Clone)]
pub struct Reconciler {
    config: AnalysisConfig,
    resolver: PathResolver,
    work_units: Arc<dyn WorkUnitStore>,
    extractor: Arc<dyn PageTextExtractor>,
    structured: Option<Arc<dyn StructuredOutputSource>>,
    vision: VisionReporter,
    rasterizer: Arc<dyn Rasterizer>,
    bootstrap: Arc<dyn EnvironmentBootstrap>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .field("resolver", &self.resolver)
            .field("structured", &self.structured.as_ref().map(|_| "<dyn StructuredOutputSource>"))
            .finish_non_exhaustive()
    }
}

/// Everything the page loop needs, produced by the fatal-error phase.
pub(crate) struct PreparedRun {
    pub(crate) work_id: String,
    pub(crate) ctx: RunContext,
    pub(crate) document: ReconciledDocument,
    pub(crate) pages: Vec<PageNumber>,
    pub(crate) structured_shape: &'static str,
    pub(crate) started: Instant,
}

impl Reconciler {
    /// Start building a reconciler. Only the work-unit store is mandatory.
    pub fn builder(config: AnalysisConfig) -> ReconcilerBuilder {
        ReconcilerBuilder {
            config,
            work_units: None,
            extractor: None,
            structured: None,
            vision_model: None,
            rasterizer: None,
            bootstrap: None,
        }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Analyse a work unit (`Analyze`).
    ///
    /// # Arguments
    /// * `work_id`      — work unit to verify
    /// * `principal`    — caller identity, recorded in logs; authorization is
    ///   the caller's responsibility
    /// * `target_page0` — analyse only this 0-based page; out of range yields
    ///   an empty `page_diffs`
    ///
    /// # Errors
    /// Only [`PdfDiffError::InvalidArgument`] (blank work id, raised before any
    /// I/O) and [`PdfDiffError::SourceUnavailable`]. Every other failure ends
    /// up as a degraded page inside the returned report.
    pub async fn analyze(
        &self,
        work_id: &str,
        principal: &str,
        target_page0: Option<usize>,
    ) -> Result<AnalysisReport, PdfDiffError> {
        let mut run = self.prepare(work_id, principal, target_page0).await?;
        self.start_event(&run);

        let mut page_diffs = Vec::with_capacity(run.pages.len());
        for page in run.pages.clone() {
            page_diffs.push(self.analyze_page(&mut run, page).await);
        }

        Ok(self.finish(run, page_diffs))
    }

    /// Fatal-error phase: validate, resolve, extract, reconcile.
    pub(crate) async fn prepare(
        &self,
        work_id: &str,
        principal: &str,
        target_page0: Option<usize>,
    ) -> Result<PreparedRun, PdfDiffError> {
        let started = Instant::now();
        let work_id = work_id.trim();
        if work_id.is_empty() {
            return Err(PdfDiffError::InvalidArgument("work_id must not be empty".into()));
        }
        info!("Analysing work unit '{}' for '{}'", work_id, principal);

        // ── Step 1: Resolve the stored original ──────────────────────────────
        let unit = self
            .work_units
            .resolve_work_unit(work_id)
            .await
            .map_err(|e| PdfDiffError::source_unavailable(work_id, e.to_string()))?
            .ok_or_else(|| PdfDiffError::source_unavailable(work_id, "unknown work unit"))?;
        let pdf_path = self
            .resolver
            .resolve(&unit.stored_path)
            .map_err(|e| PdfDiffError::source_unavailable(work_id, e.to_string()))?;
        check_pdf_magic(&pdf_path)
            .await
            .map_err(|reason| PdfDiffError::source_unavailable(work_id, reason))?;

        // ── Step 2: Ground truth and structured output ───────────────────────
        let original = self
            .extractor
            .extract_page_text(&pdf_path)
            .await
            .map_err(|e| PdfDiffError::source_unavailable(work_id, e.to_string()))?;

        let structured = match &self.structured {
            Some(source) => source.structured_output(work_id).await.unwrap_or_else(|e| {
                warn!("Structured output for '{}' unavailable: {}", work_id, e);
                StructuredOutput::Absent
            }),
            None => StructuredOutput::Absent,
        };

        // ── Step 3: Align ────────────────────────────────────────────────────
        let document = reconcile(&original, &structured);
        info!(
            "Reconciled {} original page(s) with {} structured output → {} page(s)",
            original.len(),
            structured.shape(),
            document.page_count()
        );

        let pages = select_pages(document.max_page(), target_page0);
        let ctx = RunContext::new(work_id, pdf_path, unit.original_file_name, &self.config);
        debug!("Run {} → {}", ctx.run_id(), ctx.run_dir().display());

        Ok(PreparedRun {
            work_id: work_id.to_string(),
            ctx,
            document,
            pages,
            structured_shape: structured.shape(),
            started,
        })
    }

    /// Produce the report for one page. Never fails.
    pub(crate) async fn analyze_page(&self, run: &mut PreparedRun, page: PageNumber) -> PageDiffReport {
        let start = Instant::now();
        let total = run.pages.len();
        if let Some(cb) = &self.config.progress_callback {
            cb.on_page_start(page.get(), total);
        }

        let pair = run.document.page(page).cloned().unwrap_or_default();
        let candidates = run
            .ctx
            .images_for(page, self.bootstrap.as_ref(), self.rasterizer.as_ref())
            .await;
        let narrative = self.vision.report_page(page, &pair.structured, &candidates).await;

        if let Some(cb) = &self.config.progress_callback {
            match &narrative.status {
                PageStatus::Analyzed => cb.on_page_complete(page.get(), total, narrative.text.len()),
                PageStatus::Degraded { reason } => {
                    cb.on_page_degraded(page.get(), total, &reason.to_string())
                }
            }
        }

        PageDiffReport {
            page_no: page.zero_based(),
            details: narrative.text.clone(),
            diff_text: narrative.text,
            status: narrative.status,
            image: narrative.image,
            line_delta: LineDelta::between(&pair),
            input_tokens: narrative.input_tokens,
            output_tokens: narrative.output_tokens,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    pub(crate) fn start_event(&self, run: &PreparedRun) {
        if let Some(cb) = &self.config.progress_callback {
            cb.on_analysis_start(run.pages.len());
        }
    }

    pub(crate) fn finish(&self, run: PreparedRun, page_diffs: Vec<PageDiffReport>) -> AnalysisReport {
        let rasterization = match run.ctx.state() {
            RasterState::Attempted(outcome) => Some(outcome.clone()),
            RasterState::NotAttempted => None,
        };
        let mut report = AnalysisReport {
            work_id: run.work_id,
            run_id: run.ctx.run_id().to_string(),
            summary: None,
            page_diffs,
            stats: AnalysisStats {
                total_pages: run.document.page_count(),
                total_duration_ms: run.started.elapsed().as_millis() as u64,
                structured_shape: run.structured_shape.to_string(),
                rasterization,
                bootstrap: run.ctx.bootstrap_report().cloned(),
                ..Default::default()
            },
        };
        report.tally();

        if let Some(cb) = &self.config.progress_callback {
            cb.on_analysis_complete(report.stats.reported_pages, report.stats.analyzed_pages);
        }
        info!(
            "Analysis of '{}' complete: {}/{} pages analysed, {} degraded ({} ms)",
            report.work_id,
            report.stats.analyzed_pages,
            report.stats.reported_pages,
            report.stats.degraded_pages,
            report.stats.total_duration_ms
        );
        report
    }
}

/// Pages to report: all of `1..=max`, or only the target when it is in range.
fn select_pages(max: PageNumber, target_page0: Option<usize>) -> Vec<PageNumber> {
    match target_page0 {
        None => PageNumber::up_to(max).collect(),
        Some(index) => {
            let page = PageNumber::from_zero_based(index);
            if page <= max {
                vec![page]
            } else {
                warn!(
                    "Target page index {} is outside 0..{}; reporting no pages",
                    index,
                    max.get()
                );
                Vec::new()
            }
        }
    }
}

async fn check_pdf_magic(path: &Path) -> Result<(), String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| format!("{}: {e}", path.display()))?;
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic).await {
        Ok(_) if &magic == b"%PDF" => Ok(()),
        Ok(_) => Err(format!(
            "{} is not a PDF (magic bytes: {:?})",
            path.display(),
            String::from_utf8_lossy(&magic)
        )),
        Err(e) => Err(format!("{}: {e}", path.display())),
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

/// Builder for [`Reconciler`]. Unset collaborators get the default adapters.
pub struct ReconcilerBuilder {
    config: AnalysisConfig,
    work_units: Option<Arc<dyn WorkUnitStore>>,
    extractor: Option<Arc<dyn PageTextExtractor>>,
    structured: Option<Arc<dyn StructuredOutputSource>>,
    vision_model: Option<Arc<dyn VisionModel>>,
    rasterizer: Option<Arc<dyn Rasterizer>>,
    bootstrap: Option<Arc<dyn EnvironmentBootstrap>>,
}

impl ReconcilerBuilder {
    pub fn work_units(mut self, store: Arc<dyn WorkUnitStore>) -> Self {
        self.work_units = Some(store);
        self
    }

    /// Default: [`PdfiumTextExtractor`].
    pub fn extractor(mut self, extractor: Arc<dyn PageTextExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Default: none, every run sees an absent structured output.
    pub fn structured_source(mut self, source: Arc<dyn StructuredOutputSource>) -> Self {
        self.structured = Some(source);
        self
    }

    /// Default: [`LlmVisionModel`] over the provider resolved from the config.
    pub fn vision_model(mut self, model: Arc<dyn VisionModel>) -> Self {
        self.vision_model = Some(model);
        self
    }

    /// Default: [`ScriptRasterizer`] running the configured script.
    pub fn rasterizer(mut self, rasterizer: Arc<dyn Rasterizer>) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }

    /// Default: [`SystemBootstrap`]. Ignored when `config.bootstrap` is false.
    pub fn bootstrap(mut self, bootstrap: Arc<dyn EnvironmentBootstrap>) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    pub fn build(self) -> Result<Reconciler, PdfDiffError> {
        let config = self.config;
        let work_units = self
            .work_units
            .ok_or_else(|| PdfDiffError::InvalidConfig("a work-unit store is required".into()))?;

        let mut resolver = PathResolver::from_process();
        if let Some(dir) = &config.working_dir {
            resolver = resolver.with_working_dir(dir);
        }
        if let Some(dir) = &config.install_dir {
            resolver = resolver.with_install_dir(dir);
        }

        let vision_model: Arc<dyn VisionModel> = match self.vision_model {
            Some(model) => model,
            None => Arc::new(LlmVisionModel::new(resolve_provider(&config)?, &config)),
        };

        let rasterizer: Arc<dyn Rasterizer> = match self.rasterizer {
            Some(r) => r,
            None => {
                let script = resolve_script(&resolver, &config.rasterizer_script);
                Arc::new(ScriptRasterizer::new(config.interpreter.clone(), script))
            }
        };

        let bootstrap: Arc<dyn EnvironmentBootstrap> = match self.bootstrap {
            _ if !config.bootstrap => Arc::new(NoBootstrap),
            Some(b) => b,
            None => Arc::new(SystemBootstrap::from_config(&config)),
        };

        let extractor: Arc<dyn PageTextExtractor> = match self.extractor {
            Some(e) => e,
            None => Arc::new(PdfiumTextExtractor::new()),
        };

        Ok(Reconciler {
            vision: VisionReporter::new(vision_model, &config),
            extractor,
            structured: self.structured,
            resolver,
            work_units,
            rasterizer,
            bootstrap,
            config,
        })
    }
}

/// Locate the rasteriser script like a stored file. An unresolvable script is
/// kept as given: the run then degrades when the rasteriser fails.
fn resolve_script(resolver: &PathResolver, script: &Path) -> PathBuf {
    match resolver.resolve(&script.to_string_lossy()) {
        Ok(found) => found,
        Err(e) => {
            warn!("Rasteriser script: {}", e);
            script.to_path_buf()
        }
    }
}

// ── Provider resolution ──────────────────────────────────────────────────────

/// Model used when a provider is named without one.
const DEFAULT_VISION_MODEL: &str = "gpt-4.1-mini";

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, PdfDiffError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PdfDiffError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the vision provider, from most-specific to least-specific:
///
/// 1. **Pre-built provider** (`config.provider`)
/// 2. **Named provider + model** (`config.provider_name`)
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`)
/// 4. **OpenAI** when `OPENAI_API_KEY` is set
/// 5. **Full auto-detection** (`ProviderFactory::from_env`)
pub fn resolve_provider(config: &AnalysisConfig) -> Result<Arc<dyn LLMProvider>, PdfDiffError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_VISION_MODEL);
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_VISION_MODEL);
            return create_vision_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| PdfDiffError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No vision provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or pass --provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(n: usize) -> PageNumber {
        PageNumber::from_one_based(n).unwrap()
    }

    #[test]
    fn all_pages_without_target() {
        assert_eq!(select_pages(p(3), None), vec![p(1), p(2), p(3)]);
    }

    #[test]
    fn target_in_range_selects_one_page() {
        assert_eq!(select_pages(p(3), Some(2)), vec![p(3)]);
        assert_eq!(select_pages(p(3), Some(0)), vec![p(1)]);
    }

    #[test]
    fn target_out_of_range_selects_nothing() {
        assert!(select_pages(p(3), Some(3)).is_empty());
    }

    #[tokio::test]
    async fn magic_bytes_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("a.pdf");
        let bad = dir.path().join("b.pdf");
        let short = dir.path().join("c.pdf");
        std::fs::write(&good, b"%PDF-1.7\n").unwrap();
        std::fs::write(&bad, b"<html>").unwrap();
        std::fs::write(&short, b"%P").unwrap();

        assert!(check_pdf_magic(&good).await.is_ok());
        assert!(check_pdf_magic(&bad).await.unwrap_err().contains("not a PDF"));
        assert!(check_pdf_magic(&short).await.is_err());
    }

    #[test]
    fn builder_requires_work_units() {
        let err = Reconciler::builder(AnalysisConfig::default()).build().unwrap_err();
        assert!(matches!(err, PdfDiffError::InvalidConfig(_)));
    }

    #[test]
    fn unresolvable_script_is_kept_as_given() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path(), None);
        let script = Path::new("scripts/missing.py");
        assert_eq!(resolve_script(&resolver, script), PathBuf::from("scripts/missing.py"));

        std::fs::create_dir_all(dir.path().join("scripts")).unwrap();
        std::fs::write(dir.path().join("scripts/missing.py"), "").unwrap();
        assert_eq!(
            resolve_script(&resolver, script),
            dir.path().join("scripts/missing.py")
        );
    }
}
