//! Integration tests for the reconciliation pipeline.
//!
//! Every collaborator is replaced by an in-memory fake, so these tests need
//! neither pdfium, Python nor network access. The only real I/O is a temp
//! directory holding a stub original (`%PDF` magic is all the pipeline reads
//! itself) and the run's artifact root.

use async_trait::async_trait;
use edgequake_pdfdiff::pipeline::encode::PageImage;
use edgequake_pdfdiff::pipeline::normalize::normalize_text;
use edgequake_pdfdiff::pipeline::resolve::PathResolver;
use edgequake_pdfdiff::prompts::DEGRADED_NARRATIVE;
use edgequake_pdfdiff::{
    AnalysisConfig, AnalysisProgressCallback, CollaboratorError, DegradedReason,
    JsonWorkUnitRegistry, PageNumber, PageStatus, PageTextExtractor, PdfDiffError, RasterJob,
    RasterOutcome, Rasterizer, Reconciler, StructuredOutput, StructuredOutputSource, VisionError,
    VisionModel, VisionResponse, WorkUnit,
};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// ── Fakes ────────────────────────────────────────────────────────────────────

/// Returns the same page texts for any PDF.
struct FixedExtractor(BTreeMap<PageNumber, String>);

impl FixedExtractor {
    fn pages(texts: &[&str]) -> Arc<Self> {
        Arc::new(Self(
            texts
                .iter()
                .enumerate()
                .map(|(i, t)| (PageNumber::from_zero_based(i), t.to_string()))
                .collect(),
        ))
    }
}

#[async_trait]
impl PageTextExtractor for FixedExtractor {
    async fn extract_page_text(
        &self,
        _pdf_path: &Path,
    ) -> Result<BTreeMap<PageNumber, String>, CollaboratorError> {
        Ok(self.0.clone())
    }
}

struct FixedStructured(StructuredOutput);

#[async_trait]
impl StructuredOutputSource for FixedStructured {
    async fn structured_output(&self, _work_id: &str) -> Result<StructuredOutput, CollaboratorError> {
        Ok(self.0.clone())
    }
}

struct BrokenStructured;

#[async_trait]
impl StructuredOutputSource for BrokenStructured {
    async fn structured_output(&self, _work_id: &str) -> Result<StructuredOutput, CollaboratorError> {
        Err(CollaboratorError::Http("503 Service Unavailable".into()))
    }
}

/// Counts invocations and always fails.
#[derive(Default)]
struct FailingRasterizer {
    calls: AtomicUsize,
}

#[async_trait]
impl Rasterizer for FailingRasterizer {
    async fn rasterize(&self, _job: &RasterJob) -> RasterOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        RasterOutcome::Failed {
            exit_code: Some(1),
            stderr: "ModuleNotFoundError: No module named 'fitz'".into(),
        }
    }
}

/// Writes `<base_id>-<n>.png` for `pages` pages, like the bundled script.
struct PngRasterizer {
    pages: usize,
    calls: AtomicUsize,
}

impl PngRasterizer {
    fn new(pages: usize) -> Arc<Self> {
        Arc::new(Self {
            pages,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Rasterizer for PngRasterizer {
    async fn rasterize(&self, job: &RasterJob) -> RasterOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for n in 1..=self.pages {
            let path = job.output_dir.join(format!("{}-{}.png", job.base_id, n));
            if let Err(e) = image::RgbImage::new(8, 8).save(&path) {
                return RasterOutcome::SpawnFailed {
                    reason: e.to_string(),
                };
            }
        }
        RasterOutcome::Completed
    }
}

/// A vision model that cannot be reached.
#[derive(Default)]
struct UnreachableVision {
    calls: AtomicUsize,
}

#[async_trait]
impl VisionModel for UnreachableVision {
    async fn generate(
        &self,
        _system_prompt: &str,
        _user_text: &str,
        _image: &PageImage,
    ) -> Result<VisionResponse, VisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(VisionError("connection refused".into()))
    }
}

/// Answers every page with the same itemised list and records the prompts.
#[derive(Default)]
struct EchoVision {
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl VisionModel for EchoVision {
    async fn generate(
        &self,
        _system_prompt: &str,
        user_text: &str,
        _image: &PageImage,
    ) -> Result<VisionResponse, VisionError> {
        self.prompts
            .lock()
            .map_err(|e| VisionError(e.to_string()))?
            .push(user_text.to_string());
        Ok(VisionResponse {
            text: "```markdown\n- Missing from text: table footnote\n```".into(),
            input_tokens: 100,
            output_tokens: 10,
        })
    }
}

#[derive(Default)]
struct RecordingProgress {
    events: Mutex<Vec<String>>,
}

impl RecordingProgress {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl AnalysisProgressCallback for RecordingProgress {
    fn on_analysis_start(&self, total_pages: usize) {
        self.push(format!("start {total_pages}"));
    }
    fn on_page_complete(&self, page_num: usize, _total: usize, _narrative_len: usize) {
        self.push(format!("ok {page_num}"));
    }
    fn on_page_degraded(&self, page_num: usize, _total: usize, _reason: &str) {
        self.push(format!("degraded {page_num}"));
    }
    fn on_analysis_complete(&self, total_pages: usize, analyzed: usize) {
        self.push(format!("done {analyzed}/{total_pages}"));
    }
}

// ── Fixture ──────────────────────────────────────────────────────────────────

const WORK_ID: &str = "w-42";
const STORED: &str = "storage/original-uploads/alice/w-42.pdf";

/// A working directory holding the stored original, plus an artifact root.
struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        write_pdf(&dir.path().join("cwd").join(STORED));
        std::fs::create_dir_all(dir.path().join("artifacts")).unwrap();
        Self { dir }
    }

    fn cwd(&self) -> PathBuf {
        self.dir.path().join("cwd")
    }

    fn config(&self) -> edgequake_pdfdiff::AnalysisConfigBuilder {
        AnalysisConfig::builder()
            .working_dir(self.cwd())
            .install_dir(self.dir.path().join("opt").join("bin"))
            .artifact_root(self.dir.path().join("artifacts"))
            .bootstrap(false)
            .max_retries(0)
            .retry_backoff_ms(1)
    }

    fn registry(&self) -> Arc<JsonWorkUnitRegistry> {
        Arc::new(JsonWorkUnitRegistry::from_units([WorkUnit {
            work_id: WORK_ID.into(),
            owner: "alice".into(),
            original_file_name: "Quarterly Report.pdf".into(),
            stored_path: STORED.into(),
            file_size: None,
            description: None,
        }]))
    }
}

fn write_pdf(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, b"%PDF-1.7\n%stub\n").unwrap();
}

fn per_page(texts: &[&str]) -> StructuredOutput {
    StructuredOutput::PerPage(
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| (PageNumber::from_zero_based(i), t.to_string()))
            .collect(),
    )
}

fn is_placeholder(text: &str) -> bool {
    text.starts_with("[p.") && text.ends_with(DEGRADED_NARRATIVE)
}

// ── Required properties ──────────────────────────────────────────────────────

#[tokio::test]
async fn two_pages_without_structured_output_or_rasterizer_degrade_without_error() {
    let fx = Fixture::new();
    let rasterizer = Arc::new(FailingRasterizer::default());
    let reconciler = Reconciler::builder(fx.config().build().unwrap())
        .work_units(fx.registry())
        .extractor(FixedExtractor::pages(&["Page one", "Page two"]))
        .rasterizer(rasterizer.clone())
        .vision_model(Arc::new(UnreachableVision::default()))
        .build()
        .unwrap();

    let report = reconciler.analyze(WORK_ID, "alice", None).await.unwrap();

    assert_eq!(report.page_diffs.len(), 2);
    assert!(report.summary.is_none());
    for (i, page) in report.page_diffs.iter().enumerate() {
        assert_eq!(page.page_no, i);
        assert!(is_placeholder(&page.diff_text), "{}", page.diff_text);
        assert_eq!(page.details, page.diff_text);
        assert_eq!(
            page.status,
            PageStatus::Degraded {
                reason: DegradedReason::NoImage
            }
        );
    }
    assert_eq!(report.stats.structured_shape, "absent");
    assert_eq!(report.stats.degraded_pages, 2);
}

#[tokio::test]
async fn absent_structured_output_keeps_every_original_page() {
    let fx = Fixture::new();
    let reconciler = Reconciler::builder(fx.config().build().unwrap())
        .work_units(fx.registry())
        .extractor(FixedExtractor::pages(&["alpha", "beta", "gamma"]))
        .rasterizer(Arc::new(FailingRasterizer::default()))
        .vision_model(Arc::new(UnreachableVision::default()))
        .build()
        .unwrap();

    let report = reconciler.analyze(WORK_ID, "alice", None).await.unwrap();

    assert_eq!(report.page_diffs.len(), 3);
    // Empty structured side: every original line is reported missing.
    assert_eq!(report.page_diffs[1].line_delta.missing, vec!["beta".to_string()]);
    assert!(report.page_diffs[1].line_delta.added.is_empty());
}

#[tokio::test]
async fn page_range_covers_the_longer_side() {
    let fx = Fixture::new();
    let reconciler = Reconciler::builder(fx.config().build().unwrap())
        .work_units(fx.registry())
        .extractor(FixedExtractor::pages(&["one", "two"]))
        .structured_source(Arc::new(FixedStructured(per_page(&["one", "two", "three", "four"]))))
        .rasterizer(Arc::new(FailingRasterizer::default()))
        .vision_model(Arc::new(UnreachableVision::default()))
        .build()
        .unwrap();

    let report = reconciler.analyze(WORK_ID, "alice", None).await.unwrap();

    let indices: Vec<usize> = report.page_diffs.iter().map(|p| p.page_no).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert_eq!(report.stats.total_pages, 4);
    assert!(report.page_diffs[0].line_delta.is_identical());
    assert_eq!(report.page_diffs[3].line_delta.added, vec!["four".to_string()]);
}

#[tokio::test]
async fn rasterizer_runs_once_per_run_even_when_it_fails() {
    let fx = Fixture::new();
    let rasterizer = Arc::new(FailingRasterizer::default());
    let reconciler = Reconciler::builder(fx.config().build().unwrap())
        .work_units(fx.registry())
        .extractor(FixedExtractor::pages(&["1", "2", "3", "4", "5"]))
        .rasterizer(rasterizer.clone())
        .vision_model(Arc::new(UnreachableVision::default()))
        .build()
        .unwrap();

    let report = reconciler.analyze(WORK_ID, "alice", None).await.unwrap();

    assert_eq!(rasterizer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.page_diffs.len(), 5);
    assert!(report.page_diffs.iter().all(|p| p.is_degraded()));
    assert!(matches!(
        report.stats.rasterization,
        Some(RasterOutcome::Failed { .. })
    ));
}

#[tokio::test]
async fn repeated_runs_with_unreachable_vision_match_in_structure() {
    let fx = Fixture::new();
    let vision = Arc::new(UnreachableVision::default());
    let reconciler = Reconciler::builder(fx.config().build().unwrap())
        .work_units(fx.registry())
        .extractor(FixedExtractor::pages(&["a", "b", "c"]))
        .structured_source(Arc::new(FixedStructured(per_page(&["a", "b"]))))
        .rasterizer(PngRasterizer::new(3))
        .vision_model(vision.clone())
        .build()
        .unwrap();

    let first = reconciler.analyze(WORK_ID, "alice", None).await.unwrap();
    let second = reconciler.analyze(WORK_ID, "alice", None).await.unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.page_diffs.len(), second.page_diffs.len());
    for (a, b) in first.page_diffs.iter().zip(&second.page_diffs) {
        assert_eq!(a.page_no, b.page_no);
        assert_eq!(a.diff_text, b.diff_text);
        assert!(is_placeholder(&a.diff_text));
        assert!(matches!(
            a.status,
            PageStatus::Degraded {
                reason: DegradedReason::VisionFailed { .. }
            }
        ));
    }
    // Images existed, so the model was asked for every page of both runs.
    assert_eq!(vision.calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn original_found_only_under_install_dir_is_analysed() {
    let dir = tempfile::tempdir().unwrap();
    let cwd = dir.path().join("elsewhere");
    let install = dir.path().join("app").join("bin");
    std::fs::create_dir_all(&cwd).unwrap();
    write_pdf(&install.join(STORED));

    let resolver = PathResolver::new(&cwd, Some(install.clone()));
    assert_eq!(resolver.resolve(STORED).unwrap(), install.join(STORED));

    let config = AnalysisConfig::builder()
        .working_dir(&cwd)
        .install_dir(&install)
        .artifact_root(dir.path().join("artifacts"))
        .bootstrap(false)
        .max_retries(0)
        .build()
        .unwrap();
    let reconciler = Reconciler::builder(config)
        .work_units(Fixture::new().registry())
        .extractor(FixedExtractor::pages(&["only page"]))
        .rasterizer(Arc::new(FailingRasterizer::default()))
        .vision_model(Arc::new(UnreachableVision::default()))
        .build()
        .unwrap();

    let report = reconciler.analyze(WORK_ID, "alice", None).await.unwrap();
    assert_eq!(report.page_diffs.len(), 1);
}

#[test]
fn normalization_example() {
    assert_eq!(
        normalize_text("A\r\nB\r\n```mermaid\nC\n```\nD"),
        "A\nB\nD"
    );
}

// ── Fatal errors ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn blank_work_id_is_invalid_argument() {
    let fx = Fixture::new();
    let reconciler = Reconciler::builder(fx.config().build().unwrap())
        .work_units(fx.registry())
        .extractor(FixedExtractor::pages(&["x"]))
        .vision_model(Arc::new(UnreachableVision::default()))
        .build()
        .unwrap();

    let err = reconciler.analyze("   ", "alice", None).await.unwrap_err();
    assert!(matches!(err, PdfDiffError::InvalidArgument(_)));
}

#[tokio::test]
async fn unknown_or_missing_original_is_source_unavailable() {
    let fx = Fixture::new();
    let reconciler = Reconciler::builder(fx.config().build().unwrap())
        .work_units(fx.registry())
        .extractor(FixedExtractor::pages(&["x"]))
        .vision_model(Arc::new(UnreachableVision::default()))
        .build()
        .unwrap();

    let err = reconciler.analyze("w-unknown", "alice", None).await.unwrap_err();
    assert!(matches!(err, PdfDiffError::SourceUnavailable { .. }));

    std::fs::remove_file(fx.cwd().join(STORED)).unwrap();
    let err = reconciler.analyze(WORK_ID, "alice", None).await.unwrap_err();
    match err {
        PdfDiffError::SourceUnavailable { work_id, .. } => assert_eq!(work_id, WORK_ID),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn non_pdf_original_is_source_unavailable() {
    let fx = Fixture::new();
    std::fs::write(fx.cwd().join(STORED), b"<html>not a pdf</html>").unwrap();
    let reconciler = Reconciler::builder(fx.config().build().unwrap())
        .work_units(fx.registry())
        .extractor(FixedExtractor::pages(&["x"]))
        .vision_model(Arc::new(UnreachableVision::default()))
        .build()
        .unwrap();

    let err = reconciler.analyze(WORK_ID, "alice", None).await.unwrap_err();
    assert!(err.to_string().contains("not a PDF"), "{err}");
}

// ── Successful comparison ────────────────────────────────────────────────────

#[tokio::test]
async fn rendered_pages_are_compared_and_wrapped_with_headers() {
    let fx = Fixture::new();
    let rasterizer = PngRasterizer::new(2);
    let vision = Arc::new(EchoVision::default());
    let progress = Arc::new(RecordingProgress::default());
    let config = fx
        .config()
        .progress_callback(progress.clone())
        .build()
        .unwrap();
    let reconciler = Reconciler::builder(config)
        .work_units(fx.registry())
        .extractor(FixedExtractor::pages(&["Revenue 10", "Costs 4"]))
        .structured_source(Arc::new(FixedStructured(per_page(&["Revenue 10", "Costs\t4"]))))
        .rasterizer(rasterizer.clone())
        .vision_model(vision.clone())
        .build()
        .unwrap();

    let report = reconciler.analyze(WORK_ID, "alice", None).await.unwrap();

    assert_eq!(rasterizer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.stats.analyzed_pages, 2);
    assert_eq!(report.stats.total_input_tokens, 200);
    assert_eq!(
        report.page_diffs[1].diff_text,
        "[p.2] Discrepancies\n- Missing from text: table footnote"
    );
    assert!(report.page_diffs[0]
        .image
        .as_ref()
        .is_some_and(|p| p.ends_with("w-42-1.png")));

    // Tabs are folded before the text reaches the model.
    let prompts = vision.prompts.lock().unwrap();
    assert!(prompts[1].contains("Costs 4"));
    drop(prompts);

    let events = progress.events.lock().unwrap().clone();
    assert_eq!(events, vec!["start 2", "ok 1", "ok 2", "done 2/2"]);

    let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert!(json["summary"].is_null());
    assert_eq!(json["page_diffs"][0]["page_no"], 0);
    assert_eq!(json["page_diffs"][0]["status"]["state"], "analyzed");
}

#[tokio::test]
async fn unavailable_structuring_service_counts_as_absent() {
    let fx = Fixture::new();
    let reconciler = Reconciler::builder(fx.config().build().unwrap())
        .work_units(fx.registry())
        .extractor(FixedExtractor::pages(&["x", "y"]))
        .structured_source(Arc::new(BrokenStructured))
        .rasterizer(Arc::new(FailingRasterizer::default()))
        .vision_model(Arc::new(UnreachableVision::default()))
        .build()
        .unwrap();

    let report = reconciler.analyze(WORK_ID, "alice", None).await.unwrap();
    assert_eq!(report.stats.structured_shape, "absent");
    assert_eq!(report.page_diffs.len(), 2);
}

#[tokio::test]
async fn flat_structured_output_is_compared_against_page_one() {
    let fx = Fixture::new();
    let reconciler = Reconciler::builder(fx.config().build().unwrap())
        .work_units(fx.registry())
        .extractor(FixedExtractor::pages(&["x", "y"]))
        .structured_source(Arc::new(FixedStructured(StructuredOutput::Flat("x".into()))))
        .rasterizer(Arc::new(FailingRasterizer::default()))
        .vision_model(Arc::new(UnreachableVision::default()))
        .build()
        .unwrap();

    let report = reconciler.analyze(WORK_ID, "alice", None).await.unwrap();
    assert_eq!(report.stats.structured_shape, "flat");
    assert!(report.page_diffs[0].line_delta.is_identical());
    assert_eq!(report.page_diffs[1].line_delta.missing, vec!["y".to_string()]);
}

// ── Target page and streaming ────────────────────────────────────────────────

#[tokio::test]
async fn target_page_limits_the_report() {
    let fx = Fixture::new();
    let reconciler = Reconciler::builder(fx.config().build().unwrap())
        .work_units(fx.registry())
        .extractor(FixedExtractor::pages(&["a", "b", "c"]))
        .rasterizer(Arc::new(FailingRasterizer::default()))
        .vision_model(Arc::new(UnreachableVision::default()))
        .build()
        .unwrap();

    let report = reconciler.analyze(WORK_ID, "alice", Some(1)).await.unwrap();
    assert_eq!(report.page_diffs.len(), 1);
    assert_eq!(report.page_diffs[0].page_no, 1);
    assert!(report.page_diffs[0].diff_text.starts_with("[p.2]"));

    let report = reconciler.analyze(WORK_ID, "alice", Some(7)).await.unwrap();
    assert!(report.page_diffs.is_empty());
    assert_eq!(report.stats.total_pages, 3);
}

#[tokio::test]
async fn stream_yields_pages_in_order() {
    let fx = Fixture::new();
    let rasterizer = Arc::new(FailingRasterizer::default());
    let reconciler = Reconciler::builder(fx.config().build().unwrap())
        .work_units(fx.registry())
        .extractor(FixedExtractor::pages(&["a", "b", "c"]))
        .rasterizer(rasterizer.clone())
        .vision_model(Arc::new(UnreachableVision::default()))
        .build()
        .unwrap();

    let mut stream = reconciler.analyze_stream(WORK_ID, "alice", None).await.unwrap();
    let mut indices = Vec::new();
    while let Some(page) = stream.next().await {
        assert!(page.is_degraded());
        indices.push(page.page_no);
    }

    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(rasterizer.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stream_surfaces_fatal_errors_up_front() {
    let fx = Fixture::new();
    let reconciler = Reconciler::builder(fx.config().build().unwrap())
        .work_units(fx.registry())
        .extractor(FixedExtractor::pages(&["a"]))
        .vision_model(Arc::new(UnreachableVision::default()))
        .build()
        .unwrap();

    let result = reconciler.analyze_stream("w-unknown", "alice", None).await;
    assert!(matches!(result, Err(PdfDiffError::SourceUnavailable { .. })));
}
