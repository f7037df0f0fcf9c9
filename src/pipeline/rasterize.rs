//! Page images: discovery of existing rasterisations and, when none exist,
//! one bounded invocation of the external rasteriser per run.
//!
//! ## Why a run context instead of a process-wide flag?
//!
//! "Have we already tried to rasterise this document?" is a question about
//! one run. Keeping the answer in [`RunContext`], which each analysis owns
//! exclusively, means two concurrent analyses never see each other's attempts
//! and a failed attempt is never silently reused by the next request.
//!
//! ## Discovery
//!
//! Images are looked up in an ordered list of roots:
//!
//! ```text
//! <artifact_root>/<work_id>/<run_id>   ← this run's output
//! <artifact_root>/<work_id>            ← earlier runs of the same work unit
//! <shared_dir>/<work_id>               ← each configured shared directory
//! ```
//!
//! The first root that yields a match wins; matches within a root are sorted
//! lexicographically and only the first is sent to the vision model.

use crate::config::{AnalysisConfig, RasterFormat};
use crate::pipeline::bootstrap::{BootstrapReport, EnvironmentBootstrap};
use crate::pipeline::process::{run_abandoning, tail_line, ProcessError};
use crate::pipeline::reconcile::PageNumber;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

const PAGE_SEPARATORS: &[char] = &['-', '_'];

// `page` must precede `p`: both are suffixes of "…page".
const PAGE_KEYWORDS: &[&str] = &["page", "p"];

/// Characters that may precede a page keyword.
const DELIMITERS: &[char] = &['-', '_', '.', ' '];

/// One rasterisation request: the whole document into `output_dir`.
#[derive(Debug, Clone)]
pub struct RasterJob {
    pub source: PathBuf,
    pub output_dir: PathBuf,
    /// File-name prefix for the produced images.
    pub base_id: String,
    /// Original upload name, for the rasteriser's own logging.
    pub display_name: String,
    pub dpi: u32,
    pub format: RasterFormat,
    pub timeout: Duration,
}

/// How the single rasterisation attempt of a run ended. Never escalated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RasterOutcome {
    Completed,
    Failed { exit_code: Option<i32>, stderr: String },
    TimedOut { secs: u64 },
    SpawnFailed { reason: String },
}

/// Renders every page of a PDF into image files. Bounded: returns within the
/// job's timeout. A renderer still working at the deadline may keep writing
/// into `output_dir`; later scans pick those images up.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    async fn rasterize(&self, job: &RasterJob) -> RasterOutcome;
}

/// Runs `<interpreter> <script> <source> <output_dir> <base_id> <display_name>
/// --dpi <n> --format <fmt>`.
#[derive(Debug, Clone)]
pub struct ScriptRasterizer {
    interpreter: String,
    script: PathBuf,
}

impl ScriptRasterizer {
    pub fn new(interpreter: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            script: script.into(),
        }
    }

    fn args(&self, job: &RasterJob) -> Vec<String> {
        vec![
            self.script.to_string_lossy().into_owned(),
            job.source.to_string_lossy().into_owned(),
            job.output_dir.to_string_lossy().into_owned(),
            job.base_id.clone(),
            job.display_name.clone(),
            "--dpi".into(),
            job.dpi.to_string(),
            "--format".into(),
            job.format.as_str().into(),
        ]
    }
}

#[async_trait]
impl Rasterizer for ScriptRasterizer {
    async fn rasterize(&self, job: &RasterJob) -> RasterOutcome {
        let args = self.args(job);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        debug!("Rasterising: {} {}", self.interpreter, args.join(" "));

        match run_abandoning(&self.interpreter, &args, &[], job.timeout).await {
            Ok(out) if out.status.success() => RasterOutcome::Completed,
            Ok(out) => RasterOutcome::Failed {
                exit_code: out.status.code(),
                stderr: tail_line(&out.stderr),
            },
            Err(ProcessError::TimedOut { secs, .. }) => RasterOutcome::TimedOut { secs },
            Err(e) => RasterOutcome::SpawnFailed {
                reason: e.to_string(),
            },
        }
    }
}

// ── Run context ──────────────────────────────────────────────────────────────

/// Whether this run already tried to rasterise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RasterState {
    NotAttempted,
    Attempted(RasterOutcome),
}

/// State owned by a single analysis run.
#[derive(Debug)]
pub struct RunContext {
    work_id: String,
    /// `work_id` made safe as a path component; also the image name prefix.
    base_id: String,
    run_id: String,
    run_dir: PathBuf,
    roots: Vec<PathBuf>,
    source: PathBuf,
    display_name: String,
    dpi: u32,
    format: RasterFormat,
    timeout: Duration,
    state: RasterState,
    bootstrap: Option<BootstrapReport>,
}

impl RunContext {
    /// New run for `work_id` whose original lives at `source`.
    pub fn new(
        work_id: &str,
        source: impl Into<PathBuf>,
        display_name: impl Into<String>,
        config: &AnalysisConfig,
    ) -> Self {
        Self::with_run_id(work_id, new_run_id(), source, display_name, config)
    }

    pub fn with_run_id(
        work_id: &str,
        run_id: impl Into<String>,
        source: impl Into<PathBuf>,
        display_name: impl Into<String>,
        config: &AnalysisConfig,
    ) -> Self {
        let run_id = run_id.into();
        let segment = path_segment(work_id);
        let work_root = config.artifact_root.join(&segment);
        let run_dir = work_root.join(&run_id);

        let mut roots = vec![run_dir.clone(), work_root];
        roots.extend(config.shared_image_dirs.iter().map(|d| d.join(&segment)));

        Self {
            work_id: work_id.to_string(),
            base_id: segment,
            run_id,
            run_dir,
            roots,
            source: source.into(),
            display_name: display_name.into(),
            dpi: config.dpi,
            format: config.image_format,
            timeout: Duration::from_secs(config.rasterize_timeout_secs),
            state: RasterState::NotAttempted,
            bootstrap: None,
        }
    }

    pub fn work_id(&self) -> &str {
        &self.work_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Discovery roots in search order.
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn state(&self) -> &RasterState {
        &self.state
    }

    /// Set once the bootstrapper has run in this run.
    pub fn bootstrap_report(&self) -> Option<&BootstrapReport> {
        self.bootstrap.as_ref()
    }

    /// Existing images for `page`, from the first root that has any.
    pub fn candidates_for(&self, page: PageNumber) -> Vec<PathBuf> {
        for root in &self.roots {
            let found = scan_root(root, page, &self.base_id);
            if !found.is_empty() {
                debug!(
                    "Page {}: {} candidate(s) under {}",
                    page,
                    found.len(),
                    root.display()
                );
                return found;
            }
        }
        Vec::new()
    }

    /// Candidates for `page`, rasterising the document first if nothing is
    /// found and this run has not tried yet.
    ///
    /// The bootstrapper runs at most once, immediately before the first
    /// rasterisation. After one attempt, whatever its outcome, later pages
    /// only re-scan.
    pub async fn images_for(
        &mut self,
        page: PageNumber,
        bootstrap: &dyn EnvironmentBootstrap,
        rasterizer: &dyn Rasterizer,
    ) -> Vec<PathBuf> {
        let found = self.candidates_for(page);
        if !found.is_empty() || self.state != RasterState::NotAttempted {
            return found;
        }

        if self.bootstrap.is_none() {
            let report = bootstrap.ensure_ready().await;
            if !report.is_complete() {
                warn!("Rendering toolchain incomplete; rasterisation may fail: {:?}", report);
            }
            self.bootstrap = Some(report);
        }

        let outcome = match tokio::fs::create_dir_all(&self.run_dir).await {
            Ok(()) => {
                info!(
                    "No page images for '{}'; rasterising into {}",
                    self.work_id,
                    self.run_dir.display()
                );
                rasterizer.rasterize(&self.job()).await
            }
            Err(e) => RasterOutcome::SpawnFailed {
                reason: format!("cannot create {}: {e}", self.run_dir.display()),
            },
        };

        if outcome == RasterOutcome::Completed {
            info!("Rasterisation of '{}' completed", self.work_id);
        } else {
            warn!("Rasterisation of '{}' did not complete: {:?}", self.work_id, outcome);
        }
        self.state = RasterState::Attempted(outcome);

        self.candidates_for(page)
    }

    fn job(&self) -> RasterJob {
        RasterJob {
            source: self.source.clone(),
            output_dir: self.run_dir.clone(),
            base_id: self.base_id.clone(),
            display_name: self.display_name.clone(),
            dpi: self.dpi,
            format: self.format,
            timeout: self.timeout,
        }
    }
}

/// UTC timestamp plus a random nonce, so runs started in the same
/// millisecond still get distinct directories.
fn new_run_id() -> String {
    format!(
        "{}-{:08x}",
        Utc::now().format("%Y%m%dT%H%M%S%3fZ"),
        rand::random::<u32>()
    )
}

/// Make a work id safe to use as one path component.
fn path_segment(work_id: &str) -> String {
    let cleaned: String = work_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".repeat(cleaned.len().max(1))
    } else {
        cleaned
    }
}

fn scan_root(root: &Path, page: PageNumber, base_id: &str) -> Vec<PathBuf> {
    if !root.is_dir() {
        return Vec::new();
    }
    let pattern = format!("{}/**/*", glob::Pattern::escape(&root.to_string_lossy()));
    let entries = match glob::glob(&pattern) {
        Ok(paths) => paths,
        Err(e) => {
            warn!("Bad discovery pattern {}: {}", pattern, e);
            return Vec::new();
        }
    };

    let mut found: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|p| p.is_file() && is_page_image(p, page, base_id))
        .collect();
    found.sort();
    found
}

/// `true` for png/jpg/jpeg files whose stem ends with a page suffix for
/// `page`: a `-`/`_` separator, a `page`/`p` keyword, or both, followed by the
/// (possibly zero-padded) number. `doc-3.png`, `doc_003.jpg`, `doc-p3.png`,
/// `doc-page3.jpeg`, `page_3.png`.
///
/// The keyword must start the stem or follow a delimiter, so `setup3.png` is
/// not page 3. A stem equal to `base_id` is never a page image, so a work id
/// ending in digits does not match its own bare file name.
pub fn is_page_image(path: &Path, page: PageNumber, base_id: &str) -> bool {
    let ext_ok = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)));
    if !ext_ok {
        return false;
    }
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    if stem.eq_ignore_ascii_case(base_id) {
        return false;
    }

    let digits_at = stem
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i);
    let Some(split) = digits_at else {
        return false;
    };
    let (head, digits) = stem.split_at(split);
    if !digits.parse::<usize>().is_ok_and(|n| n == page.get()) {
        return false;
    }

    let head = head.to_ascii_lowercase();
    let before_sep = head.strip_suffix(PAGE_SEPARATORS);
    let rest = before_sep.unwrap_or(&head);
    match PAGE_KEYWORDS.iter().find_map(|kw| rest.strip_suffix(kw)) {
        Some(before_kw) => before_kw.is_empty() || before_kw.ends_with(DELIMITERS),
        None => before_sep.is_some(),
    }
}
