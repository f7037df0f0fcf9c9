//! Configuration types for extraction verification.
//!
//! Every knob of an analysis run lives in [`AnalysisConfig`], built via its
//! [`AnalysisConfigBuilder`]. One struct means one place to look when two runs
//! on the same work unit disagree: log the config and diff it.
//!
//! # Design choice: builder over constructor
//! Most callers only care about the model and maybe the DPI; the builder lets
//! them set those and inherit documented defaults for the rendering toolchain,
//! retry policy and artifact layout.

use crate::error::PdfDiffError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Environment variable overriding the artifact root.
pub const ARTIFACT_ROOT_ENV: &str = "PDFDIFF_TMP_ROOT";

/// Artifact root used when [`ARTIFACT_ROOT_ENV`] is unset.
pub const DEFAULT_ARTIFACT_ROOT: &str = "/tmp/pdfdiff";

/// Configuration for one or more analysis runs.
///
/// # Example
/// ```rust
/// use edgequake_pdfdiff::AnalysisConfig;
///
/// let config = AnalysisConfig::builder()
///     .dpi(150)
///     .model("gpt-4.1-mini")
///     .max_retries(1)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct AnalysisConfig {
    /// Root under which run directories (`<root>/<work_id>/<run_id>`) are
    /// created. Default: `$PDFDIFF_TMP_ROOT`, else `/tmp/pdfdiff`.
    ///
    /// The root is append-only and shared between runs. Images left behind by
    /// earlier runs of the same work unit under `<root>/<work_id>` are reused
    /// by discovery, so a second analysis of a document usually needs no
    /// rasterisation at all.
    pub artifact_root: PathBuf,

    /// Extra directories searched (as `<dir>/<work_id>`) after the artifact
    /// root, e.g. images produced by the upload pipeline.
    pub shared_image_dirs: Vec<PathBuf>,

    /// Rasteriser script. Relative paths go through the path resolver.
    /// Default: `scripts/render_pages.py`.
    pub rasterizer_script: PathBuf,

    /// Interpreter used to run the script and to probe/install Python
    /// libraries. Default: `python3`.
    pub interpreter: String,

    /// Rasterisation DPI. Range: 72–400. Default: 200.
    ///
    /// Vision models need to read footnotes and table cells to notice that
    /// one is missing; 200 DPI keeps 8pt text legible.
    pub dpi: u32,

    /// Image format requested from the rasteriser. Default: PNG.
    pub image_format: RasterFormat,

    /// Upper bound on the single rasteriser invocation. Default: 60.
    pub rasterize_timeout_secs: u64,

    /// Whether to probe for and install missing rendering dependencies before
    /// the first rasterisation. Default: true.
    pub bootstrap: bool,

    /// Python modules that must import for the script to work.
    /// Default: `fitz`, `PIL`.
    pub python_modules: Vec<String>,

    /// Packages installed with `pip install --user` when the modules are
    /// missing. Default: `pymupdf`, `pillow`.
    pub python_packages: Vec<String>,

    /// System rasteriser the script falls back to. Default: `pdftoppm`.
    pub system_tool: String,

    /// Upper bound on each probe and install step. Default: 300.
    pub install_timeout_secs: u64,

    /// Longest image edge sent to the vision model, in pixels. Default: 2000.
    pub max_image_pixels: u32,

    /// Vision model identifier, e.g. "gpt-4.1-mini", "claude-sonnet-4-20250514".
    /// If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    /// If None along with `provider`, the provider is detected from the environment.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Custom system prompt. If None, uses [`crate::prompts::DISCREPANCY_SYSTEM_PROMPT`].
    pub system_prompt: Option<String>,

    /// Sampling temperature. Default: 0.0.
    ///
    /// Two runs over the same page should report the same discrepancies.
    pub temperature: f32,

    /// Maximum tokens the model may generate per page. Default: 2048.
    pub max_tokens: usize,

    /// Retries after a failed vision call. Default: 2.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per vision call timeout in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Overrides the working directory probed first by the path resolver.
    pub working_dir: Option<PathBuf>,

    /// Overrides the install directory (default: directory of the executable).
    pub install_dir: Option<PathBuf>,

    /// Optional progress events.
    pub progress_callback: Option<ProgressCallback>,
}

fn default_artifact_root() -> PathBuf {
    std::env::var_os(ARTIFACT_ROOT_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACT_ROOT))
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            artifact_root: default_artifact_root(),
            shared_image_dirs: Vec::new(),
            rasterizer_script: PathBuf::from("scripts/render_pages.py"),
            interpreter: "python3".into(),
            dpi: 200,
            image_format: RasterFormat::default(),
            rasterize_timeout_secs: 60,
            bootstrap: true,
            python_modules: vec!["fitz".into(), "PIL".into()],
            python_packages: vec!["pymupdf".into(), "pillow".into()],
            system_tool: "pdftoppm".into(),
            install_timeout_secs: 300,
            max_image_pixels: 2000,
            model: None,
            provider_name: None,
            provider: None,
            system_prompt: None,
            temperature: 0.0,
            max_tokens: 2048,
            max_retries: 2,
            retry_backoff_ms: 500,
            api_timeout_secs: 120,
            working_dir: None,
            install_dir: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for AnalysisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisConfig")
            .field("artifact_root", &self.artifact_root)
            .field("shared_image_dirs", &self.shared_image_dirs)
            .field("rasterizer_script", &self.rasterizer_script)
            .field("interpreter", &self.interpreter)
            .field("dpi", &self.dpi)
            .field("image_format", &self.image_format)
            .field("bootstrap", &self.bootstrap)
            .field("system_tool", &self.system_tool)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .finish()
    }
}

impl AnalysisConfig {
    /// Create a new builder for `AnalysisConfig`.
    pub fn builder() -> AnalysisConfigBuilder {
        AnalysisConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`AnalysisConfig`].
pub struct AnalysisConfigBuilder {
    config: AnalysisConfig,
}

impl fmt::Debug for AnalysisConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.config.fmt(f)
    }
}

impl AnalysisConfigBuilder {
    pub fn artifact_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.artifact_root = root.into();
        self
    }

    pub fn shared_image_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.shared_image_dirs.push(dir.into());
        self
    }

    pub fn rasterizer_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.config.rasterizer_script = script.into();
        self
    }

    pub fn interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.config.interpreter = interpreter.into();
        self
    }

    /// Out-of-range values are rejected by [`build`](Self::build).
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi;
        self
    }

    pub fn image_format(mut self, format: RasterFormat) -> Self {
        self.config.image_format = format;
        self
    }

    pub fn rasterize_timeout_secs(mut self, secs: u64) -> Self {
        self.config.rasterize_timeout_secs = secs;
        self
    }

    pub fn bootstrap(mut self, enabled: bool) -> Self {
        self.config.bootstrap = enabled;
        self
    }

    pub fn python_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.python_modules = modules.into_iter().map(Into::into).collect();
        self
    }

    pub fn python_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.python_packages = packages.into_iter().map(Into::into).collect();
        self
    }

    pub fn system_tool(mut self, tool: impl Into<String>) -> Self {
        self.config.system_tool = tool.into();
        self
    }

    pub fn install_timeout_secs(mut self, secs: u64) -> Self {
        self.config.install_timeout_secs = secs;
        self
    }

    pub fn max_image_pixels(mut self, px: u32) -> Self {
        self.config.max_image_pixels = px.max(100);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
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

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.working_dir = Some(dir.into());
        self
    }

    pub fn install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.install_dir = Some(dir.into());
        self
    }

    pub fn progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.config.progress_callback = Some(callback);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<AnalysisConfig, PdfDiffError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 400 {
            return Err(PdfDiffError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                c.dpi
            )));
        }
        if c.rasterize_timeout_secs == 0 || c.install_timeout_secs == 0 || c.api_timeout_secs == 0
        {
            return Err(PdfDiffError::InvalidConfig(
                "Timeouts must be ≥ 1 second".into(),
            ));
        }
        if c.max_retries > MAX_RETRIES {
            return Err(PdfDiffError::InvalidConfig(format!(
                "max_retries must be at most {MAX_RETRIES}, got {}",
                c.max_retries
            )));
        }
        if c.interpreter.trim().is_empty() {
            return Err(PdfDiffError::InvalidConfig(
                "Interpreter must not be empty".into(),
            ));
        }
        if c.artifact_root.as_os_str().is_empty() {
            return Err(PdfDiffError::InvalidConfig(
                "Artifact root must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

/// Largest accepted `max_retries`.
pub const MAX_RETRIES: u32 = 10;

// ── Enums ────────────────────────────────────────────────────────────────

/// Image format the rasteriser writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RasterFormat {
    #[default]
    Png,
    Jpeg,
}

impl RasterFormat {
    /// Value passed to the rasteriser's `--format` flag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
        }
    }
}

impl fmt::Display for RasterFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RasterFormat {
    type Err = PdfDiffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "jpg" | "jpeg" => Ok(Self::Jpeg),
            other => Err(PdfDiffError::InvalidConfig(format!(
                "Unsupported image format '{other}' (expected png or jpeg)"
            ))),
        }
    }
}
