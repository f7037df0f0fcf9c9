//! CLI binary for edgequake-pdfdiff.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `AnalysisConfig`, wires the file-backed collaborators and prints the report.

use anyhow::{bail, Context, Result};
use clap::Parser;
use edgequake_pdfdiff::{
    AnalysisConfig, AnalysisProgressCallback, HttpStructuredSource, JsonDirStructuredSource,
    JsonWorkUnitRegistry, PdfiumTextExtractor, ProgressCallback, RasterFormat, Reconciler,
    StructuredOutputSource, WorkUnitStore,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress bar with one log line per page.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    /// Spinner until `on_analysis_start` tells us the page count.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Extracting text…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl AnalysisProgressCallback for CliProgressCallback {
    fn on_analysis_start(&self, total_pages: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} pages  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        self.bar.set_length(total_pages as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Verifying");
    }

    fn on_page_start(&self, page_num: usize, _total: usize) {
        self.bar.set_message(format!("page {page_num}"));
    }

    fn on_page_complete(&self, page_num: usize, total: usize, narrative_len: usize) {
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}",
            green("✓"),
            page_num,
            total,
            dim(&format!("{narrative_len:>5} chars")),
        ));
        self.bar.inc(1);
    }

    fn on_page_degraded(&self, page_num: usize, total: usize, reason: &str) {
        let msg: String = if reason.chars().count() > 80 {
            reason.chars().take(79).chain(std::iter::once('…')).collect()
        } else {
            reason.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}",
            yellow("⚠"),
            page_num,
            total,
            yellow(&msg),
        ));
        self.bar.inc(1);
    }

    fn on_analysis_complete(&self, total_pages: usize, analyzed: usize) {
        self.bar.finish_and_clear();
        let degraded = total_pages.saturating_sub(analyzed);
        if degraded == 0 {
            eprintln!("{} {} pages verified", green("✔"), bold(&analyzed.to_string()));
        } else {
            eprintln!(
                "{} {}/{} pages verified  ({} degraded)",
                cyan("⚠"),
                bold(&analyzed.to_string()),
                total_pages,
                yellow(&degraded.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Verify a work unit against structured output saved as JSON files
  pdfdiff w-42 --registry work_units.json --structured-dir structured/ --principal alice

  # Query the structuring service instead
  pdfdiff w-42 --registry work_units.json --principal alice \
      --structured-url https://structurer.internal/api/check \
      --structured-user svc --structured-password "$STRUCTURER_PASSWORD"

  # Only the third page (0-based index 2), JSON report to a file
  pdfdiff w-42 --registry work_units.json --principal alice --page 2 --json -o report.json

REGISTRY FORMAT:
  [{"work_id": "w-42", "owner": "alice", "original_file_name": "Q3.pdf",
    "stored_path": "storage/original-uploads/2024/05/01/alice/w-42.pdf"}]

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium for text extraction
  PDFDIFF_PDF_PASSWORD    Password for encrypted originals
  PDFDIFF_TMP_ROOT        Artifact root for page images (default /tmp/pdfdiff)
"#;

/// Verify structured PDF extractions against rendered pages using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "pdfdiff",
    version,
    about = "Verify structured PDF extractions against rendered pages using Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Work unit to verify.
    work_id: String,

    /// JSON file listing work units.
    #[arg(long, env = "PDFDIFF_REGISTRY")]
    registry: PathBuf,

    /// Directory holding `<work_id>.json` structured outputs.
    #[arg(long, env = "PDFDIFF_STRUCTURED_DIR", conflicts_with = "structured_url")]
    structured_dir: Option<PathBuf>,

    /// Structuring service check endpoint.
    #[arg(long, env = "PDFDIFF_STRUCTURED_URL", requires_all = ["structured_user", "structured_password"])]
    structured_url: Option<String>,

    /// User id sent to the structuring service.
    #[arg(long, env = "PDFDIFF_STRUCTURED_USER")]
    structured_user: Option<String>,

    /// Password sent to the structuring service.
    #[arg(long, env = "PDFDIFF_STRUCTURED_PASSWORD", hide_env_values = true)]
    structured_password: Option<String>,

    /// Identity of the caller; must own the work unit.
    #[arg(long, env = "PDFDIFF_PRINCIPAL")]
    principal: String,

    /// Password for encrypted originals.
    #[arg(long, env = "PDFDIFF_PDF_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Analyse only this page (0-based index).
    #[arg(long)]
    page: Option<usize>,

    /// Output the JSON report instead of text.
    #[arg(long, env = "PDFDIFF_JSON")]
    json: bool,

    /// Write the report to this file instead of stdout.
    #[arg(short, long, env = "PDFDIFF_OUTPUT")]
    output: Option<PathBuf>,

    /// Rasteriser script.
    #[arg(long, env = "PDFDIFF_SCRIPT", default_value = "scripts/render_pages.py")]
    script: PathBuf,

    /// Interpreter for the rasteriser script.
    #[arg(long, env = "PDFDIFF_INTERPRETER", default_value = "python3")]
    interpreter: String,

    /// Artifact root for page images.
    #[arg(long, env = "PDFDIFF_TMP_ROOT")]
    artifact_root: Option<PathBuf>,

    /// Extra directory searched as `<dir>/<work_id>` for page images (repeatable).
    #[arg(long = "shared-dir")]
    shared_dirs: Vec<PathBuf>,

    /// Rasterisation DPI (72–400).
    #[arg(long, env = "PDFDIFF_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Image format: png or jpeg.
    #[arg(long, env = "PDFDIFF_FORMAT", default_value = "png")]
    format: RasterFormat,

    /// Vision model ID (e.g. gpt-4.1-mini, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "PDFDIFF_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Retries per page on vision call failure (0–10).
    #[arg(long, env = "PDFDIFF_MAX_RETRIES", default_value_t = 2,
          value_parser = clap::value_parser!(u32).range(0..=10))]
    max_retries: u32,

    /// Per-page vision call timeout in seconds.
    #[arg(long, env = "PDFDIFF_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Do not probe for or install rendering dependencies.
    #[arg(long, env = "PDFDIFF_NO_BOOTSTRAP")]
    no_bootstrap: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDFDIFF_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDFDIFF_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDFDIFF_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs; degraded pages still print as
    // bar lines.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.verbose;
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

    // ── Work unit and owner check ────────────────────────────────────────
    let registry = JsonWorkUnitRegistry::load(&cli.registry)
        .await
        .with_context(|| format!("Failed to load registry {}", cli.registry.display()))?;
    let unit = registry
        .resolve_work_unit(cli.work_id.trim())
        .await?
        .with_context(|| format!("Unknown work unit '{}'", cli.work_id))?;
    if !unit.is_accessible_by(&cli.principal) {
        bail!(
            "Principal '{}' may not analyse work unit '{}'",
            cli.principal,
            unit.work_id
        );
    }

    // ── Build config and collaborators ───────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new_dynamic() as Arc<dyn AnalysisProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb).await?;

    let mut builder = Reconciler::builder(config).work_units(Arc::new(registry));
    if let Some(source) = structured_source(&cli)? {
        builder = builder.structured_source(source);
    }
    if let Some(password) = &cli.password {
        builder = builder.extractor(Arc::new(
            PdfiumTextExtractor::new().with_password(password.as_str()),
        ));
    }
    let reconciler = builder.build().context("Failed to set up analysis")?;

    // ── Run ──────────────────────────────────────────────────────────────
    let report = reconciler
        .analyze(&cli.work_id, &cli.principal, cli.page)
        .await
        .context("Analysis failed")?;

    let rendered = if cli.json {
        report.to_json().context("Failed to serialise report")?
    } else {
        report.to_string()
    };

    match &cli.output {
        Some(path) => {
            tokio::fs::write(path, rendered.as_bytes())
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            if !cli.quiet {
                eprintln!("Report written to {}", bold(&path.display().to_string()));
            }
        }
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(rendered.as_bytes())
                .context("Failed to write to stdout")?;
            if !rendered.ends_with('\n') {
                handle.write_all(b"\n").ok();
            }
        }
    }

    if !cli.quiet {
        let s = &report.stats;
        eprintln!(
            "   run {}  {}  {} tokens in  /  {} tokens out  —  {}ms total",
            dim(&report.run_id),
            dim(&format!("{}/{} analysed", s.analyzed_pages, s.reported_pages)),
            dim(&s.total_input_tokens.to_string()),
            dim(&s.total_output_tokens.to_string()),
            s.total_duration_ms,
        );
    }

    Ok(())
}

/// Map CLI args to `AnalysisConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<AnalysisConfig> {
    let mut builder = AnalysisConfig::builder()
        .rasterizer_script(&cli.script)
        .interpreter(&cli.interpreter)
        .dpi(cli.dpi)
        .image_format(cli.format)
        .bootstrap(!cli.no_bootstrap)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout);

    if let Some(root) = &cli.artifact_root {
        builder = builder.artifact_root(root);
    }
    for dir in &cli.shared_dirs {
        builder = builder.shared_image_dir(dir);
    }
    if let Some(model) = &cli.model {
        builder = builder.model(model);
    }
    if let Some(provider) = &cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(path) = &cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {}", path.display()))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

fn structured_source(cli: &Cli) -> Result<Option<Arc<dyn StructuredOutputSource>>> {
    if let Some(dir) = &cli.structured_dir {
        return Ok(Some(Arc::new(JsonDirStructuredSource::new(dir))));
    }
    if let Some(url) = &cli.structured_url {
        let source = HttpStructuredSource::new(
            url,
            cli.structured_user.clone().unwrap_or_default(),
            cli.structured_password.clone().unwrap_or_default(),
            cli.api_timeout,
        )
        .context("Failed to create structuring service client")?;
        return Ok(Some(Arc::new(source)));
    }
    Ok(None)
}
