//! Output types of an analysis run.
//!
//! The JSON shape keeps two fields that only exist for older consumers:
//! `summary` (always `null`) and `details` (a verbatim copy of `diff_text`).
//! Both are serialised unconditionally so either historical reader keeps
//! working.

use crate::error::DegradedReason;
use crate::pipeline::bootstrap::BootstrapReport;
use crate::pipeline::rasterize::RasterOutcome;
use crate::pipeline::reconcile::{LineDelta, PageNumber};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Whether a page was compared visually.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PageStatus {
    Analyzed,
    Degraded { reason: DegradedReason },
}

impl PageStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

/// Report for a single page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageDiffReport {
    /// 0-based page index.
    pub page_no: usize,
    /// Narrative, opened by the page header.
    pub diff_text: String,
    /// Same text as `diff_text`.
    pub details: String,
    pub status: PageStatus,
    /// Image the narrative was produced from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<PathBuf>,
    /// Lines only on one side of the normalised texts.
    pub line_delta: LineDelta,
    #[serde(default)]
    pub input_tokens: usize,
    #[serde(default)]
    pub output_tokens: usize,
    #[serde(default)]
    pub duration_ms: u64,
}

impl PageDiffReport {
    /// 1-based page number of this entry.
    pub fn page(&self) -> PageNumber {
        PageNumber::from_zero_based(self.page_no)
    }

    pub fn is_degraded(&self) -> bool {
        self.status.is_degraded()
    }
}

/// Run-level statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStats {
    /// Highest page number seen on either side.
    pub total_pages: usize,
    /// Entries in `page_diffs` (fewer than `total_pages` with a target page).
    pub reported_pages: usize,
    pub analyzed_pages: usize,
    pub degraded_pages: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_duration_ms: u64,
    /// Shape of the structured output: `per_page`, `flat` or `absent`.
    pub structured_shape: String,
    /// Set when this run tried to rasterise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rasterization: Option<RasterOutcome>,
    /// Set when the rendering bootstrap ran in this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<BootstrapReport>,
}

/// Result of [`crate::Reconciler::analyze`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub work_id: String,
    pub run_id: String,
    /// Always `null`.
    pub summary: Option<String>,
    /// Ascending by `page_no`.
    pub page_diffs: Vec<PageDiffReport>,
    pub stats: AnalysisStats,
}

impl AnalysisReport {
    /// Recompute the per-page aggregates in `stats` from `page_diffs`.
    pub(crate) fn tally(&mut self) {
        let s = &mut self.stats;
        s.reported_pages = self.page_diffs.len();
        s.degraded_pages = self.page_diffs.iter().filter(|p| p.is_degraded()).count();
        s.analyzed_pages = s.reported_pages - s.degraded_pages;
        s.total_input_tokens = self.page_diffs.iter().map(|p| p.input_tokens as u64).sum();
        s.total_output_tokens = self.page_diffs.iter().map(|p| p.output_tokens as u64).sum();
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Plain-text rendering: each narrative, separated by a blank line.
impl fmt::Display for AnalysisReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, page) in self.page_diffs.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            writeln!(f, "{}", page.diff_text.trim_end())?;
        }
        Ok(())
    }
}
