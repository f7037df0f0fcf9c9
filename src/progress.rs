//! Progress-callback trait for per-page analysis events.
//!
//! Inject an [`Arc<dyn AnalysisProgressCallback>`] via
//! [`crate::config::AnalysisConfigBuilder::progress_callback`] to receive
//! events as the reconciler walks the document.
//!
//! # Why callbacks instead of channels?
//!
//! Hosts report progress in very different ways (a terminal bar, a job table
//! row, a websocket). A callback keeps the library ignorant of all of them.
//! If you want the reports themselves rather than events, use
//! [`crate::Reconciler::analyze_stream`].
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdfdiff::{AnalysisConfig, AnalysisProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct DegradedCounter(AtomicUsize);
//!
//! impl AnalysisProgressCallback for DegradedCounter {
//!     fn on_page_degraded(&self, page_num: usize, _total: usize, reason: &str) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("page {page_num} degraded: {reason}");
//!     }
//! }
//!
//! let config = AnalysisConfig::builder()
//!     .progress_callback(Arc::new(DegradedCounter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the reconciler as it processes each page.
///
/// Pages are processed sequentially, so calls never overlap within one run.
/// Implementations are still `Send + Sync` because one callback may be shared
/// by concurrent runs.
pub trait AnalysisProgressCallback: Send + Sync {
    /// Called once after reconciliation, before any page is analysed.
    ///
    /// # Arguments
    /// * `total_pages` — number of pages that will be reported
    fn on_analysis_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called before image discovery for a page.
    ///
    /// # Arguments
    /// * `page_num`    — 1-indexed page number
    /// * `total_pages` — pages in the document
    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called when the vision model produced a narrative for a page.
    ///
    /// # Arguments
    /// * `narrative_len` — byte length of the narrative (header included)
    fn on_page_complete(&self, page_num: usize, total_pages: usize, narrative_len: usize) {
        let _ = (page_num, total_pages, narrative_len);
    }

    /// Called when a page received the placeholder narrative.
    ///
    /// # Arguments
    /// * `reason` — human-readable degradation reason
    fn on_page_degraded(&self, page_num: usize, total_pages: usize, reason: &str) {
        let _ = (page_num, total_pages, reason);
    }

    /// Called once after the last page.
    ///
    /// # Arguments
    /// * `analyzed` — pages that were not degraded
    fn on_analysis_complete(&self, total_pages: usize, analyzed: usize) {
        let _ = (total_pages, analyzed);
    }
}

/// A no-op implementation; the default when no callback is configured.
pub struct NoopProgressCallback;

impl AnalysisProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::AnalysisConfig`].
pub type ProgressCallback = Arc<dyn AnalysisProgressCallback>;
