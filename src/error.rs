//! Error types for the edgequake-pdfdiff library.
//!
//! Three distinct error types reflect three distinct failure modes:
//!
//! * [`PdfDiffError`] — **Fatal**: the run cannot produce a meaningful report
//!   (no work id, original PDF missing or unreadable). Returned as
//!   `Err(PdfDiffError)` from [`crate::Reconciler::analyze`].
//!
//! * [`DegradedReason`] — **Non-fatal**: a single page could not be compared
//!   visually (no image, vision call failed). Stored inside
//!   [`crate::report::PageDiffReport`]; every other page is still analysed.
//!
//! * [`CollaboratorError`] — returned by the adapter traits (work-unit store,
//!   text extractor, structured-output source). The pipeline converts these at
//!   the narrowest scope: to `SourceUnavailable` for the ground-truth side,
//!   to an absent structured output for the other.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-pdfdiff library.
///
/// Only [`PdfDiffError::InvalidArgument`] and
/// [`PdfDiffError::SourceUnavailable`] ever come out of an analysis run; the
/// remaining variants are raised while building configuration or providers.
#[derive(Debug, Error)]
pub enum PdfDiffError {
    // ── Run errors ───────────────────────────────────────────────────────
    /// A required identifier was missing. Raised before any I/O.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The stored original could not be located, opened or extracted.
    ///
    /// Without ground truth there is nothing to reconcile against.
    #[error("Original PDF for work unit '{work_id}' is unavailable: {reason}")]
    SourceUnavailable { work_id: String, reason: String },

    // ── Construction errors ──────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configured vision provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },
}

impl PdfDiffError {
    pub(crate) fn source_unavailable(work_id: &str, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            work_id: work_id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Why a page ended up in degraded mode.
///
/// Degraded pages still get a report entry carrying a fixed placeholder
/// narrative; this tag records the cause for callers and logs.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DegradedReason {
    /// No rendered image of the page could be found or generated.
    #[error("no rendered image available")]
    NoImage,

    /// A candidate image existed but could not be read or decoded.
    #[error("image unreadable: {detail}")]
    ImageUnreadable { detail: String },

    /// The vision call failed after all retries.
    #[error("vision call failed after {retries} retries: {detail}")]
    VisionFailed { retries: u32, detail: String },

    /// The vision call exceeded the per-call timeout.
    #[error("vision call timed out after {secs}s")]
    VisionTimeout { secs: u64 },
}

/// Errors surfaced by external collaborators.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Malformed payload: {0}")]
    Parse(String),

    #[error("PDF error: {0}")]
    Pdf(String),
}

impl CollaboratorError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Error returned by a [`crate::pipeline::vision::VisionModel`].
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct VisionError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_unavailable_display() {
        let e = PdfDiffError::source_unavailable("w-42", "file missing");
        let msg = e.to_string();
        assert!(msg.contains("w-42"), "got: {msg}");
        assert!(msg.contains("file missing"), "got: {msg}");
    }

    #[test]
    fn degraded_reason_serialises_with_kind_tag() {
        let json = serde_json::to_value(DegradedReason::VisionTimeout { secs: 30 }).unwrap();
        assert_eq!(json["kind"], "vision_timeout");
        assert_eq!(json["secs"], 30);

        let json = serde_json::to_value(DegradedReason::NoImage).unwrap();
        assert_eq!(json["kind"], "no_image");
    }

    #[test]
    fn vision_failed_display() {
        let e = DegradedReason::VisionFailed {
            retries: 2,
            detail: "connection refused".into(),
        };
        assert!(e.to_string().contains("2 retries"));
        assert!(e.to_string().contains("connection refused"));
    }

    #[test]
    fn collaborator_io_display_includes_path() {
        let e = CollaboratorError::io(
            "/srv/uploads/a.pdf",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(e.to_string().contains("/srv/uploads/a.pdf"));
    }
}
