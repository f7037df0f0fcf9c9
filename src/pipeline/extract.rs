//! Ground-truth text: the PDF's own text layer, page by page.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and is not safe to drive from async contexts. The whole document is
//! read on one blocking-pool thread and handed back as owned strings.

use crate::error::CollaboratorError;
use crate::pipeline::reconcile::PageNumber;
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Per-page text extraction of a PDF (`ExtractPageText`).
#[async_trait]
pub trait PageTextExtractor: Send + Sync {
    /// Text of every page, keyed by 1-based page number.
    async fn extract_page_text(
        &self,
        pdf_path: &Path,
    ) -> Result<BTreeMap<PageNumber, String>, CollaboratorError>;
}

/// Reads the text layer with pdfium.
///
/// Binds to `PDFIUM_LIB_PATH` when set, otherwise to the system library.
#[derive(Debug, Clone, Default)]
pub struct PdfiumTextExtractor {
    library_path: Option<PathBuf>,
    password: Option<String>,
}

impl PdfiumTextExtractor {
    pub fn new() -> Self {
        Self {
            library_path: std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from),
            password: None,
        }
    }

    pub fn with_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_path = Some(path.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

#[async_trait]
impl PageTextExtractor for PdfiumTextExtractor {
    async fn extract_page_text(
        &self,
        pdf_path: &Path,
    ) -> Result<BTreeMap<PageNumber, String>, CollaboratorError> {
        let path = pdf_path.to_path_buf();
        let library = self.library_path.clone();
        let password = self.password.clone();

        tokio::task::spawn_blocking(move || {
            extract_blocking(&path, library.as_deref(), password.as_deref())
        })
        .await
        .map_err(|e| CollaboratorError::Pdf(format!("extraction task panicked: {e}")))?
    }
}

fn bind(library: Option<&Path>) -> Result<Pdfium, CollaboratorError> {
    let bindings = match library {
        Some(path) => Pdfium::bind_to_library(path),
        None => Pdfium::bind_to_system_library(),
    };
    bindings.map(Pdfium::new).map_err(|e| {
        CollaboratorError::Pdf(format!(
            "failed to bind pdfium{}: {e}\nSet PDFIUM_LIB_PATH=/path/to/libpdfium.",
            library
                .map(|p| format!(" from '{}'", p.display()))
                .unwrap_or_default()
        ))
    })
}

fn extract_blocking(
    pdf_path: &Path,
    library: Option<&Path>,
    password: Option<&str>,
) -> Result<BTreeMap<PageNumber, String>, CollaboratorError> {
    let pdfium = bind(library)?;

    let document = pdfium
        .load_pdf_from_file(pdf_path, password)
        .map_err(|e| CollaboratorError::Pdf(format!("{}: {:?}", pdf_path.display(), e)))?;

    let mut pages = BTreeMap::new();
    for (index, page) in document.pages().iter().enumerate() {
        let page_no = PageNumber::from_zero_based(index);
        let text = page
            .text()
            .map(|t| t.all())
            .map_err(|e| CollaboratorError::Pdf(format!("page {page_no}: {e:?}")))?;
        debug!("Extracted page {} → {} chars", page_no, text.chars().count());
        pages.insert(page_no, text);
    }

    info!("Extracted text layer of {} pages", pages.len());
    Ok(pages)
}
