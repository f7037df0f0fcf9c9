//! Prompts and fixed narratives for the vision discrepancy check.
//!
//! Everything the model is told, and everything a page says when the model
//! could not be asked, lives here. Tests assert on these constants directly,
//! and the degraded narrative in particular is part of the output contract:
//! two runs that both fail to reach the model must produce identical text.
//!
//! Callers can override the system prompt via
//! [`crate::config::AnalysisConfig::system_prompt`].

use crate::pipeline::reconcile::PageNumber;

/// Default system prompt for comparing a page image with extracted text.
pub const DISCREPANCY_SYSTEM_PROMPT: &str = r#"You are a meticulous document auditor. You receive an image of one PDF page and the text that an automated extraction produced for that same page. Your task is to find discrepancies between them.

Report, as a concise itemized list:

1. MISSING FROM TEXT
   - Content clearly visible in the image that is absent from the extracted text
   - Include headings, paragraphs, table rows or cells, captions, footnotes, labels

2. NOT SUPPORTED BY IMAGE
   - Content in the extracted text that does not appear in the image
   - Include altered numbers, names, dates and any invented sentences

3. RULES
   - Quote the affected content briefly so a reviewer can find it
   - Ignore differences in whitespace, line breaks, hyphenation and Markdown syntax
   - Ignore page numbers and running headers or footers
   - Do not describe content that matches
   - If there are no discrepancies, answer exactly: No discrepancies found.
   - Output only the list, without preamble or closing remarks"#;

/// Narrative stored for a page whose image could not be produced or analysed.
pub const DEGRADED_NARRATIVE: &str =
    "Image generation or analysis failed for this page; no visual comparison was performed.";

/// Header line that opens every page narrative.
pub fn page_header(page: PageNumber) -> String {
    format!("[p.{page}] Discrepancies")
}

/// Per-page user prompt embedding the page number and the structured text.
pub fn page_user_prompt(page: PageNumber, structured_text: &str) -> String {
    let body = if structured_text.trim().is_empty() {
        "(the extraction produced no text for this page)"
    } else {
        structured_text
    };
    format!(
        "Page {page}. Extracted text for this page:\n\n\"\"\"\n{body}\n\"\"\"\n\nList the discrepancies between the page image and this text."
    )
}

/// Header followed by the narrative body.
pub fn wrap_narrative(page: PageNumber, body: &str) -> String {
    format!("{}\n{}", page_header(page), body)
}
