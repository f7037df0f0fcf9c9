//! Page alignment between the original text layer and the structured output.
//!
//! The collaborators disagree on numbering: the text extractor keys pages
//! 1-based, the structuring service lists them 0-based, and the final report
//! is 0-based again. [`PageNumber`] is the only type allowed to cross those
//! boundaries, so every shift lives in one of its three constructors or
//! accessors instead of being scattered as `+ 1` / `- 1` through the pipeline.

use crate::pipeline::normalize::normalize_text;
use crate::pipeline::structured::StructuredOutput;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::num::NonZeroUsize;

/// Maximum number of lines listed on each side of a [`LineDelta`].
pub const LINE_DELTA_LIMIT: usize = 50;

/// A 1-based page number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageNumber(NonZeroUsize);

impl PageNumber {
    pub const FIRST: PageNumber = PageNumber(NonZeroUsize::MIN);

    /// From a 1-based number (text extractor keys). `0` is rejected.
    pub fn from_one_based(n: usize) -> Option<Self> {
        NonZeroUsize::new(n).map(Self)
    }

    /// From a 0-based index (structured per-page list, report `page_no`).
    pub fn from_zero_based(index: usize) -> Self {
        Self(NonZeroUsize::MIN.saturating_add(index))
    }

    /// The 1-based value.
    pub fn get(self) -> usize {
        self.0.get()
    }

    /// The 0-based index used in reports.
    pub fn zero_based(self) -> usize {
        self.0.get() - 1
    }

    /// Every page from 1 up to and including `last`.
    pub fn up_to(last: PageNumber) -> impl Iterator<Item = PageNumber> {
        (1..=last.get()).filter_map(PageNumber::from_one_based)
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Normalised text for one page from both sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageTextPair {
    pub original: String,
    pub structured: String,
}

/// Both text streams aligned page by page.
///
/// Every page from 1 to [`ReconciledDocument::max_page`] is present; a side
/// that has nothing for a page holds an empty string.
#[derive(Debug, Clone)]
pub struct ReconciledDocument {
    pages: BTreeMap<PageNumber, PageTextPair>,
    max_page: PageNumber,
}

impl ReconciledDocument {
    pub fn max_page(&self) -> PageNumber {
        self.max_page
    }

    pub fn page_count(&self) -> usize {
        self.max_page.get()
    }

    pub fn page(&self, page: PageNumber) -> Option<&PageTextPair> {
        self.pages.get(&page)
    }

    /// Pages in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (PageNumber, &PageTextPair)> {
        self.pages.iter().map(|(p, t)| (*p, t))
    }
}

/// Align the original text layer with the structured output.
///
/// The page range is `1..=max(original max, structured max)`; neither source
/// truncates the other. When both are empty a single empty page 1 remains so
/// the report is never empty.
pub fn reconcile(
    original: &BTreeMap<PageNumber, String>,
    structured: &StructuredOutput,
) -> ReconciledDocument {
    let structured_pages = structured.pages();

    let max_page = original
        .keys()
        .chain(structured_pages.keys())
        .copied()
        .max()
        .unwrap_or(PageNumber::FIRST);

    let pages = PageNumber::up_to(max_page)
        .map(|page| {
            let pair = PageTextPair {
                original: original
                    .get(&page)
                    .map(|t| normalize_text(t))
                    .unwrap_or_default(),
                structured: structured_pages
                    .get(&page)
                    .map(|t| normalize_text(t))
                    .unwrap_or_default(),
            };
            (page, pair)
        })
        .collect();

    ReconciledDocument { pages, max_page }
}

/// Lines found on only one side of a page, by set membership.
///
/// This does no alignment or ordering analysis; it is a cheap textual hint
/// shown next to the vision narrative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineDelta {
    /// Lines present in the original but absent from the structured text.
    pub missing: Vec<String>,
    /// Lines present in the structured text but absent from the original.
    pub added: Vec<String>,
}

impl LineDelta {
    pub fn between(pair: &PageTextPair) -> Self {
        let original = significant_lines(&pair.original);
        let structured = significant_lines(&pair.structured);
        let original_set: HashSet<&str> = original.iter().copied().collect();
        let structured_set: HashSet<&str> = structured.iter().copied().collect();

        Self {
            missing: only_in(&original, &structured_set),
            added: only_in(&structured, &original_set),
        }
    }

    pub fn is_identical(&self) -> bool {
        self.missing.is_empty() && self.added.is_empty()
    }
}

fn significant_lines(text: &str) -> Vec<&str> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect()
}

/// Distinct lines of `lines` not in `other`, first-seen order, capped.
fn only_in(lines: &[&str], other: &HashSet<&str>) -> Vec<String> {
    let mut seen = HashSet::new();
    lines
        .iter()
        .filter(|l| !other.contains(*l) && seen.insert(**l))
        .take(LINE_DELTA_LIMIT)
        .map(|l| l.to_string())
        .collect()
}
