//! Text normalisation for both sides of the comparison, plus cleanup of the
//! narrative returned by the vision model.
//!
//! ## Why normalise both sides identically?
//!
//! The original PDF text layer and the structuring service's output differ in
//! ways that carry no meaning: Windows line endings from one side, tabs or
//! non-breaking spaces from the other, and diagram source blocks (`mermaid`,
//! `plantuml`, …) that the structuring service emits for figures. Leaving any
//! of these in would make every page look different and drown the real
//! discrepancies. Running the *same* rules over both streams keeps the
//! comparison symmetric.
//!
//! ## Rule Order
//!
//! Line endings are unified first so the fence regex only has to match `\n`;
//! diagram blocks go before whitespace folding so that a tab inside a fence
//! header does not change what the fence looks like; trimming runs last.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply the comparison normalisation rules to one page of text.
///
/// Rules (applied in order):
/// 1. Collapse CRLF / CR to LF
/// 2. Strip fenced code blocks tagged with a diagramming notation
/// 3. Fold runs of tab / U+00A0 into a single space
/// 4. Trim leading and trailing whitespace
pub fn normalize_text(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }
    let s = normalise_line_endings(input);
    let s = strip_diagram_fences(&s);
    let s = fold_horizontal_space(&s);
    s.trim().to_string()
}

/// Cleanup for the narrative produced by the vision model.
///
/// Models occasionally wrap their answer in a ```` ```markdown ```` fence or
/// sprinkle zero-width characters; neither belongs in a report.
pub fn clean_narrative(input: &str) -> String {
    let s = strip_outer_fences(input);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = remove_invisible_chars(&s);
    s.trim().to_string()
}

// ── Rule: Normalise line endings ─────────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule: Strip diagram fences ───────────────────────────────────────────────
//
// The trailing newline after the closing fence goes with the block so that
// "B\n```mermaid…```\nD" becomes "B\nD" rather than "B\n\nD".

static RE_DIAGRAM_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)```[ \t]*(?:mermaid|plantuml|puml|graphviz|dot)\b.*?```[ \t]*\n?").unwrap()
});

fn strip_diagram_fences(input: &str) -> String {
    RE_DIAGRAM_FENCE.replace_all(input, "").into_owned()
}

// ── Rule: Fold tabs and non-breaking spaces ──────────────────────────────────

static RE_HSPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\t\x{00A0}]+").unwrap());

fn fold_horizontal_space(input: &str) -> String {
    RE_HSPACE.replace_all(input, " ").into_owned()
}

// ── Narrative rules ──────────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md|text)?\n(.*)\n```\s*$").unwrap());

fn strip_outer_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").into_owned()
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}
