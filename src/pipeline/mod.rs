//! Pipeline stages for extraction verification.
//!
//! Each submodule implements one step and is testable on its own; the
//! collaborator-facing steps sit behind traits so the orchestration in
//! [`crate::analyze`] can be exercised with in-memory fakes.
//!
//! ## Data Flow
//!
//! ```text
//! resolve ──▶ extract ─┐
//!                      ├─▶ normalize ──▶ reconcile ──▶ per page:
//! structured ──────────┘                               bootstrap (once)
//!                                                      rasterize (once) + discovery
//!                                                      encode ──▶ vision
//! ```
//!
//! 1. [`resolve`]    — find the stored original across deployment roots
//! 2. [`extract`]    — ground-truth text layer via pdfium, in `spawn_blocking`
//! 3. [`structured`] — structured output in either payload shape, or absent
//! 4. [`normalize`]  — identical cleanup of both text streams
//! 5. [`reconcile`]  — page alignment, page numbering, line-set delta
//! 6. [`bootstrap`]  — probe and repair the rendering toolchain
//! 7. [`rasterize`]  — run-scoped rasterisation and image discovery
//! 8. [`encode`]     — load and downscale a page image
//! 9. [`vision`]     — the discrepancy call with retry and degraded fallback
//!
//! [`process`] holds the bounded subprocess helper shared by 6 and 7.

pub mod bootstrap;
pub mod encode;
pub mod extract;
pub mod normalize;
pub mod process;
pub mod rasterize;
pub mod reconcile;
pub mod resolve;
pub mod structured;
pub mod vision;
