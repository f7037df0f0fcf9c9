//! Streaming analysis API: emit page reports as they finish.
//!
//! ## Why stream?
//!
//! Each page costs a vision call of several seconds, so a 40-page document
//! takes minutes. Streaming lets a caller show the first discrepancies while
//! later pages are still in flight, or write each page to disk as it lands.
//!
//! Pages are still processed sequentially with the same run semantics as
//! [`Reconciler::analyze`]: one run context, at most one rasterisation, and
//! reports in ascending page order. Fatal errors surface from
//! [`Reconciler::analyze_stream`] itself, before the stream is returned.

use crate::analyze::Reconciler;
use crate::error::PdfDiffError;
use crate::report::PageDiffReport;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tracing::{debug, info};

/// A boxed stream of page reports, in ascending page order.
pub type PageDiffStream = Pin<Box<dyn Stream<Item = PageDiffReport> + Send>>;

impl Reconciler {
    /// Analyse a work unit, streaming each page report as it is produced.
    ///
    /// # Errors
    /// The same fatal errors as [`Reconciler::analyze`], returned before any
    /// page is analysed. Dropping the stream stops the run after the page in
    /// progress.
    pub async fn analyze_stream(
        &self,
        work_id: &str,
        principal: &str,
        target_page0: Option<usize>,
    ) -> Result<PageDiffStream, PdfDiffError> {
        let mut run = self.prepare(work_id, principal, target_page0).await?;
        info!(
            "Streaming analysis of '{}' ({} page(s))",
            run.work_id,
            run.pages.len()
        );
        self.start_event(&run);

        // One slot: the producer stays at most one page ahead of the consumer.
        let (tx, rx) = mpsc::channel::<PageDiffReport>(1);
        let reconciler = self.clone();

        tokio::spawn(async move {
            let mut done = Vec::with_capacity(run.pages.len());
            for page in run.pages.clone() {
                let report = reconciler.analyze_page(&mut run, page).await;
                done.push(report.clone());
                if tx.send(report).await.is_err() {
                    debug!("Stream receiver dropped; stopping after page {}", page);
                    break;
                }
            }
            reconciler.finish(run, done);
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
