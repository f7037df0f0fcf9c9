//! Vision discrepancy check: one page image plus its structured text in, one
//! narrative out.
//!
//! Prompt text lives in [`crate::prompts`]; this module owns the call, its
//! retry policy and the degraded fallback.
//!
//! ## Retry Strategy
//!
//! Rate limits and overloaded backends are transient. Each failed or
//! timed-out call is retried after `retry_backoff_ms * 2^(attempt-1)`; with the
//! defaults (500 ms, 2 retries) a page waits at most 1.5 s in back-off before
//! it is marked degraded.
//!
//! ## Never fails
//!
//! [`VisionReporter::report_page`] returns a [`PageNarrative`] in every case.
//! A page whose image is missing or whose call failed gets
//! [`crate::prompts::DEGRADED_NARRATIVE`] and a [`DegradedReason`]; the caller
//! moves on to the next page.

use crate::config::AnalysisConfig;
use crate::error::{DegradedReason, VisionError};
use crate::pipeline::encode::{load_page_image, PageImage};
use crate::pipeline::normalize::clean_narrative;
use crate::pipeline::reconcile::PageNumber;
use crate::prompts::{page_user_prompt, wrap_narrative, DEGRADED_NARRATIVE, DISCREPANCY_SYSTEM_PROMPT};
use crate::report::PageStatus;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// Upper bound on a single retry delay.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Text and token usage of one vision call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisionResponse {
    pub text: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// A vision-capable generation capability (`GenerateVision`).
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn generate(
        &self,
        system_prompt: &str,
        user_text: &str,
        image: &PageImage,
    ) -> Result<VisionResponse, VisionError>;
}

/// [`VisionModel`] backed by an `edgequake-llm` provider.
#[derive(Clone)]
pub struct LlmVisionModel {
    provider: Arc<dyn LLMProvider>,
    temperature: f32,
    max_tokens: usize,
}

impl LlmVisionModel {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &AnalysisConfig) -> Self {
        Self {
            provider,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for LlmVisionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmVisionModel")
            .field("provider", &"<dyn LLMProvider>")
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

#[async_trait]
impl VisionModel for LlmVisionModel {
    async fn generate(
        &self,
        system_prompt: &str,
        user_text: &str,
        image: &PageImage,
    ) -> Result<VisionResponse, VisionError> {
        // `detail: "high"` keeps small print legible on tiled-image providers.
        let image_data =
            ImageData::new(STANDARD.encode(&image.bytes), image.mime_type()).with_detail("high");
        let messages = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user_with_images(user_text, vec![image_data]),
        ];

        let options = self.options();
        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| VisionError(e.to_string()))?;

        Ok(VisionResponse {
            text: response.content,
            input_tokens: response.prompt_tokens,
            output_tokens: response.completion_tokens,
        })
    }
}

// ── Reporter ─────────────────────────────────────────────────────────────────

/// Outcome of the vision step for one page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageNarrative {
    /// Narrative opened by the page header.
    pub text: String,
    pub status: PageStatus,
    /// Image that was sent, if any.
    pub image: Option<PathBuf>,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl PageNarrative {
    /// The fixed placeholder for a page that could not be compared.
    pub fn degraded(page: PageNumber, reason: DegradedReason, image: Option<PathBuf>) -> Self {
        Self {
            text: wrap_narrative(page, DEGRADED_NARRATIVE),
            status: PageStatus::Degraded { reason },
            image,
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

/// Runs the per-page vision check with retry, timeout and degraded fallback.
#[derive(Clone)]
pub struct VisionReporter {
    model: Arc<dyn VisionModel>,
    system_prompt: String,
    max_image_pixels: u32,
    max_retries: u32,
    retry_backoff_ms: u64,
    api_timeout: Duration,
}

impl VisionReporter {
    pub fn new(model: Arc<dyn VisionModel>, config: &AnalysisConfig) -> Self {
        Self {
            model,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DISCREPANCY_SYSTEM_PROMPT.to_string()),
            max_image_pixels: config.max_image_pixels,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            api_timeout: Duration::from_secs(config.api_timeout_secs),
        }
    }

    /// Compare `structured_text` with the first of `candidates`.
    ///
    /// `candidates` must already be in discovery order; only the first is
    /// used, so the same directory contents always yield the same request.
    pub async fn report_page(
        &self,
        page: PageNumber,
        structured_text: &str,
        candidates: &[PathBuf],
    ) -> PageNarrative {
        let Some(path) = candidates.first() else {
            warn!("Page {}: no rendered image; degraded", page);
            return PageNarrative::degraded(page, DegradedReason::NoImage, None);
        };

        let image = match load_page_image(path, self.max_image_pixels) {
            Ok(img) => img,
            Err(reason) => {
                warn!("Page {}: {}", page, reason);
                return PageNarrative::degraded(page, reason, Some(path.clone()));
            }
        };

        let user_text = page_user_prompt(page, structured_text);
        match self.call_with_retry(page, &user_text, &image).await {
            Ok(resp) => PageNarrative {
                text: wrap_narrative(page, &clean_narrative(&resp.text)),
                status: PageStatus::Analyzed,
                image: Some(path.clone()),
                input_tokens: resp.input_tokens,
                output_tokens: resp.output_tokens,
            },
            Err(reason) => {
                warn!("Page {}: {}; degraded", page, reason);
                PageNarrative::degraded(page, reason, Some(path.clone()))
            }
        }
    }

    /// Delay before retry `attempt` (1-based): `retry_backoff_ms * 2^(attempt-1)`,
    /// saturating and capped at [`MAX_BACKOFF`].
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor)).min(MAX_BACKOFF)
    }

    async fn call_with_retry(
        &self,
        page: PageNumber,
        user_text: &str,
        image: &PageImage,
    ) -> Result<VisionResponse, DegradedReason> {
        let mut last = DegradedReason::VisionFailed {
            retries: 0,
            detail: "not attempted".into(),
        };

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.backoff(attempt);
                warn!(
                    "Page {}: retry {}/{} after {:?}",
                    page, attempt, self.max_retries, backoff
                );
                sleep(backoff).await;
            }

            let call = self.model.generate(&self.system_prompt, user_text, image);
            match timeout(self.api_timeout, call).await {
                Ok(Ok(resp)) if !resp.text.trim().is_empty() => {
                    debug!(
                        "Page {}: {} input tokens, {} output tokens",
                        page, resp.input_tokens, resp.output_tokens
                    );
                    return Ok(resp);
                }
                Ok(Ok(_)) => {
                    warn!("Page {}: attempt {} returned an empty narrative", page, attempt + 1);
                    last = DegradedReason::VisionFailed {
                        retries: attempt,
                        detail: "empty response".into(),
                    };
                }
                Ok(Err(e)) => {
                    warn!("Page {}: attempt {} failed: {}", page, attempt + 1, e);
                    last = DegradedReason::VisionFailed {
                        retries: attempt,
                        detail: e.to_string(),
                    };
                }
                Err(_) => {
                    warn!("Page {}: attempt {} timed out", page, attempt + 1);
                    last = DegradedReason::VisionTimeout {
                        secs: self.api_timeout.as_secs(),
                    };
                }
            }
        }
        Err(last)
    }
}
