//! Structured output from the external structuring service.
//!
//! The service has answered in two incompatible shapes over its lifetime:
//! a per-page list (`page_text_list`, 0-based `page_no`) and, for older
//! jobs, only a flat list of text fragments (`text_list`). There is no schema
//! version to branch on, so the payload is resolved exactly once into the
//! [`StructuredOutput`] variant and nothing downstream inspects raw fields.

use crate::error::CollaboratorError;
use crate::pipeline::reconcile::PageNumber;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Structured text for a work unit, resolved from whichever shape the
/// service produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StructuredOutput {
    /// Per-page text, already shifted to 1-based page numbers.
    PerPage(BTreeMap<PageNumber, String>),
    /// One unsegmented blob; compared against page 1.
    Flat(String),
    /// The service has nothing for this work unit.
    #[default]
    Absent,
}

impl StructuredOutput {
    /// Resolve a raw service payload.
    ///
    /// `page_text_list` wins when non-empty; otherwise a non-empty
    /// `text_list` is joined with blank lines into a flat blob.
    pub fn from_json(value: serde_json::Value) -> Result<Self, CollaboratorError> {
        if value.is_null() {
            return Ok(Self::Absent);
        }
        let payload: StructuredPayload = serde_json::from_value(value)
            .map_err(|e| CollaboratorError::Parse(format!("structured output: {e}")))?;
        Ok(payload.into())
    }

    /// The text keyed by 1-based page.
    pub fn pages(&self) -> BTreeMap<PageNumber, &str> {
        match self {
            Self::PerPage(pages) => pages.iter().map(|(p, t)| (*p, t.as_str())).collect(),
            Self::Flat(text) => BTreeMap::from([(PageNumber::FIRST, text.as_str())]),
            Self::Absent => BTreeMap::new(),
        }
    }

    pub fn shape(&self) -> &'static str {
        match self {
            Self::PerPage(_) => "per_page",
            Self::Flat(_) => "flat",
            Self::Absent => "absent",
        }
    }
}

#[derive(Debug, Deserialize)]
struct StructuredPayload {
    #[serde(default)]
    page_text_list: Option<Vec<PageTextEntry>>,
    #[serde(default)]
    text_list: Option<Vec<TextEntry>>,
}

#[derive(Debug, Deserialize)]
struct PageTextEntry {
    page_no: usize,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TextEntry {
    #[serde(default)]
    text: Option<String>,
}

impl From<StructuredPayload> for StructuredOutput {
    fn from(payload: StructuredPayload) -> Self {
        if let Some(list) = payload.page_text_list.filter(|l| !l.is_empty()) {
            let pages = list
                .into_iter()
                .map(|e| {
                    (
                        PageNumber::from_zero_based(e.page_no),
                        e.text.unwrap_or_default(),
                    )
                })
                .collect();
            return Self::PerPage(pages);
        }
        if let Some(list) = payload.text_list.filter(|l| !l.is_empty()) {
            let text = list
                .into_iter()
                .map(|e| e.text.unwrap_or_default())
                .collect::<Vec<_>>()
                .join("\n\n");
            return Self::Flat(text);
        }
        Self::Absent
    }
}

/// Source of structured output for a work unit (`GetStructuredOutput`).
#[async_trait]
pub trait StructuredOutputSource: Send + Sync {
    async fn structured_output(&self, work_id: &str) -> Result<StructuredOutput, CollaboratorError>;
}

/// Reads `<dir>/<work_id>.json` as saved from the structuring service.
#[derive(Debug, Clone)]
pub struct JsonDirStructuredSource {
    dir: PathBuf,
}

impl JsonDirStructuredSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl StructuredOutputSource for JsonDirStructuredSource {
    async fn structured_output(&self, work_id: &str) -> Result<StructuredOutput, CollaboratorError> {
        if work_id.contains(['/', '\\']) || work_id.contains("..") {
            return Err(CollaboratorError::Parse(format!(
                "work id '{work_id}' is not a valid file name"
            )));
        }
        let path = self.dir.join(format!("{work_id}.json"));
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No structured output at {}", path.display());
                return Ok(StructuredOutput::Absent);
            }
            Err(e) => return Err(CollaboratorError::io(path, e)),
        };
        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| CollaboratorError::Parse(format!("{}: {e}", path.display())))?;
        StructuredOutput::from_json(value)
    }
}

/// Queries the structuring service's status endpoint for a finished job.
///
/// The endpoint takes `work_id`, `userid` and `password` as form fields and
/// answers with the structured payload, or 404 when the job is unknown.
#[derive(Debug, Clone)]
pub struct HttpStructuredSource {
    client: reqwest::Client,
    endpoint: String,
    user_id: String,
    password: String,
}

impl HttpStructuredSource {
    pub fn new(
        endpoint: impl Into<String>,
        user_id: impl Into<String>,
        password: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| CollaboratorError::Http(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            user_id: user_id.into(),
            password: password.into(),
        })
    }
}

#[async_trait]
impl StructuredOutputSource for HttpStructuredSource {
    async fn structured_output(&self, work_id: &str) -> Result<StructuredOutput, CollaboratorError> {
        info!("Fetching structured output for work unit {}", work_id);

        let response = self
            .client
            .post(&self.endpoint)
            .form(&[
                ("work_id", work_id),
                ("userid", self.user_id.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| CollaboratorError::Http(format!("POST {}: {e}", self.endpoint)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(StructuredOutput::Absent);
        }
        if !response.status().is_success() {
            return Err(CollaboratorError::Http(format!(
                "HTTP {} from {}",
                response.status(),
                self.endpoint
            )));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Parse(e.to_string()))?;
        StructuredOutput::from_json(value)
    }
}
