//! Work units: the uploaded originals the pipeline verifies.
//!
//! Upload storage and user directories are owned by the host application.
//! The pipeline only needs to look a work unit up by id, so that lookup is a
//! trait. [`JsonWorkUnitRegistry`] is a file-backed adapter for the CLI and
//! tests.

use crate::error::CollaboratorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// One uploaded original. Read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub work_id: String,
    /// Principal who uploaded the document.
    pub owner: String,
    pub original_file_name: String,
    /// Where the original was stored; usually relative to the uploader's
    /// working directory, e.g. `storage/original-uploads/2024/05/01/alice/w1.pdf`.
    pub stored_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl WorkUnit {
    /// Owner check applied before analysis. Full authorization is the host's job.
    pub fn is_accessible_by(&self, principal: &str) -> bool {
        !principal.trim().is_empty() && self.owner == principal.trim()
    }
}

/// Lookup of work units by id (`ResolveWorkUnit`).
#[async_trait]
pub trait WorkUnitStore: Send + Sync {
    async fn resolve_work_unit(&self, work_id: &str) -> Result<Option<WorkUnit>, CollaboratorError>;
}

/// Work units read from a JSON file, either a bare array or
/// `{ "work_units": [...] }`.
#[derive(Debug, Clone, Default)]
pub struct JsonWorkUnitRegistry {
    units: HashMap<String, WorkUnit>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RegistryFile {
    List(Vec<WorkUnit>),
    Wrapped { work_units: Vec<WorkUnit> },
}

impl JsonWorkUnitRegistry {
    pub fn from_units(units: impl IntoIterator<Item = WorkUnit>) -> Self {
        Self {
            units: units.into_iter().map(|u| (u.work_id.clone(), u)).collect(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, CollaboratorError> {
        let file: RegistryFile =
            serde_json::from_str(raw).map_err(|e| CollaboratorError::Parse(e.to_string()))?;
        let units = match file {
            RegistryFile::List(units) | RegistryFile::Wrapped { work_units: units } => units,
        };
        Ok(Self::from_units(units))
    }

    pub async fn load(path: &Path) -> Result<Self, CollaboratorError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CollaboratorError::io(path, e))?;
        let registry = Self::from_json(&raw)?;
        debug!("Loaded {} work units from {}", registry.len(), path.display());
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[async_trait]
impl WorkUnitStore for JsonWorkUnitRegistry {
    async fn resolve_work_unit(&self, work_id: &str) -> Result<Option<WorkUnit>, CollaboratorError> {
        Ok(self.units.get(work_id).cloned())
    }
}
