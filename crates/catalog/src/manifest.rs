use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::model::ArgSpec;

/// Errors raised while loading or validating the capability manifest.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read manifest `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest: {source}")]
    Parse {
        #[source]
        source: serde_yaml::Error,
    },
    #[error("duplicate capability id `{id}` in manifest")]
    DuplicateId { id: String },
}

/// One manifest entry. The same shape serves all three sections; workflows
/// are the only kind expected to carry `script_path` and `arg_schema`.
///
/// The trailing hint fields (`summary`, `when_to_use`, `required_args`,
/// `example`) are hit metadata: they override the derived short-form view
/// without becoming part of the capability document itself.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub script_path: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub arg_schema: BTreeMap<String, ArgSpec>,
    #[serde(default)]
    pub examples: Vec<Value>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub expected_output_shape: serde_json::Map<String, Value>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub when_to_use: String,
    #[serde(default)]
    pub required_args: Vec<String>,
    #[serde(default)]
    pub example: String,
}

/// Parsed capability manifest. Missing sections default to empty and unknown
/// top-level keys are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub workflows: Vec<ManifestEntry>,
    #[serde(default)]
    pub runtime_tools: Vec<ManifestEntry>,
    #[serde(default)]
    pub execution_patterns: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let contents = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, CatalogError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let manifest: Manifest =
            serde_yaml::from_str(contents).map_err(|source| CatalogError::Parse { source })?;
        manifest.check_unique_ids()?;
        Ok(manifest)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.workflows
            .iter()
            .chain(self.runtime_tools.iter())
            .chain(self.execution_patterns.iter())
    }

    pub(crate) fn check_unique_ids(&self) -> Result<(), CatalogError> {
        let mut seen = BTreeSet::new();
        for entry in self.entries() {
            if entry.id.is_empty() {
                continue;
            }
            if !seen.insert(entry.id.as_str()) {
                return Err(CatalogError::DuplicateId {
                    id: entry.id.clone(),
                });
            }
        }
        Ok(())
    }
}
