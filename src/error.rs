use std::path::PathBuf;
use thiserror::Error;

use crate::catalog::CatalogError;

/// The main error type for rucio-workflow operations.
///
/// The first four variants are the workflow taxonomy; the rest cover the
/// plumbing around it (input files, configuration, transport).
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Malformed input. Raised before anything reaches the catalog.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A dataset lifecycle operation failed after being sent.
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// File registration or attachment failed.
    #[error("File registration error: {0}")]
    FileRegistration(String),

    /// Orchestration-level failure not covered by the kinds above.
    #[error("Workflow execution error: {0}")]
    WorkflowExecution(String),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse file list from {path}: {source}")]
    FileListParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid metadata JSON: {0}")]
    MetadataParse(#[source] serde_json::Error),

    #[error("Failed to read configuration from {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid configuration with {error_count} error(s)")]
    InvalidConfig { error_count: usize },

    #[error("Workflow failed with {} error(s): {}", errors.len(), errors.join("; "))]
    WorkflowFailed { errors: Vec<String> },
}

impl WorkflowError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn dataset(message: impl Into<String>) -> Self {
        Self::Dataset(message.into())
    }

    pub(crate) fn registration(message: impl Into<String>) -> Self {
        Self::FileRegistration(message.into())
    }
}
