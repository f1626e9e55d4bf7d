use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EnrichError>;

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("empty input for source {source_id}")]
    EmptyInput { source_id: String },

    #[error("text for source {source_id} is not valid UTF-8: {detail}")]
    Encoding { source_id: String, detail: String },

    #[error("no text available for source {source_id}: {detail}")]
    MissingText { source_id: String, detail: String },

    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("invalid vector dimension: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding model mismatch: index holds {expected}, got {actual}")]
    ModelMismatch { expected: String, actual: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate source id: {0}")]
    DuplicateSource(String),

    #[error("malformed registry row {line}: {detail}")]
    MalformedRow { line: u64, detail: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("registry I/O failed: {0}")]
    Registry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse failure classes used for reporting and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Input,
    Backend,
    Consistency,
    Config,
    RegistryIo,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Input => "input",
            ErrorClass::Backend => "backend",
            ErrorClass::Consistency => "consistency",
            ErrorClass::Config => "config",
            ErrorClass::RegistryIo => "registry_io",
        }
    }
}

impl EnrichError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EnrichError::EmptyInput { .. }
            | EnrichError::Encoding { .. }
            | EnrichError::MissingText { .. }
            | EnrichError::MalformedRow { .. }
            | EnrichError::Io(_) => ErrorClass::Input,
            EnrichError::ModelUnavailable(_) => ErrorClass::Backend,
            EnrichError::DimensionMismatch { .. }
            | EnrichError::ModelMismatch { .. }
            | EnrichError::NotFound(_)
            | EnrichError::DuplicateSource(_) => ErrorClass::Consistency,
            EnrichError::Config(_) => ErrorClass::Config,
            EnrichError::Registry(_) => ErrorClass::RegistryIo,
        }
    }
}

impl From<providers::ProviderError> for EnrichError {
    fn from(err: providers::ProviderError) -> Self {
        EnrichError::ModelUnavailable(err.to_string())
    }
}
