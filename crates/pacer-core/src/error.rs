use thiserror::Error;

/// Top-level error type for Pacer.
///
/// Admission denials are not errors; they are reported as values by the
/// gate. This type covers configuration, provider, and storage faults.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PacerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for PacerError {
    fn from(err: toml::de::Error) -> Self {
        PacerError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for PacerError {
    fn from(err: toml::ser::Error) -> Self {
        PacerError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for PacerError {
    fn from(err: serde_json::Error) -> Self {
        PacerError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PacerError>;
