//! Error types for the fetch/cache/materialize engine
//!
//! Variants follow the engine's failure taxonomy: configuration errors are
//! raised immediately and never retried, transport and payload errors are
//! transient, archive and storage errors after raw bytes hit disk are fatal.

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Required parameter has no value and no default
    #[error("Missing argument '{name}' for artifact type '{artifact_type}'")]
    MissingParameter { artifact_type: String, name: String },

    /// Parameter is not declared by the artifact type
    #[error("Unexpected argument '{name}' for artifact type '{artifact_type}'")]
    UnknownParameter { artifact_type: String, name: String },

    /// Artifact type was never registered
    #[error("Unknown artifact type: {0}")]
    UnknownArtifactType(String),

    /// Transport or parser component name could not be resolved
    #[error("Unknown {kind} component '{name}'")]
    UnknownComponent { kind: &'static str, name: String },

    /// Engine configuration is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport failed to produce a payload
    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    /// Payload is empty or structurally empty
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Archive expanded to zero members
    #[error("Archive '{0}' contains no files")]
    EmptyArchive(String),

    /// Encoded payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Parser collaborator failed
    #[error("Materialization error: {0}")]
    Materialization(String),

    /// Metadata row does not exist
    #[error("Metadata not found for fingerprint {0}")]
    MetadataNotFound(String),

    /// Blocking task panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error(transparent)]
    Common(#[from] marketcache_common::CommonError),
}

impl EngineError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid payload error
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    /// Create a materialization error
    pub fn materialization(msg: impl Into<String>) -> Self {
        Self::Materialization(msg.into())
    }

    /// Errors the caller must fix; never logged as a trial, never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingParameter { .. }
                | Self::UnknownParameter { .. }
                | Self::UnknownArtifactType(_)
                | Self::UnknownComponent { .. }
                | Self::Config(_)
        )
    }

    /// Errors that leave no state behind and may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::InvalidPayload(_))
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}
