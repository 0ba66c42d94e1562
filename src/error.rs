//! Error types for mlkeep

use thiserror::Error;

/// Main error type for mlkeep operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("directory walk error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("integrity verification failed: {reason}")]
    Integrity { reason: String },

    #[error("transfer failed: {reason}")]
    Transfer { reason: String },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("mutability violation: [{path}] is tracked as immutable and its content changed")]
    MutabilityViolation { path: String },

    #[error("version conflict: tag [{tag}] already exists")]
    VersionConflict { tag: String },

    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    #[error("authentication failed: {reason}")]
    Auth { reason: String },

    #[error("no entity found with name [{name}]")]
    EntityNotFound { name: String },

    #[error("multiple entities with name [{name}], please specify one of: {}", candidates.join(", "))]
    AmbiguousEntity {
        name: String,
        candidates: Vec<String>,
    },

    #[error("version {version} not found for [{name}], latest version is {latest}")]
    VersionNotFound {
        name: String,
        version: usize,
        latest: usize,
    },

    #[error("{operation} failed for {} file(s): {}", failures.len(), failures.join(", "))]
    Batch {
        operation: String,
        failures: Vec<String>,
    },
}

impl Error {
    /// Process exit code for the CLI: 0 success, 1 user error, 2 integrity
    /// error, 3 remote/transport error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Integrity { .. } => 2,
            Error::Transfer { .. } | Error::Auth { .. } => 3,
            // Aggregate transfer failures keep the transport exit code.
            Error::Batch { operation, .. } if operation == "push" || operation == "fetch" => 3,
            _ => 1,
        }
    }
}

/// Result type alias for mlkeep operations
pub type Result<T> = std::result::Result<T, Error>;
