use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Failure taxonomy of a dedupe run.
///
/// `MissingArtifact` and `MalformedCoverageToken` are recoverable and are
/// normally handled where they arise; everything else aborts the run.
#[derive(Debug, Error)]
pub enum DedupeError {
    #[error("store unreachable: {0}")]
    Connectivity(String),
    #[error("cannot index field '{field}': {reason}")]
    Indexing { field: String, reason: String },
    #[error(
        "record '{record_key}' assigned to clusters '{first_canon}' and '{second_canon}'"
    )]
    Integrity {
        record_key: String,
        first_canon: String,
        second_canon: String,
    },
    #[error("cluster led by '{canon}' has {members} members but {scores} scores")]
    MalformedCluster {
        canon: String,
        members: usize,
        scores: usize,
    },
    #[error("training artifact not found: {}", .0.display())]
    MissingArtifact(PathBuf),
    #[error("malformed coverage token: {0:?}")]
    MalformedCoverageToken(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("training artifact error: {0}")]
    Artifact(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl DedupeError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DedupeError::MissingArtifact(_) | DedupeError::MalformedCoverageToken(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DedupeError>;
