//! Error types for the fundraising engine.

use thiserror::Error;

/// Failures of the persistence layer (sled + serialization).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Failures of the external language-model collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("model call timed out after {0}ms")]
    Timeout(u64),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("unparseable model output: {0}")]
    Parse(String),
}

/// Failures of the external search collaborator.
#[derive(Error, Debug, Clone)]
pub enum SearchError {
    #[error("search index unavailable: {0}")]
    Unavailable(String),

    #[error("search query failed: {0}")]
    Query(String),
}

/// Failures of an action skill after its reservation succeeded.
#[derive(Error, Debug)]
pub enum SkillError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error("no skill registered for action: {0}")]
    UnknownAction(String),

    #[error("{0}")]
    Other(String),
}

/// Credit meter failures.
#[derive(Error, Debug)]
pub enum CreditError {
    #[error("insufficient credit for {action}: needs {needed}, available {available}")]
    Denied {
        action: String,
        needed: u64,
        available: u64,
    },

    #[error("unknown or expired reservation: {0}")]
    UnknownReservation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Engine-level taxonomy. Every synchronous failure maps to one of these and then
/// to a safe user-facing reply; `MergeConflict` never leaves the reconciler.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("input rejected as spam (score {spam_score})")]
    InputRejected { spam_score: u8 },

    #[error("classification failed: {0}")]
    ClassificationFailed(#[from] ModelError),

    #[error("insufficient credit: {0}")]
    InsufficientCredit(String),

    #[error("action failed: {0}")]
    ActionFailed(#[from] SkillError),

    #[error("merge conflict on project {project_id} after {attempts} attempts")]
    MergeConflict { project_id: String, attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl From<CreditError> for EngineError {
    fn from(err: CreditError) -> Self {
        match err {
            CreditError::Store(e) => EngineError::Store(e),
            other => EngineError::InsufficientCredit(other.to_string()),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
