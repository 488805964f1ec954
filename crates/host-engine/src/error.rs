use split_core::ObjectKey;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("filtering engine not available: {0}")]
    Unavailable(String),
    #[error("object {0} already exists")]
    AlreadyExists(ObjectKey),
    #[error("object {0} not found")]
    NotFound(ObjectKey),
    #[error("object {key} is still referenced by {by}")]
    InUse { key: ObjectKey, by: ObjectKey },
    #[error("object {key} references missing object {reference}")]
    MissingReference {
        key: ObjectKey,
        reference: ObjectKey,
    },
    #[error("a transaction is already in progress")]
    TransactionInProgress,
    #[error("no transaction in progress")]
    NoTransaction,
    #[error("object {key} rejected: {reason}")]
    Rejected { key: ObjectKey, reason: String },
}

impl HostError {
    /// "Already absent" is success for idempotent teardown.
    pub fn is_not_found(&self) -> bool {
        matches!(self, HostError::NotFound(_))
    }
}
