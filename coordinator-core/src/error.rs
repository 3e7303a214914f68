use crate::types::Timestamp;

/// Errors surfaced by the document store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A conditional update lost the compare-and-set race on `last_updated`.
    #[error("conflict on {collection}/{id}: expected last_updated {expected}, found {found}")]
    Conflict {
        collection: &'static str,
        id: String,
        expected: Timestamp,
        found: Timestamp,
    },

    #[error("document not found: {collection}/{id}")]
    NotFound { collection: &'static str, id: String },

    #[error("document already exists: {collection}/{id}")]
    AlreadyExists { collection: &'static str, id: String },
}

/// Errors surfaced by the blob store facade.
#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("object not found: {bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },

    #[error("unknown multipart upload: {0}")]
    UnknownUpload(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Errors surfaced by the verification-VM executor.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("unknown VM instance: {0}")]
    UnknownInstance(String),

    #[error("unknown VM command: {0}")]
    UnknownCommand(String),

    #[error("VM executor not configured: {0}")]
    Unconfigured(String),

    #[error("VM transport error: {0}")]
    Transport(String),
}

/// Public error surface of every callable operation. One variant per
/// design-level error kind; the payload carries the human-readable detail.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("unauthenticated: no caller identity")]
    Unauthenticated,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no pending contribution for participant {0}")]
    NoPendingContribution(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("VM unavailable: {0}")]
    VmUnavailable(String),

    #[error("VM command aborted: {0}")]
    VmCommandAborted(String),

    #[error("storage failure: {0}")]
    StorageFailure(String),
}

impl From<StoreError> for CoordinatorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { collection, id } => {
                CoordinatorError::NotFound(format!("{collection}/{id}"))
            }
            // CAS conflicts that escape their retry loops surface as guard
            // violations: the state the caller observed no longer holds.
            other => CoordinatorError::FailedPrecondition(other.to_string()),
        }
    }
}

impl From<BlobStoreError> for CoordinatorError {
    fn from(e: BlobStoreError) -> Self {
        CoordinatorError::StorageFailure(e.to_string())
    }
}

impl From<VmError> for CoordinatorError {
    fn from(e: VmError) -> Self {
        CoordinatorError::VmUnavailable(e.to_string())
    }
}
