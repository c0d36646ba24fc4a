use thiserror::Error;

/// Errors raised by the content-addressed object store: the backend,
/// the cryptor, the chunker, the pack codec, and the index.
///
/// `repo::Error` wraps this with the orchestrator-level variants that
/// only make sense once a repository is involved.
#[derive(Debug, Error)]
pub enum Error {
    /// AEAD tag verification failed.
    #[error("authentication failed")]
    Unauthenticated,

    /// A decrypted blob's SHA-256 didn't match its declared id.
    #[error("content hash mismatch: expected {expected}, got {actual}")]
    CorruptHash { expected: String, actual: String },

    /// The requested id isn't present in the index or the backend.
    #[error("not found: {0}")]
    NotFound(String),

    /// `save` raced with another writer creating the same name.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Repository content violates a structural invariant (e.g. a pack
    /// header referencing bytes outside the pack).
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// An underlying backend I/O error, after the backend's own retries.
    #[error("backend error: {0}")]
    Backend(String),

    /// Cooperative cancellation.
    #[error("operation canceled")]
    Canceled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(e.to_string())
        } else if e.kind() == std::io::ErrorKind::AlreadyExists {
            Error::AlreadyExists(e.to_string())
        } else {
            Error::Backend(e.to_string())
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { path, .. } => Error::NotFound(path),
            object_store::Error::AlreadyExists { path, .. } => Error::AlreadyExists(path),
            other => Error::Backend(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidData(e.to_string())
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::NotFound(msg) => std::io::Error::new(std::io::ErrorKind::NotFound, msg),
            Error::AlreadyExists(msg) => {
                std::io::Error::new(std::io::ErrorKind::AlreadyExists, msg)
            }
            Error::Canceled => std::io::Error::new(std::io::ErrorKind::Interrupted, "canceled"),
            other => std::io::Error::other(other.to_string()),
        }
    }
}
