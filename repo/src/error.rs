use thiserror::Error;

/// The full error taxonomy: [`backup_castore::Error`] covers
/// the lower-level object-store concerns (crypto, hashing, backend I/O);
/// this adds the orchestrator-level variants that only make sense once a
/// repository, its locks, and its keys are involved.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Castore(#[from] backup_castore::Error),

    /// No stored key could be opened with the supplied password (or key
    /// hint, if one was given).
    #[error("no key could be unlocked with the supplied password")]
    NoUsableKey,

    /// A lock conflicts with one already held.
    #[error("repository is locked by {holder}")]
    Locked { holder: String },

    /// `init` was called against a repository that already has a config.
    #[error("repository already initialized")]
    AlreadyInitialized,

    /// Any other operation was attempted before a config was found.
    #[error("repository not initialized")]
    NotInitialized,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A file present at scan time was gone by the time it was opened.
    #[error("file vanished during backup: {0}")]
    VanishedFile(String),

    /// A filesystem entry kind the archiver doesn't know how to store
    /// (e.g. a socket).
    #[error("unsupported node type: {0}")]
    UnsupportedNode(String),

    #[error("path escapes restore target: {0}")]
    PathEscapesTarget(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
