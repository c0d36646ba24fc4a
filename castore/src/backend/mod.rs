//! The abstract storage backend: everything above
//! this trait treats the repository as a flat, namespaced key-value
//! store of immutable objects, with no assumptions about what's on the
//! other side — a local filesystem, or an [object_store]-backed cloud
//! bucket.

mod local;
mod object_store_backend;

pub use local::LocalBackend;
pub use object_store_backend::ObjectStoreBackend;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::Result;

/// The backend namespaces an object lives under. File names within a
/// kind are the lowercase hex of a 32-byte hash, except [`Kind::Config`]
/// which always uses the fixed name `config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Data,
    /// Legacy namespace; new code writes only [`Kind::Data`].
    Tree,
    Index,
    Key,
    Snapshot,
    Lock,
    Config,
}

impl Kind {
    pub fn dir_name(self) -> &'static str {
        match self {
            Kind::Data => "data",
            Kind::Tree => "tree",
            Kind::Index => "index",
            Kind::Key => "keys",
            Kind::Snapshot => "snapshots",
            Kind::Lock => "locks",
            Kind::Config => "config",
        }
    }
}

/// What the core consumes from a storage collaborator. Implementations
/// must be safe for concurrent use, perform their own retries on
/// transient failures, and honor any bandwidth limits installed at
/// construction time — none of that is the core's concern.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Atomically creates `name` under `kind` with `bytes`. Fails with
    /// [`crate::Error::AlreadyExists`] if the name is already taken.
    async fn save(&self, kind: Kind, name: &str, bytes: &[u8]) -> Result<()>;

    /// Range-reads `[offset, offset+length)` of `name`, or the whole
    /// object when both are `None`.
    async fn load(
        &self,
        kind: Kind,
        name: &str,
        offset: Option<u64>,
        length: Option<u64>,
    ) -> Result<Vec<u8>>;

    /// Size of `name` in bytes.
    async fn stat(&self, kind: Kind, name: &str) -> Result<u64>;

    /// Complete enumeration of the names stored under `kind`.
    async fn list(&self, kind: Kind) -> Result<BoxStream<'static, Result<String>>>;

    async fn test(&self, kind: Kind, name: &str) -> Result<bool>;

    async fn remove(&self, kind: Kind, name: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::Kind;
    use rstest::rstest;

    #[rstest]
    #[case(Kind::Data, "data")]
    #[case(Kind::Tree, "tree")]
    #[case(Kind::Index, "index")]
    #[case(Kind::Key, "keys")]
    #[case(Kind::Snapshot, "snapshots")]
    #[case(Kind::Lock, "locks")]
    #[case(Kind::Config, "config")]
    fn dir_name_matches_backend_layout(#[case] kind: Kind, #[case] expected: &str) {
        assert_eq!(kind.dir_name(), expected);
    }
}
