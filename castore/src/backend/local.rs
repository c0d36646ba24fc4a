use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::instrument;

use super::{Backend, Kind};
use crate::{Error, Result};

/// Stores the repository directly on a local (or network-mounted)
/// filesystem, laid out as:
///
/// ```text
/// config
/// keys/<hex>
/// snapshots/<hex>
/// index/<hex>
/// locks/<hex>
/// data/<first-2-hex>/<hex>
/// ```
#[derive(Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, kind: Kind, name: &str) -> PathBuf {
        match kind {
            Kind::Config => self.root.join("config"),
            Kind::Data if name.len() >= 2 => self
                .root
                .join("data")
                .join(&name[..2])
                .join(name),
            _ => self.root.join(kind.dir_name()).join(name),
        }
    }

    fn dir_for(&self, kind: Kind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for LocalBackend {
    #[instrument(skip_all, err, fields(kind = ?kind, name, len = bytes.len()))]
    async fn save(&self, kind: Kind, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(kind, name);
        Self::ensure_parent(&path).await?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok(())
    }

    #[instrument(skip_all, err, fields(kind = ?kind, name, offset, length))]
    async fn load(
        &self,
        kind: Kind,
        name: &str,
        offset: Option<u64>,
        length: Option<u64>,
    ) -> Result<Vec<u8>> {
        let path = self.path_for(kind, name);
        let mut file = fs::File::open(&path).await?;

        if let Some(offset) = offset {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }

        match length {
            Some(length) => {
                let mut buf = vec![0u8; length as usize];
                file.read_exact(&mut buf).await?;
                Ok(buf)
            }
            None => {
                let mut buf = Vec::new();
                file.read_to_end(&mut buf).await?;
                Ok(buf)
            }
        }
    }

    async fn stat(&self, kind: Kind, name: &str) -> Result<u64> {
        let path = self.path_for(kind, name);
        let meta = fs::metadata(&path).await?;
        Ok(meta.len())
    }

    async fn list(&self, kind: Kind) -> Result<BoxStream<'static, Result<String>>> {
        let base = self.dir_for(kind);
        let mut names = Vec::new();

        if kind == Kind::Data {
            let mut shard_dirs = match fs::read_dir(&base).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(stream::iter(names.into_iter().map(Ok)).boxed())
                }
                Err(e) => return Err(e.into()),
            };
            while let Some(shard) = shard_dirs.next_entry().await? {
                let mut entries = fs::read_dir(shard.path()).await?;
                while let Some(entry) = entries.next_entry().await? {
                    if let Some(name) = entry.file_name().to_str() {
                        names.push(name.to_owned());
                    }
                }
            }
        } else {
            let mut entries = match fs::read_dir(&base).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(stream::iter(names.into_iter().map(Ok)).boxed())
                }
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_owned());
                }
            }
        }

        Ok(stream::iter(names.into_iter().map(Ok)).boxed())
    }

    async fn test(&self, kind: Kind, name: &str) -> Result<bool> {
        Ok(fs::metadata(self.path_for(kind, name)).await.is_ok())
    }

    #[instrument(skip_all, err, fields(kind = ?kind, name))]
    async fn remove(&self, kind: Kind, name: &str) -> Result<()> {
        let path = self.path_for(kind, name);
        fs::remove_file(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("{}/{}", kind.dir_name(), name))
            } else {
                e.into()
            }
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::tempdir;

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.save(Kind::Snapshot, "abcd", b"hello").await.unwrap();
        let data = backend.load(Kind::Snapshot, "abcd", None, None).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn save_fails_on_existing_name() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.save(Kind::Index, "x", b"one").await.unwrap();
        let result = backend.save(Kind::Index, "x", b"two").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn data_is_sharded_by_hex_prefix() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.save(Kind::Data, "abcdef01", b"pack").await.unwrap();
        assert!(dir.path().join("data").join("ab").join("abcdef01").exists());
    }

    #[tokio::test]
    async fn range_read_returns_requested_window() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.save(Kind::Data, "aabb", b"0123456789").await.unwrap();
        let window = backend
            .load(Kind::Data, "aabb", Some(2), Some(3))
            .await
            .unwrap();
        assert_eq!(window, b"234");
    }

    #[tokio::test]
    async fn list_enumerates_all_names_in_a_kind() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.save(Kind::Data, "aabbcc", b"1").await.unwrap();
        backend.save(Kind::Data, "aaffee", b"2").await.unwrap();
        backend.save(Kind::Data, "bb1122", b"3").await.unwrap();

        let names: Vec<_> = backend.list(Kind::Data).await.unwrap().try_collect().await.unwrap();
        let mut names = names;
        names.sort();
        assert_eq!(names, vec!["aabbcc", "aaffee", "bb1122"]);
    }

    #[tokio::test]
    async fn test_and_remove() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.save(Kind::Lock, "l1", b"x").await.unwrap();
        assert!(backend.test(Kind::Lock, "l1").await.unwrap());
        backend.remove(Kind::Lock, "l1").await.unwrap();
        assert!(!backend.test(Kind::Lock, "l1").await.unwrap());
    }
}
