use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions};
use tracing::instrument;
use url::Url;

use super::{Backend, Kind};
use crate::Result;

/// Stores the repository in any backend supported by the [object_store]
/// crate (S3, GCS, Azure, or a local path given as a `file://` URL),
/// keyed the same way [`super::LocalBackend`] lays out a filesystem
/// repository — sharding `data/` by the first two hex characters.
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    base: Path,
}

impl ObjectStoreBackend {
    pub fn parse_url(url: &Url) -> std::result::Result<Self, object_store::Error> {
        let (store, base) = object_store::parse_url(url)?;
        Ok(Self {
            store: Arc::from(store),
            base,
        })
    }

    fn path_for(&self, kind: Kind, name: &str) -> Path {
        match kind {
            Kind::Config => self.base.child("config"),
            Kind::Data if name.len() >= 2 => self
                .base
                .child("data")
                .child(&name[..2])
                .child(name),
            _ => self.base.child(kind.dir_name()).child(name),
        }
    }
}

#[async_trait]
impl Backend for ObjectStoreBackend {
    #[instrument(skip_all, err, fields(kind = ?kind, name, len = bytes.len()))]
    async fn save(&self, kind: Kind, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(kind, name);
        self.store
            .put_opts(
                &path,
                bytes.to_vec().into(),
                PutOptions {
                    mode: PutMode::Create,
                    ..Default::default()
                },
            )
            .await?;
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
        let bytes = match (offset, length) {
            (Some(offset), Some(length)) => {
                let range: Range<u64> = offset..offset + length;
                self.store.get_range(&path, range).await?
            }
            _ => self.store.get(&path).await?.bytes().await?,
        };
        Ok(bytes.to_vec())
    }

    async fn stat(&self, kind: Kind, name: &str) -> Result<u64> {
        let meta = self.store.head(&self.path_for(kind, name)).await?;
        Ok(meta.size as u64)
    }

    async fn list(&self, kind: Kind) -> Result<BoxStream<'static, Result<String>>> {
        let prefix = self.base.child(kind.dir_name());
        let stream = self
            .store
            .list(Some(&prefix))
            .map(|res| res.map(|meta| meta.location.filename().unwrap_or_default().to_owned()))
            .map(|res| res.map_err(Into::into));
        Ok(stream.boxed())
    }

    async fn test(&self, kind: Kind, name: &str) -> Result<bool> {
        match self.store.head(&self.path_for(kind, name)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, kind: Kind, name: &str) -> Result<()> {
        self.store.delete(&self.path_for(kind, name)).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
