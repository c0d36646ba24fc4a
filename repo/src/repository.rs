//! The repository orchestrator: the single entry point
//! all higher components (tree walker, archiver, restorer) go through
//! to reach the backend. Owns the master index, the packer pool, and
//! the unlocked master key.

use std::collections::HashSet;
use std::sync::Arc;

use backup_castore::backend::{Backend, Kind};
use backup_castore::id::Id;
use backup_castore::index::{Index, Location, MasterIndex};
use backup_castore::pack::BlobType;
use backup_castore::Key;
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use rand_core::RngCore;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::key::{self, KeyFile};
use crate::options::RepositoryOptions;
use crate::packer::{FinishedPack, PackerPool};
use crate::snapshot::Snapshot;

pub struct Repository {
    backend: Arc<dyn Backend>,
    key: Key,
    config: Config,
    master_index: MasterIndex,
    packer_pool: PackerPool,
    /// Ids queued into an unflushed packer during this operation:
    /// consulted alongside the master index so that two chunks with the
    /// same content, produced before either has reached the backend,
    /// still collapse to one stored blob.
    pending: Mutex<HashSet<Id>>,
    options: RepositoryOptions,
    hostname: String,
    username: String,
}

fn random_id() -> Id {
    let mut bytes = [0u8; 32];
    rand_core::OsRng.fill_bytes(&mut bytes);
    Id::from_bytes(bytes)
}

fn local_identity() -> (String, String) {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    (hostname, username)
}

impl Repository {
    /// Initializes a fresh repository: writes config, then a master key
    /// sealed by `password`, and nothing else. Fails with
    /// [`Error::AlreadyInitialized`] if a config is already present.
    #[instrument(skip(backend, password))]
    pub async fn init(
        backend: Arc<dyn Backend>,
        password: &str,
        options: RepositoryOptions,
    ) -> Result<Self> {
        if backend.test(Kind::Config, "config").await.map_err(Error::Castore)? {
            return Err(Error::AlreadyInitialized);
        }

        let (hostname, username) = local_identity();
        let mut rng = rand_core::OsRng;
        let config = Config::generate(&mut rng);
        let master_key = Key::random();

        let key_file = key::seal(
            &master_key,
            config.chunker_polynomial,
            password,
            &username,
            &hostname,
        );
        let key_id = random_id();
        backend
            .save(Kind::Key, &key_id.to_hex(), &key_file.to_json())
            .await
            .map_err(|e| match e {
                backup_castore::Error::AlreadyExists(n) => Error::Castore(
                    backup_castore::Error::AlreadyExists(n),
                ),
                other => other.into(),
            })?;

        backend
            .save(Kind::Config, "config", &config.to_json())
            .await
            .map_err(|e| match e {
                backup_castore::Error::AlreadyExists(_) => Error::AlreadyInitialized,
                other => other.into(),
            })?;

        debug!(id = %config.id.to_hex(), "repository initialized");
        Ok(Self::new(backend, master_key, config, options, hostname, username))
    }

    /// Opens an existing repository: loads config (absence means
    /// uninitialized), then tries each stored key object against
    /// `password` (the key hint first, if configured).
    #[instrument(skip(backend, password))]
    pub async fn open(
        backend: Arc<dyn Backend>,
        password: &str,
        options: RepositoryOptions,
    ) -> Result<Self> {
        let config_bytes = backend
            .load(Kind::Config, "config", None, None)
            .await
            .map_err(|e| match e {
                backup_castore::Error::NotFound(_) => Error::NotInitialized,
                other => other.into(),
            })?;
        let config = Config::from_json(&config_bytes)
            .map_err(|e| Error::Other(format!("malformed config: {e}")))?;

        let key_names: Vec<String> = backend
            .list(Kind::Key)
            .await
            .map_err(Error::Castore)?
            .try_collect()
            .await
            .map_err(Error::Castore)?;

        let mut key_files = Vec::with_capacity(key_names.len());
        for name in &key_names {
            let bytes = backend
                .load(Kind::Key, name, None, None)
                .await
                .map_err(Error::Castore)?;
            let kf = KeyFile::from_json(&bytes)
                .map_err(|e| Error::Other(format!("malformed key object {name}: {e}")))?;
            key_files.push((
                Id::from_hex(name).map_err(|e| Error::Other(e.to_string()))?,
                kf,
            ));
        }
        let refs: Vec<(Id, &KeyFile)> = key_files.iter().map(|(id, kf)| (*id, kf)).collect();
        let (master_key, polynomial) = key::search(refs, options.key_hint, password)?;

        if polynomial != config.chunker_polynomial {
            return Err(Error::Other(
                "key object's chunker polynomial disagrees with repository config".into(),
            ));
        }

        let (hostname, username) = local_identity();
        Ok(Self::new(backend, master_key, config, options, hostname, username))
    }

    fn new(
        backend: Arc<dyn Backend>,
        key: Key,
        config: Config,
        options: RepositoryOptions,
        hostname: String,
        username: String,
    ) -> Self {
        let packer_pool =
            PackerPool::with_limits(options.packer_low_water_mark, options.packer_pool_cap);
        Self {
            backend,
            key,
            config,
            master_index: MasterIndex::new(),
            packer_pool,
            pending: Mutex::new(HashSet::new()),
            options,
            hostname,
            username,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn chunker_polynomial(&self) -> u64 {
        self.config.chunker_polynomial
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn options(&self) -> &RepositoryOptions {
        &self.options
    }

    /// Loads every index file the backend currently lists, with bounded
    /// fan-out. Individual load/parse failures are
    /// logged and skipped rather than aborting the whole load, matching
    /// "failures on individual files are reported but do not abort
    /// loading of others."
    #[instrument(skip(self))]
    pub async fn load_indices(&self) -> Result<()> {
        let names: Vec<String> = self
            .backend
            .list(Kind::Index)
            .await
            .map_err(Error::Castore)?
            .try_collect()
            .await
            .map_err(Error::Castore)?;

        let concurrency = self.options.index_load_concurrency.max(1);
        let backend = self.backend.clone();
        let key = self.key.clone();

        let loaded: Vec<std::result::Result<Index, String>> = stream::iter(names)
            .map(|name| {
                let backend = backend.clone();
                let key = key.clone();
                async move {
                    let bytes = backend
                        .load(Kind::Index, &name, None, None)
                        .await
                        .map_err(|e| format!("{name}: {e}"))?;
                    let plaintext = key.open(&bytes).map_err(|e| format!("{name}: {e}"))?;
                    let file: backup_castore::index::IndexFile = serde_json::from_slice(&plaintext)
                        .map_err(|e| format!("{name}: {e}"))?;
                    Ok(Index::from_file(&file))
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for result in loaded {
            match result {
                Ok(index) => self.master_index.add_loaded(index),
                Err(msg) => warn!(error = %msg, "skipping unreadable index file"),
            }
        }
        Ok(())
    }

    /// Saves a packed blob (`data` or `tree`). A no-op if the content is
    /// already known, whether flushed to the backend or merely queued in
    /// an open packer from earlier in this same operation.
    #[instrument(skip(self, plaintext), fields(id = %id, len = plaintext.len()))]
    pub async fn save_blob(&self, blob_type: BlobType, id: Id, plaintext: &[u8]) -> Result<()> {
        {
            let mut pending = self.pending.lock();
            if self.master_index.contains(&id) || pending.contains(&id) {
                return Ok(());
            }
            pending.insert(id);
        }

        let finished = self.packer_pool.add_blob(&self.key, blob_type, id, plaintext);
        if let Some(finished) = finished {
            self.upload_finished_pack(finished).await?;
        }
        Ok(())
    }

    /// Loads a blob by id: master-index lookup, range-read from its
    /// pack, decrypt, and re-verify that the plaintext hashes back to
    /// `id`.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn load_blob(&self, id: Id) -> Result<Vec<u8>> {
        let location = self
            .master_index
            .get(&id)
            .ok_or_else(|| Error::Castore(backup_castore::Error::NotFound(id.to_hex())))?;

        let sealed = self
            .backend
            .load(
                Kind::Data,
                &location.pack_id.to_hex(),
                Some(location.offset),
                Some(location.length as u64),
            )
            .await
            .map_err(Error::Castore)?;

        let plaintext = self.key.open(&sealed).map_err(Error::Castore)?;
        let actual = Id::of(&plaintext);
        if actual != id {
            return Err(Error::Castore(backup_castore::Error::CorruptHash {
                expected: id.to_hex(),
                actual: actual.to_hex(),
            }));
        }
        Ok(plaintext)
    }

    /// Looks up where a blob lives without fetching it, for callers
    /// (the restorer's scheduler) that batch reads by pack.
    pub fn locate_blob(&self, id: &Id) -> Option<Location> {
        self.master_index.get(id)
    }

    /// Opens a sealed byte range the caller already fetched itself (the
    /// restorer's pack-centric reads, which range into a whole pack
    /// rather than going through [`Repository::load_blob`]).
    pub fn open_sealed(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        self.key.open(sealed).map_err(Error::Castore)
    }

    pub fn has_blob(&self, id: &Id) -> bool {
        self.master_index.contains(id) || self.pending.lock().contains(id)
    }

    /// Fetches an entire pack's bytes in one range-read, for the
    /// restorer's pack-centric scheduler.
    pub async fn load_pack(&self, pack_id: Id, size: u64) -> Result<Vec<u8>> {
        self.backend
            .load(Kind::Data, &pack_id.to_hex(), Some(0), Some(size))
            .await
            .map_err(Error::Castore)
    }

    pub async fn pack_size(&self, pack_id: Id) -> Result<u64> {
        self.backend
            .stat(Kind::Data, &pack_id.to_hex())
            .await
            .map_err(Error::Castore)
    }

    /// Uploads a finished packer's bytes under its ciphertext hash,
    /// idempotent on `AlreadyExists` (content-addressed saves racing
    /// another writer are success, not failure), records its blobs into
    /// the master index, and writes an index file covering it.
    async fn upload_finished_pack(&self, finished: FinishedPack) -> Result<()> {
        let pack_id = Id::of(&finished.bytes);
        match self
            .backend
            .save(Kind::Data, &pack_id.to_hex(), &finished.bytes)
            .await
        {
            Ok(()) | Err(backup_castore::Error::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }

        {
            let mut pending = self.pending.lock();
            for blob in &finished.blobs {
                self.master_index.insert(
                    blob.id,
                    Location {
                        pack_id,
                        blob_type: blob.blob_type,
                        offset: blob.offset,
                        length: blob.length,
                    },
                );
                pending.remove(&blob.id);
            }
        }

        let index_file = Index::to_file_for_pack(pack_id, &finished.blobs);
        let index_json = serde_json::to_vec(&index_file)
            .expect("index file serializes infallibly");
        let sealed = self.key.seal(&index_json);
        let index_name = Id::of(&sealed).to_hex();
        match self.backend.save(Kind::Index, &index_name, &sealed).await {
            Ok(()) | Err(backup_castore::Error::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }

        debug!(pack = %pack_id, blobs = finished.blobs.len(), "flushed pack");
        Ok(())
    }

    /// Finalizes and uploads every packer still open in the pool. Called
    /// once at the end of a backup, after which every blob saved during
    /// the operation is durably recorded in at least one index file.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<()> {
        let finished = self.packer_pool.drain(&self.key);
        for pack in finished {
            self.upload_finished_pack(pack).await?;
        }
        Ok(())
    }

    /// Saves a snapshot object under a fresh random id: snapshots are
    /// not content-addressed, since two runs with
    /// identical trees taken seconds apart must remain distinct objects.
    pub async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<Id> {
        let sealed = self.key.seal(&snapshot.to_json());
        let id = random_id();
        self.backend
            .save(Kind::Snapshot, &id.to_hex(), &sealed)
            .await
            .map_err(Error::Castore)?;
        Ok(id)
    }

    pub async fn load_snapshot(&self, id: Id) -> Result<Snapshot> {
        let sealed = self
            .backend
            .load(Kind::Snapshot, &id.to_hex(), None, None)
            .await
            .map_err(Error::Castore)?;
        let plaintext = self.key.open(&sealed).map_err(Error::Castore)?;
        Snapshot::from_json(&plaintext).map_err(|e| Error::Other(format!("malformed snapshot: {e}")))
    }

    pub async fn list_snapshots(&self) -> Result<Vec<Id>> {
        let names: Vec<String> = self
            .backend
            .list(Kind::Snapshot)
            .await
            .map_err(Error::Castore)?
            .try_collect()
            .await
            .map_err(Error::Castore)?;
        names
            .into_iter()
            .map(|n| Id::from_hex(&n).map_err(|e| Error::Other(e.to_string())))
            .collect()
    }

    /// Every pack currently stored under the data namespace, by id.
    pub async fn list_packs(&self) -> Result<Vec<Id>> {
        let names: Vec<String> = self
            .backend
            .list(Kind::Data)
            .await
            .map_err(Error::Castore)?
            .try_collect()
            .await
            .map_err(Error::Castore)?;
        names
            .into_iter()
            .map(|n| Id::from_hex(&n).map_err(|e| Error::Other(e.to_string())))
            .collect()
    }

    /// Decodes one pack's header without downloading its blob bodies,
    /// for callers (rebuild-index, check) that only need to know what a
    /// pack contains.
    pub(crate) async fn decode_pack_header(
        &self,
        pack_id: Id,
    ) -> Result<Vec<backup_castore::pack::BlobEntry>> {
        let size = self.pack_size(pack_id).await?;
        let bytes = self.load_pack(pack_id, size).await?;
        backup_castore::pack::decode_header(&self.key, size, |start, end| {
            Ok(bytes[start as usize..end as usize].to_vec())
        })
        .map_err(Error::Castore)
    }

    /// Rebuilds the index from the packs actually present in the
    /// backend, for recovering from an interrupted backup that left
    /// packs uploaded but their index file never written: lists every
    /// pack, decodes its header, and writes one fresh index file per
    /// pack not already covered by a loaded index. Returns the number
    /// of packs it wrote a fresh index for.
    #[instrument(skip(self))]
    pub async fn rebuild_index(&self) -> Result<usize> {
        let pack_ids = self.list_packs().await?;
        let mut rebuilt = 0;
        for pack_id in pack_ids {
            let entries = self.decode_pack_header(pack_id).await?;
            let already_covered = entries
                .first()
                .is_some_and(|e| self.master_index.contains(&e.id));
            if already_covered {
                continue;
            }

            let index_file = Index::to_file_for_pack(pack_id, &entries);
            let index_json =
                serde_json::to_vec(&index_file).expect("index file serializes infallibly");
            let sealed = self.key.seal(&index_json);
            let index_name = Id::of(&sealed).to_hex();
            match self.backend.save(Kind::Index, &index_name, &sealed).await {
                Ok(()) | Err(backup_castore::Error::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }

            let mut fresh = Index::new();
            for entry in &entries {
                fresh.insert(
                    entry.id,
                    Location {
                        pack_id,
                        blob_type: entry.blob_type,
                        offset: entry.offset,
                        length: entry.length,
                    },
                );
            }
            self.master_index.add_loaded(fresh);
            rebuilt += 1;
            debug!(pack = %pack_id, blobs = entries.len(), "rebuilt index entry for orphan pack");
        }
        Ok(rebuilt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backup_castore::backend::LocalBackend;
    use tempfile::tempdir;

    fn backend() -> (Arc<dyn Backend>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        (Arc::new(LocalBackend::new(dir.path())), dir)
    }

    #[tokio::test]
    async fn init_then_open_round_trips_the_master_key() {
        let (backend, _dir) = backend();
        let repo = Repository::init(backend.clone(), "hunter2", RepositoryOptions::default())
            .await
            .unwrap();
        let poly = repo.chunker_polynomial();

        let reopened = Repository::open(backend, "hunter2", RepositoryOptions::default())
            .await
            .unwrap();
        assert_eq!(reopened.chunker_polynomial(), poly);
    }

    #[tokio::test]
    async fn init_twice_fails() {
        let (backend, _dir) = backend();
        Repository::init(backend.clone(), "pw", RepositoryOptions::default())
            .await
            .unwrap();
        let result = Repository::init(backend, "pw", RepositoryOptions::default()).await;
        assert!(matches!(result, Err(Error::AlreadyInitialized)));
    }

    #[tokio::test]
    async fn open_with_wrong_password_fails() {
        let (backend, _dir) = backend();
        Repository::init(backend.clone(), "right", RepositoryOptions::default())
            .await
            .unwrap();
        let result = Repository::open(backend, "wrong", RepositoryOptions::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn save_and_load_blob_round_trips() {
        let (backend, _dir) = backend();
        let repo = Repository::init(backend, "pw", RepositoryOptions::default())
            .await
            .unwrap();
        let data = b"hello\n".to_vec();
        let id = Id::of(&data);
        repo.save_blob(BlobType::Data, id, &data).await.unwrap();
        repo.flush().await.unwrap();

        let loaded = repo.load_blob(id).await.unwrap();
        assert_eq!(loaded, data);
    }

    #[tokio::test]
    async fn duplicate_save_is_a_noop() {
        let (backend, _dir) = backend();
        let repo = Repository::init(backend, "pw", RepositoryOptions::default())
            .await
            .unwrap();
        let data = vec![7u8; 100];
        let id = Id::of(&data);
        repo.save_blob(BlobType::Data, id, &data).await.unwrap();
        repo.save_blob(BlobType::Data, id, &data).await.unwrap();
        repo.flush().await.unwrap();
        assert!(repo.has_blob(&id));
    }

    #[tokio::test]
    async fn save_across_two_flushes_needs_no_duplicate_upload() {
        let (backend, _dir) = backend();
        let repo = Repository::init(backend, "pw", RepositoryOptions::default())
            .await
            .unwrap();
        let data = vec![9u8; 4096];
        let id = Id::of(&data);
        repo.save_blob(BlobType::Data, id, &data).await.unwrap();
        repo.flush().await.unwrap();
        // Loading after the operation ends still works.
        assert_eq!(repo.load_blob(id).await.unwrap(), data);
    }

    #[tokio::test]
    async fn loaded_fresh_repository_can_rediscover_blobs_via_load_indices() {
        let (backend, _dir) = backend();
        let repo = Repository::init(backend.clone(), "pw", RepositoryOptions::default())
            .await
            .unwrap();
        let data = b"persisted across opens".to_vec();
        let id = Id::of(&data);
        repo.save_blob(BlobType::Data, id, &data).await.unwrap();
        repo.flush().await.unwrap();

        let reopened = Repository::open(backend, "pw", RepositoryOptions::default())
            .await
            .unwrap();
        assert!(reopened.locate_blob(&id).is_none());
        reopened.load_indices().await.unwrap();
        assert_eq!(reopened.load_blob(id).await.unwrap(), data);
    }

    #[tokio::test]
    async fn snapshot_round_trips() {
        let (backend, _dir) = backend();
        let repo = Repository::init(backend, "pw", RepositoryOptions::default())
            .await
            .unwrap();
        let snap = Snapshot {
            time: chrono::Local::now(),
            parent: None,
            tree: Id::of(b"tree"),
            paths: vec!["/src".into()],
            hostname: repo.hostname().to_string(),
            username: repo.username().to_string(),
            uid: 0,
            gid: 0,
            excludes: None,
            tags: vec![],
        };
        let id = repo.save_snapshot(&snap).await.unwrap();
        let loaded = repo.load_snapshot(id).await.unwrap();
        assert_eq!(loaded.tree, snap.tree);

        let ids = repo.list_snapshots().await.unwrap();
        assert_eq!(ids, vec![id]);
    }
}
