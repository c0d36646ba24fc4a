//! The restorer: walks a snapshot's tree, creates every
//! filesystem entry, fetches pack-sized ranges rather than one read per
//! chunk, and restores metadata only after an entry's content (and, for
//! directories, all its children) are fully in place.

use std::collections::HashMap;
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use backup_castore::id::Id;
use backup_castore::index::Location;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

use crate::error::{Error, Result};
use crate::lock;
use crate::repository::Repository;
use crate::tree::{CancelToken, Node, NodeKind, WalkEvent};

/// Fixed AEAD envelope overhead (16-byte IV + 16-byte Poly1305 tag) added
/// to every sealed chunk; mirrors `backup_castore::crypto`'s private
/// `OVERHEAD` constant so a chunk's plaintext length — and thus its
/// offset within the restored file — can be computed from the index
/// alone, without decrypting it first.
const SEAL_OVERHEAD: u64 = 32;

#[derive(Debug, Clone, Default)]
pub struct RestoreStats {
    pub files_restored: u64,
    pub dirs_restored: u64,
    pub bytes_written: u64,
    pub errors: Vec<String>,
}

/// Restores snapshot `snapshot_id` under `target`. Best-effort per entry:
/// a corrupt or missing chunk fails that one file (recorded in
/// [`RestoreStats::errors`]) without aborting the rest of the restore.
/// Holds a non-exclusive repository lock, refreshed in the background,
/// for the duration of the restore.
#[instrument(skip(repo, cancel))]
pub async fn restore(
    repo: Arc<Repository>,
    snapshot_id: Id,
    target: &Path,
    cancel: CancelToken,
) -> Result<RestoreStats> {
    let guard = lock::lock(
        repo.backend().as_ref(),
        false,
        repo.hostname(),
        repo.username(),
    )
    .await?;
    let lock_cancel = CancelToken::new();
    let refresh_handle = lock::spawn_refresh_loop(
        repo.backend().clone(),
        guard,
        repo.hostname().to_string(),
        repo.username().to_string(),
        false,
        lock_cancel.clone(),
    );

    let result = run_restore(repo.clone(), snapshot_id, target, cancel).await;

    lock_cancel.cancel();
    let guard = refresh_handle
        .await
        .map_err(|e| Error::Other(format!("lock refresh task panicked: {e}")))?;
    lock::unlock(repo.backend().as_ref(), guard).await?;

    result
}

async fn run_restore(
    repo: Arc<Repository>,
    snapshot_id: Id,
    target: &Path,
    cancel: CancelToken,
) -> Result<RestoreStats> {
    repo.load_indices().await?;
    let snapshot = repo.load_snapshot(snapshot_id).await?;
    let events = crate::tree::walk(&repo, snapshot.tree, &cancel).await?;

    let mut stats = RestoreStats::default();

    tokio::fs::create_dir_all(target)
        .await
        .map_err(|e| Error::Other(format!("creating restore target: {e}")))?;

    let mut files = Vec::new();
    let mut dirs = Vec::new();

    // Pass 1: create every entry (sequential — cheap, and directories
    // must exist before their children are created).
    for event in &events {
        if cancel.is_canceled() {
            return Err(Error::Castore(backup_castore::Error::Canceled));
        }
        match event {
            WalkEvent::EnterDir { path, node, .. } => {
                let dir_path = safe_join(target, path)?;
                tokio::fs::create_dir_all(&dir_path)
                    .await
                    .map_err(|e| Error::Other(format!("{}: {e}", dir_path.display())))?;
                if let Some(node) = node {
                    dirs.push((dir_path, node.clone()));
                }
            }
            WalkEvent::File { path, node } => {
                let file_path = safe_join(target, path)?;
                match create_entry(&file_path, node).await {
                    Ok(true) => files.push((file_path, node.clone())),
                    Ok(false) => {}
                    Err(e) => stats.errors.push(format!("{path}: {e}")),
                }
            }
            WalkEvent::LeaveDir { .. } => {}
        }
    }

    // Pass 2: fetch content pack by pack, writing each chunk at its
    // plaintext offset within its file.
    let (jobs, plan_errors) = plan_chunk_jobs(&repo, &files);
    stats.errors.extend(plan_errors);

    let workers = repo.options().restorer_workers.max(1);
    let cache = Arc::new(PackCache::new(repo.options().pack_cache_bytes));
    let write_errors = Arc::new(Mutex::new(Vec::new()));
    let bytes_written = Arc::new(std::sync::atomic::AtomicU64::new(0));

    // Visited in ascending order (== ascending hex order, since `Id`'s
    // derived `Ord` compares the same bytes hex encodes) so restore is
    // reproducible across runs regardless of `HashMap` iteration order.
    let mut pack_ids: Vec<Id> = jobs.keys().copied().collect();
    pack_ids.sort();
    stream::iter(pack_ids)
        .for_each_concurrent(workers, |pack_id| {
            let repo = repo.clone();
            let cache = cache.clone();
            let write_errors = write_errors.clone();
            let bytes_written = bytes_written.clone();
            let chunk_jobs = jobs.get(&pack_id).cloned().unwrap_or_default();
            let cancel = cancel.clone();
            async move {
                if cancel.is_canceled() {
                    return;
                }
                match restore_pack(&repo, &cache, pack_id, &chunk_jobs).await {
                    Ok((written, chunk_errors)) => {
                        bytes_written.fetch_add(written, std::sync::atomic::Ordering::Relaxed);
                        write_errors.lock().extend(chunk_errors);
                    }
                    Err(e) => write_errors.lock().push(e.to_string()),
                }
            }
        })
        .await;

    stats.errors.extend(Arc::try_unwrap(write_errors).map(|m| m.into_inner()).unwrap_or_default());
    stats.bytes_written = bytes_written.load(std::sync::atomic::Ordering::Relaxed);

    // Pass 3: file metadata, now that every file's content is settled.
    for (path, node) in &files {
        if let Err(e) = restore_metadata(path, node).await {
            stats.errors.push(format!("{}: {e}", path.display()));
        } else {
            stats.files_restored += 1;
        }
    }

    // Pass 4: directory metadata, children-before-parents (the walk
    // already emitted `dirs` in post-order).
    for (path, node) in dirs.iter().rev() {
        if let Err(e) = restore_metadata(path, node).await {
            stats.errors.push(format!("{}: {e}", path.display()));
        } else {
            stats.dirs_restored += 1;
        }
    }

    Ok(stats)
}

/// Rejects any path carrying a `..` component, so a tampered or foreign
/// tree blob can't write outside `base`.
fn safe_join(base: &Path, rel: &str) -> Result<PathBuf> {
    let mut result = base.to_path_buf();
    for component in rel.split('/') {
        if component.is_empty() || component == "." {
            continue;
        }
        if component == ".." {
            return Err(Error::PathEscapesTarget(rel.to_string()));
        }
        result.push(component);
    }
    Ok(result)
}

/// Creates one non-directory entry. Returns `Ok(true)` for a regular
/// file (which still needs its content written), `Ok(false)` for
/// anything handled in full right here (symlink, device, skipped
/// socket).
async fn create_entry(path: &Path, node: &Node) -> Result<bool> {
    match node.kind {
        NodeKind::File => {
            let file = std::fs::File::create(path).map_err(|e| Error::Other(e.to_string()))?;
            file.set_len(node.size).map_err(|e| Error::Other(e.to_string()))?;
            Ok(true)
        }
        NodeKind::Symlink => {
            let target = node
                .link_target
                .as_deref()
                .ok_or_else(|| Error::Other("symlink node missing link_target".into()))?;
            tokio::fs::symlink(target, path)
                .await
                .map_err(|e| Error::Other(e.to_string()))?;
            Ok(false)
        }
        NodeKind::Fifo => {
            mkfifo(path, node.mode)?;
            Ok(false)
        }
        NodeKind::Chardev | NodeKind::Blockdev => {
            mknod_device(path, node)?;
            Ok(false)
        }
        NodeKind::Socket => {
            warn!(path = %path.display(), "skipping socket, cannot be recreated on restore");
            Ok(false)
        }
        NodeKind::Dir => unreachable!("directories are handled as EnterDir events"),
    }
}

fn mkfifo(path: &Path, mode: u32) -> Result<()> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|e| Error::Other(e.to_string()))?;
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), mode as libc::mode_t) };
    if rc != 0 {
        return Err(Error::Other(std::io::Error::last_os_error().to_string()));
    }
    Ok(())
}

fn mknod_device(path: &Path, node: &Node) -> Result<()> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|e| Error::Other(e.to_string()))?;
    let mode_flag = match node.kind {
        NodeKind::Chardev => libc::S_IFCHR,
        NodeKind::Blockdev => libc::S_IFBLK,
        _ => unreachable!(),
    };
    let rc = unsafe {
        libc::mknod(
            c_path.as_ptr(),
            (mode_flag | (node.mode & 0o777)) as libc::mode_t,
            node.device as libc::dev_t,
        )
    };
    if rc != 0 {
        return Err(Error::Other(std::io::Error::last_os_error().to_string()));
    }
    Ok(())
}

async fn restore_metadata(path: &Path, node: &Node) -> Result<()> {
    let path = path.to_path_buf();
    let node = node.clone();
    tokio::task::spawn_blocking(move || {
        chown(&path, node.uid, node.gid)?;
        if node.kind != NodeKind::Symlink {
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(node.mode & 0o7777))
                .map_err(|e| Error::Other(e.to_string()))?;
        }
        for (name, value) in &node.xattrs {
            xattr::set(&path, name, value).ok();
        }
        set_times(&path, &node)
    })
    .await
    .map_err(|e| Error::Other(e.to_string()))?
}

/// `lchown(2)` (doesn't follow a symlink's target, so a symlink entry
/// gets its own ownership rather than its target's — the same reason
/// `set_times` uses `AT_SYMLINK_NOFOLLOW`). Restoring ownership requires
/// `CAP_CHOWN`/root in the common case; run unprivileged, every call
/// fails with `EPERM`, which is ignored rather than treated as a
/// restore error.
fn chown(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|e| Error::Other(e.to_string()))?;
    let rc = unsafe { libc::lchown(c_path.as_ptr(), uid as libc::uid_t, gid as libc::gid_t) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            return Ok(());
        }
        return Err(Error::Other(err.to_string()));
    }
    Ok(())
}

/// `utimensat(2)` with `AT_SYMLINK_NOFOLLOW` for symlinks, so a
/// symlink's own timestamp is set rather than its target's.
fn set_times(path: &Path, node: &Node) -> Result<()> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|e| Error::Other(e.to_string()))?;
    let times = [
        libc::timespec {
            tv_sec: node.atime.timestamp(),
            tv_nsec: node.atime.timestamp_subsec_nanos() as libc::c_long,
        },
        libc::timespec {
            tv_sec: node.mtime.timestamp(),
            tv_nsec: node.mtime.timestamp_subsec_nanos() as libc::c_long,
        },
    ];
    let flags = if node.kind == NodeKind::Symlink {
        libc::AT_SYMLINK_NOFOLLOW
    } else {
        0
    };
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), flags) };
    if rc != 0 {
        return Err(Error::Other(std::io::Error::last_os_error().to_string()));
    }
    Ok(())
}

#[derive(Clone)]
struct ChunkJob {
    file_path: Arc<PathBuf>,
    file_offset: u64,
    id: Id,
    location: Location,
}

/// Groups every file's chunks by the pack that holds them, computing
/// each chunk's offset within its destination file purely from index
/// metadata.
fn plan_chunk_jobs(
    repo: &Repository,
    files: &[(PathBuf, Node)],
) -> (HashMap<Id, Vec<ChunkJob>>, Vec<String>) {
    let mut jobs: HashMap<Id, Vec<ChunkJob>> = HashMap::new();
    let mut errors = Vec::new();

    for (path, node) in files {
        if node.content.is_empty() {
            continue;
        }
        let path = Arc::new(path.clone());
        let mut offset = 0u64;
        for id in &node.content {
            let Some(location) = repo.locate_blob(id) else {
                errors.push(format!("{}: missing chunk {}", path.display(), id));
                break;
            };
            jobs.entry(location.pack_id).or_default().push(ChunkJob {
                file_path: path.clone(),
                file_offset: offset,
                id: *id,
                location,
            });
            offset += location.length as u64 - SEAL_OVERHEAD;
        }
    }
    (jobs, errors)
}

/// Fetches one pack (through the shared cache) and writes every chunk
/// this restore needs from it, re-verifying each chunk's hash before it
/// touches disk, catching corruption at restore time rather than later.
///
/// A pack shared by several unrelated files means a single corrupt or
/// unauthenticated chunk must only fail the file it belongs to: each
/// job's error is caught and recorded against its own `file_path`
/// rather than aborting the remaining jobs in this pack. Only a
/// failure to fetch the pack itself (size lookup, download) aborts all
/// jobs queued against it, since none of them can proceed without it.
async fn restore_pack(
    repo: &Repository,
    cache: &PackCache,
    pack_id: Id,
    jobs: &[ChunkJob],
) -> Result<(u64, Vec<String>)> {
    if jobs.is_empty() {
        return Ok((0, Vec::new()));
    }
    let size = repo.pack_size(pack_id).await?;
    let pack_bytes = cache.get_or_fetch(pack_id, || repo.load_pack(pack_id, size)).await?;

    let mut written = 0u64;
    let mut errors = Vec::new();
    for job in jobs {
        match restore_chunk(repo, &pack_bytes, pack_id, job).await {
            Ok(len) => written += len,
            Err(e) => errors.push(format!("{}: {e}", job.file_path.display())),
        }
    }
    Ok((written, errors))
}

async fn restore_chunk(repo: &Repository, pack_bytes: &[u8], pack_id: Id, job: &ChunkJob) -> Result<u64> {
    let start = job.location.offset as usize;
    let end = start + job.location.length as usize;
    let sealed = pack_bytes
        .get(start..end)
        .ok_or_else(|| Error::Other(format!("pack {pack_id}: chunk range out of bounds")))?;

    let plaintext = repo.open_sealed(sealed)?;
    let actual = Id::of(&plaintext);
    if actual != job.id {
        return Err(Error::Castore(backup_castore::Error::CorruptHash {
            expected: job.id.to_hex(),
            actual: actual.to_hex(),
        }));
    }

    let path = job.file_path.clone();
    let offset = job.file_offset;
    let len = plaintext.len() as u64;
    tokio::task::spawn_blocking(move || write_at(&path, offset, &plaintext))
        .await
        .map_err(|e| Error::Other(e.to_string()))??;
    Ok(len)
}

fn write_at(path: &Path, offset: u64, data: &[u8]) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| Error::Other(e.to_string()))?;
    file.write_all_at(data, offset)
        .map_err(|e| Error::Other(e.to_string()))
}

/// LRU pack cache with a byte budget rather than an entry-count cap: a
/// repository's packs vary widely in size, so capping by count either
/// wastes memory or evicts too eagerly. Recency tracking itself is an
/// ordinary unbounded [`lru::LruCache`]; the budget is enforced by
/// popping its least-recently-used end after every insert. Entries are
/// `Arc<Vec<u8>>`, so a reader holds its own reference and keeps working
/// even if the entry is evicted by a later fetch.
struct PackCache {
    budget: u64,
    state: Mutex<PackCacheState>,
}

struct PackCacheState {
    bytes: u64,
    lru: lru::LruCache<Id, Arc<Vec<u8>>>,
}

impl PackCache {
    fn new(budget: u64) -> Self {
        Self {
            budget,
            state: Mutex::new(PackCacheState {
                bytes: 0,
                lru: lru::LruCache::unbounded(),
            }),
        }
    }

    async fn get_or_fetch<F, Fut>(&self, pack_id: Id, fetch: F) -> Result<Arc<Vec<u8>>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<u8>>>,
    {
        if let Some(hit) = self.state.lock().lru.get(&pack_id).cloned() {
            return Ok(hit);
        }
        let bytes = Arc::new(fetch().await?);

        let mut state = self.state.lock();
        state.bytes += bytes.len() as u64;
        state.lru.put(pack_id, bytes.clone());
        while state.bytes > self.budget && state.lru.len() > 1 {
            let Some((_, evicted)) = state.lru.pop_lru() else {
                break;
            };
            state.bytes = state.bytes.saturating_sub(evicted.len() as u64);
        }
        Ok(bytes)
    }
}
