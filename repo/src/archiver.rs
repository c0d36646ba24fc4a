//! The archiver: scanner → filter → per-file worker pool
//! → chunker → repository, driving one backup run end to end.

use std::collections::BTreeMap;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use backup_castore::chunker::Chunker;
use backup_castore::id::Id;
use backup_castore::pack::BlobType;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{instrument, warn};

use crate::error::{Error, Result};
use crate::lock;
use crate::repository::Repository;
use crate::snapshot::{Excludes, Snapshot};
use crate::tree::{CancelToken, Node, NodeKind, Tree};

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Top-level paths to back up; each becomes one entry of the root
    /// tree, named by its final path component.
    pub paths: Vec<PathBuf>,
    /// Name-only exclude patterns, evaluated against each entry's bare
    /// name before it's stat'd.
    pub excludes: Vec<String>,
    /// Parent snapshot to diff against for unchanged-file reuse.
    pub parent: Option<Id>,
    /// Skips parent-based reuse even when a parent snapshot is given.
    pub force: bool,
    pub tags: Vec<String>,
}

/// Drives one backup run to completion: acquires a non-exclusive
/// repository lock for the run's duration, scans `opts.paths`, saves
/// every new chunk and tree, and returns the id of the snapshot it
/// wrote. The lock is refreshed in the background and released
/// whether the run succeeds or fails.
#[instrument(skip(repo, opts, cancel))]
pub async fn backup(
    repo: Arc<Repository>,
    opts: BackupOptions,
    cancel: CancelToken,
) -> Result<Id> {
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

    let result = run_backup(repo.clone(), opts, cancel).await;

    lock_cancel.cancel();
    let guard = refresh_handle
        .await
        .map_err(|e| Error::Other(format!("lock refresh task panicked: {e}")))?;
    lock::unlock(repo.backend().as_ref(), guard).await?;

    result
}

async fn run_backup(repo: Arc<Repository>, opts: BackupOptions, cancel: CancelToken) -> Result<Id> {
    repo.load_indices().await?;

    let parent_tree = match opts.parent {
        Some(parent_id) => {
            let snap = repo.load_snapshot(parent_id).await?;
            let bytes = repo.load_blob(snap.tree).await?;
            Some(Tree::from_json(&bytes).map_err(|e| Error::Other(format!("malformed parent tree: {e}")))?)
        }
        None => None,
    };

    let excludes: Arc<[glob::Pattern]> = opts
        .excludes
        .iter()
        .filter_map(|p| glob::Pattern::new(p).ok())
        .collect::<Vec<_>>()
        .into();

    let ctx = Arc::new(Ctx {
        repo: repo.clone(),
        semaphore: Arc::new(Semaphore::new(repo.options().archiver_workers.max(1))),
        excludes,
        force: opts.force,
        cancel: cancel.clone(),
    });

    let mut root_nodes = Vec::with_capacity(opts.paths.len());
    for path in &opts.paths {
        if cancel.is_canceled() {
            return Err(Error::Castore(backup_castore::Error::Canceled));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        let parent_node = parent_tree.as_ref().and_then(|t| t.node(&name));
        let node = scan_entry(ctx.clone(), path.clone(), name, parent_node.cloned()).await;
        root_nodes.push(node);
    }

    let root_tree = Tree::new(root_nodes);
    let root_tree_bytes = root_tree.to_canonical_json();
    let root_tree_id = Id::of(&root_tree_bytes);
    repo.save_blob(BlobType::Tree, root_tree_id, &root_tree_bytes).await?;
    repo.flush().await?;

    let (local_uid, local_gid) = crate::lock::local_ids();
    let snapshot = Snapshot {
        time: chrono::Local::now(),
        parent: opts.parent,
        tree: root_tree_id,
        paths: opts
            .paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect(),
        hostname: repo.hostname().to_string(),
        username: repo.username().to_string(),
        uid: local_uid,
        gid: local_gid,
        excludes: if opts.excludes.is_empty() {
            None
        } else {
            Some(Excludes {
                patterns: opts.excludes.clone(),
            })
        },
        tags: opts.tags,
    };
    repo.save_snapshot(&snapshot).await
}

struct Ctx {
    repo: Arc<Repository>,
    semaphore: Arc<Semaphore>,
    excludes: Arc<[glob::Pattern]>,
    force: bool,
    cancel: CancelToken,
}

fn scan_entry(
    ctx: Arc<Ctx>,
    path: PathBuf,
    name: String,
    parent_node: Option<Node>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Node> + Send>> {
    Box::pin(async move {
        let metadata = match tokio::fs::symlink_metadata(&path).await {
            Ok(m) => m,
            Err(e) => return error_node(name, e),
        };

        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            NodeKind::Symlink
        } else if file_type.is_dir() {
            NodeKind::Dir
        } else if file_type.is_file() {
            NodeKind::File
        } else if file_type.is_char_device() {
            NodeKind::Chardev
        } else if file_type.is_block_device() {
            NodeKind::Blockdev
        } else if file_type.is_fifo() {
            NodeKind::Fifo
        } else {
            NodeKind::Socket
        };

        let mut node = base_node(&name, kind, &metadata);
        node.xattrs = read_xattrs(&path);

        match kind {
            NodeKind::Dir => match scan_dir(&ctx, &path, parent_node.as_ref()).await {
                Ok(children) => {
                    let tree = Tree::new(children);
                    let bytes = tree.to_canonical_json();
                    let id = Id::of(&bytes);
                    if let Err(e) = ctx.repo.save_blob(BlobType::Tree, id, &bytes).await {
                        node.error = Some(e.to_string());
                        return node;
                    }
                    node.subtree = Some(id);
                }
                Err(e) => node.error = Some(e.to_string()),
            },
            NodeKind::Symlink => match tokio::fs::read_link(&path).await {
                Ok(target) => node.link_target = Some(target.to_string_lossy().into_owned()),
                Err(e) => node.error = Some(e.to_string()),
            },
            NodeKind::File => {
                if !ctx.force {
                    if let Some(parent) = &parent_node {
                        if unchanged(parent, &node) {
                            node.content = parent.content.clone();
                            return node;
                        }
                    }
                }
                match chunk_and_save_file(&ctx, &path).await {
                    Ok(ids) => node.content = ids,
                    Err(e) => node.error = Some(e.to_string()),
                }
            }
            NodeKind::Chardev | NodeKind::Blockdev | NodeKind::Fifo | NodeKind::Socket => {}
        }

        node
    })
}

/// Unchanged-file test: name, kind, size, mtime,
/// ctime, and inode all match the parent's node of the same name.
fn unchanged(parent: &Node, candidate: &Node) -> bool {
    parent.name == candidate.name
        && parent.kind == candidate.kind
        && parent.size == candidate.size
        && parent.mtime == candidate.mtime
        && parent.ctime == candidate.ctime
        && parent.inode == candidate.inode
}

async fn scan_dir(ctx: &Arc<Ctx>, path: &Path, parent_node: Option<&Node>) -> Result<Vec<Node>> {
    if ctx.cancel.is_canceled() {
        return Err(Error::Castore(backup_castore::Error::Canceled));
    }

    let mut read_dir = tokio::fs::read_dir(path)
        .await
        .map_err(|e| Error::PermissionDenied(format!("{}: {e}", path.display())))?;

    let mut entries = Vec::new();
    loop {
        let next = read_dir
            .next_entry()
            .await
            .map_err(|e| Error::Other(e.to_string()))?;
        let Some(entry) = next else { break };
        let name = entry.file_name().to_string_lossy().into_owned();
        if ctx.excludes.iter().any(|pat| pat.matches(&name)) {
            continue;
        }
        entries.push((name, entry.path()));
    }

    // Parent tree loaded lazily per child, to avoid fetching subtrees
    // for directories that turn out unchanged (handled at the file
    // level already) or whose parent counterpart doesn't exist.
    let parent_tree: Option<Tree> = match parent_node.and_then(|n| n.subtree) {
        Some(subtree_id) => {
            let bytes = ctx.repo.load_blob(subtree_id).await?;
            Some(Tree::from_json(&bytes).map_err(|e| Error::Other(format!("malformed parent tree: {e}")))?)
        }
        None => None,
    };

    let mut tasks = JoinSet::new();
    for (name, child_path) in entries {
        let ctx = ctx.clone();
        let parent_node = parent_tree.as_ref().and_then(|t| t.node(&name)).cloned();
        tasks.spawn(async move { scan_entry(ctx, child_path, name, parent_node).await });
    }

    let mut nodes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(node) => nodes.push(node),
            Err(e) => warn!(error = %e, "archiver worker task panicked"),
        }
    }
    Ok(nodes)
}

/// Reads a file chunk by chunk, saving each chunk and collecting its id,
/// without ever holding the whole file in memory. Bounded by the shared
/// semaphore so only a small number of files are being read
/// concurrently.
async fn chunk_and_save_file(ctx: &Arc<Ctx>, path: &Path) -> Result<Vec<Id>> {
    let _permit = ctx
        .semaphore
        .clone()
        .acquire_owned()
        .await
        .expect("semaphore is never closed");

    let poly = ctx.repo.chunker_polynomial();
    let path = path.to_path_buf();
    let file = tokio::task::spawn_blocking(move || std::fs::File::open(&path))
        .await
        .map_err(|e| Error::Other(e.to_string()))?
        .map_err(|e| Error::VanishedFile(e.to_string()))?;

    let mut chunker = Chunker::new(std::io::BufReader::with_capacity(256 * 1024, file), poly);
    let mut ids = Vec::new();
    loop {
        if ctx.cancel.is_canceled() {
            return Err(Error::Castore(backup_castore::Error::Canceled));
        }
        let (result, returned) = tokio::task::spawn_blocking(move || {
            let result = chunker.next_chunk();
            (result, chunker)
        })
        .await
        .map_err(|e| Error::Other(e.to_string()))?;
        chunker = returned;

        match result.map_err(|e| Error::Other(e.to_string()))? {
            None => break,
            Some(chunk) => {
                ids.push(chunk.digest);
                ctx.repo
                    .save_blob(BlobType::Data, chunk.digest, &chunk.data)
                    .await?;
            }
        }
    }
    Ok(ids)
}

fn base_node(name: &str, kind: NodeKind, metadata: &std::fs::Metadata) -> Node {
    Node {
        name: name.to_string(),
        kind,
        mode: metadata.mode(),
        mtime: time_of(metadata.mtime(), metadata.mtime_nsec()),
        atime: time_of(metadata.atime(), metadata.atime_nsec()),
        ctime: time_of(metadata.ctime(), metadata.ctime_nsec()),
        uid: metadata.uid(),
        gid: metadata.gid(),
        user: metadata.uid().to_string(),
        group: metadata.gid().to_string(),
        inode: metadata.ino(),
        size: metadata.size(),
        links: metadata.nlink(),
        device: metadata.rdev(),
        link_target: None,
        xattrs: BTreeMap::new(),
        content: Vec::new(),
        subtree: None,
        error: None,
    }
}

fn time_of(secs: i64, nsecs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, nsecs as u32).unwrap_or_else(Utc::now)
}

fn error_node(name: String, e: std::io::Error) -> Node {
    Node {
        name,
        kind: NodeKind::File,
        mode: 0,
        mtime: Utc::now(),
        atime: Utc::now(),
        ctime: Utc::now(),
        uid: 0,
        gid: 0,
        user: String::new(),
        group: String::new(),
        inode: 0,
        size: 0,
        links: 0,
        device: 0,
        link_target: None,
        xattrs: BTreeMap::new(),
        content: Vec::new(),
        subtree: None,
        error: Some(if e.kind() == std::io::ErrorKind::PermissionDenied {
            format!("permission denied: {e}")
        } else {
            format!("vanished during backup: {e}")
        }),
    }
}

fn read_xattrs(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut map = BTreeMap::new();
    let Ok(names) = xattr::list(path) else {
        return map;
    };
    for name in names {
        if let Ok(Some(value)) = xattr::get(path, &name) {
            map.insert(name.to_string_lossy().into_owned(), value);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::RepositoryOptions;
    use std::io::Write;
    use tempfile::tempdir;

    async fn init_repo() -> (Arc<Repository>, tempfile::TempDir) {
        let repo_dir = tempdir().unwrap();
        let backend: Arc<dyn backup_castore::backend::Backend> =
            Arc::new(backup_castore::backend::LocalBackend::new(repo_dir.path()));
        let repo = Repository::init(backend, "pw", RepositoryOptions::default())
            .await
            .unwrap();
        (Arc::new(repo), repo_dir)
    }

    #[tokio::test]
    async fn backs_up_a_single_small_file() {
        let (repo, _repo_dir) = init_repo().await;
        let src = tempdir().unwrap();
        std::fs::create_dir(src.path().join("src")).unwrap();
        let mut f = std::fs::File::create(src.path().join("src/a.txt")).unwrap();
        f.write_all(b"hello\n").unwrap();
        drop(f);

        let opts = BackupOptions {
            paths: vec![src.path().join("src")],
            ..Default::default()
        };
        let snap_id = backup(repo.clone(), opts, CancelToken::new()).await.unwrap();
        let snap = repo.load_snapshot(snap_id).await.unwrap();

        let root = Tree::from_json(&repo.load_blob(snap.tree).await.unwrap()).unwrap();
        assert_eq!(root.nodes.len(), 1);
        let dir_node = &root.nodes[0];
        assert_eq!(dir_node.kind, NodeKind::Dir);

        let subtree = Tree::from_json(&repo.load_blob(dir_node.subtree.unwrap()).await.unwrap()).unwrap();
        assert_eq!(subtree.nodes.len(), 1);
        let file_node = &subtree.nodes[0];
        assert_eq!(file_node.name, "a.txt");
        assert_eq!(file_node.content.len(), 1);
        assert_eq!(file_node.content[0], Id::of(b"hello\n"));
        assert_eq!(file_node.size, 6);
    }

    #[tokio::test]
    async fn empty_file_has_no_chunks() {
        let (repo, _repo_dir) = init_repo().await;
        let src = tempdir().unwrap();
        std::fs::create_dir(src.path().join("src")).unwrap();
        std::fs::File::create(src.path().join("src/empty.txt")).unwrap();

        let opts = BackupOptions {
            paths: vec![src.path().join("src")],
            ..Default::default()
        };
        let snap_id = backup(repo.clone(), opts, CancelToken::new()).await.unwrap();
        let snap = repo.load_snapshot(snap_id).await.unwrap();
        let root = Tree::from_json(&repo.load_blob(snap.tree).await.unwrap()).unwrap();
        let subtree = Tree::from_json(&repo.load_blob(root.nodes[0].subtree.unwrap()).await.unwrap()).unwrap();
        assert!(subtree.nodes[0].content.is_empty());
        assert_eq!(subtree.nodes[0].size, 0);
    }

    #[tokio::test]
    async fn idempotent_rebackup_uploads_no_new_packs() {
        let (repo, _repo_dir) = init_repo().await;
        let src = tempdir().unwrap();
        std::fs::create_dir(src.path().join("src")).unwrap();
        std::fs::write(src.path().join("src/a.txt"), b"hello\n").unwrap();

        let opts = BackupOptions {
            paths: vec![src.path().join("src")],
            ..Default::default()
        };
        let first = backup(repo.clone(), opts.clone(), CancelToken::new())
            .await
            .unwrap();
        let packs_after_first = repo.list_packs().await.unwrap();

        let opts_with_parent = BackupOptions {
            parent: Some(first),
            ..opts
        };
        let second = backup(repo.clone(), opts_with_parent, CancelToken::new())
            .await
            .unwrap();
        let packs_after_second = repo.list_packs().await.unwrap();

        assert_eq!(packs_after_first.len(), packs_after_second.len());

        let first_snap = repo.load_snapshot(first).await.unwrap();
        let second_snap = repo.load_snapshot(second).await.unwrap();
        assert_eq!(first_snap.tree, second_snap.tree);
    }

    #[tokio::test]
    async fn dedups_identical_files() {
        let (repo, _repo_dir) = init_repo().await;
        let src = tempdir().unwrap();
        std::fs::create_dir(src.path().join("src")).unwrap();
        let data = vec![0u8; 2 * 1024 * 1024];
        std::fs::write(src.path().join("src/a"), &data).unwrap();
        std::fs::write(src.path().join("src/b"), &data).unwrap();

        let opts = BackupOptions {
            paths: vec![src.path().join("src")],
            ..Default::default()
        };
        let snap_id = backup(repo.clone(), opts, CancelToken::new()).await.unwrap();
        let snap = repo.load_snapshot(snap_id).await.unwrap();
        let root = Tree::from_json(&repo.load_blob(snap.tree).await.unwrap()).unwrap();
        let subtree = Tree::from_json(&repo.load_blob(root.nodes[0].subtree.unwrap()).await.unwrap()).unwrap();

        let a = subtree.node("a").unwrap();
        let b = subtree.node("b").unwrap();
        assert_eq!(a.content, b.content);
    }

    #[tokio::test]
    async fn excludes_by_name() {
        let (repo, _repo_dir) = init_repo().await;
        let src = tempdir().unwrap();
        std::fs::create_dir(src.path().join("src")).unwrap();
        std::fs::write(src.path().join("src/keep.txt"), b"x").unwrap();
        std::fs::write(src.path().join("src/skip.log"), b"y").unwrap();

        let opts = BackupOptions {
            paths: vec![src.path().join("src")],
            excludes: vec!["*.log".to_string()],
            ..Default::default()
        };
        let snap_id = backup(repo.clone(), opts, CancelToken::new()).await.unwrap();
        let snap = repo.load_snapshot(snap_id).await.unwrap();
        let root = Tree::from_json(&repo.load_blob(snap.tree).await.unwrap()).unwrap();
        let subtree = Tree::from_json(&repo.load_blob(root.nodes[0].subtree.unwrap()).await.unwrap()).unwrap();
        assert!(subtree.node("keep.txt").is_some());
        assert!(subtree.node("skip.log").is_none());
    }

    fn reference_node() -> Node {
        let now = Utc::now();
        Node {
            name: "a.txt".into(),
            kind: NodeKind::File,
            mode: 0o644,
            mtime: now,
            atime: now,
            ctime: now,
            uid: 0,
            gid: 0,
            user: "0".into(),
            group: "0".into(),
            inode: 7,
            size: 100,
            links: 1,
            device: 0,
            link_target: None,
            xattrs: BTreeMap::new(),
            content: vec![Id::of(b"x")],
            subtree: None,
            error: None,
        }
    }

    #[rstest::rstest]
    #[case(|n: &mut Node| n.size = 200, false)]
    #[case(|n: &mut Node| n.mtime = Utc::now() + chrono::Duration::seconds(1), false)]
    #[case(|n: &mut Node| n.ctime = Utc::now() + chrono::Duration::seconds(1), false)]
    #[case(|n: &mut Node| n.inode = 8, false)]
    #[case(|n: &mut Node| n.kind = NodeKind::Symlink, false)]
    #[case(|_: &mut Node| {}, true)]
    fn unchanged_requires_every_field_to_match(#[case] mutate: fn(&mut Node), #[case] expected: bool) {
        let parent = reference_node();
        let mut candidate = parent.clone();
        mutate(&mut candidate);
        assert_eq!(unchanged(&parent, &candidate), expected);
    }
}
