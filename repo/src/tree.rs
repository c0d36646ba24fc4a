//! The tree model: the `Node` and `Tree` types that
//! make up a snapshot's directory structure, plus the lazy walker that
//! drives both the archiver's parent comparison and the restorer's
//! pack-centric scheduler.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use backup_castore::id::Id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::repository::Repository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Dir,
    Symlink,
    Chardev,
    Blockdev,
    Fifo,
    Socket,
}

/// One filesystem entry's metadata. Names are stored as verbatim bytes
/// on most filesystems but represented as a lossy `String` here — a
/// `bstr`-flavored treatment of filenames is overkill for a JSON wire
/// format, since the JSON itself carries UTF-8 already.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub mode: u32,
    pub mtime: DateTime<Utc>,
    pub atime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
    pub uid: u32,
    pub gid: u32,
    pub user: String,
    pub group: String,
    pub inode: u64,
    pub size: u64,
    pub links: u64,
    pub device: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub xattrs: BTreeMap<String, Vec<u8>>,
    /// Content chunk ids, in order, for `Kind::File`. Empty for an empty
    /// file.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<Id>,
    /// Subtree id, for `Kind::Dir`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtree: Option<Id>,
    /// Set when this entry could not be backed up or restored; carried
    /// instead of aborting the whole operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A directory's contents: nodes sorted by name, serialized
/// as canonical JSON and stored as a `tree` blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    pub fn new(mut nodes: Vec<Node>) -> Self {
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Self { nodes }
    }

    /// Canonical encoding: nodes sorted by name (enforced by
    /// [`Tree::new`]), keys emitted in a fixed field order by `derive`,
    /// no extraneous whitespace. Two trees with the same node list
    /// byte-identical inputs always serialize identically, which is what
    /// lets the archiver detect "root tree unchanged" on re-backup.
    pub fn to_canonical_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("tree serializes infallibly")
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes
            .binary_search_by(|n| n.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.nodes[i])
    }
}

/// A cooperative cancellation token, checked at each walker step. Cheap
/// to clone and share across threads.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One event from [`walk`], in the order a depth-first traversal of
/// sorted node names would produce them. The walker never follows
/// symlinks.
#[derive(Debug)]
pub enum WalkEvent {
    /// `node` is `None` only for the synthetic root, which has no [`Node`]
    /// of its own (its metadata lives in the snapshot, not the tree).
    EnterDir {
        path: String,
        tree: Id,
        node: Option<Node>,
    },
    File { path: String, node: Node },
    LeaveDir { path: String },
}

/// Walks the tree rooted at `root` id, loading subtrees on demand (one
/// blob fetch per directory) and emitting events depth-first, sorted by
/// name within each directory. Stops early, with no further blob fetches
/// or events, if `cancel` is set.
pub async fn walk(
    repo: &Repository,
    root: Id,
    cancel: &CancelToken,
) -> Result<Vec<WalkEvent>> {
    let mut events = Vec::new();
    walk_into(repo, root, String::new(), None, cancel, &mut events).await?;
    Ok(events)
}

fn walk_into<'a>(
    repo: &'a Repository,
    tree_id: Id,
    path: String,
    dir_node: Option<Node>,
    cancel: &'a CancelToken,
    events: &'a mut Vec<WalkEvent>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        if cancel.is_canceled() {
            return Err(Error::Castore(backup_castore::Error::Canceled));
        }

        events.push(WalkEvent::EnterDir {
            path: path.clone(),
            tree: tree_id,
            node: dir_node,
        });

        let tree_bytes = repo.load_blob(tree_id).await?;
        let tree = Tree::from_json(&tree_bytes)
            .map_err(|e| Error::Other(format!("malformed tree blob: {e}")))?;

        for node in tree.nodes {
            if cancel.is_canceled() {
                return Err(Error::Castore(backup_castore::Error::Canceled));
            }
            let child_path = if path.is_empty() {
                node.name.clone()
            } else {
                format!("{path}/{}", node.name)
            };
            match (node.kind, node.subtree) {
                (NodeKind::Dir, Some(subtree)) => {
                    let node_for_dir = node.clone();
                    walk_into(repo, subtree, child_path, Some(node_for_dir), cancel, events).await?;
                }
                _ => events.push(WalkEvent::File {
                    path: child_path,
                    node,
                }),
            }
        }

        events.push(WalkEvent::LeaveDir { path });
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, kind: NodeKind) -> Node {
        Node {
            name: name.to_string(),
            kind,
            mode: 0o644,
            mtime: Utc::now(),
            atime: Utc::now(),
            ctime: Utc::now(),
            uid: 0,
            gid: 0,
            user: "root".into(),
            group: "root".into(),
            inode: 0,
            size: 0,
            links: 1,
            device: 0,
            link_target: None,
            xattrs: BTreeMap::new(),
            content: Vec::new(),
            subtree: None,
            error: None,
        }
    }

    #[test]
    fn tree_new_sorts_by_name() {
        let tree = Tree::new(vec![
            node("b", NodeKind::File),
            node("a", NodeKind::File),
            node("c", NodeKind::File),
        ]);
        let names: Vec<_> = tree.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn identical_node_lists_serialize_identically() {
        let mtime = Utc::now();
        let mut a = node("x", NodeKind::File);
        a.mtime = mtime;
        a.atime = mtime;
        a.ctime = mtime;
        let mut b = a.clone();
        b.mtime = mtime;

        let tree_a = Tree::new(vec![a]);
        let tree_b = Tree::new(vec![b]);
        assert_eq!(tree_a.to_canonical_json(), tree_b.to_canonical_json());
    }

    #[test]
    fn tree_round_trips_through_json() {
        let tree = Tree::new(vec![node("f", NodeKind::File), node("d", NodeKind::Dir)]);
        let json = tree.to_canonical_json();
        let back = Tree::from_json(&json).unwrap();
        assert_eq!(back.nodes.len(), 2);
    }

    #[test]
    fn node_lookup_by_name() {
        let tree = Tree::new(vec![node("b", NodeKind::File), node("a", NodeKind::File)]);
        assert!(tree.node("a").is_some());
        assert!(tree.node("zzz").is_none());
    }

    proptest::proptest! {
        #[test]
        fn canonical_json_is_independent_of_input_order(
            mut names in proptest::collection::hash_set("[a-z]{1,8}", 1..12),
        ) {
            let nodes: Vec<Node> = names.drain().map(|n| node(&n, NodeKind::File)).collect();

            let mut reversed = nodes.clone();
            reversed.reverse();

            let tree_a = Tree::new(nodes);
            let tree_b = Tree::new(reversed);

            proptest::prop_assert_eq!(tree_a.to_canonical_json(), tree_b.to_canonical_json());
        }
    }
}
