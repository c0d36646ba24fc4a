//! Index and master index: the mapping from blob id to
//! where it physically lives, so that loading a blob never requires
//! scanning every pack in the repository.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::id::Id;
use crate::pack::BlobType;

/// Where a blob lives: which pack, and the (offset, length) of its
/// sealed bytes within that pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub pack_id: Id,
    pub blob_type: BlobType,
    pub offset: u64,
    pub length: u32,
}

/// One pack's worth of entries, as stored in an index file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexPackEntry {
    id: Id,
    blobs: Vec<IndexBlobEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexBlobEntry {
    id: Id,
    #[serde(rename = "type")]
    blob_type: BlobType,
    offset: u64,
    length: u32,
}

/// The persistent, on-disk form of a single index file: a flat list of
/// packs, each with the blobs it contains.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexFile {
    packs: Vec<IndexPackEntry>,
}

/// One loaded index: an in-memory `id -> Location` map built from an
/// [`IndexFile`] (or accumulated directly, for the in-progress index).
#[derive(Debug, Default)]
pub struct Index {
    entries: HashMap<Id, Location>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(file: &IndexFile) -> Self {
        let mut entries = HashMap::new();
        for pack in &file.packs {
            for blob in &pack.blobs {
                entries.entry(blob.id).or_insert(Location {
                    pack_id: pack.id,
                    blob_type: blob.blob_type,
                    offset: blob.offset,
                    length: blob.length,
                });
            }
        }
        Self { entries }
    }

    pub fn get(&self, id: &Id) -> Option<Location> {
        self.entries.get(id).copied()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.entries.contains_key(id)
    }

    pub fn insert(&mut self, id: Id, location: Location) {
        self.entries.entry(id).or_insert(location);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serializes this index's contents as a single pack's worth of
    /// entries under `pack_id`, suitable for writing a fresh index file
    /// that covers one flushed pack.
    pub fn to_file_for_pack(pack_id: Id, blobs: &[crate::pack::BlobEntry]) -> IndexFile {
        IndexFile {
            packs: vec![IndexPackEntry {
                id: pack_id,
                blobs: blobs
                    .iter()
                    .map(|b| IndexBlobEntry {
                        id: b.id,
                        blob_type: b.blob_type,
                        offset: b.offset,
                        length: b.length,
                    })
                    .collect(),
            }],
        }
    }
}

/// The union of every loaded index plus an in-progress index for blobs
/// saved during the current operation. Readers see a
/// consistent snapshot-free view: lookups scan loaded indices in a
/// fixed order, then the in-progress index, and the first hit wins —
/// matching the "duplicate id across indices is a hint, not an error"
/// policy.
///
/// Safe for concurrent readers with a single writer: the writer is
/// always the current operation's blob-save path, which only appends to
/// the in-progress index.
pub struct MasterIndex {
    loaded: RwLock<Vec<Arc<Index>>>,
    in_progress: RwLock<Index>,
}

impl MasterIndex {
    pub fn new() -> Self {
        Self {
            loaded: RwLock::new(Vec::new()),
            in_progress: RwLock::new(Index::new()),
        }
    }

    /// Adds a fully-loaded index to the set consulted by lookups.
    pub fn add_loaded(&self, index: Index) {
        self.loaded.write().push(Arc::new(index));
    }

    /// Records a just-written blob so subsequent lookups in this
    /// operation see it without waiting for a flushed index file.
    pub fn insert(&self, id: Id, location: Location) {
        self.in_progress.write().insert(id, location);
    }

    pub fn get(&self, id: &Id) -> Option<Location> {
        for idx in self.loaded.read().iter() {
            if let Some(loc) = idx.get(id) {
                return Some(loc);
            }
        }
        self.in_progress.read().get(id)
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.get(id).is_some()
    }

    /// Total blob count across all loaded indices plus the in-progress
    /// one. Duplicates across indices are counted once per index they
    /// appear in (this is a diagnostic count, not a dedup count).
    pub fn len(&self) -> usize {
        let loaded: usize = self.loaded.read().iter().map(|i| i.len()).sum();
        loaded + self.in_progress.read().len()
    }
}

impl Default for MasterIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(byte: u8) -> Location {
        Location {
            pack_id: Id::of(&[byte]),
            blob_type: BlobType::Data,
            offset: 0,
            length: 10,
        }
    }

    #[test]
    fn in_progress_lookup_sees_inserted_blobs() {
        let mi = MasterIndex::new();
        let id = Id::of(b"blob-a");
        assert!(mi.get(&id).is_none());
        mi.insert(id, loc(1));
        assert_eq!(mi.get(&id).unwrap().offset, 0);
    }

    #[test]
    fn loaded_index_wins_over_later_loaded_index_on_duplicate() {
        let mi = MasterIndex::new();
        let id = Id::of(b"dup");

        let mut first = Index::new();
        first.insert(id, loc(1));
        mi.add_loaded(first);

        let mut second = Index::new();
        second.insert(id, loc(2));
        mi.add_loaded(second);

        assert_eq!(mi.get(&id).unwrap().pack_id, Id::of(&[1u8]));
    }

    #[test]
    fn loaded_index_takes_priority_over_in_progress() {
        let mi = MasterIndex::new();
        let id = Id::of(b"x");
        let mut loaded = Index::new();
        loaded.insert(id, loc(9));
        mi.add_loaded(loaded);
        mi.insert(id, loc(42));
        assert_eq!(mi.get(&id).unwrap().pack_id, Id::of(&[9u8]));
    }

    #[test]
    fn index_file_round_trips_through_json() {
        let pack_id = Id::of(b"pack");
        let entries = vec![crate::pack::BlobEntry {
            blob_type: BlobType::Tree,
            id: Id::of(b"blob"),
            offset: 0,
            length: 50,
        }];
        let file = Index::to_file_for_pack(pack_id, &entries);
        let json = serde_json::to_string(&file).unwrap();
        let back: IndexFile = serde_json::from_str(&json).unwrap();
        let index = Index::from_file(&back);
        assert_eq!(index.get(&Id::of(b"blob")).unwrap().pack_id, pack_id);
    }
}
