//! The packer pool: a bounded set of in-progress packers
//! that blob saves are multiplexed across, so that many small blobs end
//! up concatenated into a handful of medium-sized pack files instead of
//! one pack file each.

use backup_castore::id::Id;
use backup_castore::pack::{BlobEntry, BlobType, PackWriter};
use backup_castore::Key;
use parking_lot::Mutex;

/// Packs are flushed once they reach this size even if more blobs would
/// still fit under [`MAX_PACK_SIZE`] — a "low-water mark" that keeps the
/// pool from accumulating many half-empty packers.
pub const LOW_WATER_MARK: usize = 4 * 1024 * 1024;

/// A packer stops accepting new blobs once it would exceed this size.
pub const MAX_PACK_SIZE: usize = 16 * 1024 * 1024;

/// Maximum number of concurrently open packers.
pub const POOL_CAP: usize = 200;

struct Slot {
    writer: PackWriter,
}

/// One packer's worth of finalized output, ready to upload.
pub struct FinishedPack {
    pub bytes: Vec<u8>,
    pub blobs: Vec<BlobEntry>,
}

/// Mutex-protected list of in-progress packers: individual
/// packers are "checked out" for the duration of a single `add_blob`
/// call, never held across an await point, so the pool itself never
/// blocks on backend I/O.
pub struct PackerPool {
    slots: Mutex<Vec<Slot>>,
    low_water_mark: usize,
    pool_cap: usize,
}

impl PackerPool {
    pub fn new() -> Self {
        Self::with_limits(LOW_WATER_MARK, POOL_CAP)
    }

    pub fn with_limits(low_water_mark: usize, pool_cap: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            low_water_mark,
            pool_cap,
        }
    }

    /// Seals `plaintext` under `key` and appends it to a packer with
    /// room for it (opening a new one if none fits), returning any
    /// packer that became eligible for flushing as a result — either
    /// because it crossed [`LOW_WATER_MARK`], or because adding this
    /// blob pushed the pool over [`POOL_CAP`] and the largest packer was
    /// evicted to make room.
    pub fn add_blob(
        &self,
        key: &Key,
        blob_type: BlobType,
        id: Id,
        plaintext: &[u8],
    ) -> Option<FinishedPack> {
        // Rough estimate of sealed size, used only to pick a slot with
        // room; the packer itself tracks its exact size.
        let estimated = plaintext.len() + 32;

        let mut slots = self.slots.lock();
        let idx = slots
            .iter()
            .position(|s| s.writer.len() + estimated <= MAX_PACK_SIZE);

        let idx = match idx {
            Some(i) => i,
            None => {
                slots.push(Slot {
                    writer: PackWriter::new(),
                });
                slots.len() - 1
            }
        };

        slots[idx].writer.add(key, blob_type, id, plaintext);

        let crossed_low_water = slots[idx].writer.len() >= self.low_water_mark;
        let over_cap = slots.len() > self.pool_cap;

        if crossed_low_water {
            let slot = slots.remove(idx);
            return Some(self.finish_slot(slot, key));
        }

        if over_cap {
            let largest = slots
                .iter()
                .enumerate()
                .max_by_key(|(_, s)| s.writer.len())
                .map(|(i, _)| i)
                .expect("pool is non-empty: over_cap implies at least pool_cap+1 slots");
            let slot = slots.remove(largest);
            return Some(self.finish_slot(slot, key));
        }

        None
    }

    fn finish_slot(&self, slot: Slot, key: &Key) -> FinishedPack {
        let (bytes, blobs) = slot.writer.finish(key);
        FinishedPack { bytes, blobs }
    }

    /// Flushes every remaining packer, for end-of-operation cleanup.
    /// Empty packers are dropped, not flushed.
    pub fn drain(&self, key: &Key) -> Vec<FinishedPack> {
        let mut slots = self.slots.lock();
        std::mem::take(&mut *slots)
            .into_iter()
            .filter(|s| !s.writer.is_empty())
            .map(|s| self.finish_slot(s, key))
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.slots.lock().len()
    }
}

impl Default for PackerPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Key {
        Key::random()
    }

    #[test]
    fn small_blobs_share_a_packer_until_low_water_mark() {
        let pool = PackerPool::new();
        let key = key();
        let mut flushed = 0;
        for i in 0..10u32 {
            let data = vec![i as u8; 1024];
            let id = Id::of(&data);
            if pool
                .add_blob(&key, BlobType::Data, id, &data)
                .is_some()
            {
                flushed += 1;
            }
        }
        assert_eq!(flushed, 0);
        assert_eq!(pool.open_count(), 1);
    }

    #[test]
    fn crossing_low_water_mark_flushes_the_packer() {
        let pool = PackerPool::new();
        let key = key();
        let big = vec![0xABu8; LOW_WATER_MARK];
        let id = Id::of(&big);
        let finished = pool.add_blob(&key, BlobType::Data, id, &big);
        assert!(finished.is_some());
        assert_eq!(pool.open_count(), 0);
        let finished = finished.unwrap();
        assert_eq!(finished.blobs.len(), 1);
        assert_eq!(finished.blobs[0].id, id);
    }

    #[test]
    fn drain_flushes_all_nonempty_packers() {
        let pool = PackerPool::new();
        let key = key();
        let data = b"tiny".to_vec();
        pool.add_blob(&key, BlobType::Data, Id::of(&data), &data);
        assert_eq!(pool.open_count(), 1);
        let drained = pool.drain(&key);
        assert_eq!(drained.len(), 1);
        assert_eq!(pool.open_count(), 0);
    }

    #[test]
    fn pool_cap_forces_eviction_of_largest_packer() {
        let pool = PackerPool::new();
        let key = key();
        // Fill the pool past POOL_CAP with maximally-sized distinguishable
        // blobs so each occupies its own packer (estimated size equals
        // MAX_PACK_SIZE, so no two fit in the same slot).
        for i in 0..(POOL_CAP + 1) {
            let mut data = vec![0u8; MAX_PACK_SIZE - 64];
            data[0] = (i % 256) as u8;
            data[1] = ((i / 256) % 256) as u8;
            let id = Id::of(&data);
            let finished = pool.add_blob(&key, BlobType::Data, id, &data);
            if i == POOL_CAP {
                assert!(finished.is_some(), "pool cap should force a flush");
            }
        }
        assert!(pool.open_count() <= POOL_CAP);
    }
}
