//! The on-disk pack file format: a concatenation of sealed
//! blobs, followed by a sealed header describing them, followed by a
//! plaintext 4-byte little-endian length of that header:
//!
//! ```text
//! E_1 || E_2 || ... || E_n || H_enc || header_len_le32
//! ```
//!
//! The header lets a reader fetch any one blob with a single range read,
//! without ever downloading blobs it doesn't need.

use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::id::Id;
use crate::{Error, Key, Result};

const TRAILER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobType {
    Data,
    Tree,
}

/// One entry in a pack's header: where a blob lives and what it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobEntry {
    #[serde(rename = "type")]
    pub blob_type: BlobType,
    pub id: Id,
    pub offset: u64,
    pub length: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PackHeader {
    blobs: Vec<BlobEntry>,
}

/// Accumulates sealed blobs for a single pack file, in memory, until it's
/// finalized. Not safe for concurrent use by design — a packer is checked
/// out of the pool by exactly one worker at a time.
#[derive(Default)]
pub struct PackWriter {
    body: Vec<u8>,
    header: PackHeader,
}

impl PackWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn blob_count(&self) -> usize {
        self.header.blobs.len()
    }

    /// Seals `plaintext` under `key` and appends it to the pack body,
    /// recording its offset and length in the header. `id` is the
    /// caller's already-computed `SHA256(plaintext)`.
    pub fn add(&mut self, key: &Key, blob_type: BlobType, id: Id, plaintext: &[u8]) {
        let sealed = key.seal(plaintext);
        let offset = self.body.len() as u64;
        let length = sealed.len() as u32;
        self.body.extend_from_slice(&sealed);
        self.header.blobs.push(BlobEntry {
            blob_type,
            id,
            offset,
            length,
        });
    }

    /// Finalizes the pack: seals the header, appends it and its
    /// plaintext length, and returns the complete pack bytes plus the
    /// header entries (for recording into the master index).
    pub fn finish(self, key: &Key) -> (Vec<u8>, Vec<BlobEntry>) {
        let header_json =
            serde_json::to_vec(&self.header).expect("pack header serializes infallibly");
        let sealed_header = key.seal(&header_json);
        let hlen = sealed_header.len() as u32;

        let mut out = self.body;
        out.extend_from_slice(&sealed_header);
        out.extend_from_slice(&hlen.to_le_bytes());
        (out, self.header.blobs)
    }
}

/// Decodes a pack's header from the pack's trailing bytes, given only
/// the total pack size and a function that can range-read arbitrary
/// byte windows of it (so callers never have to download a whole pack
/// just to list its contents).
pub fn decode_header<F>(key: &Key, total_size: u64, mut range_read: F) -> Result<Vec<BlobEntry>>
where
    F: FnMut(u64, u64) -> Result<Vec<u8>>,
{
    if total_size < TRAILER_LEN as u64 {
        return Err(Error::InvalidData("pack smaller than its trailer".into()));
    }
    let trailer = range_read(total_size - TRAILER_LEN as u64, total_size)?;
    let hlen = u32::from_le_bytes(
        trailer
            .try_into()
            .map_err(|_| Error::InvalidData("malformed pack trailer".into()))?,
    ) as u64;

    let header_start = total_size
        .checked_sub(TRAILER_LEN as u64 + hlen)
        .ok_or_else(|| Error::InvalidData("pack header length exceeds pack size".into()))?;
    let sealed_header = range_read(header_start, total_size - TRAILER_LEN as u64)?;
    let header_json = key.open(&sealed_header)?;
    let header: PackHeader = serde_json::from_slice(&header_json)?;

    let sum: u64 = header.blobs.iter().map(|b| b.length as u64).sum();
    if sum + hlen + TRAILER_LEN as u64 != total_size {
        return Err(Error::InvalidData(
            "pack blob lengths don't account for the full pack size".into(),
        ));
    }

    Ok(header.blobs)
}

/// Fetches and verifies a single blob, given its header entry and the
/// sealed bytes at `[entry.offset, entry.offset + entry.length)`.
#[instrument(skip_all, fields(blob.id = %entry.id, blob.type = ?entry.blob_type))]
pub fn open_blob(key: &Key, entry: &BlobEntry, sealed: &[u8]) -> Result<Vec<u8>> {
    let plaintext = key.open(sealed).inspect_err(|e| {
        warn!(blob.id = %entry.id, error = %e, "blob failed authentication");
    })?;
    let actual = Id::of(&plaintext);
    if actual != entry.id {
        warn!(blob.id = %entry.id, %actual, "blob decrypted to mismatched hash");
        return Err(Error::CorruptHash {
            expected: entry.id.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Key {
        Key::random()
    }

    #[test]
    fn round_trips_a_single_blob_pack() {
        let key = key();
        let mut w = PackWriter::new();
        let data = b"a single blob".to_vec();
        let id = Id::of(&data);
        w.add(&key, BlobType::Data, id, &data);
        let (pack_bytes, entries) = w.finish(&key);

        assert_eq!(entries.len(), 1);
        let total = pack_bytes.len() as u64;
        let decoded = decode_header(&key, total, |start, end| {
            Ok(pack_bytes[start as usize..end as usize].to_vec())
        })
        .unwrap();
        assert_eq!(decoded, entries);

        let entry = &decoded[0];
        let sealed = &pack_bytes[entry.offset as usize..(entry.offset + entry.length) as usize];
        let plaintext = open_blob(&key, entry, sealed).unwrap();
        assert_eq!(plaintext, data);
    }

    #[test]
    fn round_trips_many_blobs_and_allows_individual_fetch() {
        let key = key();
        let mut w = PackWriter::new();
        let blobs: Vec<Vec<u8>> = (0..20).map(|i| vec![i as u8; 100 + i]).collect();
        for b in &blobs {
            w.add(&key, BlobType::Data, Id::of(b), b);
        }
        let (pack_bytes, entries) = w.finish(&key);
        let total = pack_bytes.len() as u64;

        let decoded = decode_header(&key, total, |start, end| {
            Ok(pack_bytes[start as usize..end as usize].to_vec())
        })
        .unwrap();
        assert_eq!(decoded.len(), blobs.len());

        for (entry, expected) in decoded.iter().zip(blobs.iter()) {
            let sealed =
                &pack_bytes[entry.offset as usize..(entry.offset + entry.length) as usize];
            let plaintext = open_blob(&key, entry, sealed).unwrap();
            assert_eq!(&plaintext, expected);
        }
    }

    #[test]
    fn tampered_header_length_is_rejected() {
        let key = key();
        let mut w = PackWriter::new();
        let data = b"hi".to_vec();
        w.add(&key, BlobType::Data, Id::of(&data), &data);
        let (mut pack_bytes, _) = w.finish(&key);

        let len = pack_bytes.len();
        pack_bytes[len - 1] ^= 0xFF;

        let total = pack_bytes.len() as u64;
        let result = decode_header(&key, total, |start, end| {
            Ok(pack_bytes[start as usize..end as usize].to_vec())
        });
        assert!(result.is_err());
    }

    #[test]
    fn tampered_blob_ciphertext_fails_verification() {
        let key = key();
        let mut w = PackWriter::new();
        let data = b"tamper with me".to_vec();
        let id = Id::of(&data);
        w.add(&key, BlobType::Data, id, &data);
        let (mut pack_bytes, entries) = w.finish(&key);

        pack_bytes[0] ^= 0xFF;

        let entry = &entries[0];
        let sealed = &pack_bytes[entry.offset as usize..(entry.offset + entry.length) as usize];
        assert!(open_blob(&key, entry, sealed).is_err());
    }
}
