//! Repository configuration: the one object whose presence or absence
//! decides whether a repository is initialized at all.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const REPO_ID_LEN: usize = 8;

/// A repository's own identity, distinct from any blob id: a 64-bit
/// random value chosen once at `init`, rendered as `id:hex16` — 16 hex
/// characters, i.e. 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepoId([u8; REPO_ID_LEN]);

impl RepoId {
    pub fn random() -> Self {
        use rand_core::RngCore;
        let mut bytes = [0u8; REPO_ID_LEN];
        rand_core::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn to_hex(self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != REPO_ID_LEN * 2 {
            return Err(Error::Other(format!("malformed repository id: {s}")));
        }
        let mut bytes = [0u8; REPO_ID_LEN];
        data_encoding::HEXLOWER_PERMISSIVE
            .decode_mut(s.as_bytes(), &mut bytes)
            .map_err(|_| Error::Other(format!("malformed repository id: {s}")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for RepoId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RepoId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: u32,
    pub id: RepoId,
    pub chunker_polynomial: u64,
}

impl Config {
    pub fn new(chunker_polynomial: u64) -> Self {
        Self {
            version: 1,
            id: RepoId::random(),
            chunker_polynomial,
        }
    }

    /// Freezes a fresh repository's config: a random id plus a freshly
    /// chosen chunker polynomial.
    pub fn generate(rng: &mut impl rand_core::RngCore) -> Self {
        Self::new(backup_castore::chunker::random_irreducible(rng))
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("config serializes infallibly")
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_id_round_trips_through_hex() {
        let id = RepoId::random();
        assert_eq!(RepoId::from_hex(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = Config::new(0xDEAD_BEEF_u64);
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.chunker_polynomial, config.chunker_polynomial);
        assert_eq!(back.id, config.id);
        assert_eq!(back.version, 1);
    }
}
