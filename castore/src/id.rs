//! The 32-byte content identifier used throughout the repository: always
//! the SHA-256 of the plaintext of the object it names.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const ID_LEN: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id([u8; ID_LEN]);

impl Id {
    /// Computes the id of `plaintext`, i.e. `SHA256(plaintext)`.
    pub fn of(plaintext: &[u8]) -> Self {
        let digest = Sha256::digest(plaintext);
        Self(digest.into())
    }

    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self, HexError> {
        if s.len() != ID_LEN * 2 {
            return Err(HexError::WrongLength(s.len()));
        }
        let mut bytes = [0u8; ID_LEN];
        data_encoding::HEXLOWER_PERMISSIVE
            .decode_mut(s.as_bytes(), &mut bytes)
            .map_err(|_| HexError::NotHex)?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }

    /// A short hex prefix for display and prefix-lookup, mirroring what
    /// restic-family tools print for snapshot/object ids.
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HexError {
    #[error("expected {} hex chars, got {0}", ID_LEN * 2)]
    WrongLength(usize),
    #[error("not valid hex")]
    NotHex,
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.short())
    }
}

impl Serialize for Id {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_hash() {
        let id = Id::of(b"hello\n");
        assert_eq!(
            id.to_hex(),
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
    }

    #[test]
    fn hex_round_trip() {
        let id = Id::of(b"round trip me");
        assert_eq!(Id::from_hex(&id.to_hex()).unwrap(), id);
    }
}
