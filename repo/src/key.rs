//! Key objects: a password-wrapped copy of the repository's master key.
//! A repository may have many key objects — one per user or device that
//! knows a password — all wrapping the same master key, so distinct
//! keys unlocking the same repository always yield byte-identical
//! master keys by construction.

use backup_castore::crypto::{KdfParams, Key, RawKey};
use backup_castore::id::Id;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The sealed payload inside a key object's `data` field: an
/// `{encrypt, mac:{k,r}, chunker_polynomial}` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyData {
    #[serde(with = "b64_32")]
    encrypt: [u8; 32],
    mac: MacData,
    chunker_polynomial: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MacData {
    #[serde(with = "b64_16")]
    k: [u8; 16],
    #[serde(with = "b64_16")]
    r: [u8; 16],
}

mod b64_32 {
    use serde::{Deserialize, Deserializer, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&data_encoding::BASE64.encode(v))
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = data_encoding::BASE64
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("encrypt key must be 32 bytes"))
    }
}

mod b64_16 {
    use serde::{Deserialize, Deserializer, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 16], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&data_encoding::BASE64.encode(v))
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = data_encoding::BASE64
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("mac component must be 16 bytes"))
    }
}

impl KeyData {
    fn from_raw(raw: &RawKey, chunker_polynomial: u64) -> Self {
        Self {
            encrypt: *raw.encrypt_bytes(),
            mac: MacData {
                k: *raw.mac_k_bytes(),
                r: *raw.mac_r_bytes(),
            },
            chunker_polynomial,
        }
    }

    fn to_raw(&self) -> RawKey {
        RawKey::from_parts(self.encrypt, self.mac.k, self.mac.r)
    }
}

/// The on-disk form of one key object (`kdf` is always `"scrypt"` — it's
/// a format tag, not a choice, since scrypt is the only KDF this
/// repository format knows).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub created: DateTime<Local>,
    pub username: String,
    pub hostname: String,
    kdf: String,
    #[serde(rename = "N")]
    n: u64,
    r: u32,
    p: u32,
    #[serde(with = "b64")]
    salt: [u8; 64],
    #[serde(with = "b64_vec")]
    data: Vec<u8>,
}

impl KeyFile {
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("key object serializes infallibly")
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

mod b64 {
    use serde::{Deserialize, Deserializer, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&data_encoding::BASE64.encode(v))
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = data_encoding::BASE64
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|_| serde::de::Error::custom("salt must be 64 bytes"))
    }
}

mod b64_vec {
    use serde::{Deserialize, Deserializer, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&data_encoding::BASE64.encode(v))
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        data_encoding::BASE64
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Wraps `master_key` (and the repository's frozen `chunker_polynomial`)
/// under `password`, producing a new key object ready to be saved under
/// the `key` namespace.
pub fn seal(
    master_key: &Key,
    chunker_polynomial: u64,
    password: &str,
    username: &str,
    hostname: &str,
) -> KeyFile {
    let params = KdfParams::generate();
    let user_key = Key::from_password(password, &params).expect("fresh params are always valid");

    let payload = KeyData::from_raw(&master_key.to_raw(), chunker_polynomial);
    let payload_json = serde_json::to_vec(&payload).expect("key payload serializes infallibly");
    let data = user_key.seal(&payload_json);

    KeyFile {
        created: Local::now(),
        username: username.to_string(),
        hostname: hostname.to_string(),
        kdf: "scrypt".to_string(),
        n: params.n,
        r: params.r,
        p: params.p,
        salt: params.salt,
        data,
    }
}

/// Tries to unlock `key_file` with `password`, returning the master key
/// and the chunker polynomial it was frozen with.
pub fn open(key_file: &KeyFile, password: &str) -> Result<(Key, u64)> {
    let params = KdfParams {
        n: key_file.n,
        r: key_file.r,
        p: key_file.p,
        salt: key_file.salt,
    };
    let user_key = Key::from_password(password, &params)?;
    let payload_json = user_key
        .open(&key_file.data)
        .map_err(|_| Error::NoUsableKey)?;
    let payload: KeyData = serde_json::from_slice(&payload_json)
        .map_err(|e| Error::Other(format!("malformed key payload: {e}")))?;
    let master_key = Key::from_raw(&payload.to_raw());
    Ok((master_key, payload.chunker_polynomial))
}

/// Tries every stored key, `hint` first if given, returning the first
/// that opens under `password`. A key that fails to open is not fatal:
/// every other stored key is still tried before giving up.
pub fn search<'a>(
    keys: impl IntoIterator<Item = (Id, &'a KeyFile)>,
    hint: Option<Id>,
    password: &str,
) -> Result<(Key, u64)> {
    let mut ordered: Vec<(Id, &KeyFile)> = keys.into_iter().collect();
    if let Some(hint) = hint {
        ordered.sort_by_key(|(id, _)| *id != hint);
    }
    for (_, key_file) in ordered {
        if let Ok(result) = open(key_file, password) {
            return Ok(result);
        }
    }
    Err(Error::NoUsableKey)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open_round_trip() {
        let master = Key::random();
        let poly = 0xABCDu64;
        let key_file = seal(&master, poly, "hunter2", "alice", "host");
        let (opened, opened_poly) = open(&key_file, "hunter2").unwrap();
        assert_eq!(opened_poly, poly);
        // Same plaintext seals to different ciphertext under both keys
        // (fresh IV each time), but both must decrypt identically.
        let probe = b"probe";
        let sealed_by_master = master.seal(probe);
        assert_eq!(opened.open(&sealed_by_master).unwrap(), probe);
    }

    #[test]
    fn wrong_password_is_rejected() {
        let master = Key::random();
        let key_file = seal(&master, 1, "correct-horse", "a", "h");
        assert!(open(&key_file, "wrong").is_err());
    }

    #[test]
    fn search_tries_every_key_and_honors_hint() {
        let master_a = Key::random();
        let master_b = Key::random();
        let key_a = seal(&master_a, 1, "pw-a", "a", "h");
        let key_b = seal(&master_b, 2, "pw-b", "b", "h");

        let id_a = Id::of(b"a");
        let id_b = Id::of(b"b");
        let keys = vec![(id_a, &key_a), (id_b, &key_b)];

        let (_, poly) = search(keys.clone(), Some(id_b), "pw-b").unwrap();
        assert_eq!(poly, 2);
        let (_, poly) = search(keys, None, "pw-a").unwrap();
        assert_eq!(poly, 1);
    }
}
