//! The cryptographic envelope that seals every object in the repository.
//!
//! Every object (pack blob, pack header, index file, snapshot, key, lock,
//! config) is protected the same way: `scrypt` (or a CSPRNG, for keys that
//! don't originate from a password) produces a 64-byte key, split into a
//! 32-byte AES-256 key and a 32-byte Poly1305-AES MAC key. AES-256-CTR
//! provides confidentiality, Poly1305-AES provides authenticity, and the
//! wire format is `IV(16) || ciphertext(n) || tag(16)`.

use aes::cipher::{BlockEncrypt, KeyInit as BlockKeyInit};
use aes::{Aes128, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use poly1305::universal_hash::{KeyInit as UhKeyInit, UniversalHash};
use poly1305::Poly1305;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Error, Result};

const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;
const OVERHEAD: usize = IV_LEN + TAG_LEN;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// scrypt parameters for deriving a [`Key`] from a password. `N` is stored
/// as its base-2 logarithm (`log2_n`) so it round-trips through the
/// `"N": <int>` field of the key JSON format without losing precision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KdfParams {
    #[serde(rename = "N")]
    pub n: u64,
    pub r: u32,
    pub p: u32,
    #[serde(with = "salt_b64")]
    pub salt: [u8; 64],
}

impl KdfParams {
    /// Generates fresh parameters with the repository's default cost
    /// factors (`N=65536, r=8, p=1`) and a random salt.
    pub fn generate() -> Self {
        let mut salt = [0u8; 64];
        OsRng.fill_bytes(&mut salt);
        Self {
            n: 65536,
            r: 8,
            p: 1,
            salt,
        }
    }

    fn log2_n(&self) -> Result<u8> {
        if !self.n.is_power_of_two() {
            return Err(Error::InvalidData("scrypt N is not a power of two".into()));
        }
        Ok(self.n.trailing_zeros() as u8)
    }
}

mod salt_b64 {
    use data_encoding::BASE64;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(salt: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        BASE64.encode(salt).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let encoded = String::deserialize(d)?;
        let decoded = BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        decoded
            .try_into()
            .map_err(|v: Vec<u8>| serde::de::Error::invalid_length(v.len(), &"64 bytes"))
    }
}

/// The 64-byte symmetric key material behind every sealed object: a
/// 32-byte AES-256 key for confidentiality and a 32-byte Poly1305-AES MAC
/// key (`k`, the AES-128 nonce-masking key, and `r`, the polynomial key).
///
/// The same shape is used whether the key was derived from a password via
/// [`Key::from_password`] (the "user key" that unlocks a key object) or
/// generated at random via [`Key::random`] (the repository's master key).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Key {
    encrypt: [u8; 32],
    mac_k: [u8; 16],
    mac_r: [u8; 16],
}

impl Key {
    /// Generates a new master key with cryptographically secure randomness.
    pub fn random() -> Self {
        let mut bytes = [0u8; 64];
        OsRng.fill_bytes(&mut bytes);
        let key = Self::from_bytes(&bytes);
        bytes.zeroize();
        key
    }

    /// Derives a user key from a password via scrypt.
    pub fn from_password(password: &str, params: &KdfParams) -> Result<Self> {
        let log2_n = params.log2_n()?;
        let scrypt_params = scrypt::Params::new(log2_n, params.r, params.p, 64)
            .map_err(|e| Error::InvalidData(format!("invalid scrypt params: {e}")))?;
        let mut out = [0u8; 64];
        scrypt::scrypt(password.as_bytes(), &params.salt, &scrypt_params, &mut out)
            .map_err(|e| Error::InvalidData(format!("scrypt failed: {e}")))?;
        let key = Self::from_bytes(&out);
        out.zeroize();
        Ok(key)
    }

    fn from_bytes(bytes: &[u8; 64]) -> Self {
        let mut encrypt = [0u8; 32];
        let mut mac_k = [0u8; 16];
        let mut mac_r = [0u8; 16];
        encrypt.copy_from_slice(&bytes[0..32]);
        mac_k.copy_from_slice(&bytes[32..48]);
        mac_r.copy_from_slice(&bytes[48..64]);
        Self {
            encrypt,
            mac_k,
            mac_r,
        }
    }

    /// Serializes the key material for embedding in a sealed key-object
    /// payload (the `{encrypt, mac: {k, r}}` JSON shape).
    pub fn to_raw(&self) -> RawKey {
        RawKey {
            encrypt: self.encrypt,
            mac_k: self.mac_k,
            mac_r: self.mac_r,
        }
    }

    pub fn from_raw(raw: &RawKey) -> Self {
        Self {
            encrypt: raw.encrypt,
            mac_k: raw.mac_k,
            mac_r: raw.mac_r,
        }
    }

    /// Seals `plaintext`, returning `IV || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let mut ciphertext = plaintext.to_vec();
        let mut cipher = Aes256Ctr::new_from_slices(&self.encrypt, &iv).expect("key/iv lengths are fixed and correct");
        cipher.apply_keystream(&mut ciphertext);

        let tag = self.tag(&iv, &ciphertext);

        let mut out = Vec::with_capacity(OVERHEAD + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        out.extend_from_slice(&tag);
        out
    }

    /// Opens a sealed object, verifying the Poly1305-AES tag in constant
    /// time before returning the plaintext. Any bit flip anywhere in
    /// `IV || ciphertext || tag` causes this to fail with
    /// [`Error::Unauthenticated`].
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < OVERHEAD {
            return Err(Error::InvalidData("sealed object shorter than envelope overhead".into()));
        }
        let iv = &sealed[..IV_LEN];
        let ciphertext = &sealed[IV_LEN..sealed.len() - TAG_LEN];
        let tag = &sealed[sealed.len() - TAG_LEN..];

        let expected_tag = self.tag(iv, ciphertext);
        if expected_tag.ct_eq(tag).unwrap_u8() != 1 {
            return Err(Error::Unauthenticated);
        }

        let mut plaintext = ciphertext.to_vec();
        let mut cipher = Aes256Ctr::new_from_slices(&self.encrypt, iv).expect("key/iv lengths are fixed and correct");
        cipher.apply_keystream(&mut plaintext);
        Ok(plaintext)
    }

    /// Computes the Poly1305-AES tag over `iv || ciphertext`.
    fn tag(&self, iv: &[u8], ciphertext: &[u8]) -> [u8; TAG_LEN] {
        // s = AES_k(iv), the nonce-scrambling mask from the original
        // Poly1305-AES construction (djb). The `poly1305` crate expects a
        // 32-byte key of `r || s` and performs the standard r-clamping
        // itself.
        let block_cipher = Aes128::new_from_slice(&self.mac_k).expect("key length is fixed and correct");
        let mut s = aes::Block::clone_from_slice(iv);
        block_cipher.encrypt_block(&mut s);

        let mut poly_key = [0u8; 32];
        poly_key[..16].copy_from_slice(&self.mac_r);
        poly_key[16..].copy_from_slice(&s);

        let mut mac = Poly1305::new_from_slice(&poly_key).expect("key length is fixed and correct");
        mac.update_padded(iv);
        mac.update_padded(ciphertext);
        let tag = mac.finalize();
        tag.into()
    }

    /// A streaming sealing writer: emits the IV as soon as the first byte
    /// is written, streams ciphertext as it arrives, and writes the tag on
    /// [`SealingWriter::close`].
    pub fn sealing_writer<W: AsyncWrite + Unpin>(&self, sink: W) -> SealingWriter<W> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let cipher = Aes256Ctr::new_from_slices(&self.encrypt, &iv).expect("key/iv lengths are fixed and correct");

        let block_cipher = Aes128::new_from_slice(&self.mac_k).expect("key length is fixed and correct");
        let mut s = aes::Block::clone_from_slice(&iv);
        block_cipher.encrypt_block(&mut s);
        let mut poly_key = [0u8; 32];
        poly_key[..16].copy_from_slice(&self.mac_r);
        poly_key[16..].copy_from_slice(&s);
        let mut mac = Poly1305::new_from_slice(&poly_key).expect("key length is fixed and correct");
        mac.update_padded(&iv);

        SealingWriter {
            sink,
            cipher,
            mac: Some(mac),
            iv,
            header_written: false,
        }
    }

    /// Opens a fully-buffered sealed object. Per the Cryptor contract, no
    /// plaintext byte is released until the whole tag has been verified;
    /// since every object this store seals is bounded in size (chunks cap
    /// out at 8 MiB, metadata objects are smaller still), buffering the
    /// entire sealed object before verifying is the straightforward way to
    /// satisfy that contract.
    pub fn opening_reader(&self, sealed: &[u8]) -> Result<std::io::Cursor<Vec<u8>>> {
        Ok(std::io::Cursor::new(self.open(sealed)?))
    }
}

/// Plain byte form of [`Key`], used when (de)serializing a key object's
/// sealed payload.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct RawKey {
    #[serde(with = "hex_32")]
    encrypt: [u8; 32],
    #[serde(with = "hex_16")]
    mac_k: [u8; 16],
    #[serde(with = "hex_16")]
    mac_r: [u8; 16],
}

impl RawKey {
    pub fn encrypt_bytes(&self) -> &[u8; 32] {
        &self.encrypt
    }

    pub fn mac_k_bytes(&self) -> &[u8; 16] {
        &self.mac_k
    }

    pub fn mac_r_bytes(&self) -> &[u8; 16] {
        &self.mac_r
    }

    pub fn from_parts(encrypt: [u8; 32], mac_k: [u8; 16], mac_r: [u8; 16]) -> Self {
        Self {
            encrypt,
            mac_k,
            mac_r,
        }
    }
}

macro_rules! hex_array_mod {
    ($name:ident, $len:expr) => {
        mod $name {
            use data_encoding::BASE64;
            use serde::{Deserialize, Deserializer, Serialize, Serializer};

            pub fn serialize<S: Serializer>(bytes: &[u8; $len], s: S) -> Result<S::Ok, S::Error> {
                BASE64.encode(bytes).serialize(s)
            }

            pub fn deserialize<'de, D: Deserializer<'de>>(
                d: D,
            ) -> Result<[u8; $len], D::Error> {
                let encoded = String::deserialize(d)?;
                let decoded = BASE64
                    .decode(encoded.as_bytes())
                    .map_err(serde::de::Error::custom)?;
                decoded
                    .try_into()
                    .map_err(|v: Vec<u8>| serde::de::Error::invalid_length(v.len(), &stringify!($len)))
            }
        }
    };
}
hex_array_mod!(hex_32, 32);
hex_array_mod!(hex_16, 16);

/// Streaming counterpart of [`Key::seal`]. Implements [`AsyncWrite`];
/// closing it finalizes and appends the Poly1305-AES tag.
pub struct SealingWriter<W> {
    sink: W,
    cipher: Aes256Ctr,
    mac: Option<Poly1305>,
    iv: [u8; IV_LEN],
    header_written: bool,
}

impl<W: AsyncWrite + Unpin> SealingWriter<W> {
    /// Writes `plaintext`, encrypting it in place before forwarding to the
    /// sink. Emits the IV first if this is the first call.
    pub async fn write_all(&mut self, plaintext: &[u8]) -> std::io::Result<()> {
        if !self.header_written {
            self.sink.write_all(&self.iv).await?;
            self.header_written = true;
        }
        let mut buf = plaintext.to_vec();
        self.cipher.apply_keystream(&mut buf);
        self.mac
            .as_mut()
            .expect("writer not yet closed")
            .update_padded(&buf);
        self.sink.write_all(&buf).await
    }

    /// Finalizes the MAC, writes the tag, and flushes the sink.
    pub async fn close(mut self) -> std::io::Result<W> {
        if !self.header_written {
            self.sink.write_all(&self.iv).await?;
            self.header_written = true;
        }
        let mac = self.mac.take().expect("close called twice");
        let tag = mac.finalize();
        self.sink.write_all(&tag).await?;
        self.sink.flush().await?;
        Ok(self.sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn round_trip() {
        let key = Key::random();
        let plaintext = b"hello\n".to_vec();
        let sealed = key.seal(&plaintext);
        assert_eq!(key.open(&sealed).unwrap(), plaintext);
    }

    #[test]
    fn distinct_ciphertexts_for_same_plaintext() {
        let key = Key::random();
        let a = key.seal(b"same plaintext");
        let b = key.seal(b"same plaintext");
        assert_ne!(a, b, "fresh IV should make ciphertexts differ");
    }

    #[test]
    fn bit_flip_is_detected() {
        let key = Key::random();
        let mut sealed = key.seal(b"authenticate me");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(key.open(&sealed), Err(Error::Unauthenticated)));
    }

    #[test]
    fn kdf_is_deterministic_given_same_params() {
        let params = KdfParams::generate();
        let a = Key::from_password("hunter2", &params).unwrap();
        let b = Key::from_password("hunter2", &params).unwrap();
        assert_eq!(a.to_raw().encrypt, b.to_raw().encrypt);
        assert_eq!(a.to_raw().mac_k, b.to_raw().mac_k);
        assert_eq!(a.to_raw().mac_r, b.to_raw().mac_r);
    }

    proptest! {
        #[test]
        fn open_of_seal_is_identity(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let key = Key::random();
            let sealed = key.seal(&data);
            prop_assert_eq!(key.open(&sealed).unwrap(), data);
        }
    }

    #[tokio::test]
    async fn streaming_seal_matches_one_shot() {
        let key = Key::random();
        let plaintext = b"streamed plaintext, a bit longer than one write".to_vec();

        let mut writer = key.sealing_writer(Vec::new());
        writer.write_all(&plaintext[..10]).await.unwrap();
        writer.write_all(&plaintext[10..]).await.unwrap();
        let sealed = writer.close().await.unwrap();

        assert_eq!(key.open(&sealed).unwrap(), plaintext);
    }
}
