//! Payload codec: compression and encryption of job payloads at rest.
//!
//! Encoding: JSON → (gzip + base64 when larger than the threshold) →
//! AES-256-GCM with a random 16-byte IV → base64(iv ‖ tag ‖ ciphertext).
//! Decoding reverses it; the gzip step is detected by the `1f 8b` magic
//! bytes after the inner base64 decode.

use std::io::{Read, Write};

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::CodecError;

/// AES-256-GCM with a 128-bit IV.
type Cipher = AesGcm<Aes256, U16>;

const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Default size (bytes of JSON) above which payloads are compressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Encrypts and compresses payloads for storage.
pub struct PayloadCodec {
    cipher: Cipher,
    compression_threshold: usize,
}

impl std::fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCodec")
            .field("compression_threshold", &self.compression_threshold)
            .finish_non_exhaustive()
    }
}

impl PayloadCodec {
    /// Build a codec from a passphrase. The AES key is its SHA-256 digest.
    pub fn new(key: &str, compression_threshold: usize) -> Result<Self, CodecError> {
        if key.is_empty() {
            return Err(CodecError::EmptyKey);
        }
        let digest = Sha256::digest(key.as_bytes());
        let cipher = Cipher::new_from_slice(digest.as_slice()).map_err(|_| CodecError::Encrypt)?;
        Ok(Self {
            cipher,
            compression_threshold,
        })
    }

    /// Encode a payload into the text stored in the `payload` column.
    pub fn encode(&self, payload: &serde_json::Value) -> Result<String, CodecError> {
        let json = serde_json::to_string(payload)?;
        let inner = if json.len() > self.compression_threshold {
            STANDARD.encode(gzip(json.as_bytes())?)
        } else {
            json
        };
        Ok(STANDARD.encode(self.encrypt(inner.as_bytes())?))
    }

    /// Decode text produced by [`PayloadCodec::encode`].
    pub fn decode(&self, stored: &str) -> Result<serde_json::Value, CodecError> {
        let blob = STANDARD.decode(stored.trim())?;
        let plain = String::from_utf8(self.decrypt(&blob)?)?;

        let json = match STANDARD.decode(plain.as_bytes()) {
            Ok(bytes) if bytes.starts_with(&GZIP_MAGIC) => gunzip(&bytes)?,
            _ => plain,
        };
        Ok(serde_json::from_str(&json)?)
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        // aes-gcm appends the tag; the stored layout puts it after the IV.
        let sealed = self
            .cipher
            .encrypt(Nonce::<U16>::from_slice(&iv), plaintext)
            .map_err(|_| CodecError::Encrypt)?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut out = Vec::with_capacity(IV_LEN + sealed.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(tag);
        out.extend_from_slice(ciphertext);
        Ok(out)
    }

    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CodecError> {
        if blob.len() < IV_LEN + TAG_LEN {
            return Err(CodecError::Truncated { len: blob.len() });
        }
        let (iv, rest) = blob.split_at(IV_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let mut sealed = Vec::with_capacity(rest.len());
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        self.cipher
            .decrypt(Nonce::<U16>::from_slice(iv), sealed.as_slice())
            .map_err(|_| CodecError::Decrypt)
    }
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

fn gunzip(bytes: &[u8]) -> Result<String, CodecError> {
    let mut out = String::new();
    GzDecoder::new(bytes).read_to_string(&mut out)?;
    Ok(out)
}
