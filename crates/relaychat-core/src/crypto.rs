//! Hybrid encryption layer: AES-256-GCM payloads under RSA-OAEP-sealed keys
//!
//! Every outbound message gets a fresh symmetric key and IV; the key
//! material travels as a small JSON blob sealed with the recipient's RSA
//! key. Associated data binds each ciphertext to its sender, recipient and
//! timestamp so a captured message cannot be replayed into another
//! conversation.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::RelayError;

/// Symmetric key size in bytes (AES-256)
pub const KEY_SIZE: usize = 32;
/// IV size in bytes (96-bit GCM nonce)
pub const IV_SIZE: usize = 12;
/// Authentication tag size in bytes (128-bit GCM tag)
pub const TAG_SIZE: usize = 16;

/// One hybrid-encrypted message: fresh key material plus detached-tag
/// ciphertext. Constructed per message, never persisted.
pub struct HybridPayload {
    /// Fresh 256-bit symmetric key
    pub key: [u8; KEY_SIZE],
    /// Fresh 96-bit IV
    pub iv: [u8; IV_SIZE],
    /// 128-bit authentication tag
    pub tag: [u8; TAG_SIZE],
    /// Ciphertext without the tag
    pub ciphertext: Vec<u8>,
}

/// The key material that travels inside the RSA-OAEP-sealed blob.
///
/// All fields are standard base64.
#[derive(Debug, Serialize, Deserialize)]
pub struct KeyBlob {
    pub key: String,
    pub iv: String,
    pub tag: String,
}

impl KeyBlob {
    /// Build the blob from a payload's key material.
    pub fn from_payload(payload: &HybridPayload) -> Self {
        Self {
            key: BASE64.encode(payload.key),
            iv: BASE64.encode(payload.iv),
            tag: BASE64.encode(payload.tag),
        }
    }

    /// Serialize to the compact JSON wire form.
    pub fn to_json(&self) -> Result<Vec<u8>, RelayError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse from JSON bytes and decode the base64 fields, validating
    /// lengths before anything touches the cipher.
    pub fn decode(bytes: &[u8]) -> Result<([u8; KEY_SIZE], [u8; IV_SIZE], [u8; TAG_SIZE]), RelayError> {
        let blob: KeyBlob = serde_json::from_slice(bytes)?;
        let key = decode_fixed::<KEY_SIZE>(&blob.key, "key")?;
        let iv = decode_fixed::<IV_SIZE>(&blob.iv, "iv")?;
        let tag = decode_fixed::<TAG_SIZE>(&blob.tag, "tag")?;
        Ok((key, iv, tag))
    }
}

fn decode_fixed<const N: usize>(b64: &str, field: &str) -> Result<[u8; N], RelayError> {
    let bytes = BASE64
        .decode(b64)
        .map_err(|e| RelayError::DecryptionFailed(format!("Bad base64 in {}: {}", field, e)))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| RelayError::DecryptionFailed(format!("Wrong {} length: {}", field, bytes.len())))
}

/// Associated data for a contact-to-contact message.
///
/// Binds the ciphertext to sender, recipient and timestamp:
/// `v2|from=<fromUid>|to=<toUid>|ts=<unixSeconds>`
pub fn message_aad(from_uid: &str, to_uid: &str, ts: i64) -> String {
    format!("v2|from={}|to={}|ts={}", from_uid, to_uid, ts)
}

/// Encrypt a plaintext under a fresh key and IV.
///
/// The associated data is authenticated but not encrypted; decryption with
/// different associated data fails.
pub fn encrypt(plaintext: &[u8], aad: &[u8]) -> Result<HybridPayload, RelayError> {
    let mut key = [0u8; KEY_SIZE];
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    rand::thread_rng().fill_bytes(&mut iv);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let mut combined = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| RelayError::Crypto("Encryption failed".to_string()))?;

    // aes-gcm appends the tag; detach it for the wire format
    let tag_bytes = combined.split_off(combined.len() - TAG_SIZE);
    let tag: [u8; TAG_SIZE] = tag_bytes
        .as_slice()
        .try_into()
        .map_err(|_| RelayError::Crypto("Malformed cipher output".to_string()))?;

    Ok(HybridPayload {
        key,
        iv,
        tag,
        ciphertext: combined,
    })
}

/// Decrypt a detached-tag ciphertext.
///
/// Key, IV and tag lengths are validated before the cipher call. A tag
/// mismatch (including mismatched associated data) yields
/// [`RelayError::DecryptionFailed`], never corrupted plaintext.
pub fn decrypt(
    key: &[u8],
    iv: &[u8],
    tag: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, RelayError> {
    if key.len() != KEY_SIZE {
        return Err(RelayError::DecryptionFailed(format!(
            "Wrong key length: {}",
            key.len()
        )));
    }
    if iv.len() != IV_SIZE {
        return Err(RelayError::DecryptionFailed(format!(
            "Wrong iv length: {}",
            iv.len()
        )));
    }
    if tag.len() != TAG_SIZE {
        return Err(RelayError::DecryptionFailed(format!(
            "Wrong tag length: {}",
            tag.len()
        )));
    }

    let mut combined = ciphertext.to_vec();
    combined.extend_from_slice(tag);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: &combined,
                aad,
            },
        )
        .map_err(|_| RelayError::DecryptionFailed("Authentication failed".to_string()))
}

/// Seal a small key blob with the recipient's RSA key.
///
/// RSA-OAEP with SHA-256 hash, MGF1-SHA256 mask and empty label.
pub fn seal_key_blob(peer_key: &RsaPublicKey, blob: &[u8]) -> Result<String, RelayError> {
    let sealed = peer_key
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), blob)
        .map_err(|e| RelayError::Crypto(format!("Key blob seal failed: {}", e)))?;
    Ok(BASE64.encode(sealed))
}

/// Open an RSA-OAEP-sealed key blob with our private key.
pub fn open_key_blob(own_key: &RsaPrivateKey, sealed_b64: &str) -> Result<Vec<u8>, RelayError> {
    let sealed = BASE64
        .decode(sealed_b64)
        .map_err(|e| RelayError::DecryptionFailed(format!("Bad base64 key blob: {}", e)))?;
    own_key
        .decrypt(Oaep::new::<Sha256>(), &sealed)
        .map_err(|_| RelayError::DecryptionFailed("Key blob unwrap failed".to_string()))
}

/// Legacy path: the whole plaintext RSA-OAEP-encrypted directly against the
/// recipient key. No AEAD, no context binding. Retained for inbound
/// compatibility only; new messages always use the hybrid path.
pub fn encrypt_legacy(peer_key: &RsaPublicKey, plaintext: &[u8]) -> Result<String, RelayError> {
    let sealed = peer_key
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| RelayError::Crypto(format!("Legacy encrypt failed: {}", e)))?;
    Ok(BASE64.encode(sealed))
}

/// Decrypt a legacy whole-plaintext RSA ciphertext.
pub fn decrypt_legacy(own_key: &RsaPrivateKey, sealed_b64: &str) -> Result<Vec<u8>, RelayError> {
    let sealed = BASE64
        .decode(sealed_b64)
        .map_err(|e| RelayError::DecryptionFailed(format!("Bad base64 ciphertext: {}", e)))?;
    own_key
        .decrypt(Oaep::new::<Sha256>(), &sealed)
        .map_err(|_| RelayError::DecryptionFailed("Legacy decrypt failed".to_string()))
}
