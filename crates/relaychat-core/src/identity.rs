//! RSA identity: key lifecycle, wire encoding and uid derivation
//!
//! An identity is a 2048-bit RSA keypair. The public key travels as
//! base64-wrapped PEM ("wire form"); a party's uid is the lowercase-hex MD5
//! of that wire string. The digest is a routing handle for the relay, not a
//! security boundary; authenticity always comes from signatures and the
//! per-contact handshake.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest, Md5};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tracing::info;

use crate::error::RelayError;

/// RSA modulus size in bits
pub const KEY_BITS: usize = 2048;

/// File name of the persisted private key inside the data directory
const IDENTITY_FILE: &str = "identity.pem";

/// Our own keypair plus the derived wire form and uid.
///
/// The wire form and uid are computed once at construction so request
/// building never re-encodes the key.
pub struct Identity {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    wire_pub: String,
    uid: String,
}

impl Identity {
    /// Generate a fresh 2048-bit identity.
    pub fn generate() -> Result<Self, RelayError> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS)
            .map_err(|e| RelayError::Identity(format!("Key generation failed: {}", e)))?;
        Self::from_private(private)
    }

    /// Load the identity from the data directory, generating and persisting
    /// a new one on first run.
    pub fn load_or_generate(data_dir: impl AsRef<Path>) -> Result<Self, RelayError> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(IDENTITY_FILE);

        if path.exists() {
            let pem = std::fs::read_to_string(&path)?;
            return Self::from_private_pem(&pem);
        }

        info!(?path, "No identity found, generating a new keypair");
        let identity = Self::generate()?;
        let pem = identity
            .private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| RelayError::Identity(format!("PEM export failed: {}", e)))?;
        std::fs::write(&path, pem.as_bytes())?;
        Ok(identity)
    }

    /// Import an identity from a PKCS#8 private-key PEM.
    pub fn from_private_pem(pem: &str) -> Result<Self, RelayError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| RelayError::Identity(format!("Invalid private key PEM: {}", e)))?;
        Self::from_private(private)
    }

    fn from_private(private: RsaPrivateKey) -> Result<Self, RelayError> {
        let public = RsaPublicKey::from(&private);
        let wire_pub = encode_wire_pub(&public)?;
        let uid = derive_uid(&wire_pub);
        Ok(Self {
            private,
            public,
            wire_pub,
            uid,
        })
    }

    /// Our private key, for unsealing inbound key blobs.
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    /// Our public key.
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Public key PEM (SPKI).
    pub fn public_pem(&self) -> Result<String, RelayError> {
        self.public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| RelayError::Identity(format!("PEM export failed: {}", e)))
    }

    /// Wire form of the public key: base64 of the PEM text.
    pub fn wire_pub(&self) -> &str {
        &self.wire_pub
    }

    /// Our routing uid.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Sign data with RSASSA-PKCS1-v1_5 over SHA-256.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, RelayError> {
        let signing_key = SigningKey::<Sha256>::new(self.private.clone());
        let signature = signing_key
            .try_sign(data)
            .map_err(|e| RelayError::Identity(format!("Signing failed: {}", e)))?;
        Ok(signature.to_vec())
    }
}

/// Encode a public key to its wire form (base64-wrapped PEM).
pub fn encode_wire_pub(key: &RsaPublicKey) -> Result<String, RelayError> {
    let pem = key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| RelayError::Identity(format!("PEM export failed: {}", e)))?;
    Ok(BASE64.encode(pem.as_bytes()))
}

/// Parse a wire-form public key back into an [`RsaPublicKey`].
pub fn parse_wire_pub(wire: &str) -> Result<RsaPublicKey, RelayError> {
    let pem_bytes = BASE64
        .decode(wire)
        .map_err(|e| RelayError::Identity(format!("Bad base64 public key: {}", e)))?;
    let pem = String::from_utf8(pem_bytes)
        .map_err(|_| RelayError::Identity("Public key PEM is not UTF-8".to_string()))?;
    RsaPublicKey::from_public_key_pem(&pem)
        .map_err(|e| RelayError::Identity(format!("Invalid public key PEM: {}", e)))
}

/// Derive the routing uid for a wire-form public key.
///
/// Both sides compute the same uid for a given key: lowercase hex MD5 of
/// the UTF-8 bytes of the base64 string.
pub fn derive_uid(wire_pub: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(wire_pub.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify an RSASSA-PKCS1-v1_5 / SHA-256 signature.
pub fn verify_signature(key: &RsaPublicKey, data: &[u8], signature: &[u8]) -> bool {
    let Ok(signature) = Signature::try_from(signature) else {
        return false;
    };
    VerifyingKey::<Sha256>::new(key.clone())
        .verify(data, &signature)
        .is_ok()
}
