//! Node-channel and flow-report encryption.
//!
//! Nodes and the panel share the node secret; both sides derive an
//! AES-256-GCM key from it with PBKDF2-HMAC-SHA256 and exchange frames
//! wrapped in `{"encrypted": true, "data": "<base64(nonce || ct+tag)>"}`.
//! Plaintext frames (`encrypted` absent or false) stay legal so older
//! node builds keep working.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

/// Key-derivation salt; fixed so both ends derive the same key from the
/// shared node secret.
const KDF_SALT: &[u8] = b"gateport-node-channel-v1";
const KDF_ROUNDS: u32 = 10_000;

/// Errors that can occur during wire encryption operations
#[derive(Error, Debug)]
pub enum WireCryptoError {
    #[error("Invalid ciphertext: too short")]
    CiphertextTooShort,

    #[error("Invalid base64 payload")]
    InvalidBase64,

    #[error("Decryption failed: wrong key or corrupted data")]
    DecryptionFailed,
}

/// Outer envelope shared by the control channel and flow uploads.
#[derive(Debug, Serialize, Deserialize)]
pub struct WireEnvelope {
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// AES-256-GCM cipher bound to one node secret.
///
/// Ciphertext format: nonce (12 bytes) || AES-GCM ciphertext+tag
#[derive(Clone)]
pub struct NodeCipher {
    key: [u8; 32],
}

impl NodeCipher {
    /// Derive the channel key from the node secret.
    pub fn from_secret(secret: &str) -> Self {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(secret.as_bytes(), KDF_SALT, KDF_ROUNDS, &mut key);
        Self { key }
    }

    /// Encrypt a plaintext frame, returning base64(nonce || ct+tag).
    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .expect("AES-256-GCM key length is always 32 bytes");

        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .expect("AES-256-GCM encryption should not fail with valid key and nonce");

        let mut combined = Vec::with_capacity(12 + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        BASE64.encode(combined)
    }

    /// Decrypt base64(nonce || ct+tag) back to the plaintext frame.
    pub fn decrypt(&self, data_b64: &str) -> Result<Vec<u8>, WireCryptoError> {
        let data = BASE64
            .decode(data_b64.trim())
            .map_err(|_| WireCryptoError::InvalidBase64)?;

        // Minimum size: nonce (12) + tag (16)
        if data.len() < 28 {
            return Err(WireCryptoError::CiphertextTooShort);
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| WireCryptoError::DecryptionFailed)?;

        let nonce = Nonce::from_slice(&data[0..12]);
        cipher
            .decrypt(nonce, &data[12..])
            .map_err(|_| WireCryptoError::DecryptionFailed)
    }

    /// Wrap a JSON frame in the encrypted envelope.
    pub fn seal_frame(&self, frame_json: &str) -> String {
        let envelope = WireEnvelope {
            encrypted: true,
            data: self.encrypt(frame_json.as_bytes()),
            timestamp: None,
        };
        serde_json::to_string(&envelope).expect("envelope serialization cannot fail")
    }

    /// Unwrap an inbound message: if it parses as an encrypted envelope,
    /// decrypt it; otherwise treat the raw text as the frame itself.
    /// Undecryptable envelopes fall back to the raw text, matching the
    /// tolerant behaviour nodes rely on during secret rotation.
    pub fn open_frame(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return String::new();
        }

        let Ok(envelope) = serde_json::from_str::<WireEnvelope>(trimmed) else {
            return trimmed.to_string();
        };
        if !envelope.encrypted || envelope.data.trim().is_empty() {
            return trimmed.to_string();
        }

        match self.decrypt(&envelope.data) {
            Ok(plain) => String::from_utf8(plain).unwrap_or_else(|_| trimmed.to_string()),
            Err(_) => trimmed.to_string(),
        }
    }
}
