//! Passphrase message encryption
//!
//! When a passphrase is configured every outbound message is encrypted as a
//! whole with AES-256-GCM under a SHA-256-derived key, and inbound traffic
//! is decrypted before the framing parse. The layout is
//! `[12-byte nonce][ciphertext + tag]`. After decryption the second
//! plaintext byte must be `{` (the start of the JSON body), which fails
//! fast on a passphrase mismatch without waiting for a parse error.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use sha2::{Digest, Sha256};

use crate::error::{Result, StreamError};

const NONCE_LEN: usize = 12;

pub struct AesPskCipher {
    cipher: Aes256Gcm,
}

impl AesPskCipher {
    pub fn new(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| StreamError::Fail("encryption failed".to_string()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() <= NONCE_LEN {
            return Err(StreamError::InvalidMessage(
                "encrypted message too short".to_string(),
            ));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StreamError::InvalidMessage("decryption failed".to_string()))
    }
}

/// The signature check applied after decryption: the message is
/// `[opcode][JSON ...]`, so a correctly decrypted message of more than one
/// byte starts its body with `{`.
pub fn plaintext_signature_ok(plaintext: &[u8]) -> bool {
    plaintext.len() == 1 || plaintext.get(1) == Some(&b'{')
}
