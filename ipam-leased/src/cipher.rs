//! Deterministic encryption of caller secrets.
//!
//! The store looks records up by secret equality, so the same plaintext must
//! always produce the same ciphertext. `SivCipher` derives the AES-GCM nonce
//! from an HMAC of the plaintext (synthetic IV): identical secrets collide on
//! purpose, distinct secrets never share a nonce.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("encryption failed")]
    Encrypt,
    #[error("ciphertext is malformed")]
    Malformed,
    #[error("ciphertext failed authentication")]
    Authentication,
}

/// Encrypts secrets before they reach the store.
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError>;
    fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError>;
}

pub struct SivCipher {
    aead: Aes256Gcm,
    nonce_key: [u8; 32],
}

impl SivCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"ipam-leased/nonce-key");
        hasher.update(key);

        Self {
            aead: Aes256Gcm::new(key.into()),
            nonce_key: hasher.finalize().into(),
        }
    }

    fn synthetic_nonce(&self, plaintext: &[u8]) -> Result<[u8; NONCE_LEN], CipherError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.nonce_key)
            .map_err(|_| CipherError::Encrypt)?;
        mac.update(plaintext);
        let tag = mac.finalize().into_bytes();

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&tag[..NONCE_LEN]);
        Ok(nonce)
    }
}

impl SecretCipher for SivCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let nonce = self.synthetic_nonce(plaintext.as_bytes())?;
        let sealed = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(hex::encode(out))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError> {
        let raw = hex::decode(ciphertext).map_err(|_| CipherError::Malformed)?;
        if raw.len() <= NONCE_LEN {
            return Err(CipherError::Malformed);
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);

        let plain = self
            .aead
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CipherError::Authentication)?;

        // The nonce is a function of the plaintext; anything else was not
        // produced by this cipher.
        if self.synthetic_nonce(&plain)?.as_slice() != nonce {
            return Err(CipherError::Authentication);
        }

        String::from_utf8(plain).map_err(|_| CipherError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher(seed: u8) -> SivCipher {
        SivCipher::new(&[seed; 32])
    }

    #[test]
    fn test_deterministic() {
        let c = cipher(7);
        let a = c.encrypt("s3cr3t!!").unwrap();
        let b = c.encrypt("s3cr3t!!").unwrap();
        assert_eq!(a, b, "Same secret must encrypt to the same ciphertext");
        assert_ne!(a, c.encrypt("s3cr3t!?").unwrap());
    }

    #[test]
    fn test_decrypt_recovers_plaintext() {
        let c = cipher(7);
        let sealed = c.encrypt("a_secret_value").unwrap();
        assert!(!sealed.contains("a_secret_value"));
        assert_eq!(c.decrypt(&sealed).unwrap(), "a_secret_value");
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = cipher(1).encrypt("a_secret_value").unwrap();
        assert!(matches!(
            cipher(2).decrypt(&sealed),
            Err(CipherError::Authentication)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let c = cipher(3);
        let mut raw = hex::decode(c.encrypt("a_secret_value").unwrap()).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        assert!(c.decrypt(&hex::encode(raw)).is_err());
        assert!(matches!(c.decrypt("zz"), Err(CipherError::Malformed)));
    }
}
