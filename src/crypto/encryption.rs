//! AES-256-GCM sealing of key-value store entries
//!
//! When whole-store encryption is enabled every value written to sled is
//! sealed here first, so the database on disk only holds `nonce || ciphertext || tag`.

use crate::crypto::{NONCE_SIZE, STORE_KEY_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};

/// A sealed store value: random nonce plus ciphertext with appended tag
#[derive(Debug, Clone)]
pub struct SealedValue {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

impl SealedValue {
    /// Serialize to bytes for storage
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Decryption("Sealed value too short".to_string()));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[..NONCE_SIZE]);
        Ok(SealedValue {
            nonce,
            ciphertext: bytes[NONCE_SIZE..].to_vec(),
        })
    }
}

fn store_key(key: &[u8; STORE_KEY_SIZE]) -> Result<LessSafeKey> {
    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| Error::Encryption("Failed to create store key".to_string()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Seal a value for storage
pub fn seal(key: &[u8; STORE_KEY_SIZE], plaintext: &[u8]) -> Result<SealedValue> {
    let sealing_key = store_key(key)?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut in_out = plaintext.to_vec();
    in_out.reserve(TAG_SIZE);
    sealing_key
        .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
        .map_err(|_| Error::Encryption("Sealing store value failed".to_string()))?;

    Ok(SealedValue {
        nonce,
        ciphertext: in_out,
    })
}

/// Open a sealed value read back from storage
pub fn unseal(key: &[u8; STORE_KEY_SIZE], sealed: &SealedValue) -> Result<Vec<u8>> {
    let opening_key = store_key(key)?;

    let mut in_out = sealed.ciphertext.clone();
    let plaintext = opening_key
        .open_in_place(
            Nonce::assume_unique_for_key(sealed.nonce),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| Error::Decryption("Store value corrupted or wrong key".to_string()))?;

    Ok(plaintext.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; STORE_KEY_SIZE] {
        let mut key = [0u8; STORE_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    #[test]
    fn test_seal_unseal() {
        let key = test_key();
        let sealed = seal(&key, b"tree snapshot").unwrap();
        assert_eq!(unseal(&key, &sealed).unwrap(), b"tree snapshot");
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(&test_key(), b"Secret data").unwrap();
        assert!(unseal(&test_key(), &sealed).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = test_key();
        let mut sealed = seal(&key, b"Secret data").unwrap();
        sealed.ciphertext[0] ^= 0xFF;
        assert!(unseal(&key, &sealed).is_err());
    }

    #[test]
    fn test_bytes_roundtrip() {
        let key = test_key();
        let bytes = seal(&key, b"").unwrap().to_bytes();
        let restored = SealedValue::from_bytes(&bytes).unwrap();
        assert!(unseal(&key, &restored).unwrap().is_empty());
        assert!(SealedValue::from_bytes(&bytes[..10]).is_err());
    }
}
