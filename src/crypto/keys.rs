//! Key derivation from the operator passphrase
//!
//! - Content key: first 16 bytes of SHA-256(passphrase)
//! - Store key: HKDF-SHA256 over the same digest, used to seal KV values

use crate::crypto::{CONTENT_KEY_SIZE, STORE_KEY_SIZE};
use crate::error::{Error, Result};
use ring::digest::{digest, SHA256};
use ring::hkdf::{self, Salt, HKDF_SHA256};
use zeroize::Zeroizing;

const STORE_KEY_SALT: &[u8] = b"sealfs-store-salt-v1";
const STORE_KEY_INFO: &[u8] = b"sealfs-store-v1";

/// Keys derived from the passphrase for one mount
pub struct KeyMaterial {
    content_key: Zeroizing<[u8; CONTENT_KEY_SIZE]>,
    store_key: Zeroizing<[u8; STORE_KEY_SIZE]>,
}

impl KeyMaterial {
    /// Derive all keys from a passphrase
    pub fn from_passphrase(passphrase: &[u8]) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(Error::KeyDerivation("passphrase must not be empty".to_string()));
        }

        let hashed = digest(&SHA256, passphrase);
        let hashed = hashed.as_ref();

        let mut content_key = Zeroizing::new([0u8; CONTENT_KEY_SIZE]);
        content_key.copy_from_slice(&hashed[..CONTENT_KEY_SIZE]);

        let prk = Salt::new(HKDF_SHA256, STORE_KEY_SALT).extract(hashed);
        let mut store_key = Zeroizing::new([0u8; STORE_KEY_SIZE]);
        prk.expand(&[STORE_KEY_INFO], HkdfKeyType)
            .map_err(|_| Error::KeyDerivation("HKDF expansion failed".to_string()))?
            .fill(&mut store_key[..])
            .map_err(|_| Error::KeyDerivation("HKDF fill failed".to_string()))?;

        Ok(KeyMaterial {
            content_key,
            store_key,
        })
    }

    /// AES-128 key for file content records
    pub fn content_key(&self) -> &[u8; CONTENT_KEY_SIZE] {
        &self.content_key
    }

    /// AES-256 key for whole-store sealing
    pub fn store_key(&self) -> &[u8; STORE_KEY_SIZE] {
        &self.store_key
    }
}

/// HKDF key type for ring
struct HkdfKeyType;

impl hkdf::KeyType for HkdfKeyType {
    fn len(&self) -> usize {
        STORE_KEY_SIZE
    }
}
