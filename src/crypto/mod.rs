//! Cryptography module for sealfs
//!
//! Two ciphers are in play:
//! - AES-128-CBC with PKCS#7 padding for file content records (the content codec)
//! - AES-256-GCM for optional whole-store sealing of every KV value
//!
//! Both keys come from the operator passphrase, see [`KeyMaterial`].

mod codec;
mod encryption;
mod keys;

pub use codec::{
    decrypt_cbc, encrypt_cbc, ContentCodec, ContentEncoding, IvMode, BLOCK_SIZE, LEGACY_IV,
};
pub use encryption::{seal, unseal, SealedValue};
pub use keys::KeyMaterial;

/// Size of the AES-128 content key in bytes
pub const CONTENT_KEY_SIZE: usize = 16;

/// Size of the AES-256 store key in bytes
pub const STORE_KEY_SIZE: usize = 32;

/// Size of GCM nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;
