//! Content codec: framing and AES-128-CBC encryption of file bodies
//!
//! A framed record looks like
//!
//! ```text
//! +----------------------+-----------------------+----------------------+
//! | plaintext len (u32BE)| IV (per-record only)  | AES-128-CBC(PKCS#7)  |
//! +----------------------+-----------------------+----------------------+
//! ```
//!
//! In [`IvMode::Fixed`] every record is encrypted under [`LEGACY_IV`]. That
//! keeps byte compatibility with existing stores but leaks equal plaintext
//! prefixes across files. New deployments should pick [`IvMode::PerRecord`],
//! which stores a random IV in each record; the two layouts are not
//! interchangeable.

use crate::crypto::CONTENT_KEY_SIZE;
use crate::error::{Error, Result};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// IV shared by every record in fixed mode.
///
/// Security defect kept for compatibility with stores written by earlier
/// releases. See [`IvMode`].
pub const LEGACY_IV: [u8; BLOCK_SIZE] = *b"1234567887654321";

/// Length of the plaintext-size header
const HEADER_SIZE: usize = 4;

/// How content records are laid out in the store
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ContentEncoding {
    /// Plaintext bytes stored as-is
    Raw,
    /// Length header followed by CBC ciphertext
    #[default]
    Framed,
}

/// Initialization vector policy for framed records
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IvMode {
    /// One constant IV for all records (legacy layout)
    #[default]
    Fixed,
    /// Random IV per record, stored after the length header
    PerRecord,
}

/// Encrypt `plaintext` with AES-128-CBC, PKCS#7 padded.
///
/// Aligned input still gains one full block of padding.
pub fn encrypt_cbc(
    plaintext: &[u8],
    key: &[u8; CONTENT_KEY_SIZE],
    iv: &[u8; BLOCK_SIZE],
) -> Vec<u8> {
    Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypt AES-128-CBC ciphertext and strip PKCS#7 padding
pub fn decrypt_cbc(
    ciphertext: &[u8],
    key: &[u8; CONTENT_KEY_SIZE],
    iv: &[u8; BLOCK_SIZE],
) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(Error::Decryption(format!(
            "ciphertext length {} is not a positive multiple of {}",
            ciphertext.len(),
            BLOCK_SIZE
        )));
    }

    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::Decryption("invalid padding - wrong key or corrupt record".to_string()))
}

/// Encodes plaintext file bodies into content records and back
pub struct ContentCodec {
    key: Zeroizing<[u8; CONTENT_KEY_SIZE]>,
    encoding: ContentEncoding,
    iv_mode: IvMode,
}

impl ContentCodec {
    /// Create a codec for the given key and record layout
    pub fn new(key: [u8; CONTENT_KEY_SIZE], encoding: ContentEncoding, iv_mode: IvMode) -> Self {
        ContentCodec {
            key: Zeroizing::new(key),
            encoding,
            iv_mode,
        }
    }

    /// Turn a plaintext body into the bytes stored under the file's path
    pub fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if self.encoding == ContentEncoding::Raw {
            return Ok(plaintext.to_vec());
        }

        let len = u32::try_from(plaintext.len()).map_err(|_| {
            Error::Encryption(format!("content of {} bytes exceeds frame limit", plaintext.len()))
        })?;

        let mut record = Vec::with_capacity(HEADER_SIZE + BLOCK_SIZE * 2 + plaintext.len());
        record.extend_from_slice(&len.to_be_bytes());

        let iv = match self.iv_mode {
            IvMode::Fixed => LEGACY_IV,
            IvMode::PerRecord => {
                let mut iv = [0u8; BLOCK_SIZE];
                rand::thread_rng().fill_bytes(&mut iv);
                record.extend_from_slice(&iv);
                iv
            }
        };

        record.extend_from_slice(&encrypt_cbc(plaintext, &self.key, &iv));
        Ok(record)
    }

    /// Recover the plaintext body from a stored record
    pub fn decode(&self, record: &[u8]) -> Result<Vec<u8>> {
        if self.encoding == ContentEncoding::Raw || record.is_empty() {
            return Ok(record.to_vec());
        }

        if record.len() < HEADER_SIZE {
            return Err(Error::Decryption(format!(
                "record of {} bytes is shorter than its header",
                record.len()
            )));
        }

        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&record[..HEADER_SIZE]);
        let expected = u32::from_be_bytes(header) as usize;
        let body = &record[HEADER_SIZE..];

        let (iv, ciphertext) = match self.iv_mode {
            IvMode::Fixed => (LEGACY_IV, body),
            IvMode::PerRecord => {
                if body.len() < BLOCK_SIZE {
                    return Err(Error::Decryption("record truncated inside IV".to_string()));
                }
                let mut iv = [0u8; BLOCK_SIZE];
                iv.copy_from_slice(&body[..BLOCK_SIZE]);
                (iv, &body[BLOCK_SIZE..])
            }
        };

        let plaintext = decrypt_cbc(ciphertext, &self.key, &iv)?;
        if plaintext.len() != expected {
            return Err(Error::Decryption(format!(
                "length header says {} bytes, decrypted {}",
                expected,
                plaintext.len()
            )));
        }

        Ok(plaintext)
    }
}
