//! Sled-based key-value store
//!
//! Holds the tree snapshot and every content record. When opened with an
//! encryption key each value is sealed with AES-256-GCM before it reaches
//! sled, so the database files only ever contain ciphertext.

use crate::crypto::{seal, unseal, SealedValue, STORE_KEY_SIZE};
use crate::error::{Error, Result};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Tree};
use std::path::PathBuf;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Tree holding snapshot and content records
const DATA_TREE: &str = "data";
/// Tree holding store bookkeeping (key check)
const META_TREE: &str = "meta";
/// Sealed known value used to detect a wrong store key at open
const KEY_CHECK: &[u8] = b"key-check";
const KEY_CHECK_VALUE: &[u8] = b"sealfs";

/// Options for [`KvStore::open`]
#[derive(Clone, Default)]
pub struct KvOptions {
    /// Directory of the sled database (ignored when `in_memory`)
    pub path: PathBuf,
    /// Seal every value with this key
    pub encryption_key: Option<[u8; STORE_KEY_SIZE]>,
    /// Temporary database discarded on close
    pub in_memory: bool,
}

impl std::fmt::Debug for KvOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvOptions")
            .field("path", &self.path)
            .field("encrypted", &self.encryption_key.is_some())
            .field("in_memory", &self.in_memory)
            .finish()
    }
}

/// Byte-key/byte-value store
pub struct KvStore {
    db: Db,
    data: Tree,
    key: Option<Zeroizing<[u8; STORE_KEY_SIZE]>>,
}

impl KvStore {
    /// Open or create a store
    pub fn open(options: KvOptions) -> Result<Self> {
        let db = if options.in_memory {
            sled::Config::new().temporary(true).open()?
        } else {
            std::fs::create_dir_all(&options.path)?;
            sled::Config::new().path(&options.path).open()?
        };

        let data = db.open_tree(DATA_TREE)?;
        let store = KvStore {
            db,
            data,
            key: options.encryption_key.map(Zeroizing::new),
        };
        store.verify_key()?;

        info!(
            "KV store opened: path={:?}, in_memory={}, encrypted={}, keys={}",
            options.path,
            options.in_memory,
            store.key.is_some(),
            store.data.len()
        );
        Ok(store)
    }

    /// Check (or on first open, plant) the sealed key-check value
    fn verify_key(&self) -> Result<()> {
        let key = match &self.key {
            Some(key) => key,
            None => return Ok(()),
        };

        let meta = self.db.open_tree(META_TREE)?;
        match meta.get(KEY_CHECK)? {
            Some(stored) => {
                let sealed = SealedValue::from_bytes(&stored)?;
                let value = unseal(key, &sealed).map_err(|_| {
                    Error::Decryption("store key mismatch (wrong passphrase?)".to_string())
                })?;
                if value != KEY_CHECK_VALUE {
                    return Err(Error::Decryption("store key check value corrupt".to_string()));
                }
            }
            None => {
                let sealed = seal(key, KEY_CHECK_VALUE)?;
                meta.insert(KEY_CHECK, sealed.to_bytes())?;
                debug!("Planted store key check");
            }
        }
        Ok(())
    }

    fn seal_value(&self, value: &[u8]) -> Result<Vec<u8>> {
        match &self.key {
            Some(key) => Ok(seal(key, value)?.to_bytes()),
            None => Ok(value.to_vec()),
        }
    }

    fn unseal_value(&self, stored: &[u8]) -> Result<Vec<u8>> {
        match &self.key {
            Some(key) => unseal(key, &SealedValue::from_bytes(stored)?),
            None => Ok(stored.to_vec()),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.data.get(key)? {
            Some(stored) => Ok(Some(self.unseal_value(&stored)?)),
            None => Ok(None),
        }
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let stored = self.seal_value(value)?;
        self.data.insert(key, stored)?;
        Ok(())
    }

    /// Remove a key; absent keys are not an error
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.data.remove(key)?;
        Ok(())
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.data.contains_key(key)?)
    }

    /// Move the value at `from` to `to` in one transaction.
    ///
    /// Returns false when `from` is absent. A value already at `to` is
    /// overwritten.
    pub fn move_key(&self, from: &[u8], to: &[u8]) -> Result<bool> {
        if from == to {
            return self.contains(from);
        }

        let result: std::result::Result<bool, TransactionError<()>> =
            self.data.transaction(|tx| match tx.get(from)? {
                Some(value) => {
                    tx.insert(to, value)?;
                    tx.remove(from)?;
                    Ok(true)
                }
                None => Ok::<bool, ConflictableTransactionError<()>>(false),
            });

        match result {
            Ok(moved) => Ok(moved),
            Err(TransactionError::Storage(e)) => Err(Error::Database(e)),
            Err(TransactionError::Abort(())) => {
                Err(Error::Internal("move transaction aborted".to_string()))
            }
        }
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Flush and release the database
    pub fn close(self) -> Result<()> {
        self.flush()?;
        info!("KV store closed");
        Ok(())
    }

    /// Store statistics
    pub fn stats(&self) -> Result<KvStats> {
        let mut stats = KvStats {
            key_count: 0,
            stored_bytes: 0,
            size_on_disk: self.db.size_on_disk()?,
            encrypted: self.key.is_some(),
        };
        for entry in self.data.iter() {
            let (key, value) = entry?;
            stats.key_count += 1;
            stats.stored_bytes += (key.len() + value.len()) as u64;
        }
        Ok(stats)
    }
}

/// Store statistics
#[derive(Debug, Clone)]
pub struct KvStats {
    pub key_count: u64,
    /// Key plus stored (possibly sealed) value bytes
    pub stored_bytes: u64,
    pub size_on_disk: u64,
    pub encrypted: bool,
}
