//! Error types for sealfs

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for sealfs
///
/// Variants fall into five groups: not found, permission denied, invalid
/// argument, I/O failure and crypto failure. [`Error::to_errno`] flattens
/// them into the POSIX codes handed back to the kernel.
#[derive(Error, Debug)]
pub enum Error {
    // Crypto errors
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    // Namespace errors
    #[error("Inode not found: {0}")]
    InodeNotFound(u64),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Filesystem errors
    #[error("Permission denied")]
    PermissionDenied,

    #[error("Invalid file handle: {0}")]
    InvalidFileHandle(u64),

    // Storage errors
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert to libc errno for FUSE
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Error::InodeNotFound(_) | Error::PathNotFound(_) => libc::ENOENT,
            Error::InvalidFileHandle(_) => libc::EBADF,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::IsADirectory(_) => libc::EISDIR,
            Error::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::PermissionDenied => libc::EACCES,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }

    /// True for the "missing node or content key" family
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::InodeNotFound(_) | Error::PathNotFound(_))
    }

    /// True for failures raised by the content or store ciphers
    pub fn is_crypto(&self) -> bool {
        matches!(
            self,
            Error::Encryption(_) | Error::Decryption(_) | Error::KeyDerivation(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}
