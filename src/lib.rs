//! sealfs - Encrypted, process-gated filesystem
//!
//! This library provides a FUSE filesystem whose namespace and file
//! content live encrypted in an embedded key-value store. Every request is
//! authorized against the executable of the calling process.

pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod gate;
pub mod metadata;

pub use config::Config;
pub use error::{Error, Result};
