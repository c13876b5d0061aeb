//! FUSE filesystem implementation
//!
//! [`FsCore`] holds the semantics of every verb; [`SealFs`] adapts it to
//! the kernel through `fuser`.

mod core;
mod filesystem;
mod handle;

pub use self::core::{Caller, DirEntry, FsCore, SetAttr};
pub use filesystem::SealFs;
pub use handle::{FileHandle, HandleManager};
