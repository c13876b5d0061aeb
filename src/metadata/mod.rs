//! Metadata module
//!
//! The namespace tree, the key-value store it is mirrored into, and the
//! content records stored beside it.

mod node;
mod persist;
mod store;
mod tree;

pub use node::{FileKind, Node, NodeAttr};
pub use persist::{ContentStore, SnapshotPersistence, TreePersistence, SNAPSHOT_KEY};
pub use store::{KvOptions, KvStats, KvStore};
pub use tree::{Namespace, ROOT_INO};
