//! In-memory namespace tree
//!
//! Nodes live in an arena keyed by inode number. A directory owns its
//! children through a name -> inode map and every node stores its parent's
//! inode, so there are no reference cycles. The root is always
//! [`ROOT_INO`].
//!
//! The whole tree serializes to a single JSON document: node records in
//! depth-first order starting at the root, each with its attributes and
//! child map. Parent links are not stored; [`Namespace::deserialize`]
//! rebuilds them in a second pass.

use crate::error::{Error, Result};
use crate::metadata::node::{Node, NodeAttr};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Inode number of the root directory
pub const ROOT_INO: u64 = 1;

const DOCUMENT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct TreeDocument {
    version: u32,
    nodes: Vec<NodeRecord>,
}

#[derive(Serialize, Deserialize)]
struct NodeRecord {
    name: String,
    attr: NodeAttr,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    children: BTreeMap<String, u64>,
}

/// Arena-backed hierarchy of files and directories
#[derive(Debug, Clone)]
pub struct Namespace {
    nodes: HashMap<u64, Node>,
    next_ino: u64,
}

impl Namespace {
    /// Create a tree holding only a root with the given attributes
    pub fn new(mut root_attr: NodeAttr) -> Self {
        root_attr.ino = ROOT_INO;
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INO, Node::new(String::new(), root_attr, None));
        Namespace {
            nodes,
            next_ino: ROOT_INO + 1,
        }
    }

    /// First-run tree: a root carrying the mount point's on-disk attributes
    pub fn bootstrap(mount_point: &Path) -> Self {
        let attr = match std::fs::metadata(mount_point) {
            Ok(meta) => root_attr_from(&meta),
            Err(e) => {
                warn!("Cannot stat mount point {:?}, using defaults: {}", mount_point, e);
                NodeAttr::new_directory(
                    ROOT_INO,
                    nix::unistd::getuid().as_raw(),
                    nix::unistd::getgid().as_raw(),
                    0o755,
                )
            }
        };
        debug!("Bootstrapped namespace root from {:?}", mount_point);
        Namespace::new(attr)
    }

    pub fn root(&self) -> &Node {
        &self.nodes[&ROOT_INO]
    }

    /// Number of nodes, root included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn contains(&self, ino: u64) -> bool {
        self.nodes.contains_key(&ino)
    }

    pub fn get(&self, ino: u64) -> Result<&Node> {
        self.nodes.get(&ino).ok_or(Error::InodeNotFound(ino))
    }

    pub fn get_mut(&mut self, ino: u64) -> Result<&mut Node> {
        self.nodes.get_mut(&ino).ok_or(Error::InodeNotFound(ino))
    }

    fn directory(&self, ino: u64) -> Result<&Node> {
        let node = self.get(ino)?;
        if !node.is_dir() {
            return Err(Error::NotADirectory(self.path(ino)?));
        }
        Ok(node)
    }

    fn alloc_ino(&mut self) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    /// Return the child `name` of `parent`, creating it if absent.
    ///
    /// New children get a fresh inode number and empty attributes; the
    /// caller fills in mode and ownership.
    pub fn add_child(&mut self, parent: u64, name: &str) -> Result<u64> {
        validate_name(name)?;
        if let Some(&existing) = self.directory(parent)?.children.get(name) {
            return Ok(existing);
        }

        let ino = self.alloc_ino();
        self.nodes.insert(
            ino,
            Node::new(name.to_string(), NodeAttr::empty(ino), Some(parent)),
        );
        self.get_mut(parent)?.children.insert(name.to_string(), ino);
        Ok(ino)
    }

    /// Detach `name` from `parent` and drop its whole subtree.
    ///
    /// Returns the detached node. Content records are left alone.
    pub fn remove_child(&mut self, parent: u64, name: &str) -> Result<Node> {
        let ino = match self.get_mut(parent)?.children.remove(name) {
            Some(ino) => ino,
            None => return Err(Error::PathNotFound(self.child_path(parent, name)?)),
        };

        let mut stack: Vec<u64> = self.get(ino)?.children.values().copied().collect();
        while let Some(descendant) = stack.pop() {
            if let Some(node) = self.nodes.remove(&descendant) {
                stack.extend(node.children.values().copied());
            }
        }

        self.nodes.remove(&ino).ok_or(Error::InodeNotFound(ino))
    }

    pub fn lookup(&self, parent: u64, name: &str) -> Result<&Node> {
        match self.directory(parent)?.children.get(name) {
            Some(&ino) => self.get(ino),
            None => Err(Error::PathNotFound(self.child_path(parent, name)?)),
        }
    }

    /// Move `parent/name` to `new_parent/new_name`.
    ///
    /// A node already at the destination is discarded along with its
    /// subtree. Returns the moved inode.
    pub fn rename(
        &mut self,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> Result<u64> {
        validate_name(new_name)?;
        let ino = self.lookup(parent, name)?.ino();
        self.directory(new_parent)?;

        if parent == new_parent && name == new_name {
            return Ok(ino);
        }
        if self.is_ancestor_or_self(ino, new_parent) {
            return Err(Error::InvalidArgument(format!(
                "cannot move {} beneath itself",
                self.path(ino)?
            )));
        }

        if self.get(new_parent)?.children.contains_key(new_name) {
            self.remove_child(new_parent, new_name)?;
        }

        self.get_mut(parent)?.children.remove(name);
        let node = self.get_mut(ino)?;
        node.name = new_name.to_string();
        node.parent = Some(new_parent);
        self.get_mut(new_parent)?
            .children
            .insert(new_name.to_string(), ino);

        Ok(ino)
    }

    /// True if `ancestor` is `ino` or one of its ancestors
    pub fn is_ancestor_or_self(&self, ancestor: u64, ino: u64) -> bool {
        let mut current = Some(ino);
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            current = self.nodes.get(&c).and_then(|n| n.parent);
        }
        false
    }

    /// `/`-joined names from the root; the root itself is `/`
    pub fn path(&self, ino: u64) -> Result<String> {
        let mut names = Vec::new();
        let mut current = self.get(ino)?;
        while let Some(parent) = current.parent {
            names.push(current.name.as_str());
            current = self.get(parent)?;
        }

        if names.is_empty() {
            return Ok("/".to_string());
        }
        let mut path = String::new();
        for name in names.iter().rev() {
            path.push('/');
            path.push_str(name);
        }
        Ok(path)
    }

    fn child_path(&self, parent: u64, name: &str) -> Result<String> {
        let base = self.path(parent)?;
        if base == "/" {
            Ok(format!("/{}", name))
        } else {
            Ok(format!("{}/{}", base, name))
        }
    }

    /// Regular files at or beneath `ino`
    pub fn files_under(&self, ino: u64) -> Result<Vec<u64>> {
        let mut files = Vec::new();
        let mut stack = vec![ino];
        while let Some(current) = stack.pop() {
            let node = self.get(current)?;
            if node.is_dir() {
                stack.extend(node.children.values().copied());
            } else {
                files.push(current);
            }
        }
        Ok(files)
    }

    /// Serialize the whole tree, depth-first from the root
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut records = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![ROOT_INO];
        while let Some(ino) = stack.pop() {
            let node = self.get(ino)?;
            records.push(NodeRecord {
                name: node.name.clone(),
                attr: node.attr.clone(),
                children: node.children.clone(),
            });
            stack.extend(node.children.values().rev().copied());
        }

        let document = TreeDocument {
            version: DOCUMENT_VERSION,
            nodes: records,
        };
        Ok(serde_json::to_vec(&document)?)
    }

    /// Rebuild a tree from [`Namespace::serialize`] output
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let document: TreeDocument = serde_json::from_slice(bytes)
            .map_err(|e| Error::Deserialization(format!("tree snapshot: {}", e)))?;

        if document.version != DOCUMENT_VERSION {
            return Err(Error::Deserialization(format!(
                "unsupported tree snapshot version {}",
                document.version
            )));
        }

        let mut records = document.nodes.into_iter();
        let root = records
            .next()
            .ok_or_else(|| Error::Deserialization("tree snapshot has no root".to_string()))?;
        if root.attr.ino != ROOT_INO || !root.name.is_empty() {
            return Err(Error::Deserialization(format!(
                "first record is not the root (ino {}, name {:?})",
                root.attr.ino, root.name
            )));
        }

        let mut nodes = HashMap::new();
        for record in std::iter::once(root).chain(records) {
            let ino = record.attr.ino;
            let mut node = Node::new(record.name, record.attr, None);
            node.children = record.children;
            if nodes.insert(ino, node).is_some() {
                return Err(Error::Deserialization(format!("duplicate inode {}", ino)));
            }
        }

        let mut tree = Namespace {
            next_ino: nodes.keys().max().copied().unwrap_or(ROOT_INO) + 1,
            nodes,
        };
        tree.link_parents()?;
        Ok(tree)
    }

    /// Second pass: point every child at its parent and check the shape
    fn link_parents(&mut self) -> Result<()> {
        let links: Vec<(u64, String, u64)> = self
            .nodes
            .iter()
            .flat_map(|(&parent, node)| {
                node.children
                    .iter()
                    .map(move |(name, &child)| (parent, name.clone(), child))
            })
            .collect();

        for (parent, name, child) in links {
            if child == ROOT_INO {
                return Err(Error::Deserialization(format!(
                    "root listed as child {:?} of inode {}",
                    name, parent
                )));
            }
            let node = self.nodes.get_mut(&child).ok_or_else(|| {
                Error::Deserialization(format!("child {:?} references missing inode {}", name, child))
            })?;
            if node.parent.is_some() {
                return Err(Error::Deserialization(format!("inode {} has two parents", child)));
            }
            if node.name != name {
                return Err(Error::Deserialization(format!(
                    "inode {} named {:?} but listed as {:?}",
                    child, node.name, name
                )));
            }
            node.parent = Some(parent);
        }

        if let Some((&ino, _)) = self
            .nodes
            .iter()
            .find(|(&ino, node)| ino != ROOT_INO && node.parent.is_none())
        {
            return Err(Error::Deserialization(format!("inode {} is unreachable", ino)));
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(Error::InvalidArgument(format!("invalid entry name {:?}", name)));
    }
    Ok(())
}

fn root_attr_from(meta: &std::fs::Metadata) -> NodeAttr {
    let ctime = UNIX_EPOCH
        + Duration::new(
            u64::try_from(meta.ctime()).unwrap_or(0),
            u32::try_from(meta.ctime_nsec()).unwrap_or(0),
        );
    let mut attr = NodeAttr::new_directory(ROOT_INO, meta.uid(), meta.gid(), meta.mode());
    attr.atime = meta.accessed().unwrap_or_else(|_| SystemTime::now());
    attr.mtime = meta.modified().unwrap_or_else(|_| SystemTime::now());
    attr.ctime = ctime;
    attr
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Namespace {
        Namespace::new(NodeAttr::new_directory(0, 1000, 1000, 0o755))
    }

    fn mkdir(tree: &mut Namespace, parent: u64, name: &str) -> u64 {
        let ino = tree.add_child(parent, name).unwrap();
        tree.get_mut(ino).unwrap().attr = NodeAttr::new_directory(ino, 1000, 1000, 0o755);
        ino
    }

    fn mkfile(tree: &mut Namespace, parent: u64, name: &str) -> u64 {
        let ino = tree.add_child(parent, name).unwrap();
        tree.get_mut(ino).unwrap().attr = NodeAttr::new_file(ino, 1000, 1000, 0o644);
        ino
    }

    #[test]
    fn test_root() {
        let tree = tree();
        assert_eq!(tree.root().ino(), ROOT_INO);
        assert_eq!(tree.root().name, "");
        assert_eq!(tree.path(ROOT_INO).unwrap(), "/");
        assert!(tree.is_empty());
    }

    #[test]
    fn test_add_child_is_idempotent() {
        let mut tree = tree();
        let a = mkdir(&mut tree, ROOT_INO, "a");
        assert_eq!(tree.add_child(ROOT_INO, "a").unwrap(), a);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.get(a).unwrap().parent(), Some(ROOT_INO));
    }

    #[test]
    fn test_add_child_rejects_bad_names_and_files() {
        let mut tree = tree();
        let f = mkfile(&mut tree, ROOT_INO, "f");
        assert!(matches!(tree.add_child(ROOT_INO, ""), Err(Error::InvalidArgument(_))));
        assert!(matches!(tree.add_child(ROOT_INO, "x/y"), Err(Error::InvalidArgument(_))));
        assert!(matches!(tree.add_child(f, "child"), Err(Error::NotADirectory(_))));
    }

    #[test]
    fn test_path() {
        let mut tree = tree();
        let a = mkdir(&mut tree, ROOT_INO, "a");
        let b = mkfile(&mut tree, a, "b.txt");
        assert_eq!(tree.path(a).unwrap(), "/a");
        assert_eq!(tree.path(b).unwrap(), "/a/b.txt");
    }

    #[test]
    fn test_lookup_missing() {
        let tree = tree();
        match tree.lookup(ROOT_INO, "nope") {
            Err(Error::PathNotFound(p)) => assert_eq!(p, "/nope"),
            other => panic!("unexpected {:?}", other.map(|n| n.ino())),
        }
    }

    #[test]
    fn test_remove_child_drops_subtree() {
        let mut tree = tree();
        let a = mkdir(&mut tree, ROOT_INO, "a");
        let b = mkdir(&mut tree, a, "b");
        let c = mkfile(&mut tree, b, "c");

        let removed = tree.remove_child(ROOT_INO, "a").unwrap();
        assert_eq!(removed.ino(), a);
        assert!(!tree.contains(b));
        assert!(!tree.contains(c));
        assert!(tree.lookup(ROOT_INO, "a").is_err());
        assert!(tree.remove_child(ROOT_INO, "a").unwrap_err().is_not_found());
    }

    #[test]
    fn test_rename_reparents() {
        let mut tree = tree();
        let a = mkdir(&mut tree, ROOT_INO, "a");
        let b = mkdir(&mut tree, ROOT_INO, "b");
        let f = mkfile(&mut tree, a, "old.txt");

        assert_eq!(tree.rename(a, "old.txt", b, "new.txt").unwrap(), f);
        assert_eq!(tree.path(f).unwrap(), "/b/new.txt");
        assert_eq!(tree.get(f).unwrap().parent(), Some(b));
        assert!(tree.lookup(a, "old.txt").is_err());
    }

    #[test]
    fn test_rename_replaces_destination() {
        let mut tree = tree();
        let x = mkfile(&mut tree, ROOT_INO, "x");
        let y = mkfile(&mut tree, ROOT_INO, "y");

        tree.rename(ROOT_INO, "x", ROOT_INO, "y").unwrap();
        assert!(!tree.contains(y));
        assert_eq!(tree.lookup(ROOT_INO, "y").unwrap().ino(), x);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_rename_into_own_subtree_rejected() {
        let mut tree = tree();
        let a = mkdir(&mut tree, ROOT_INO, "a");
        let b = mkdir(&mut tree, a, "b");

        assert!(matches!(
            tree.rename(ROOT_INO, "a", b, "a"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            tree.rename(ROOT_INO, "a", a, "self"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_files_under() {
        let mut tree = tree();
        let a = mkdir(&mut tree, ROOT_INO, "a");
        let b = mkdir(&mut tree, a, "b");
        let f1 = mkfile(&mut tree, a, "1");
        let f2 = mkfile(&mut tree, b, "2");

        let mut files = tree.files_under(a).unwrap();
        files.sort();
        assert_eq!(files, vec![f1, f2]);
        assert_eq!(tree.files_under(f1).unwrap(), vec![f1]);
    }

    #[test]
    fn test_serialize_deserialize_preserves_shape() {
        let mut tree = tree();
        let a = mkdir(&mut tree, ROOT_INO, "a");
        let b = mkdir(&mut tree, a, "b");
        let c = mkfile(&mut tree, b, "c.txt");
        let d = mkfile(&mut tree, ROOT_INO, "d");
        tree.get_mut(c).unwrap().attr.size = 42;
        tree.rename(ROOT_INO, "d", a, "moved").unwrap();
        let gone = mkfile(&mut tree, ROOT_INO, "gone");
        tree.remove_child(ROOT_INO, "gone").unwrap();

        let bytes = tree.serialize().unwrap();
        let restored = Namespace::deserialize(&bytes).unwrap();

        assert_eq!(restored.len(), tree.len());
        assert!(!restored.contains(gone));
        for ino in [ROOT_INO, a, b, c, d] {
            let original = tree.get(ino).unwrap();
            let copy = restored.get(ino).unwrap();
            assert_eq!(copy.name, original.name);
            assert_eq!(copy.attr, original.attr);
            assert_eq!(copy.parent(), original.parent());
            assert_eq!(
                copy.children().collect::<Vec<_>>(),
                original.children().collect::<Vec<_>>()
            );
            assert_eq!(restored.path(ino).unwrap(), tree.path(ino).unwrap());
        }
        assert_eq!(restored.get(c).unwrap().attr.size, 42);
    }

    #[test]
    fn test_deserialized_tree_allocates_fresh_inodes() {
        let mut tree = tree();
        let a = mkdir(&mut tree, ROOT_INO, "a");

        let mut restored = Namespace::deserialize(&tree.serialize().unwrap()).unwrap();
        let next = restored.add_child(ROOT_INO, "next").unwrap();
        assert!(next > a);
    }

    #[test]
    fn test_deserialize_rejects_corrupt_documents() {
        assert!(matches!(
            Namespace::deserialize(b"{not json"),
            Err(Error::Deserialization(_))
        ));

        let dangling = br#"{"version":1,"nodes":[{"name":"","attr":{"ino":1,"size":0,
            "atime":{"secs_since_epoch":0,"nanos_since_epoch":0},
            "mtime":{"secs_since_epoch":0,"nanos_since_epoch":0},
            "ctime":{"secs_since_epoch":0,"nanos_since_epoch":0},
            "mode":16877,"uid":0,"gid":0},"children":{"a":7}}]}"#;
        assert!(matches!(
            Namespace::deserialize(dangling),
            Err(Error::Deserialization(_))
        ));
    }
}
