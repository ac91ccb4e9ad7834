//! Merkle directory nodes and tree flattening
//!
//! A directory tree is stored as a graph of [`DirectoryNode`]s where every
//! subdirectory is referenced by the digest of its canonical serialization.
//! Flattening resolves that graph into a single path-keyed map, ordered by
//! path, which is used for upload diffing, download materialization and
//! display alike.

use crate::digest::Digest;
use crate::error::{CasError, Result};
use crate::DEFAULT_MAX_TREE_DEPTH;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::debug;

/// A regular file inside a directory node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub digest: Digest,
    pub is_executable: bool,
}

/// A subdirectory, referenced by the digest of its own node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub digest: Digest,
}

/// A symbolic link; the target is kept verbatim and never followed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkEntry {
    pub name: String,
    pub target: String,
}

/// One level of a Merkle directory tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryNode {
    pub files: Vec<FileEntry>,
    pub directories: Vec<DirectoryEntry>,
    pub symlinks: Vec<SymlinkEntry>,
}

impl DirectoryNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: impl Into<String>, digest: Digest, is_executable: bool) -> Self {
        self.files.push(FileEntry {
            name: name.into(),
            digest,
            is_executable,
        });
        self
    }

    pub fn with_directory(mut self, name: impl Into<String>, digest: Digest) -> Self {
        self.directories.push(DirectoryEntry {
            name: name.into(),
            digest,
        });
        self
    }

    pub fn with_symlink(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.symlinks.push(SymlinkEntry {
            name: name.into(),
            target: target.into(),
        });
        self
    }

    /// A node with no children of any kind
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.directories.is_empty() && self.symlinks.is_empty()
    }

    /// Total number of children
    pub fn len(&self) -> usize {
        self.files.len() + self.directories.len() + self.symlinks.len()
    }

    /// Sort children by name and check that names are valid and unique
    /// across all three lists.
    pub fn canonicalize(mut self) -> Result<Self> {
        self.files.sort_by(|a, b| a.name.cmp(&b.name));
        self.directories.sort_by(|a, b| a.name.cmp(&b.name));
        self.symlinks.sort_by(|a, b| a.name.cmp(&b.name));

        let mut seen = BTreeSet::new();
        let names = self
            .files
            .iter()
            .map(|f| &f.name)
            .chain(self.directories.iter().map(|d| &d.name))
            .chain(self.symlinks.iter().map(|s| &s.name));
        for name in names {
            validate_name(name)?;
            if !seen.insert(name.as_str()) {
                return Err(CasError::DuplicateName(name.clone()));
            }
        }
        Ok(self)
    }

    /// Canonical serialized form; its hash is the node's digest
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let canonical = self.clone().canonicalize()?;
        Ok(bincode::serialize(&canonical)?)
    }

    /// Decode a node received from the remote store
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let node: DirectoryNode = bincode::deserialize(bytes)?;
        node.canonicalize()
    }

    pub fn digest(&self) -> Result<Digest> {
        Digest::of_node(self)
    }
}

impl Digest {
    /// Digest of a directory node's canonical serialization
    pub fn of_node(node: &DirectoryNode) -> Result<Self> {
        Ok(Digest::from_content(&node.to_bytes()?))
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(CasError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Resolves a subdirectory digest to its node
pub trait NodeResolver {
    fn resolve(&self, digest: &Digest) -> Option<&DirectoryNode>;
}

impl NodeResolver for HashMap<Digest, DirectoryNode> {
    fn resolve(&self, digest: &Digest) -> Option<&DirectoryNode> {
        self.get(digest)
    }
}

impl NodeResolver for BTreeMap<Digest, DirectoryNode> {
    fn resolve(&self, digest: &Digest) -> Option<&DirectoryNode> {
        self.get(digest)
    }
}

/// Key a set of nodes (as returned by a tree fetch) by their digests
pub fn index_nodes(nodes: impl IntoIterator<Item = DirectoryNode>) -> Result<HashMap<Digest, DirectoryNode>> {
    nodes
        .into_iter()
        .map(|node| Ok((node.digest()?, node)))
        .collect()
}

/// What a flattened path refers to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File { digest: Digest, is_executable: bool },
    /// A directory with no children, kept so it can be recreated
    EmptyDirectory { digest: Digest },
    Symlink { target: String },
}

/// One resolved path of a flattened tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatEntry {
    /// Relative, slash-separated path
    pub path: String,
    pub kind: EntryKind,
}

impl FlatEntry {
    /// Digest of a file or empty directory; symlinks have none
    pub fn digest(&self) -> Option<Digest> {
        match &self.kind {
            EntryKind::File { digest, .. } | EntryKind::EmptyDirectory { digest } => Some(*digest),
            EntryKind::Symlink { .. } => None,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File { .. })
    }
}

impl fmt::Display for FlatEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EntryKind::File { digest, .. } => write!(f, "{}: [File digest: {}]", self.path, digest),
            EntryKind::EmptyDirectory { digest } => {
                write!(f, "{}: [Directory digest: {}]", self.path, digest)
            }
            EntryKind::Symlink { target } => {
                write!(f, "{}: [Symlink Target: {}]", self.path, target)
            }
        }
    }
}

/// Flatten the tree rooted at `root` into a path-ordered map
pub fn flatten(root: &Digest, resolver: &impl NodeResolver) -> Result<BTreeMap<String, FlatEntry>> {
    flatten_with_prefix(root, resolver, "", DEFAULT_MAX_TREE_DEPTH)
}

/// Flatten with every path placed under `prefix`, refusing trees nested
/// deeper than `max_depth` levels below the root.
///
/// An empty root yields a single empty-directory entry at the prefix.
pub fn flatten_with_prefix(
    root: &Digest,
    resolver: &impl NodeResolver,
    prefix: &str,
    max_depth: usize,
) -> Result<BTreeMap<String, FlatEntry>> {
    let mut out = BTreeMap::new();
    let prefix = prefix.trim_end_matches('/');
    walk(root, resolver, prefix, 0, max_depth, &mut out)?;
    debug!(root = %root, entries = out.len(), "Flattened tree");
    Ok(out)
}

fn walk(
    digest: &Digest,
    resolver: &impl NodeResolver,
    path: &str,
    depth: usize,
    max_depth: usize,
    out: &mut BTreeMap<String, FlatEntry>,
) -> Result<()> {
    if depth > max_depth {
        return Err(CasError::TreeTooDeep { max: max_depth });
    }
    let node = resolver
        .resolve(digest)
        .ok_or(CasError::MissingNode(*digest))?;

    if node.is_empty() {
        return insert(
            out,
            path.to_string(),
            EntryKind::EmptyDirectory { digest: *digest },
        );
    }

    for file in &node.files {
        validate_name(&file.name)?;
        insert(
            out,
            join(path, &file.name),
            EntryKind::File {
                digest: file.digest,
                is_executable: file.is_executable,
            },
        )?;
    }
    for link in &node.symlinks {
        validate_name(&link.name)?;
        insert(
            out,
            join(path, &link.name),
            EntryKind::Symlink {
                target: link.target.clone(),
            },
        )?;
    }
    for dir in &node.directories {
        validate_name(&dir.name)?;
        walk(&dir.digest, resolver, &join(path, &dir.name), depth + 1, max_depth, out)?;
    }
    Ok(())
}

fn insert(out: &mut BTreeMap<String, FlatEntry>, path: String, kind: EntryKind) -> Result<()> {
    if out.contains_key(&path) {
        return Err(CasError::DuplicateName(path));
    }
    out.insert(path.clone(), FlatEntry { path, kind });
    Ok(())
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Human-readable listing: a root header, then one line per entry in path
/// order.
pub fn render_listing(root: &Digest, entries: &BTreeMap<String, FlatEntry>) -> String {
    let mut out = format!("[Root directory digest: {}]\n", root);
    for entry in entries.values() {
        out.push_str(&entry.to_string());
        out.push('\n');
    }
    out
}
