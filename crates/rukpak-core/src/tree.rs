//! The in-memory, read-only file tree produced by a source unpacker and
//! consumed by the transform stage and the content store.
//!
//! Ownership: a tree is owned entirely by the reconciliation turn that
//! produced it. Nothing holds a tree across turns.

use std::collections::BTreeMap;
use std::io::{self, Read};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use snafu::{ResultExt, Snafu};

#[derive(Snafu, Debug)]
pub enum TreeError {
    #[snafu(display("path {path:?} escapes the tree root"))]
    PathEscapesRoot { path: String },
    #[snafu(display("destination path {path:?} is claimed by more than one source"))]
    DestinationCollision { path: String },
    #[snafu(display("failed to build tar archive"))]
    BuildArchive { source: io::Error },
    #[snafu(display("failed to read tar archive"))]
    ReadArchive { source: io::Error },
}

type Result<T, E = TreeError> = std::result::Result<T, E>;

/// A flat map of normalized, `/`-separated relative paths to file bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileTree {
    files: BTreeMap<String, Bytes>,
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Inserts a file at `path`. `path` must already be normalized
    /// (no `..`, no leading `/`) — callers that take paths from an external
    /// source must call [`validate_relative_path`] first.
    pub fn insert(&mut self, path: impl Into<String>, data: impl Into<Bytes>) {
        self.files.insert(path.into(), data.into());
    }

    pub fn get(&self, path: &str) -> Option<&Bytes> {
        self.files.get(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.files.iter().map(|(p, b)| (p.as_str(), b))
    }

    /// Returns the subset of the tree rooted at `prefix`, with `prefix`
    /// stripped from each resulting path. Used to root a declared
    /// subdirectory for the git unpacker.
    pub fn subtree(&self, prefix: &str) -> FileTree {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            return self.clone();
        }
        let dir_prefix = format!("{prefix}/");
        let mut out = FileTree::new();
        for (path, data) in &self.files {
            if let Some(rest) = path.strip_prefix(&dir_prefix) {
                out.insert(rest.to_string(), data.clone());
            }
        }
        out
    }

    /// Merges `other`'s files into `self` under `dest_prefix`, rejecting any
    /// destination path already claimed — used by the configmaps unpacker,
    /// where no two entries may resolve to the same destination path.
    pub fn merge_under(&mut self, dest_prefix: &str, other: &FileTree) -> Result<()> {
        let dest_prefix = dest_prefix.trim_matches('/');
        for (path, data) in other.iter() {
            let dest = if dest_prefix.is_empty() {
                path.to_string()
            } else {
                format!("{dest_prefix}/{path}")
            };
            if self.files.contains_key(&dest) {
                return DestinationCollisionSnafu { path: dest }.fail();
            }
            self.files.insert(dest, data.clone());
        }
        Ok(())
    }

    /// Whether any file lives directly under `manifests/` in a subdirectory
    /// (i.e. the tree is *not* flat). Used by the plain-format transform.
    pub fn has_nested_manifests(&self, root: &str) -> bool {
        let prefix = format!("{}/", root.trim_end_matches('/'));
        self.files
            .keys()
            .filter_map(|p| p.strip_prefix(&prefix))
            .any(|rest| rest.contains('/'))
    }

    /// Serializes the tree into a gzip-compressed tar archive with
    /// normalized headers: uid/gid zero, no owner/group names, fixed mtime,
    /// so that two equivalent trees always produce byte-identical archives.
    pub fn to_tar_gz(&self) -> Result<Vec<u8>> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, data) in &self.files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(0);
            header.set_entry_type(tar::EntryType::Regular);
            header.set_cksum();
            builder
                .append_data(&mut header, path, &data[..])
                .context(BuildArchiveSnafu)?;
        }
        let encoder = builder.into_inner().context(BuildArchiveSnafu)?;
        encoder.finish().context(BuildArchiveSnafu)
    }

    pub fn from_tar_gz(bytes: &[u8]) -> Result<FileTree> {
        let decoder = GzDecoder::new(bytes);
        let mut archive = tar::Archive::new(decoder);
        let mut tree = FileTree::new();
        for entry in archive.entries().context(ReadArchiveSnafu)? {
            let mut entry = entry.context(ReadArchiveSnafu)?;
            if entry.header().entry_type() != tar::EntryType::Regular {
                continue;
            }
            let path = entry
                .path()
                .context(ReadArchiveSnafu)?
                .to_string_lossy()
                .into_owned();
            let mut buf = Vec::with_capacity(entry.header().size().unwrap_or(0) as usize);
            entry.read_to_end(&mut buf).context(ReadArchiveSnafu)?;
            tree.insert(path, buf);
        }
        Ok(tree)
    }
}

/// Rejects paths that try to escape the tree root, per the git and
/// configmaps unpacker contracts ("paths starting with `..` or `/` are
/// rejected").
pub fn validate_relative_path(path: &str) -> Result<()> {
    if path.starts_with('/') || path.split('/').any(|seg| seg == "..") {
        return PathEscapesRootSnafu {
            path: path.to_string(),
        }
        .fail();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_load_round_trips() {
        let mut tree = FileTree::new();
        tree.insert("manifests/a.yaml", Bytes::from_static(b"a: 1"));
        tree.insert("manifests/b.yaml", Bytes::from_static(b"b: 2"));

        let archive = tree.to_tar_gz().unwrap();
        let loaded = FileTree::from_tar_gz(&archive).unwrap();

        assert_eq!(tree, loaded);
    }

    #[test]
    fn rejects_traversal_paths() {
        assert!(validate_relative_path("../etc/passwd").is_err());
        assert!(validate_relative_path("/etc/passwd").is_err());
        assert!(validate_relative_path("a/../../b").is_err());
        assert!(validate_relative_path("a/b/c.yaml").is_ok());
    }

    #[test]
    fn subtree_strips_prefix() {
        let mut tree = FileTree::new();
        tree.insert("sub/manifests/a.yaml", Bytes::from_static(b"a"));
        tree.insert("other/b.yaml", Bytes::from_static(b"b"));

        let rooted = tree.subtree("sub");
        assert_eq!(rooted.paths().collect::<Vec<_>>(), vec!["manifests/a.yaml"]);
    }

    #[test]
    fn merge_under_detects_destination_collisions() {
        let mut base = FileTree::new();
        base.insert("cm-a/file.yaml", Bytes::from_static(b"1"));

        let mut incoming = FileTree::new();
        incoming.insert("file.yaml", Bytes::from_static(b"2"));

        assert!(base.merge_under("cm-a", &incoming).is_err());

        let mut other = FileTree::new();
        other.insert("file.yaml", Bytes::from_static(b"3"));
        assert!(base.merge_under("cm-b", &other).is_ok());
    }

    #[test]
    fn detects_nested_manifests() {
        let mut flat = FileTree::new();
        flat.insert("manifests/a.yaml", Bytes::from_static(b"a"));
        assert!(!flat.has_nested_manifests("manifests"));

        let mut nested = FileTree::new();
        nested.insert("manifests/sub/a.yaml", Bytes::from_static(b"a"));
        assert!(nested.has_nested_manifests("manifests"));
    }
}
