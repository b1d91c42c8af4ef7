//! Content-addressed directory snapshots and their diffs.
//!
//! An [`Index`] records every regular file under a source directory with its
//! size and SHA-256, plus a tree hash over the canonical file list. Two
//! indexes with the same tree hash are equivalent for synchronization. The
//! remote side of a sync stores its index as a JSON file inside the target
//! volume; a missing or unparseable remote index reads as empty, which makes
//! every local file a create.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Name of the index file stored at the root of a fileset's target path.
pub const INDEX_FILE_NAME: &str = ".dockform-index.json";

/// Schema tag written into every serialized index.
pub const INDEX_VERSION: &str = "v1";

/// One file in an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the source root, forward slashes
    pub path: String,
    /// Size in bytes
    pub size: u64,
    /// Lowercase hex SHA-256 of the content
    pub sha256: String,
}

/// A content-addressed snapshot of a directory tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    /// Schema tag
    pub version: String,
    /// Absolute target path inside the volume, kept for sanity checks
    pub target: String,
    /// Files sorted by path
    pub files: Vec<FileEntry>,
    /// SHA-256 over the canonical encoding of `files`
    pub tree_hash: String,
}

impl Index {
    /// An empty index for the given target path.
    #[must_use]
    pub fn empty(target: &str) -> Self {
        Self::from_entries(target, Vec::new())
    }

    /// Build an index from a file list, sorting it and computing the tree
    /// hash over the canonical encoding.
    #[must_use]
    pub fn from_entries(target: &str, mut files: Vec<FileEntry>) -> Self {
        files.sort_by(|a, b| a.path.cmp(&b.path));
        let tree_hash = tree_hash(&files);
        Self {
            version: INDEX_VERSION.to_string(),
            target: target.to_string(),
            files,
            tree_hash,
        }
    }
}

/// Hash the canonical encoding of a sorted file list.
fn tree_hash(files: &[FileEntry]) -> String {
    let mut hasher = Sha256::new();
    for entry in files {
        hasher.update(entry.path.as_bytes());
        hasher.update(b"\0");
        hasher.update(entry.size.to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(entry.sha256.as_bytes());
        hasher.update(b"\n");
    }
    hex_digest(hasher)
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn compile_excludes(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            Error::invalid_input("index", format!("bad exclude pattern {pattern:?}: {e}"))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::invalid_input("index", format!("bad exclude set: {e}")))
}

/// Walk `source_abs` and build its index.
///
/// Runs the filesystem walk on the blocking pool; hashing large trees must
/// not stall the runtime.
pub async fn build_local_index(
    source_abs: &Path,
    target_path: &str,
    exclude: &[String],
) -> Result<Index> {
    let source = source_abs.to_path_buf();
    let target = target_path.to_string();
    let exclude = exclude.to_vec();
    tokio::task::spawn_blocking(move || build_local_index_blocking(&source, &target, &exclude))
        .await
        .map_err(|e| Error::internal("index", format!("index task panicked: {e}")))?
}

/// Synchronous variant of [`build_local_index`].
pub fn build_local_index_blocking(
    source_abs: &Path,
    target_path: &str,
    exclude: &[String],
) -> Result<Index> {
    if !source_abs.is_dir() {
        return Err(Error::internal(
            "index",
            format!("source path {} is not a readable directory", source_abs.display()),
        ));
    }
    let excludes = compile_excludes(exclude)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(source_abs)
        .sort_by_file_name()
        .into_iter()
    {
        let entry = entry.map_err(|e| {
            Error::internal("index", format!("walking {}: {e}", source_abs.display()))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(source_abs)
            .map_err(|e| Error::internal("index", format!("relativizing path: {e}")))?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if excludes.is_match(&rel) {
            continue;
        }
        let (size, sha256) = hash_file(entry.path())?;
        files.push(FileEntry {
            path: rel,
            size,
            sha256,
        });
    }
    Ok(Index::from_entries(target_path, files))
}

fn hash_file(path: &Path) -> Result<(u64, String)> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        Error::internal("index", format!("reading {}: {e}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).map_err(|e| {
            Error::internal("index", format!("reading {}: {e}", path.display()))
        })?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok((size, hex_digest(hasher)))
}

/// Parse a remote index file.
///
/// Malformed input reads as an empty index for `target`: the caller treats it
/// as "no prior sync" and recreates everything, which is always safe.
#[must_use]
pub fn parse_index(content: &str, target: &str) -> Index {
    match serde_json::from_str::<Index>(content) {
        Ok(index) => index,
        Err(_) => Index::empty(target),
    }
}

/// Serialize an index to its canonical JSON form.
pub fn serialize_index(index: &Index) -> Result<String> {
    serde_json::to_string_pretty(index)
        .map_err(|e| Error::internal("index", format!("encoding index: {e}")))
}

/// What a sync has to do to make remote match local.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexDiff {
    /// Present locally, absent remotely; sorted by path
    pub to_create: Vec<FileEntry>,
    /// Present on both sides with differing hashes; sorted by path
    pub to_update: Vec<FileEntry>,
    /// Present remotely, absent locally; sorted
    pub to_delete: Vec<String>,
}

impl IndexDiff {
    /// True when nothing has to change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    /// Paths written by this diff (creates plus updates), sorted.
    #[must_use]
    pub fn written_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self
            .to_create
            .iter()
            .chain(self.to_update.iter())
            .map(|e| e.path.as_str())
            .collect();
        paths.sort_unstable();
        paths
    }
}

/// Diff two indexes. Both inputs hold path-sorted file lists, so a single
/// pairwise merge produces each output list already sorted.
#[must_use]
pub fn diff_indexes(local: &Index, remote: &Index) -> IndexDiff {
    let mut diff = IndexDiff::default();
    let mut l = local.files.iter().peekable();
    let mut r = remote.files.iter().peekable();

    loop {
        match (l.peek(), r.peek()) {
            (Some(lf), Some(rf)) => match lf.path.cmp(&rf.path) {
                std::cmp::Ordering::Less => {
                    diff.to_create.push((*lf).clone());
                    l.next();
                }
                std::cmp::Ordering::Greater => {
                    diff.to_delete.push(rf.path.clone());
                    r.next();
                }
                std::cmp::Ordering::Equal => {
                    if lf.sha256 != rf.sha256 {
                        diff.to_update.push((*lf).clone());
                    }
                    l.next();
                    r.next();
                }
            },
            (Some(lf), None) => {
                diff.to_create.push((*lf).clone());
                l.next();
            }
            (None, Some(rf)) => {
                diff.to_delete.push(rf.path.clone());
                r.next();
            }
            (None, None) => break,
        }
    }
    diff
}
