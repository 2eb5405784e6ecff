// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

/// A file read out of a workspace root: its bytes and whether it carries the
/// executable bit.
pub struct RootFile {
    pub content: Vec<u8>,
    pub is_executable: bool,
}

/// A workspace root a repository's source files are read from: either a plain
/// directory on disk, or a tree inside a bare Git repository (the result of
/// fetching a pinned commit).
#[derive(Clone)]
pub enum FileRoot {
    Filesystem(PathBuf),
    Git {
        repo: Arc<GitRepo>,
        /// Hex id of the root tree within the repository.
        tree: String,
    },
}

impl FileRoot {
    /// Read a file (relative path) out of this root.
    pub fn read_file(&self, path: &Path) -> Result<RootFile, String> {
        match self {
            FileRoot::Filesystem(root) => {
                let full = root.join(path);
                let metadata = full
                    .symlink_metadata()
                    .map_err(|e| format!("Failed to stat {}: {e}", full.display()))?;
                if !metadata.is_file() {
                    return Err(format!("{} is not a regular file", full.display()));
                }
                let content = std::fs::read(&full)
                    .map_err(|e| format!("Failed to read {}: {e}", full.display()))?;
                #[cfg(unix)]
                let is_executable = {
                    use std::os::unix::fs::PermissionsExt;
                    metadata.permissions().mode() & 0o100 != 0
                };
                #[cfg(not(unix))]
                let is_executable = false;
                Ok(RootFile {
                    content,
                    is_executable,
                })
            }
            FileRoot::Git { repo, tree } => repo.read_file(tree, path),
        }
    }
}

/// A bare Git repository holding fetched workspace roots.
///
/// libgit2 objects are not thread-safe; every access goes through the mutex.
pub struct GitRepo {
    inner: Mutex<git2::Repository>,
}

impl GitRepo {
    pub fn open(path: &Path) -> Result<GitRepo, String> {
        let repo = git2::Repository::open(path)
            .map_err(|e| format!("Failed to open git repository {}: {e}", path.display()))?;
        Ok(GitRepo {
            inner: Mutex::new(repo),
        })
    }

    /// Read a file at `path` below the tree with hex id `tree`.
    pub fn read_file(&self, tree: &str, path: &Path) -> Result<RootFile, String> {
        let repo = self.inner.lock();
        let oid = git2::Oid::from_str(tree).map_err(|e| format!("Invalid tree id {tree}: {e}"))?;
        let tree_obj = repo
            .find_tree(oid)
            .map_err(|e| format!("Tree {tree} not found: {e}"))?;
        let entry = tree_obj
            .get_path(path)
            .map_err(|e| format!("{} not found below tree {tree}: {e}", path.display()))?;
        let object = entry
            .to_object(&repo)
            .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
        let blob = object
            .as_blob()
            .ok_or_else(|| format!("{} is not a blob", path.display()))?;
        Ok(RootFile {
            content: blob.content().to_vec(),
            is_executable: entry.filemode() == 0o100755,
        })
    }
}

/// Maps repository names to the roots their source files live in.
#[derive(Clone, Default)]
pub struct RepositoryConfig {
    roots: HashMap<String, FileRoot>,
}

impl RepositoryConfig {
    pub fn new() -> RepositoryConfig {
        RepositoryConfig {
            roots: HashMap::new(),
        }
    }

    pub fn add_root(&mut self, repository: String, root: FileRoot) {
        self.roots.insert(repository, root);
    }

    pub fn root(&self, repository: &str) -> Option<&FileRoot> {
        self.roots.get(repository)
    }
}
