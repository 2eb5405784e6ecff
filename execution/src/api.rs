// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::{ObjectInfo, ObjectType};
use futures::future::BoxFuture;
use futures::FutureExt;
use hashing::{Digest, HashFunction};
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use store::TreeEntry;

use crate::blob::ArtifactBlob;

pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(300);

/// How an action interacts with the action cache.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheFlag {
    /// Look the action up, and store a successful result.
    CacheOutput,
    /// Always execute, never store.
    DoNotCacheOutput,
    /// Only look the action up; a miss yields no response.
    FromCacheOnly,
    /// Execute without lookup or store, but report the result as cached.
    /// Used by the rebuilder to force a fresh run through the normal path.
    PretendCached,
}

impl CacheFlag {
    pub fn do_cache_lookup(&self) -> bool {
        matches!(self, CacheFlag::CacheOutput | CacheFlag::FromCacheOnly)
    }

    pub fn do_cache_store(&self) -> bool {
        matches!(self, CacheFlag::CacheOutput)
    }
}

/// An object at a path, as used for tree assembly and retrieval.
#[derive(Clone, Debug)]
pub struct NamedArtifact {
    pub path: PathBuf,
    pub info: ObjectInfo,
}

/// The capability interface both execution backends implement.
///
/// Everything the executor needs reduces to these operations: availability
/// queries before uploads, blob and tree uploads, retrieval to various sinks,
/// action construction, and the incremental split/splice transfer facility.
#[async_trait]
pub trait ExecutionApi: Send + Sync {
    fn hash_function(&self) -> HashFunction;

    /// Create a (not yet started) action against this backend. Output paths
    /// are relative to `cwd`, which is itself relative to the input root.
    fn create_action(
        &self,
        root_digest: Digest,
        command: Vec<String>,
        cwd: String,
        output_files: Vec<String>,
        output_dirs: Vec<String>,
        env: BTreeMap<String, String>,
        properties: BTreeMap<String, String>,
    ) -> Box<dyn ExecutionAction>;

    /// Fast-path availability check used before every upload.
    async fn is_available(&self, digest: &Digest) -> bool;

    /// The subset of `digests` this backend does not have.
    async fn missing_digests(&self, digests: &[Digest]) -> Result<Vec<Digest>, String>;

    /// Upload the given blobs. `skip_find_missing` may be set by callers
    /// that have just performed an availability query themselves.
    async fn upload(&self, blobs: Vec<ArtifactBlob>, skip_find_missing: bool)
        -> Result<(), String>;

    /// Assemble a directory tree from named artifacts and upload every
    /// missing tree object, children before parents. After a successful
    /// return the tree and everything it references are available here.
    async fn upload_tree(&self, artifacts: &[NamedArtifact]) -> Result<Digest, String>;

    /// Read the entries of a tree object available to this backend.
    async fn read_tree_entries(&self, digest: &Digest) -> Result<Vec<TreeEntry>, String>;

    /// Materialize objects at the given filesystem paths; trees fan out to
    /// their leaves.
    async fn retrieve_to_paths(
        &self,
        infos: &[ObjectInfo],
        paths: &[PathBuf],
    ) -> Result<(), String>;

    /// Write objects to the given file descriptors, which are consumed. With
    /// `raw_tree`, a tree object is written in its serialized form instead
    /// of as a rendered listing.
    async fn retrieve_to_fds(
        &self,
        infos: &[ObjectInfo],
        fds: &[i32],
        raw_tree: bool,
    ) -> Result<(), String>;

    /// Copy objects (trees recursively, children before parents) into
    /// another backend's CAS.
    async fn retrieve_to_cas(
        &self,
        infos: &[ObjectInfo],
        other: &dyn ExecutionApi,
    ) -> Result<(), String>;

    /// Fetch one object's bytes.
    async fn retrieve_to_memory(&self, info: &ObjectInfo) -> Result<Bytes, String>;

    /// Split an object into chunks, returning the chunk digests.
    async fn split_blob(&self, digest: &Digest) -> Result<Vec<Digest>, String>;

    /// Splice an object from previously uploaded chunks.
    async fn splice_blob(&self, digest: &Digest, chunks: Vec<Digest>) -> Result<Digest, String>;

    async fn blob_split_support(&self) -> bool;

    async fn blob_splice_support(&self) -> bool;
}

/// An action bound to a backend, ready to be configured and executed.
#[async_trait]
pub trait ExecutionAction: Send + Sync {
    fn set_cache_flag(&mut self, flag: CacheFlag);

    fn set_timeout(&mut self, timeout: Duration);

    /// Run (or look up) the action. `Ok(None)` means a `FromCacheOnly`
    /// lookup found nothing.
    async fn execute(&self) -> Result<Option<Box<dyn ExecutionResponse>>, String>;
}

/// The outcome of an executed (or cache-served) action.
#[async_trait]
pub trait ExecutionResponse: Send + Sync {
    fn action_digest(&self) -> Digest;

    fn exit_code(&self) -> i32;

    fn is_cached(&self) -> bool;

    async fn stdout(&self) -> Result<Bytes, String>;

    async fn stderr(&self) -> Result<Bytes, String>;

    /// All produced outputs by path (relative to the working directory).
    async fn artifacts(&self) -> Result<BTreeMap<String, ObjectInfo>, String>;

    /// Whether any produced symlink (direct or inside an output tree)
    /// escapes upward. Only consulted in compatible mode, where such
    /// outputs are a hard failure.
    async fn has_upwards_symlinks(&self) -> Result<bool, String>;
}

/// A symlink target stays inside the tree it is rooted in: not absolute, and
/// no `..` component ever escapes above its starting directory.
pub fn is_non_upward_target(target: &str) -> bool {
    if target.is_empty() || target.starts_with('/') {
        return false;
    }
    let mut depth: i64 = 0;
    for component in target.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => depth += 1,
        }
    }
    true
}

/// Interpret an `ActionResult` as a map from output path to object info.
#[allow(deprecated)]
pub fn artifacts_from_action_result(
    hash_function: HashFunction,
    result: &remexec::ActionResult,
) -> Result<BTreeMap<String, ObjectInfo>, String> {
    let hash_type = hash_function.hash_type();
    let mut artifacts = BTreeMap::new();

    for file in &result.output_files {
        let digest = protos::require_digest(file.digest.as_ref(), false, hash_type)?;
        let object_type = if file.is_executable {
            ObjectType::Executable
        } else {
            ObjectType::File
        };
        artifacts.insert(file.path.clone(), ObjectInfo::new(digest, object_type));
    }
    for symlink in result
        .output_symlinks
        .iter()
        .chain(&result.output_file_symlinks)
        .chain(&result.output_directory_symlinks)
    {
        let digest = hash_function.hash_blob_data(symlink.target.as_bytes());
        artifacts.insert(
            symlink.path.clone(),
            ObjectInfo::new(digest, ObjectType::Symlink),
        );
    }
    for dir in &result.output_directories {
        let digest = protos::require_digest(dir.tree_digest.as_ref(), true, hash_type)?;
        artifacts.insert(dir.path.clone(), ObjectInfo::new(digest, ObjectType::Tree));
    }
    Ok(artifacts)
}

/// Scan a result for upward symlinks: the directly reported ones, and the
/// ones buried in output trees.
#[allow(deprecated)]
pub async fn result_has_upwards_symlinks(
    api: &dyn ExecutionApi,
    result: &remexec::ActionResult,
) -> Result<bool, String> {
    for symlink in result
        .output_symlinks
        .iter()
        .chain(&result.output_file_symlinks)
        .chain(&result.output_directory_symlinks)
    {
        if !is_non_upward_target(&symlink.target) {
            return Ok(true);
        }
    }

    let hash_type = api.hash_function().hash_type();
    for dir in &result.output_directories {
        let digest = protos::require_digest(dir.tree_digest.as_ref(), true, hash_type)?;
        if tree_has_upwards_symlinks(api, digest).await? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn tree_has_upwards_symlinks(
    api: &dyn ExecutionApi,
    digest: Digest,
) -> BoxFuture<'_, Result<bool, String>> {
    async move {
        for entry in api.read_tree_entries(&digest).await? {
            match entry.object_type {
                ObjectType::Symlink => {
                    let target = match entry.target {
                        Some(target) => target,
                        None => {
                            // Native trees store the target as blob content.
                            let info = ObjectInfo::new(entry.digest, ObjectType::Symlink);
                            let bytes = api.retrieve_to_memory(&info).await?;
                            String::from_utf8(bytes.to_vec())
                                .map_err(|_| "Symlink target is not UTF-8".to_owned())?
                        }
                    };
                    if !is_non_upward_target(&target) {
                        return Ok(true);
                    }
                }
                ObjectType::Tree => {
                    if tree_has_upwards_symlinks(api, entry.digest).await? {
                        return Ok(true);
                    }
                }
                _ => {}
            }
        }
        Ok(false)
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::is_non_upward_target;

    #[test]
    fn non_upward_targets() {
        assert!(is_non_upward_target("file"));
        assert!(is_non_upward_target("a/b/c"));
        assert!(is_non_upward_target("a/../b"));
        assert!(is_non_upward_target("./a"));
    }

    #[test]
    fn upward_targets() {
        assert!(!is_non_upward_target("/etc/passwd"));
        assert!(!is_non_upward_target(".."));
        assert!(!is_non_upward_target("../sibling"));
        assert!(!is_non_upward_target("a/../../b"));
        assert!(!is_non_upward_target(""));
    }
}
