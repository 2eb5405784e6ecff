// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The local execution backend: implements the execution API against the
//! local storage and a process launcher.

mod action;
mod config;
mod response;

pub use action::LocalAction;
pub use config::LocalExecutionConfig;
pub use response::LocalResponse;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use common::{ObjectInfo, ObjectType};
use futures::future::BoxFuture;
use futures::FutureExt;
use hashing::{Digest, HashFunction};
use store::{Storage, TreeEntry};

use crate::api::{ExecutionAction, ExecutionApi, NamedArtifact};
use crate::blob::ArtifactBlob;
use crate::transfer::{self, write_to_fd};
use crate::tree_builder::build_tree_blobs;

#[derive(Clone)]
pub struct LocalApi {
    storage: Storage,
    config: Arc<LocalExecutionConfig>,
}

impl LocalApi {
    pub fn new(storage: Storage, config: LocalExecutionConfig) -> LocalApi {
        LocalApi {
            storage,
            config: Arc::new(config),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub(crate) fn exec_config(&self) -> &LocalExecutionConfig {
        &self.config
    }

    /// Materialize one object at a path.
    fn materialize<'a>(
        &'a self,
        info: &'a ObjectInfo,
        path: &'a Path,
    ) -> BoxFuture<'a, Result<(), String>> {
        async move {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
            }
            match info.object_type {
                ObjectType::File | ObjectType::Executable => {
                    let executable = info.object_type.is_executable();
                    let src = self
                        .storage
                        .cas()
                        .blob_path(&info.digest, executable)
                        .await?
                        .ok_or_else(|| format!("Blob {} not found in CAS", info.digest.hash))?;
                    let _ = tokio::fs::remove_file(path).await;
                    tokio::fs::copy(&src, path)
                        .await
                        .map_err(|e| format!("Failed to copy to {}: {e}", path.display()))?;
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        let mode = if executable { 0o755 } else { 0o644 };
                        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                            .await
                            .map_err(|e| {
                                format!("Failed to set permissions on {}: {e}", path.display())
                            })?;
                    }
                    Ok(())
                }
                ObjectType::Symlink => {
                    let target = self
                        .storage
                        .cas()
                        .read_blob(&info.digest, false)
                        .await?
                        .ok_or_else(|| format!("Symlink blob {} not found", info.digest.hash))?;
                    let target = String::from_utf8(target)
                        .map_err(|_| "Symlink target is not UTF-8".to_owned())?;
                    let _ = tokio::fs::remove_file(path).await;
                    #[cfg(unix)]
                    tokio::fs::symlink(&target, path)
                        .await
                        .map_err(|e| format!("Failed to create symlink {}: {e}", path.display()))?;
                    Ok(())
                }
                ObjectType::Tree => {
                    tokio::fs::create_dir_all(path)
                        .await
                        .map_err(|e| format!("Failed to create {}: {e}", path.display()))?;
                    for entry in self.storage.cas().read_tree_entries(&info.digest).await? {
                        let child = ObjectInfo::new(entry.digest, entry.object_type);
                        self.materialize(&child, &path.join(&entry.name)).await?;
                    }
                    Ok(())
                }
            }
        }
        .boxed()
    }

    async fn object_bytes(&self, info: &ObjectInfo) -> Result<Bytes, String> {
        let bytes = if info.object_type.is_tree() {
            self.storage.cas().read_tree(&info.digest).await?
        } else {
            self.storage.cas().read_blob(&info.digest, false).await?
        };
        bytes
            .map(Bytes::from)
            .ok_or_else(|| format!("Object {} not found in CAS", info.digest.hash))
    }
}

#[async_trait]
impl ExecutionApi for LocalApi {
    fn hash_function(&self) -> HashFunction {
        self.storage.config().hash_function
    }

    fn create_action(
        &self,
        root_digest: Digest,
        command: Vec<String>,
        cwd: String,
        output_files: Vec<String>,
        output_dirs: Vec<String>,
        env: BTreeMap<String, String>,
        properties: BTreeMap<String, String>,
    ) -> Box<dyn ExecutionAction> {
        Box::new(LocalAction::new(
            self.clone(),
            root_digest,
            command,
            cwd,
            output_files,
            output_dirs,
            env,
            properties,
        ))
    }

    async fn is_available(&self, digest: &Digest) -> bool {
        let result = if digest.is_tree {
            self.storage.cas().has_tree(digest).await
        } else {
            self.storage.cas().has_blob(digest, false).await
        };
        result.unwrap_or(false)
    }

    async fn missing_digests(&self, digests: &[Digest]) -> Result<Vec<Digest>, String> {
        let mut missing = vec![];
        for digest in digests {
            if !self.is_available(digest).await {
                missing.push(*digest);
            }
        }
        Ok(missing)
    }

    async fn upload(
        &self,
        blobs: Vec<ArtifactBlob>,
        _skip_find_missing: bool,
    ) -> Result<(), String> {
        for blob in blobs {
            let stored = match (blob.digest().is_tree, blob.file_path()) {
                (true, _) => {
                    let bytes = blob.bytes().await?;
                    self.storage.cas().store_tree_bytes(&bytes).await?
                }
                (false, Some(path)) => {
                    self.storage
                        .cas()
                        .store_blob_file(path, blob.is_executable(), false)
                        .await?
                }
                (false, None) => {
                    let bytes = blob.bytes().await?;
                    self.storage
                        .cas()
                        .store_blob_bytes(&bytes, blob.is_executable())
                        .await?
                }
            };
            if stored.hash != blob.digest().hash {
                return Err(format!(
                    "Uploaded content hashes to {}, but {} was declared",
                    stored.hash,
                    blob.digest().hash,
                ));
            }
        }
        Ok(())
    }

    async fn upload_tree(&self, artifacts: &[NamedArtifact]) -> Result<Digest, String> {
        // Leaves must already be present: a stored tree implies its whole
        // closure is recoverable.
        let leaves: Vec<Digest> = artifacts
            .iter()
            .filter(|artifact| !artifact.info.object_type.is_tree())
            .map(|artifact| artifact.info.digest)
            .collect();
        let missing = self.missing_digests(&leaves).await?;
        if !missing.is_empty() {
            return Err(format!(
                "Cannot upload tree: {} referenced blobs are missing from the CAS",
                missing.len()
            ));
        }

        let (blobs, root_digest) = build_tree_blobs(self, artifacts).await?;
        self.upload(blobs, true).await?;
        Ok(root_digest)
    }

    async fn read_tree_entries(&self, digest: &Digest) -> Result<Vec<TreeEntry>, String> {
        self.storage.cas().read_tree_entries(digest).await
    }

    async fn retrieve_to_paths(
        &self,
        infos: &[ObjectInfo],
        paths: &[PathBuf],
    ) -> Result<(), String> {
        if infos.len() != paths.len() {
            return Err("Object and path counts differ".to_owned());
        }
        for (info, path) in infos.iter().zip(paths) {
            self.materialize(info, path).await?;
        }
        Ok(())
    }

    async fn retrieve_to_fds(
        &self,
        infos: &[ObjectInfo],
        fds: &[i32],
        raw_tree: bool,
    ) -> Result<(), String> {
        if infos.len() != fds.len() {
            return Err("Object and fd counts differ".to_owned());
        }
        for (info, fd) in infos.iter().zip(fds) {
            let bytes = if info.object_type.is_tree() && !raw_tree {
                render_tree_listing(self, info).await?
            } else {
                self.object_bytes(info).await?
            };
            write_to_fd(*fd, &bytes)?;
        }
        Ok(())
    }

    async fn retrieve_to_cas(
        &self,
        infos: &[ObjectInfo],
        other: &dyn ExecutionApi,
    ) -> Result<(), String> {
        transfer::retrieve_to_cas(self, infos, other).await
    }

    async fn retrieve_to_memory(&self, info: &ObjectInfo) -> Result<Bytes, String> {
        self.object_bytes(info).await
    }

    async fn split_blob(&self, digest: &Digest) -> Result<Vec<Digest>, String> {
        let result = if digest.is_tree {
            self.storage.cas().split_tree(digest).await
        } else {
            self.storage.cas().split_blob(digest).await
        };
        result.map_err(|e| e.to_string())
    }

    async fn splice_blob(&self, digest: &Digest, chunks: Vec<Digest>) -> Result<Digest, String> {
        let result = if digest.is_tree {
            self.storage.cas().splice_tree(digest, &chunks).await
        } else {
            self.storage.cas().splice_blob(digest, &chunks).await
        };
        result.map_err(|e| e.to_string())
    }

    async fn blob_split_support(&self) -> bool {
        true
    }

    async fn blob_splice_support(&self) -> bool {
        true
    }
}

/// Render a tree as a human-readable listing, one `path info` line per leaf.
async fn render_tree_listing(api: &LocalApi, info: &ObjectInfo) -> Result<Bytes, String> {
    fn walk<'a>(
        api: &'a LocalApi,
        digest: &'a Digest,
        prefix: String,
        out: &'a mut String,
    ) -> BoxFuture<'a, Result<(), String>> {
        async move {
            for entry in api.storage.cas().read_tree_entries(digest).await? {
                let path = if prefix.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{prefix}/{}", entry.name)
                };
                let child = ObjectInfo::new(entry.digest, entry.object_type);
                out.push_str(&format!("{path} {child}\n"));
                if entry.object_type.is_tree() {
                    walk(api, &entry.digest, path, out).await?;
                }
            }
            Ok(())
        }
        .boxed()
    }

    let mut out = String::new();
    walk(api, &info.digest, String::new(), &mut out).await?;
    Ok(Bytes::from(out))
}
