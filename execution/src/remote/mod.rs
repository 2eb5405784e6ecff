// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The remote execution backend: a client of the Remote Execution API v2
//! CAS, action cache and execution services.

mod ac_client;
mod action;
pub(crate) mod cas_client;
mod config;
mod execution_client;
mod response;

pub use ac_client::RemoteAcClient;
pub use action::RemoteAction;
pub use cas_client::RemoteCasClient;
pub use config::{DispatchRule, ExecutionConfiguration, RemoteExecutionConfig};
pub use execution_client::RemoteExecutionClient;
pub use response::RemoteResponse;

use std::collections::BTreeMap;
use std::path::PathBuf;
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

/// The remote implementation of the execution API. Holds one client stub per
/// sub-service, all multiplexed over a single channel, plus the local
/// storage used for temp space and for caching fetched tree objects.
#[derive(Clone)]
pub struct RemoteApi {
    config: Arc<RemoteExecutionConfig>,
    storage: Storage,
    cas: RemoteCasClient,
    ac: RemoteAcClient,
    execution: RemoteExecutionClient,
}

impl RemoteApi {
    /// Create a client for the configured endpoint. The channel connects
    /// lazily, so this does not require the endpoint to be reachable yet.
    pub fn connect(config: RemoteExecutionConfig, storage: Storage) -> Result<RemoteApi, String> {
        let channel = grpc_util::create_channel(&config.address, config.tls.as_ref())?;
        let hash_function = storage.config().hash_function;
        let storage_config = Arc::new(storage.config().clone());

        let cas = RemoteCasClient::new(
            channel.clone(),
            config.instance_name.clone(),
            hash_function,
            config.retry,
            config.execution,
            storage_config,
        );
        let ac = RemoteAcClient::new(channel.clone(), config.instance_name.clone(), config.retry);
        let execution =
            RemoteExecutionClient::new(channel, config.instance_name.clone(), config.retry);

        Ok(RemoteApi {
            config: Arc::new(config),
            storage,
            cas,
            ac,
            execution,
        })
    }

    pub fn config(&self) -> &RemoteExecutionConfig {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub(crate) fn cas_client(&self) -> &RemoteCasClient {
        &self.cas
    }

    pub(crate) fn ac_client(&self) -> &RemoteAcClient {
        &self.ac
    }

    pub(crate) fn execution_client(&self) -> &RemoteExecutionClient {
        &self.execution
    }

    /// Fetch one object's bytes, preferring the local CAS for tree objects
    /// already ingested from responses.
    async fn fetch_bytes(&self, info: &ObjectInfo) -> Result<Bytes, String> {
        if info.object_type.is_tree() {
            if let Some(bytes) = self.storage.cas().read_tree(&info.digest).await? {
                return Ok(Bytes::from(bytes));
            }
        }
        let blob = self.cas.read_blob(&info.digest).await?;
        blob.bytes().await
    }

    fn materialize<'a>(
        &'a self,
        info: &'a ObjectInfo,
        path: &'a std::path::Path,
    ) -> BoxFuture<'a, Result<(), String>> {
        async move {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
            }
            match info.object_type {
                ObjectType::Tree => {
                    tokio::fs::create_dir_all(path)
                        .await
                        .map_err(|e| format!("Failed to create {}: {e}", path.display()))?;
                    for entry in self.read_tree_entries(&info.digest).await? {
                        let child = ObjectInfo::new(entry.digest, entry.object_type);
                        self.materialize(&child, &path.join(&entry.name)).await?;
                    }
                    Ok(())
                }
                ObjectType::Symlink => {
                    let target = self.fetch_bytes(info).await?;
                    let target = String::from_utf8(target.to_vec())
                        .map_err(|_| "Symlink target is not UTF-8".to_owned())?;
                    let _ = tokio::fs::remove_file(path).await;
                    #[cfg(unix)]
                    tokio::fs::symlink(&target, path)
                        .await
                        .map_err(|e| format!("Failed to create symlink {}: {e}", path.display()))?;
                    Ok(())
                }
                ObjectType::File | ObjectType::Executable => {
                    let bytes = self.fetch_bytes(info).await?;
                    tokio::fs::write(path, &bytes)
                        .await
                        .map_err(|e| format!("Failed to write {}: {e}", path.display()))?;
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        let mode = if info.object_type.is_executable() {
                            0o755
                        } else {
                            0o644
                        };
                        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                            .await
                            .map_err(|e| {
                                format!("Failed to set permissions on {}: {e}", path.display())
                            })?;
                    }
                    Ok(())
                }
            }
        }
        .boxed()
    }
}

#[async_trait]
impl ExecutionApi for RemoteApi {
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
        Box::new(RemoteAction::new(
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
        matches!(
            self.cas.find_missing(std::slice::from_ref(digest)).await,
            Ok(missing) if missing.is_empty()
        )
    }

    async fn missing_digests(&self, digests: &[Digest]) -> Result<Vec<Digest>, String> {
        self.cas.find_missing(digests).await
    }

    async fn upload(
        &self,
        mut blobs: Vec<ArtifactBlob>,
        skip_find_missing: bool,
    ) -> Result<(), String> {
        if !skip_find_missing {
            let digests: Vec<Digest> = blobs.iter().map(|blob| *blob.digest()).collect();
            let missing = self.cas.find_missing(&digests).await?;
            let missing: std::collections::HashSet<String> =
                missing.iter().map(|digest| digest.hash.to_hex()).collect();
            blobs.retain(|blob| missing.contains(&blob.digest().hash.to_hex()));
        }
        if blobs.is_empty() {
            return Ok(());
        }
        let count = blobs.len();
        let uploaded = self.cas.batch_update(blobs).await?;
        if uploaded != count {
            return Err(format!("Uploaded only {uploaded} of {count} blobs"));
        }
        Ok(())
    }

    async fn upload_tree(&self, artifacts: &[NamedArtifact]) -> Result<Digest, String> {
        let leaves: Vec<Digest> = artifacts
            .iter()
            .filter(|artifact| !artifact.info.object_type.is_tree())
            .map(|artifact| artifact.info.digest)
            .collect();
        let missing = self.missing_digests(&leaves).await?;
        if !missing.is_empty() {
            return Err(format!(
                "Cannot upload tree: {} referenced blobs are missing remotely",
                missing.len()
            ));
        }

        let (blobs, root_digest) = build_tree_blobs(self, artifacts).await?;
        // Also keep the tree objects locally: response handling and
        // overlay computations read them without a round trip.
        for blob in &blobs {
            let bytes = blob.bytes().await?;
            self.storage.cas().store_tree_bytes(&bytes).await?;
        }
        self.upload(blobs, false).await?;
        Ok(root_digest)
    }

    async fn read_tree_entries(&self, digest: &Digest) -> Result<Vec<TreeEntry>, String> {
        if let Some(bytes) = self.storage.cas().read_tree(digest).await? {
            return store::tree::parse_entries(self.hash_function(), &bytes);
        }
        let blob = self.cas.read_blob(digest).await?;
        let bytes = blob.bytes().await?;
        // Cache the fetched tree object locally.
        self.storage.cas().store_tree_bytes(&bytes).await?;
        store::tree::parse_entries(self.hash_function(), &bytes)
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
                let mut listing = String::new();
                self.render_listing(&info.digest, String::new(), &mut listing)
                    .await?;
                Bytes::from(listing)
            } else {
                self.fetch_bytes(info).await?
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
        self.fetch_bytes(info).await
    }

    async fn split_blob(&self, digest: &Digest) -> Result<Vec<Digest>, String> {
        if !self.blob_split_support().await {
            return Err("Remote endpoint does not support blob splitting".to_owned());
        }
        self.cas.split_blob(digest).await
    }

    async fn splice_blob(&self, digest: &Digest, chunks: Vec<Digest>) -> Result<Digest, String> {
        if !self.blob_splice_support().await {
            return Err("Remote endpoint does not support blob splicing".to_owned());
        }
        self.cas.splice_blob(digest, chunks).await
    }

    async fn blob_split_support(&self) -> bool {
        self.cas.blob_split_support().await
    }

    async fn blob_splice_support(&self) -> bool {
        self.cas.blob_splice_support().await
    }
}

impl RemoteApi {
    fn render_listing<'a>(
        &'a self,
        digest: &'a Digest,
        prefix: String,
        out: &'a mut String,
    ) -> BoxFuture<'a, Result<(), String>> {
        async move {
            for entry in self.read_tree_entries(digest).await? {
                let path = if prefix.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{prefix}/{}", entry.name)
                };
                let info = ObjectInfo::new(entry.digest, entry.object_type);
                out.push_str(&format!("{path} {info}\n"));
                if entry.object_type.is_tree() {
                    self.render_listing(&entry.digest, path, out).await?;
                }
            }
            Ok(())
        }
        .boxed()
    }
}
