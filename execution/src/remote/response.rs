// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use common::ObjectInfo;
use hashing::{Digest, HashType};
use prost::Message;
use protos::gen::build::bazel::remote::execution::v2 as remexec;

use crate::api::{
    artifacts_from_action_result, result_has_upwards_symlinks, ExecutionApi, ExecutionResponse,
};
use crate::remote::RemoteApi;

/// The result of a remotely executed (or remote-cache-served) action.
pub struct RemoteResponse {
    api: RemoteApi,
    action_digest: Digest,
    result: remexec::ActionResult,
    cached: bool,
}

impl RemoteResponse {
    /// Wrap a raw remote result, normalizing output-directory references.
    ///
    /// In compatible mode the wire reports the digest of a `Tree` message
    /// for each output directory; the stored representation here is the root
    /// `Directory` object. Fetch the `Tree`, ingest every contained
    /// directory into the local CAS, and rewrite the reference to the root.
    pub(crate) async fn populate(
        api: RemoteApi,
        action_digest: Digest,
        mut result: remexec::ActionResult,
        cached: bool,
    ) -> Result<RemoteResponse, String> {
        let hash_function = api.hash_function();
        if hash_function.hash_type() == HashType::Compatible {
            for output_dir in &mut result.output_directories {
                let tree_digest = protos::require_digest(
                    output_dir.tree_digest.as_ref(),
                    false,
                    hash_function.hash_type(),
                )?;
                let tree_bytes = api.cas_client().read_blob(&tree_digest).await?;
                let tree_bytes = tree_bytes.bytes().await?;
                let tree = remexec::Tree::decode(tree_bytes.as_ref())
                    .map_err(|e| format!("Invalid Tree message from server: {e}"))?;

                let root = tree
                    .root
                    .as_ref()
                    .ok_or("Tree message without a root directory")?;
                let mut root_digest = None;
                for directory in std::iter::once(root).chain(tree.children.iter()) {
                    let bytes = directory.encode_to_vec();
                    let digest = api.storage().cas().store_tree_bytes(&bytes).await?;
                    if std::ptr::eq(directory, root) {
                        root_digest = Some(digest);
                    }
                }
                let root_digest = root_digest.expect("root directory was ingested");
                output_dir.tree_digest = Some(protos::digest_to_proto(&root_digest));
            }
        }

        Ok(RemoteResponse {
            api,
            action_digest,
            result,
            cached,
        })
    }

    async fn read_std_stream(
        &self,
        inline: &Bytes,
        digest: &Option<remexec::Digest>,
    ) -> Result<Bytes, String> {
        if !inline.is_empty() {
            return Ok(inline.clone());
        }
        let digest = match digest {
            Some(digest) => protos::digest_from_proto(
                digest,
                false,
                self.api.hash_function().hash_type(),
            )?,
            None => return Ok(Bytes::new()),
        };
        if digest.size_bytes == 0 {
            return Ok(Bytes::new());
        }
        let blob = self.api.cas_client().read_blob(&digest).await?;
        blob.bytes().await
    }
}

#[async_trait]
impl ExecutionResponse for RemoteResponse {
    fn action_digest(&self) -> Digest {
        self.action_digest
    }

    fn exit_code(&self) -> i32 {
        self.result.exit_code
    }

    fn is_cached(&self) -> bool {
        self.cached
    }

    async fn stdout(&self) -> Result<Bytes, String> {
        self.read_std_stream(&self.result.stdout_raw, &self.result.stdout_digest)
            .await
    }

    async fn stderr(&self) -> Result<Bytes, String> {
        self.read_std_stream(&self.result.stderr_raw, &self.result.stderr_digest)
            .await
    }

    async fn artifacts(&self) -> Result<BTreeMap<String, ObjectInfo>, String> {
        artifacts_from_action_result(self.api.hash_function(), &self.result)
    }

    async fn has_upwards_symlinks(&self) -> Result<bool, String> {
        result_has_upwards_symlinks(&self.api, &self.result).await
    }
}
