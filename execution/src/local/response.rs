// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use common::ObjectInfo;
use hashing::Digest;
use protos::gen::build::bazel::remote::execution::v2 as remexec;

use crate::api::{
    artifacts_from_action_result, result_has_upwards_symlinks, ExecutionApi, ExecutionResponse,
};
use crate::local::LocalApi;

/// The result of a locally executed (or cache-served) action.
pub struct LocalResponse {
    api: LocalApi,
    action_digest: Digest,
    result: remexec::ActionResult,
    cached: bool,
}

impl LocalResponse {
    pub(crate) fn new(
        api: LocalApi,
        action_digest: Digest,
        result: remexec::ActionResult,
        cached: bool,
    ) -> LocalResponse {
        LocalResponse {
            api,
            action_digest,
            result,
            cached,
        }
    }

    async fn read_std_stream(&self, digest: &Option<remexec::Digest>) -> Result<Bytes, String> {
        let digest = match digest {
            Some(digest) => protos::digest_from_proto(
                digest,
                false,
                self.api.hash_function().hash_type(),
            )?,
            None => return Ok(Bytes::new()),
        };
        let bytes = self
            .api
            .storage()
            .cas()
            .read_blob(&digest, false)
            .await?
            .ok_or_else(|| format!("Stream blob {} not found in CAS", digest.hash))?;
        Ok(Bytes::from(bytes))
    }
}

#[async_trait]
impl ExecutionResponse for LocalResponse {
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
        self.read_std_stream(&self.result.stdout_digest).await
    }

    async fn stderr(&self) -> Result<Bytes, String> {
        self.read_std_stream(&self.result.stderr_digest).await
    }

    async fn artifacts(&self) -> Result<BTreeMap<String, ObjectInfo>, String> {
        artifacts_from_action_result(self.api.hash_function(), &self.result)
    }

    async fn has_upwards_symlinks(&self) -> Result<bool, String> {
        result_has_upwards_symlinks(&self.api, &self.result).await
    }
}
