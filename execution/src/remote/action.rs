// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use hashing::Digest;

use crate::api::{CacheFlag, ExecutionAction, ExecutionApi, ExecutionResponse};
use crate::bazel_msg::{create_action_messages, ActionMessages};
use crate::blob::ArtifactBlob;
use crate::remote::response::RemoteResponse;
use crate::remote::RemoteApi;
use crate::DEFAULT_EXECUTION_TIMEOUT;

/// An action executed against the remote execution service.
pub struct RemoteAction {
    api: RemoteApi,
    root_digest: Digest,
    command: Vec<String>,
    cwd: String,
    output_files: Vec<String>,
    output_dirs: Vec<String>,
    env: BTreeMap<String, String>,
    properties: BTreeMap<String, String>,
    cache_flag: CacheFlag,
    timeout: Duration,
}

impl RemoteAction {
    pub(crate) fn new(
        api: RemoteApi,
        root_digest: Digest,
        command: Vec<String>,
        cwd: String,
        output_files: Vec<String>,
        output_dirs: Vec<String>,
        env: BTreeMap<String, String>,
        properties: BTreeMap<String, String>,
    ) -> RemoteAction {
        RemoteAction {
            api,
            root_digest,
            command,
            cwd,
            output_files,
            output_dirs,
            env,
            properties,
            cache_flag: CacheFlag::CacheOutput,
            timeout: DEFAULT_EXECUTION_TIMEOUT,
        }
    }

    fn messages(&self) -> ActionMessages {
        create_action_messages(
            self.api.hash_function(),
            &self.root_digest,
            &self.command,
            &self.cwd,
            &self.output_files,
            &self.output_dirs,
            &self.env,
            &self.properties,
            self.timeout,
            self.cache_flag == CacheFlag::DoNotCacheOutput,
        )
    }
}

#[async_trait]
impl ExecutionAction for RemoteAction {
    fn set_cache_flag(&mut self, flag: CacheFlag) {
        self.cache_flag = flag;
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn execute(&self) -> Result<Option<Box<dyn ExecutionResponse>>, String> {
        let messages = self.messages();
        let hash_function = self.api.hash_function();

        if self.cache_flag.do_cache_lookup() {
            if let Some(result) = self
                .api
                .ac_client()
                .get_action_result(&messages.action_digest)
                .await?
            {
                log::debug!(
                    "Action {} served from remote cache",
                    messages.action_digest.hash,
                );
                let response = RemoteResponse::populate(
                    self.api.clone(),
                    messages.action_digest,
                    result,
                    true,
                )
                .await?;
                return Ok(Some(Box::new(response)));
            }
            if self.cache_flag == CacheFlag::FromCacheOnly {
                return Ok(None);
            }
        }

        // The action and command blobs must be present remotely before the
        // service can execute the fingerprint.
        self.api
            .upload(
                vec![
                    ArtifactBlob::from_bytes(hash_function, messages.action.clone(), false),
                    ArtifactBlob::from_bytes(hash_function, messages.command.clone(), false),
                ],
                false,
            )
            .await?;

        let skip_cache_lookup = !matches!(self.cache_flag, CacheFlag::CacheOutput);
        let response = self
            .api
            .execution_client()
            .execute_action(&messages.action_digest, skip_cache_lookup)
            .await?;

        if let Some(status) = &response.status {
            if status.code != 0 {
                // DEADLINE_EXCEEDED is how the server reports our timeout.
                if status.code == 4 {
                    return Err(format!(
                        "Action timed out after {:?}: {:?}",
                        self.timeout, self.command
                    ));
                }
                return Err(format!(
                    "Remote execution failed with code {}: {}",
                    status.code, status.message
                ));
            }
        }

        let result = response
            .result
            .ok_or("Execution response carried no action result")?;
        let cached = response.cached_result || self.cache_flag == CacheFlag::PretendCached;
        let response =
            RemoteResponse::populate(self.api.clone(), messages.action_digest, result, cached)
                .await?;
        Ok(Some(Box::new(response)))
    }
}
