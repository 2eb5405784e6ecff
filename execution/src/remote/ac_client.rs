// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use grpc_util::retry::{retry_call, status_is_retryable, RetryConfig};
use grpc_util::status_to_str;
use hashing::Digest;
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use remexec::action_cache_client::ActionCacheClient;
use tonic::transport::Channel;
use tonic::Code;

/// Client of the remote action cache.
#[derive(Clone)]
pub struct RemoteAcClient {
    instance_name: String,
    retry: RetryConfig,
    ac: ActionCacheClient<Channel>,
}

impl RemoteAcClient {
    pub fn new(channel: Channel, instance_name: String, retry: RetryConfig) -> RemoteAcClient {
        RemoteAcClient {
            instance_name,
            retry,
            ac: ActionCacheClient::new(channel),
        }
    }

    /// Fetch the cached result for an action fingerprint, if any.
    pub async fn get_action_result(
        &self,
        action_digest: &Digest,
    ) -> Result<Option<remexec::ActionResult>, String> {
        let request = remexec::GetActionResultRequest {
            instance_name: self.instance_name.clone(),
            action_digest: Some(protos::digest_to_proto(action_digest)),
            inline_stdout: false,
            inline_stderr: false,
            inline_output_files: vec![],
        };
        let client = self.ac.clone();
        let response = retry_call(
            self.retry,
            (client, request),
            move |(mut client, request), _| async move { client.get_action_result(request).await },
            status_is_retryable,
        )
        .await;

        match response {
            Ok(response) => Ok(Some(response.into_inner())),
            Err(status) if status.code() == Code::NotFound => Ok(None),
            Err(status) => Err(status_to_str(status)),
        }
    }

    pub async fn update_action_result(
        &self,
        action_digest: &Digest,
        result: &remexec::ActionResult,
    ) -> Result<(), String> {
        let request = remexec::UpdateActionResultRequest {
            instance_name: self.instance_name.clone(),
            action_digest: Some(protos::digest_to_proto(action_digest)),
            action_result: Some(result.clone()),
            results_cache_policy: None,
        };
        let client = self.ac.clone();
        retry_call(
            self.retry,
            (client, request),
            move |(mut client, request), _| async move {
                client.update_action_result(request).await
            },
            status_is_retryable,
        )
        .await
        .map(|_| ())
        .map_err(status_to_str)
    }
}
