// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use futures::StreamExt;
use grpc_util::retry::{status_is_retryable, RetryConfig};
use grpc_util::status_to_str;
use hashing::Digest;
use prost::Message;
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use protos::gen::google::longrunning::{operation, Operation};
use remexec::execution_client::ExecutionClient;
use tonic::transport::Channel;
use tonic::Status;

/// Client of the remote execution service: starts an operation and follows
/// its server-streamed progress, reconnecting via `WaitExecution` when the
/// stream is lost.
#[derive(Clone)]
pub struct RemoteExecutionClient {
    instance_name: String,
    retry: RetryConfig,
    execution: ExecutionClient<Channel>,
}

enum StreamOutcome {
    Complete(Box<Operation>),
    Failed(Status),
    StreamClosed,
}

impl RemoteExecutionClient {
    pub fn new(
        channel: Channel,
        instance_name: String,
        retry: RetryConfig,
    ) -> RemoteExecutionClient {
        RemoteExecutionClient {
            instance_name,
            retry,
            execution: ExecutionClient::new(channel),
        }
    }

    /// Run the action with the given fingerprint remotely and wait for the
    /// final `ExecuteResponse`.
    pub async fn execute_action(
        &self,
        action_digest: &Digest,
        skip_cache_lookup: bool,
    ) -> Result<remexec::ExecuteResponse, String> {
        let mut operation_name: Option<String> = None;
        let mut attempts_left = self.retry.max_attempts.max(1);

        loop {
            let stream_result = match &operation_name {
                None => {
                    let request = remexec::ExecuteRequest {
                        instance_name: self.instance_name.clone(),
                        skip_cache_lookup,
                        action_digest: Some(protos::digest_to_proto(action_digest)),
                        execution_policy: None,
                        results_cache_policy: None,
                    };
                    self.execution.clone().execute(request).await
                }
                Some(name) => {
                    let request = remexec::WaitExecutionRequest { name: name.clone() };
                    self.execution.clone().wait_execution(request).await
                }
            };

            let stream = match stream_result {
                Ok(response) => response.into_inner(),
                Err(status) if status_is_retryable(&status) && attempts_left > 1 => {
                    attempts_left -= 1;
                    tokio::time::sleep(self.retry.initial_backoff).await;
                    continue;
                }
                Err(status) => return Err(status_to_str(status)),
            };

            match Self::wait_on_operation_stream(stream, &mut operation_name).await {
                StreamOutcome::Complete(operation) => {
                    return Self::extract_response(*operation);
                }
                StreamOutcome::Failed(status)
                    if status_is_retryable(&status) && attempts_left > 1 =>
                {
                    attempts_left -= 1;
                    tokio::time::sleep(self.retry.initial_backoff).await;
                }
                StreamOutcome::Failed(status) => return Err(status_to_str(status)),
                StreamOutcome::StreamClosed => {
                    // Reconnect: WaitExecution if the operation is known,
                    // else restart from Execute.
                    if attempts_left <= 1 {
                        return Err("Execution stream closed before completion".to_owned());
                    }
                    attempts_left -= 1;
                }
            }
        }
    }

    /// Follow one operation stream until it reports a completed operation,
    /// fails, or disconnects.
    async fn wait_on_operation_stream(
        mut stream: tonic::Streaming<Operation>,
        operation_name: &mut Option<String>,
    ) -> StreamOutcome {
        loop {
            match stream.next().await {
                Some(Ok(operation)) => {
                    log::trace!("Execution operation update: {}", operation.name);
                    // Servers may leave the name empty on early updates.
                    if !operation.name.trim().is_empty() {
                        *operation_name = Some(operation.name.clone());
                    }
                    if operation.done {
                        return StreamOutcome::Complete(Box::new(operation));
                    }
                }
                Some(Err(status)) => {
                    log::debug!("Execution stream error: {}", status.message());
                    return StreamOutcome::Failed(status);
                }
                None => {
                    log::debug!("Execution stream disconnected before completion");
                    return StreamOutcome::StreamClosed;
                }
            }
        }
    }

    fn extract_response(operation: Operation) -> Result<remexec::ExecuteResponse, String> {
        match operation.result {
            Some(operation::Result::Response(any)) => {
                remexec::ExecuteResponse::decode(any.value.as_slice())
                    .map_err(|e| format!("Invalid ExecuteResponse from server: {e}"))
            }
            Some(operation::Result::Error(status)) => Err(format!(
                "Remote execution failed with code {}: {}",
                status.code, status.message
            )),
            None => Err("Operation completed without a result".to_owned()),
        }
    }
}
