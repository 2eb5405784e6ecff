// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;

use grpc_util::retry::RetryConfig;
use grpc_util::tls;

/// Client-side transfer tuning. The gRPC message limit is a hard protocol
/// bound; the batch transfer limit may be lowered further by the server's
/// advertised `max_batch_total_size_bytes`.
#[derive(Clone, Copy, Debug)]
pub struct ExecutionConfiguration {
    /// Upper bound for a single gRPC message.
    pub max_grpc_message_bytes: usize,
    /// Upper bound for the content carried by one batch request; anything
    /// bigger goes through the streaming interface.
    pub max_batch_transfer_bytes: usize,
    /// Downloaded blobs above this size are spooled to disk instead of being
    /// held in memory.
    pub in_memory_blob_limit_bytes: usize,
    /// Chunk size for streaming transfers.
    pub stream_chunk_bytes: usize,
}

impl Default for ExecutionConfiguration {
    fn default() -> Self {
        ExecutionConfiguration {
            max_grpc_message_bytes: 4 * 1024 * 1024,
            max_batch_transfer_bytes: store::LARGE_OBJECT_THRESHOLD,
            in_memory_blob_limit_bytes: 1024 * 1024,
            stream_chunk_bytes: 1024 * 1024,
        }
    }
}

/// One dispatch rule: if every property of the predicate matches the
/// effective platform properties of an action, that action is executed
/// against the alternative endpoint instead.
#[derive(Clone, Debug)]
pub struct DispatchRule {
    pub predicate: BTreeMap<String, String>,
    pub endpoint: String,
}

impl DispatchRule {
    pub fn matches(&self, properties: &BTreeMap<String, String>) -> bool {
        self.predicate
            .iter()
            .all(|(key, value)| properties.get(key) == Some(value))
    }
}

/// Configuration of a remote execution endpoint.
#[derive(Clone)]
pub struct RemoteExecutionConfig {
    pub address: String,
    pub instance_name: String,
    /// Base platform properties; actions overlay their own on top.
    pub platform_properties: BTreeMap<String, String>,
    /// Rules mapping platform-property patterns to alternative endpoints.
    pub dispatch: Vec<DispatchRule>,
    /// Secondary endpoint the rebuilder compares against.
    pub cache_address: Option<String>,
    pub tls: Option<tls::Config>,
    pub retry: RetryConfig,
    pub execution: ExecutionConfiguration,
}

impl RemoteExecutionConfig {
    pub fn new(address: String) -> RemoteExecutionConfig {
        RemoteExecutionConfig {
            address,
            instance_name: String::new(),
            platform_properties: BTreeMap::new(),
            dispatch: vec![],
            cache_address: None,
            tls: None,
            retry: RetryConfig::default(),
            execution: ExecutionConfiguration::default(),
        }
    }

    /// The endpoint the given effective properties dispatch to, if any rule
    /// matches. The first matching rule wins.
    pub fn dispatch_endpoint(&self, properties: &BTreeMap<String, String>) -> Option<&str> {
        self.dispatch
            .iter()
            .find(|rule| rule.matches(properties))
            .map(|rule| rule.endpoint.as_str())
    }
}
