// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use common::{RepositoryConfig, Statistics};
use execution::remote::RemoteExecutionConfig;
use execution::ExecutionApi;
use store::Storage;

/// Everything the executor needs to process nodes, constructed once at
/// startup and threaded through explicitly: the workspace roots, the local
/// and main execution APIs, the remote configuration (platform properties,
/// dispatch rules, cache endpoint), the storage, and the statistics sink.
///
/// For a purely local build the "remote" API is the local one; the executor
/// never cares which it is talking to.
#[derive(Clone)]
pub struct ExecutionContext {
    pub repo_config: Arc<RepositoryConfig>,
    pub local: Arc<dyn ExecutionApi>,
    pub remote: Arc<dyn ExecutionApi>,
    pub remote_config: Arc<RemoteExecutionConfig>,
    pub storage: Storage,
    pub statistics: Arc<Statistics>,
}

impl ExecutionContext {
    /// A context executing everything locally.
    pub fn local_only(
        repo_config: RepositoryConfig,
        api: Arc<dyn ExecutionApi>,
        storage: Storage,
    ) -> ExecutionContext {
        ExecutionContext {
            repo_config: Arc::new(repo_config),
            local: api.clone(),
            remote: api,
            remote_config: Arc::new(RemoteExecutionConfig::new(String::new())),
            storage,
            statistics: Arc::new(Statistics::new()),
        }
    }

    pub fn with_remote(
        repo_config: RepositoryConfig,
        local: Arc<dyn ExecutionApi>,
        remote: Arc<dyn ExecutionApi>,
        remote_config: RemoteExecutionConfig,
        storage: Storage,
    ) -> ExecutionContext {
        ExecutionContext {
            repo_config: Arc::new(repo_config),
            local,
            remote,
            remote_config: Arc::new(remote_config),
            storage,
            statistics: Arc::new(Statistics::new()),
        }
    }
}
