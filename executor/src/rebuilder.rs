// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use execution::{CacheFlag, ExecutionApi, DEFAULT_EXECUTION_TIMEOUT};
use graph::{ActionNode, ArtifactNode, DependencyGraph, NodeProcessor};
use parking_lot::Mutex;

use crate::context::ExecutionContext;
use crate::executor::ExecutorImpl;

/// One detected divergence: the same action produced different outputs than
/// the comparison ("cache") endpoint has recorded.
#[derive(Clone, Debug)]
pub struct RebuildRecord {
    pub action_id: String,
    /// Per-path pairs of (fresh, cached) object info renderings.
    pub differences: BTreeMap<String, (String, String)>,
    /// Whether the action was tainted (may fail or uncacheable) to begin
    /// with, which makes divergence expected rather than alarming.
    pub tainted: bool,
}

/// Runs every action twice: once fresh against the main endpoint, once
/// against the cache endpoint in lookup-only mode, and records per-path
/// mismatches. Distinguishes flaky actions (different outputs) from plain
/// cache misses (no cached result available).
pub struct Rebuilder {
    context: ExecutionContext,
    api_cached: Arc<dyn ExecutionApi>,
    timeout: Duration,
    flaky: Mutex<Vec<RebuildRecord>>,
    cache_misses: Mutex<Vec<String>>,
}

impl Rebuilder {
    /// `api_cached` is the endpoint whose action cache the fresh results are
    /// compared against.
    pub fn new(
        context: ExecutionContext,
        api_cached: Arc<dyn ExecutionApi>,
        timeout: Option<Duration>,
    ) -> Rebuilder {
        Rebuilder {
            context,
            api_cached,
            timeout: timeout.unwrap_or(DEFAULT_EXECUTION_TIMEOUT),
            flaky: Mutex::new(vec![]),
            cache_misses: Mutex::new(vec![]),
        }
    }

    /// The comparison report, in a shape suitable for dumping to a file.
    pub fn dump_flaky_actions(&self) -> serde_json::Value {
        let flaky = self.flaky.lock();
        let cache_misses = self.cache_misses.lock();
        serde_json::json!({
            "flaky actions": flaky
                .iter()
                .map(|record| {
                    (
                        record.action_id.clone(),
                        serde_json::json!({
                            "tainted": record.tainted,
                            "outputs": record
                                .differences
                                .iter()
                                .map(|(path, (fresh, cached))| {
                                    (
                                        path.clone(),
                                        serde_json::json!({
                                            "rebuilt": fresh,
                                            "cached": cached,
                                        }),
                                    )
                                })
                                .collect::<serde_json::Map<_, _>>(),
                        }),
                    )
                })
                .collect::<serde_json::Map<_, _>>(),
            "cache misses": *cache_misses,
        })
    }

    pub fn flaky_actions(&self) -> Vec<RebuildRecord> {
        self.flaky.lock().clone()
    }

    pub fn cache_misses(&self) -> Vec<String> {
        self.cache_misses.lock().clone()
    }
}

#[async_trait]
impl NodeProcessor for Rebuilder {
    async fn process_artifact(&self, _graph: &DependencyGraph, node: &ArtifactNode) -> bool {
        match ExecutorImpl::verify_or_upload_artifact(&self.context, node).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to provide artifact {}: {e}", node.artifact().id());
                false
            }
        }
    }

    async fn process_action(&self, graph: &DependencyGraph, node: &ActionNode) -> bool {
        let action_id = node.action().id.clone();

        // First run: fresh execution through the normal path, pretending it
        // was cached so nothing is written back.
        let response = match ExecutorImpl::execute_action(
            &self.context,
            self.context.remote.as_ref(),
            graph,
            node,
            self.timeout,
            CacheFlag::PretendCached,
        )
        .await
        {
            Ok(None) => return true, // tree actions have no response
            Ok(Some(response)) => response,
            Err(e) => {
                log::error!("Failed to execute action {action_id}: {e}");
                return false;
            }
        };

        let parsed = match ExecutorImpl::parse_response(
            &self.context,
            graph,
            node,
            response.as_ref(),
            /* count_as_executed= */ true,
        )
        .await
        {
            Ok(ok) => ok,
            Err(e) => {
                log::error!("Failed to parse response of action {action_id}: {e}");
                false
            }
        };
        if !parsed {
            return false;
        }

        // Second run: cache lookup only, against the comparison endpoint.
        let response_cached = match ExecutorImpl::execute_action(
            &self.context,
            self.api_cached.as_ref(),
            graph,
            node,
            self.timeout,
            CacheFlag::FromCacheOnly,
        )
        .await
        {
            Ok(result) => result,
            Err(e) => {
                log::error!("Cache-endpoint lookup for action {action_id} failed: {e}");
                return false;
            }
        };

        let response_cached = match response_cached {
            Some(response) => response,
            None => {
                log::debug!("No cached result for action {action_id}");
                self.context.statistics.increment_rebuilt_actions_missing();
                self.cache_misses.lock().push(action_id);
                return true;
            }
        };

        self.context.statistics.increment_rebuilt_actions_compared();
        let fresh = match response.artifacts().await {
            Ok(artifacts) => artifacts,
            Err(e) => {
                log::error!("Failed to read artifacts of action {action_id}: {e}");
                return false;
            }
        };
        let cached = match response_cached.artifacts().await {
            Ok(artifacts) => artifacts,
            Err(e) => {
                log::error!("Failed to read cached artifacts of action {action_id}: {e}");
                return false;
            }
        };

        let mut differences = BTreeMap::new();
        for (path, fresh_info) in &fresh {
            match cached.get(path) {
                Some(cached_info) if cached_info == fresh_info => {}
                Some(cached_info) => {
                    differences
                        .insert(path.clone(), (fresh_info.to_string(), cached_info.to_string()));
                }
                None => {
                    differences
                        .insert(path.clone(), (fresh_info.to_string(), "missing".to_owned()));
                }
            }
        }
        for (path, cached_info) in &cached {
            if !fresh.contains_key(path) {
                differences.insert(path.clone(), ("missing".to_owned(), cached_info.to_string()));
            }
        }

        if !differences.is_empty() {
            let tainted = node.action().may_fail.is_some() || node.action().no_cache;
            log::warn!(
                "Action {action_id} is flaky: {} outputs differ from the cache endpoint",
                differences.len(),
            );
            self.context.statistics.increment_actions_flaky();
            if tainted {
                self.context.statistics.increment_actions_flaky_tainted();
            }
            self.flaky.lock().push(RebuildRecord {
                action_id,
                differences,
                tainted,
            });
        }
        true
    }
}
