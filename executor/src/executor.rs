// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{ArtifactDescription, ObjectInfo, ObjectType};
use execution::remote::{RemoteApi, RemoteExecutionConfig};
use execution::tree_ops::compute_tree_overlay;
use execution::{
    ArtifactBlob, CacheFlag, ExecutionApi, ExecutionResponse, NamedArtifact,
    DEFAULT_EXECUTION_TIMEOUT,
};
use graph::{ActionNode, ArtifactNode, DependencyGraph, NodeProcessor};
use hashing::{Digest, HashType};

use crate::context::ExecutionContext;

/// Stateless helpers shared by the executor and the rebuilder.
pub(crate) struct ExecutorImpl;

impl ExecutorImpl {
    /// Compute and stamp the result of a tree-overlay action: fold the input
    /// trees left-to-right with the overlay primitive.
    pub(crate) async fn execute_tree_overlay_action(
        context: &ExecutionContext,
        api: &dyn ExecutionApi,
        graph: &DependencyGraph,
        action: &ActionNode,
    ) -> Result<(), String> {
        let mut inputs = Self::collect_inputs(graph, action)?;
        inputs.sort_by(|a, b| a.path.cmp(&b.path));
        log::debug!(
            "Tree-overlay action {} over {} trees",
            action.action().id,
            inputs.len(),
        );

        let mut tree = inputs
            .first()
            .ok_or("Tree-overlay action without inputs")?
            .info;
        for overlay in &inputs {
            tree = compute_tree_overlay(
                api,
                &tree,
                &overlay.info,
                action.action().is_overlay_disjoint(),
            )
            .await?;
            context.statistics.increment_trees_analysed();
        }

        let failed_inputs = inputs.iter().any(|input| input.info.failed);
        let output = action
            .output_dirs()
            .first()
            .ok_or("Tree-overlay action without a tree output")?;
        graph.artifact_node(output.node).artifact().set_object_info(
            tree.digest,
            ObjectType::Tree,
            failed_inputs,
        );
        Ok(())
    }

    /// Execute one action and obtain its response. `Ok(None)` is an action
    /// that produces no response (tree and tree-overlay actions, or a
    /// cache-only miss).
    pub(crate) async fn execute_action(
        context: &ExecutionContext,
        api: &dyn ExecutionApi,
        graph: &DependencyGraph,
        action: &ActionNode,
        timeout: Duration,
        cache_flag: CacheFlag,
    ) -> Result<Option<Box<dyn ExecutionResponse>>, String> {
        if action.action().is_tree_overlay_action() {
            Self::execute_tree_overlay_action(context, api, graph, action).await?;
            return Ok(None);
        }

        let inputs = Self::collect_inputs(graph, action)?;
        let root_digest = Self::create_root_digest(api, &inputs).await?;

        if action.action().is_tree_action() {
            let failed_inputs = inputs.iter().any(|input| input.info.failed);
            let output = action
                .output_dirs()
                .first()
                .ok_or("Tree action without a tree output")?;
            graph.artifact_node(output.node).artifact().set_object_info(
                root_digest,
                ObjectType::Tree,
                failed_inputs,
            );
            return Ok(None);
        }

        // Rebuilder cache fetches are not counted as queued work.
        if cache_flag != CacheFlag::FromCacheOnly {
            context.statistics.increment_actions_queued();
        }

        let merged_properties = Self::merge_properties(
            &context.remote_config.platform_properties,
            &action.action().execution_properties,
        );

        // A matching dispatch rule sends this action (and only this action)
        // to an alternative endpoint, with its input root staged there first.
        let alternative_api = match context.remote_config.dispatch_endpoint(&merged_properties) {
            Some(endpoint) => {
                log::debug!(
                    "Dispatching action {} to endpoint {endpoint}",
                    action.action().id,
                );
                let alternative = Self::endpoint_api(context, endpoint)?;
                let root_info = ObjectInfo::new(root_digest, ObjectType::Tree);
                api.retrieve_to_cas(&[root_info], alternative.as_ref())
                    .await
                    .map_err(|e| {
                        format!("Failed to sync tree {} to dispatch endpoint: {e}", root_digest.hash)
                    })?;
                Some(alternative)
            }
            None => None,
        };
        let effective_api: &dyn ExecutionApi = match &alternative_api {
            Some(alternative) => alternative.as_ref(),
            None => api,
        };

        let base = &action.action().cwd;
        let cwd_relative_output_files = action
            .action()
            .output_files
            .iter()
            .map(|path| rebase_path_relative_to(base, path))
            .collect();
        let cwd_relative_output_dirs = action
            .action()
            .output_dirs
            .iter()
            .map(|path| rebase_path_relative_to(base, path))
            .collect();

        let mut remote_action = effective_api.create_action(
            root_digest,
            action.action().command.clone(),
            base.clone(),
            cwd_relative_output_files,
            cwd_relative_output_dirs,
            action.action().env.clone(),
            merged_properties,
        );
        remote_action.set_cache_flag(cache_flag);
        remote_action.set_timeout(Self::scale_time(timeout, action.action().timeout_scale));

        let response = match remote_action.execute().await? {
            Some(response) => response,
            None => return Ok(None),
        };

        // In compatible mode, check that no output escapes via an upward
        // symlink; that is a hard failure regardless of where it was found.
        if api.hash_function().hash_type() == HashType::Compatible
            && response.has_upwards_symlinks().await?
        {
            return Err("Executed action produced invalid outputs -- upwards symlinks".to_owned());
        }

        // If an alternative endpoint was used, bring its outputs back.
        if let Some(alternative) = &alternative_api {
            let artifacts = response.artifacts().await?;
            let infos: Vec<ObjectInfo> = artifacts.values().copied().collect();
            if let Err(e) = alternative.retrieve_to_cas(&infos, api).await {
                log::warn!("Failed to retrieve back artifacts from dispatch endpoint: {e}");
            }
        }

        Ok(Some(response))
    }

    /// Parse a response and write the object infos onto the action's output
    /// artifact nodes. Returns false on a non-zero exit (unless the action
    /// may fail) or when declared outputs are missing.
    pub(crate) async fn parse_response(
        context: &ExecutionContext,
        graph: &DependencyGraph,
        action: &ActionNode,
        response: &dyn ExecutionResponse,
        count_as_executed: bool,
    ) -> Result<bool, String> {
        if !count_as_executed && response.is_cached() {
            log::debug!("Action {} served from cache", action.action().id);
            context.statistics.increment_actions_cached();
        } else {
            context.statistics.increment_actions_executed();
        }

        let mut should_fail_outputs = false;
        for input in action.inputs() {
            if let Some(info) = graph.artifact_node(input.node).artifact().info() {
                should_fail_outputs |= info.failed;
            }
        }

        let mut action_failed = false;
        if response.exit_code() != 0 {
            match &action.action().may_fail {
                Some(_) => {
                    should_fail_outputs = true;
                    action_failed = true;
                }
                None => {
                    log::error!(
                        "Action {} returned non-zero exit code {}",
                        action.action().id,
                        response.exit_code(),
                    );
                    Self::log_command_output(action, response).await;
                    return Ok(false);
                }
            }
        }

        let artifacts = response.artifacts().await?;
        let base = &action.action().cwd;

        // Every declared output must be present with a compatible type.
        for output in action.output_files() {
            let rebased = rebase_path_relative_to(base, &output.path);
            match artifacts.get(&rebased) {
                Some(info) if info.object_type.is_file() || info.object_type.is_symlink() => {}
                _ => {
                    Self::log_missing_outputs(action, response, action_failed).await;
                    return Ok(false);
                }
            }
        }
        for output in action.output_dirs() {
            let rebased = rebase_path_relative_to(base, &output.path);
            match artifacts.get(&rebased) {
                Some(info) if info.object_type.is_tree() || info.object_type.is_symlink() => {}
                _ => {
                    Self::log_missing_outputs(action, response, action_failed).await;
                    return Ok(false);
                }
            }
        }

        Self::log_command_output(action, response).await;

        for output in action.output_files().iter().chain(action.output_dirs()) {
            let rebased = rebase_path_relative_to(base, &output.path);
            let info = artifacts[&rebased];
            graph.artifact_node(output.node).artifact().set_object_info(
                info.digest,
                info.object_type,
                should_fail_outputs,
            );
        }

        if action_failed {
            let message = action.action().may_fail.as_deref().unwrap_or("");
            log::warn!(
                "{message} (exit code {}); outputs are marked failed",
                response.exit_code(),
            );
        }
        Ok(true)
    }

    /// Ensure an artifact is available to the main API: verify a known
    /// digest, forward local content, or read it out of a workspace root,
    /// hash it and upload it.
    pub(crate) async fn verify_or_upload_artifact(
        context: &ExecutionContext,
        artifact: &ArtifactNode,
    ) -> Result<(), String> {
        let api = context.remote.as_ref();

        if let Some(info) = artifact.artifact().info() {
            log::trace!("upload KNOWN artifact: {info}");
            if api.is_available(&info.digest).await {
                return Ok(());
            }
            // Not remotely available: maybe the local CAS has it.
            if context.local.is_available(&info.digest).await {
                return context
                    .local
                    .retrieve_to_cas(std::slice::from_ref(info), api)
                    .await;
            }
            return Err(format!(
                "Artifact {} should be present in CAS but is missing.",
                artifact.artifact().id()
            ));
        }

        let (path, repository) = match artifact.artifact().description() {
            ArtifactDescription::Local { path, repository } => (path, repository),
            other => {
                return Err(format!(
                    "Artifact {} with description {other:?} cannot be processed as a source.",
                    artifact.artifact().id()
                ))
            }
        };
        log::trace!("upload LOCAL artifact: {}", path.display());

        let root = context
            .repo_config
            .root(repository)
            .ok_or_else(|| format!("Unknown repository {repository:?}"))?;
        let file = root.read_file(path)?;
        let blob = ArtifactBlob::from_bytes(
            api.hash_function(),
            file.content.into(),
            file.is_executable,
        );
        let digest = *blob.digest();
        let object_type = if file.is_executable {
            ObjectType::Executable
        } else {
            ObjectType::File
        };
        api.upload(vec![blob], false).await?;

        artifact
            .artifact()
            .set_object_info(digest, object_type, false);
        Ok(())
    }

    pub(crate) fn collect_inputs(
        graph: &DependencyGraph,
        action: &ActionNode,
    ) -> Result<Vec<NamedArtifact>, String> {
        action
            .inputs()
            .iter()
            .map(|input| {
                let node = graph.artifact_node(input.node);
                let info = node.artifact().info().ok_or_else(|| {
                    format!(
                        "Input {} of action {} has no object info",
                        input.path,
                        action.action().id
                    )
                })?;
                Ok(NamedArtifact {
                    path: input.path.clone().into(),
                    info: *info,
                })
            })
            .collect()
    }

    /// The input-root digest: a sole tree staged at the root is used as-is,
    /// anything else is assembled into a fresh tree.
    pub(crate) async fn create_root_digest(
        api: &dyn ExecutionApi,
        inputs: &[NamedArtifact],
    ) -> Result<Digest, String> {
        if let [only] = inputs {
            let at_root = only.path.as_os_str() == "." || only.path.as_os_str().is_empty();
            if at_root && only.info.object_type.is_tree() {
                return Ok(only.info.digest);
            }
        }
        api.upload_tree(inputs).await
    }

    pub(crate) fn scale_time(timeout: Duration, factor: f64) -> Duration {
        Duration::from_millis((timeout.as_millis() as f64 * factor).round() as u64)
    }

    /// Effective execution properties: the base from the configuration with
    /// the action's own properties overlaid (the overlay wins).
    pub(crate) fn merge_properties(
        base: &BTreeMap<String, String>,
        overlay: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut result = base.clone();
        for (key, value) in overlay {
            result.insert(key.clone(), value.clone());
        }
        result
    }

    /// Connect to an alternative execution endpoint, inheriting everything
    /// but the address from the main configuration.
    fn endpoint_api(
        context: &ExecutionContext,
        endpoint: &str,
    ) -> Result<Arc<dyn ExecutionApi>, String> {
        let config = RemoteExecutionConfig {
            address: endpoint.to_owned(),
            dispatch: vec![],
            ..(*context.remote_config).clone()
        };
        let api = RemoteApi::connect(config, context.storage.clone())?;
        Ok(Arc::new(api))
    }

    async fn log_command_output(action: &ActionNode, response: &dyn ExecutionResponse) {
        let stdout = response.stdout().await.unwrap_or_default();
        let stderr = response.stderr().await.unwrap_or_default();
        if stdout.is_empty() && stderr.is_empty() {
            return;
        }
        let mut message = format!(
            "Output of command {:?} in environment {:?}\n",
            action.action().command,
            action.action().env,
        );
        if !stdout.is_empty() {
            message.push_str(&String::from_utf8_lossy(&stdout));
        }
        if !stderr.is_empty() {
            message.push_str(&String::from_utf8_lossy(&stderr));
        }
        log::info!("{message}");
    }

    async fn log_missing_outputs(
        action: &ActionNode,
        response: &dyn ExecutionResponse,
        action_failed: bool,
    ) {
        let mut message = String::new();
        if action_failed {
            message.push_str(&format!(
                "{} (exit code {})\nMoreover ",
                action.action().may_fail.as_deref().unwrap_or(""),
                response.exit_code(),
            ));
        }
        message.push_str("action executed with missing outputs.\nAction outputs should be:");
        for output in action.output_files() {
            message.push_str(&format!("\n  - file: {}", output.path));
        }
        for output in action.output_dirs() {
            message.push_str(&format!("\n  - dir: {}", output.path));
        }
        log::error!("{message}");
        Self::log_command_output(action, response).await;
    }
}

/// Express `path` (relative to the action root) relative to `base`.
pub(crate) fn rebase_path_relative_to(base: &str, path: &str) -> String {
    if base.is_empty() || base == "." {
        return path.to_owned();
    }
    let base_components: Vec<&str> = base.split('/').filter(|c| !c.is_empty() && *c != ".").collect();
    let path_components: Vec<&str> = path.split('/').filter(|c| !c.is_empty() && *c != ".").collect();

    let common = base_components
        .iter()
        .zip(&path_components)
        .take_while(|(a, b)| a == b)
        .count();

    let mut result: Vec<&str> = vec![];
    for _ in common..base_components.len() {
        result.push("..");
    }
    result.extend(&path_components[common..]);
    if result.is_empty() {
        ".".to_owned()
    } else {
        result.join("/")
    }
}

/// The executor: turns graph nodes into execution-API calls against the
/// context's main endpoint.
pub struct Executor {
    context: ExecutionContext,
    timeout: Duration,
}

impl Executor {
    pub fn new(context: ExecutionContext, timeout: Option<Duration>) -> Executor {
        Executor {
            context,
            timeout: timeout.unwrap_or(DEFAULT_EXECUTION_TIMEOUT),
        }
    }
}

#[async_trait]
impl NodeProcessor for Executor {
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
        let cache_flag = if node.action().no_cache {
            CacheFlag::DoNotCacheOutput
        } else {
            CacheFlag::CacheOutput
        };

        let response = match ExecutorImpl::execute_action(
            &self.context,
            self.context.remote.as_ref(),
            graph,
            node,
            self.timeout,
            cache_flag,
        )
        .await
        {
            // Actions without a response (tree actions) have stamped their
            // outputs already.
            Ok(None) => return true,
            Ok(Some(response)) => response,
            Err(e) => {
                log::error!("Failed to execute action {}: {e}", node.action().id);
                return false;
            }
        };

        match ExecutorImpl::parse_response(&self.context, graph, node, response.as_ref(), false)
            .await
        {
            Ok(ok) => ok,
            Err(e) => {
                log::error!("Failed to parse response of action {}: {e}", node.action().id);
                false
            }
        }
    }
}
