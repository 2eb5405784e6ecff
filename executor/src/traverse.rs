// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use common::ArtifactId;
use graph::{DependencyGraph, Traverser};

use crate::context::ExecutionContext;
use crate::executor::Executor;
use crate::BuildExitCode;

/// Validate the graph, traverse it with `jobs` workers, and fold the outcome
/// into the process exit-code convention: traversal failure is a failure,
/// and a completed build still exits non-zero when any requested artifact
/// carries the failed mark of a may-fail action.
pub async fn build_artifacts(
    context: &ExecutionContext,
    graph: &DependencyGraph,
    targets: &[ArtifactId],
    jobs: usize,
    timeout: Option<Duration>,
) -> BuildExitCode {
    if let Err(e) = graph.validate() {
        log::error!("Invalid dependency graph: {e}");
        return BuildExitCode::Failure;
    }

    let executor = Executor::new(context.clone(), timeout);
    let failed = AtomicBool::new(false);
    let traverser = Traverser::new(graph, &executor, jobs, &failed);
    if !traverser.traverse(targets).await {
        log::error!("Build failed.");
        return BuildExitCode::Failure;
    }

    log::info!(
        "Processed {} actions, {} cache hits.",
        context.statistics.actions_queued(),
        context.statistics.actions_cached(),
    );

    let failed_artifacts = targets.iter().any(|artifact_id| {
        graph
            .node_for_artifact_id(artifact_id)
            .and_then(|node| node.artifact().info())
            .map(|info| info.failed)
            .unwrap_or(false)
    });
    if failed_artifacts {
        BuildExitCode::FailedArtifacts
    } else {
        BuildExitCode::Success
    }
}
