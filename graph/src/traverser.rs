// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::ArtifactId;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::Semaphore;

use crate::dag::{ActionNodeId, ArtifactNodeId, DependencyGraph};
use crate::{ActionNode, ArtifactNode};

/// What the traverser calls to get work done. Implementations must be
/// thread-safe; calls for independent nodes run concurrently. A `false`
/// return fails the node (and thereby the traversal); implementations report
/// details through the logger, never by panicking.
#[async_trait]
pub trait NodeProcessor: Send + Sync {
    /// Make a source (or known) artifact available.
    async fn process_artifact(&self, graph: &DependencyGraph, node: &ArtifactNode) -> bool;

    /// Execute an action whose inputs are all available, stamping object
    /// infos onto its output artifact nodes.
    async fn process_action(&self, graph: &DependencyGraph, node: &ActionNode) -> bool;
}

enum WorkItem {
    VisitArtifact(ArtifactNodeId),
    VisitAction(ActionNodeId),
    ProcessArtifact(ArtifactNodeId),
    ExecuteAction(ActionNodeId),
}

type WorkQueue = UnboundedSender<WorkItem>;

/// Concurrent leaves-first scheduler over the dependency graph.
///
/// Workers follow the readiness discipline: an action executes only once
/// every input artifact is available; each node is processed at most once
/// (enforced by the queued-to-be-processed latch); a failure anywhere sets
/// the shared `failed` latch, after which no new work starts while in-flight
/// work completes. At most `jobs` processor calls run at a time.
pub struct Traverser<'a, P> {
    graph: &'a DependencyGraph,
    processor: &'a P,
    jobs: usize,
    failed: &'a AtomicBool,
}

impl<'a, P: NodeProcessor> Traverser<'a, P> {
    pub fn new(
        graph: &'a DependencyGraph,
        processor: &'a P,
        jobs: usize,
        failed: &'a AtomicBool,
    ) -> Traverser<'a, P> {
        Traverser {
            graph,
            processor,
            jobs: jobs.max(1),
            failed,
        }
    }

    /// Build the given artifacts. Returns true if all of them were made
    /// available and no node failed.
    pub async fn traverse(&self, targets: &[ArtifactId]) -> bool {
        // Dependency counters can only be initialised once linking is
        // complete, which is now.
        for action in self.graph.action_nodes() {
            action
                .traversal_state()
                .init_unavailable_deps(action.inputs().len());
        }

        let mut target_nodes = Vec::with_capacity(targets.len());
        for artifact_id in targets {
            match self.graph.node_for_artifact_id(artifact_id) {
                Some(node) => target_nodes.push(node.id()),
                None => {
                    log::error!("Artifact {artifact_id} not found in graph.");
                    return false;
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.jobs));
        let (queue, mut rx) = unbounded_channel();

        for node_id in &target_nodes {
            self.graph
                .artifact_node(*node_id)
                .traversal_state()
                .mark_required();
            let _ = queue.send(WorkItem::VisitArtifact(*node_id));
        }

        // Single-driver event loop: drain everything currently queued into
        // the in-flight set, then wait for one completion (which may enqueue
        // more). Work items are enqueued only from here or from in-flight
        // work, so an empty queue with nothing in flight means quiescence.
        let mut in_flight = FuturesUnordered::new();
        loop {
            while let Ok(item) = rx.try_recv() {
                in_flight.push(self.run(item, &queue, &semaphore));
            }
            if in_flight.next().await.is_none() {
                break;
            }
        }

        !self.failed.load(Ordering::SeqCst)
            && target_nodes.iter().all(|node_id| {
                self.graph
                    .artifact_node(*node_id)
                    .traversal_state()
                    .is_available()
            })
    }

    async fn run(&self, item: WorkItem, queue: &WorkQueue, semaphore: &Arc<Semaphore>) {
        match item {
            WorkItem::VisitArtifact(node_id) => self.visit_artifact(node_id, queue),
            WorkItem::VisitAction(node_id) => self.visit_action(node_id, queue),
            WorkItem::ProcessArtifact(node_id) => {
                let _permit = semaphore.acquire().await.expect("semaphore never closes");
                self.process_artifact(node_id, queue).await;
            }
            WorkItem::ExecuteAction(node_id) => {
                let _permit = semaphore.acquire().await.expect("semaphore never closes");
                self.execute_action(node_id, queue).await;
            }
        }
    }

    /// First visit of an artifact: either forward to its builder action, or,
    /// for a source artifact, queue it for processing.
    fn visit_artifact(&self, node_id: ArtifactNodeId, queue: &WorkQueue) {
        let node = self.graph.artifact_node(node_id);
        if node.traversal_state().get_and_mark_discovered() {
            return;
        }
        match node.builder() {
            Some(builder) => {
                let action = self.graph.action_node(builder);
                action.traversal_state().mark_required();
                let _ = queue.send(WorkItem::VisitAction(builder));
            }
            None => {
                if !node.traversal_state().get_and_mark_queued_to_be_processed() {
                    let _ = queue.send(WorkItem::ProcessArtifact(node_id));
                }
            }
        }
    }

    /// First visit of an action: discover its inputs, and queue the action
    /// itself if everything it needs is already available.
    fn visit_action(&self, node_id: ActionNodeId, queue: &WorkQueue) {
        let node = self.graph.action_node(node_id);
        if node.traversal_state().get_and_mark_discovered() {
            return;
        }
        for input in node.inputs() {
            let input_node = self.graph.artifact_node(input.node);
            input_node.traversal_state().mark_required();
            let _ = queue.send(WorkItem::VisitArtifact(input.node));
        }
        // All dependencies may have become available before this action was
        // discovered; the notification path will not fire again for them.
        if node.traversal_state().is_ready()
            && !node.traversal_state().get_and_mark_queued_to_be_processed()
        {
            let _ = queue.send(WorkItem::ExecuteAction(node_id));
        }
    }

    async fn process_artifact(&self, node_id: ArtifactNodeId, queue: &WorkQueue) {
        if self.failed.load(Ordering::SeqCst) {
            return;
        }
        let node = self.graph.artifact_node(node_id);
        if !self.processor.process_artifact(self.graph, node).await {
            self.failed.store(true, Ordering::SeqCst);
            return;
        }
        self.mark_available(node_id, queue);
    }

    async fn execute_action(&self, node_id: ActionNodeId, queue: &WorkQueue) {
        if self.failed.load(Ordering::SeqCst) {
            return;
        }
        let node = self.graph.action_node(node_id);
        if !self.processor.process_action(self.graph, node).await {
            self.failed.store(true, Ordering::SeqCst);
            return;
        }
        for output in node.outputs() {
            self.mark_available(output.node, queue);
        }
    }

    /// Mark an artifact available and wake any consumer action for which it
    /// was the last unavailable dependency.
    fn mark_available(&self, node_id: ArtifactNodeId, queue: &WorkQueue) {
        let node = self.graph.artifact_node(node_id);
        node.traversal_state().make_available();
        for consumer_id in node.consumers() {
            let consumer = self.graph.action_node(*consumer_id);
            if consumer
                .traversal_state()
                .notify_available_dep_and_check_ready()
                && consumer.traversal_state().is_discovered()
                && !consumer
                    .traversal_state()
                    .get_and_mark_queued_to_be_processed()
            {
                let _ = queue.send(WorkItem::ExecuteAction(*consumer_id));
            }
        }
    }
}
