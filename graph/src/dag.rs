// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};

use common::{Action, ActionDescription, ActionId, Artifact, ArtifactDescription, ArtifactId};
use hashing::HashFunction;

/// Index of an artifact node in the graph's arena. Stable for the lifetime
/// of the graph.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ArtifactNodeId(usize);

/// Index of an action node in the graph's arena.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ActionNodeId(usize);

/// An input or output of an action: the path it is staged at (relative to
/// the action root) and the artifact node behind it.
#[derive(Clone, Debug)]
pub struct NamedInput {
    pub path: String,
    pub node: ArtifactNodeId,
}

/// Lock-free traversal state shared by both node roles.
///
/// All flags are one-way latches with sequentially consistent ordering;
/// the swap results tell a worker whether it is the one that gets to act.
#[derive(Debug, Default)]
pub struct NodeTraversalState {
    discovered: AtomicBool,
    queued_to_be_processed: AtomicBool,
    required: AtomicBool,
}

impl NodeTraversalState {
    /// Mark discovered; true if some worker already had.
    pub fn get_and_mark_discovered(&self) -> bool {
        self.discovered.swap(true, Ordering::SeqCst)
    }

    /// Mark queued for processing; true if some worker already had. This is
    /// what guarantees at most one `process` call per node.
    pub fn get_and_mark_queued_to_be_processed(&self) -> bool {
        self.queued_to_be_processed.swap(true, Ordering::SeqCst)
    }

    pub fn is_discovered(&self) -> bool {
        self.discovered.load(Ordering::SeqCst)
    }

    pub fn mark_required(&self) {
        self.required.store(true, Ordering::SeqCst);
    }

    pub fn is_required(&self) -> bool {
        self.required.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct ArtifactTraversalState {
    base: NodeTraversalState,
    available: AtomicBool,
}

impl ArtifactTraversalState {
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn make_available(&self) {
        self.available.store(true, Ordering::SeqCst);
    }
}

impl std::ops::Deref for ArtifactTraversalState {
    type Target = NodeTraversalState;

    fn deref(&self) -> &NodeTraversalState {
        &self.base
    }
}

#[derive(Debug)]
pub struct ActionTraversalState {
    base: NodeTraversalState,
    unavailable_deps: AtomicIsize,
}

impl Default for ActionTraversalState {
    fn default() -> Self {
        ActionTraversalState {
            base: NodeTraversalState::default(),
            unavailable_deps: AtomicIsize::new(-1),
        }
    }
}

impl ActionTraversalState {
    /// Initialise the dependency counter; must happen before traversal
    /// starts, once linking is complete.
    pub fn init_unavailable_deps(&self, count: usize) {
        self.unavailable_deps
            .store(count as isize, Ordering::SeqCst);
    }

    /// Acknowledge that one dependency became available; true if that was
    /// the last one and the action is now ready.
    pub fn notify_available_dep_and_check_ready(&self) -> bool {
        self.unavailable_deps.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// Whether the action can execute right now. Unlike the notify call this
    /// does not modify state; it covers the case where all dependencies were
    /// already available when the node was visited.
    pub fn is_ready(&self) -> bool {
        self.unavailable_deps.load(Ordering::SeqCst) == 0
    }
}

impl std::ops::Deref for ActionTraversalState {
    type Target = NodeTraversalState;

    fn deref(&self) -> &NodeTraversalState {
        &self.base
    }
}

/// An artifact node: the artifact itself, at most one builder action
/// (child), and the actions consuming it (parents).
#[derive(Debug)]
pub struct ArtifactNode {
    id: ArtifactNodeId,
    artifact: Artifact,
    builder: Option<ActionNodeId>,
    consumers: Vec<ActionNodeId>,
    traversal: ArtifactTraversalState,
}

impl ArtifactNode {
    pub fn id(&self) -> ArtifactNodeId {
        self.id
    }

    pub fn artifact(&self) -> &Artifact {
        &self.artifact
    }

    pub fn builder(&self) -> Option<ActionNodeId> {
        self.builder
    }

    pub fn has_builder_action(&self) -> bool {
        self.builder.is_some()
    }

    pub fn consumers(&self) -> &[ActionNodeId] {
        &self.consumers
    }

    pub fn traversal_state(&self) -> &ArtifactTraversalState {
        &self.traversal
    }
}

/// An action node: the action, its named inputs (children) and its named
/// outputs (parents). Valid only with at least one output.
#[derive(Debug)]
pub struct ActionNode {
    id: ActionNodeId,
    action: Action,
    inputs: Vec<NamedInput>,
    output_files: Vec<NamedInput>,
    output_dirs: Vec<NamedInput>,
    traversal: ActionTraversalState,
}

impl ActionNode {
    pub fn id(&self) -> ActionNodeId {
        self.id
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn inputs(&self) -> &[NamedInput] {
        &self.inputs
    }

    pub fn output_files(&self) -> &[NamedInput] {
        &self.output_files
    }

    pub fn output_dirs(&self) -> &[NamedInput] {
        &self.output_dirs
    }

    pub fn outputs(&self) -> impl Iterator<Item = &NamedInput> {
        self.output_files.iter().chain(self.output_dirs.iter())
    }

    pub fn traversal_state(&self) -> &ActionTraversalState {
        &self.traversal
    }
}

/// The bipartite action/artifact dependency graph of one build invocation.
///
/// Nodes live in arenas and reference each other by index, so borrowed node
/// references are stable for the graph's lifetime and teardown is a pair of
/// vector drops. Artifact construction is idempotent per identifier.
pub struct DependencyGraph {
    hash_function: HashFunction,
    artifact_nodes: Vec<ArtifactNode>,
    action_nodes: Vec<ActionNode>,
    artifact_ids: HashMap<ArtifactId, ArtifactNodeId>,
    action_ids: HashMap<ActionId, ActionNodeId>,
}

impl DependencyGraph {
    pub fn new(hash_function: HashFunction) -> DependencyGraph {
        DependencyGraph {
            hash_function,
            artifact_nodes: vec![],
            action_nodes: vec![],
            artifact_ids: HashMap::new(),
            action_ids: HashMap::new(),
        }
    }

    pub fn hash_function(&self) -> HashFunction {
        self.hash_function
    }

    /// Add (or find) the artifact with the given description.
    pub fn add_artifact(&mut self, description: ArtifactDescription) -> ArtifactId {
        let artifact_id = description.id(self.hash_function);
        self.ensure_artifact_node(artifact_id.clone(), description);
        artifact_id
    }

    fn ensure_artifact_node(
        &mut self,
        artifact_id: ArtifactId,
        description: ArtifactDescription,
    ) -> ArtifactNodeId {
        if let Some(node_id) = self.artifact_ids.get(&artifact_id) {
            return *node_id;
        }
        let node_id = ArtifactNodeId(self.artifact_nodes.len());
        self.artifact_nodes.push(ArtifactNode {
            id: node_id,
            artifact: Artifact::new(artifact_id.clone(), description),
            builder: None,
            consumers: vec![],
            traversal: ArtifactTraversalState::default(),
        });
        self.artifact_ids.insert(artifact_id, node_id);
        node_id
    }

    /// Add all given actions; fails on the first invalid one.
    pub fn add(&mut self, actions: Vec<ActionDescription>) -> Result<(), String> {
        for action in actions {
            self.add_action(action)?;
        }
        Ok(())
    }

    /// Add an action: registers its output artifacts (parents), its input
    /// artifacts (children), and the builder edges. Rejects duplicate action
    /// identifiers and any attempt to give an artifact a second builder.
    pub fn add_action(&mut self, description: ActionDescription) -> Result<ActionNodeId, String> {
        let ActionDescription { action, inputs } = description;

        if action.output_files.is_empty() && action.output_dirs.is_empty() {
            return Err(format!("Action {} declares no outputs", action.id));
        }
        if self.action_ids.contains_key(&action.id) {
            return Err(format!(
                "Action {} is already registered; cannot set a second builder for its outputs",
                action.id
            ));
        }

        let node_id = ActionNodeId(self.action_nodes.len());

        let mut input_nodes = Vec::with_capacity(inputs.len());
        for (path, input_description) in inputs {
            let artifact_id = input_description.id(self.hash_function);
            let input_node = self.ensure_artifact_node(artifact_id, input_description);
            self.artifact_nodes[input_node.0].consumers.push(node_id);
            input_nodes.push(NamedInput {
                path,
                node: input_node,
            });
        }

        let link_outputs = |graph: &mut Self, paths: &[String]| -> Result<Vec<NamedInput>, String> {
            let mut outputs = Vec::with_capacity(paths.len());
            for path in paths {
                let description = ArtifactDescription::Action {
                    action_id: action.id.clone(),
                    path: path.into(),
                };
                let artifact_id = description.id(graph.hash_function);
                let output_node = graph.ensure_artifact_node(artifact_id, description);
                let node = &mut graph.artifact_nodes[output_node.0];
                if node.builder.is_some() {
                    return Err(format!(
                        "Cannot set a second builder for artifact {}",
                        node.artifact.id()
                    ));
                }
                node.builder = Some(node_id);
                outputs.push(NamedInput {
                    path: path.clone(),
                    node: output_node,
                });
            }
            Ok(outputs)
        };

        let output_files = link_outputs(self, &action.output_files)?;
        let output_dirs = link_outputs(self, &action.output_dirs)?;

        self.action_ids.insert(action.id.clone(), node_id);
        self.action_nodes.push(ActionNode {
            id: node_id,
            action,
            inputs: input_nodes,
            output_files,
            output_dirs,
            traversal: ActionTraversalState::default(),
        });
        Ok(node_id)
    }

    pub fn artifact_node(&self, id: ArtifactNodeId) -> &ArtifactNode {
        &self.artifact_nodes[id.0]
    }

    pub fn action_node(&self, id: ActionNodeId) -> &ActionNode {
        &self.action_nodes[id.0]
    }

    pub fn artifact_nodes(&self) -> impl Iterator<Item = &ArtifactNode> {
        self.artifact_nodes.iter()
    }

    pub fn action_nodes(&self) -> impl Iterator<Item = &ActionNode> {
        self.action_nodes.iter()
    }

    pub fn node_for_artifact_id(&self, artifact_id: &ArtifactId) -> Option<&ArtifactNode> {
        self.artifact_ids
            .get(artifact_id)
            .map(|node_id| self.artifact_node(*node_id))
    }

    pub fn node_for_action_id(&self, action_id: &ActionId) -> Option<&ActionNode> {
        self.action_ids
            .get(action_id)
            .map(|node_id| self.action_node(*node_id))
    }

    /// The action building the given artifact, if any.
    pub fn action_for_artifact_id(&self, artifact_id: &ArtifactId) -> Option<&ActionNode> {
        self.node_for_artifact_id(artifact_id)
            .and_then(|node| node.builder)
            .map(|action_id| self.action_node(action_id))
    }

    /// Check that the graph is acyclic. Structural validity (single builder,
    /// at least one output) is already enforced during construction.
    pub fn validate(&self) -> Result<(), String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        // Artifact and action nodes share one color space; actions are
        // offset past the artifacts.
        let offset = self.artifact_nodes.len();
        let mut colors = vec![Color::White; offset + self.action_nodes.len()];

        // Iterative DFS over the children edges: artifact -> builder action,
        // action -> input artifacts.
        #[derive(Clone, Copy)]
        enum Visit {
            Enter(usize),
            Leave(usize),
        }

        for start in 0..self.artifact_nodes.len() {
            if colors[start] != Color::White {
                continue;
            }
            let mut stack = vec![Visit::Enter(start)];
            while let Some(visit) = stack.pop() {
                match visit {
                    Visit::Enter(index) => {
                        match colors[index] {
                            Color::Gray => {
                                return Err("Dependency graph contains a cycle".to_owned())
                            }
                            Color::Black => {}
                            Color::White => {
                                colors[index] = Color::Gray;
                                stack.push(Visit::Leave(index));
                                if index < offset {
                                    if let Some(builder) = self.artifact_nodes[index].builder {
                                        match colors[offset + builder.0] {
                                            Color::Gray => {
                                                return Err(
                                                    "Dependency graph contains a cycle".to_owned()
                                                )
                                            }
                                            Color::Black => {}
                                            Color::White => {
                                                stack.push(Visit::Enter(offset + builder.0))
                                            }
                                        }
                                    }
                                } else {
                                    for input in &self.action_nodes[index - offset].inputs {
                                        match colors[input.node.0] {
                                            Color::Gray => {
                                                return Err(
                                                    "Dependency graph contains a cycle".to_owned()
                                                )
                                            }
                                            Color::Black => {}
                                            Color::White => stack.push(Visit::Enter(input.node.0)),
                                        }
                                    }
                                }
                            }
                        }
                    }
                    Visit::Leave(index) => colors[index] = Color::Black,
                }
            }
        }
        Ok(())
    }
}
