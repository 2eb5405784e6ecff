// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use common::{Action, ActionDescription, ArtifactDescription, ObjectType};
use hashing::{HashFunction, HashType};
use parking_lot::Mutex;

use crate::{ActionNode, ArtifactNode, DependencyGraph, NodeProcessor, Traverser};

fn hash_function() -> HashFunction {
    HashFunction::new(HashType::Native)
}

fn local(path: &str) -> ArtifactDescription {
    ArtifactDescription::Local {
        path: path.into(),
        repository: "".to_owned(),
    }
}

fn action_output(action_id: &str, path: &str) -> ArtifactDescription {
    ArtifactDescription::Action {
        action_id: action_id.to_owned(),
        path: path.into(),
    }
}

fn command_action(
    id: &str,
    outputs: &[&str],
    inputs: Vec<(String, ArtifactDescription)>,
) -> ActionDescription {
    ActionDescription::new(
        Action::new_command(
            id.to_owned(),
            vec!["true".to_owned()],
            outputs.iter().map(|s| (*s).to_owned()).collect(),
            vec![],
        ),
        inputs,
    )
}

/// Records processing order and stamps dummy infos, optionally failing a
/// designated action.
struct RecordingProcessor {
    log: Mutex<Vec<String>>,
    fail_action: Option<String>,
}

impl RecordingProcessor {
    fn new() -> RecordingProcessor {
        RecordingProcessor {
            log: Mutex::new(vec![]),
            fail_action: None,
        }
    }

    fn failing(action_id: &str) -> RecordingProcessor {
        RecordingProcessor {
            log: Mutex::new(vec![]),
            fail_action: Some(action_id.to_owned()),
        }
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl NodeProcessor for RecordingProcessor {
    async fn process_artifact(&self, _graph: &DependencyGraph, node: &ArtifactNode) -> bool {
        self.log.lock().push(format!("artifact:{}", node.artifact().id()));
        node.artifact().set_object_info(
            hash_function().hash_blob_data(b"source"),
            ObjectType::File,
            false,
        );
        true
    }

    async fn process_action(&self, graph: &DependencyGraph, node: &ActionNode) -> bool {
        // Every input must be available before the action runs.
        for input in node.inputs() {
            assert!(
                graph
                    .artifact_node(input.node)
                    .traversal_state()
                    .is_available(),
                "action {} ran before input {} was available",
                node.action().id,
                input.path,
            );
        }
        self.log.lock().push(format!("action:{}", node.action().id));
        if self.fail_action.as_deref() == Some(node.action().id.as_str()) {
            return false;
        }
        for output in node.outputs() {
            graph.artifact_node(output.node).artifact().set_object_info(
                hash_function().hash_blob_data(node.action().id.as_bytes()),
                ObjectType::File,
                false,
            );
        }
        true
    }
}

#[tokio::test]
async fn builds_a_chain_leaves_first() {
    let mut graph = DependencyGraph::new(hash_function());
    graph
        .add_action(command_action(
            "compile",
            &["object"],
            vec![("src".to_owned(), local("main.c"))],
        ))
        .unwrap();
    graph
        .add_action(command_action(
            "link",
            &["binary"],
            vec![("object".to_owned(), action_output("compile", "object"))],
        ))
        .unwrap();
    let target = graph.add_artifact(action_output("link", "binary"));

    let processor = RecordingProcessor::new();
    let failed = AtomicBool::new(false);
    let traverser = Traverser::new(&graph, &processor, 4, &failed);
    assert!(traverser.traverse(&[target]).await);
    assert!(!failed.load(Ordering::SeqCst));

    let log = processor.log();
    let position = |needle: &str| log.iter().position(|entry| entry.contains(needle)).unwrap();
    assert!(position("artifact:") < position("action:compile"));
    assert!(position("action:compile") < position("action:link"));
}

#[tokio::test]
async fn shared_inputs_are_processed_once() {
    let mut graph = DependencyGraph::new(hash_function());
    let shared = local("shared.h");
    graph
        .add_action(command_action(
            "a0",
            &["out0"],
            vec![("dep".to_owned(), shared.clone())],
        ))
        .unwrap();
    graph
        .add_action(command_action(
            "a1",
            &["out1"],
            vec![("dep".to_owned(), shared.clone())],
        ))
        .unwrap();
    let targets = vec![
        graph.add_artifact(action_output("a0", "out0")),
        graph.add_artifact(action_output("a1", "out1")),
    ];

    let processor = RecordingProcessor::new();
    let failed = AtomicBool::new(false);
    assert!(Traverser::new(&graph, &processor, 8, &failed)
        .traverse(&targets)
        .await);

    let log = processor.log();
    let artifact_entries: Vec<_> = log.iter().filter(|e| e.starts_with("artifact:")).collect();
    assert_eq!(artifact_entries.len(), 1, "{log:?}");
    let unique: HashSet<_> = log.iter().collect();
    assert_eq!(unique.len(), log.len(), "nothing is processed twice: {log:?}");
}

#[tokio::test]
async fn wide_fan_in_executes_after_all_inputs() {
    let mut graph = DependencyGraph::new(hash_function());
    let mut inputs = vec![];
    for index in 0..32 {
        let id = format!("produce{index}");
        graph
            .add_action(command_action(&id, &["out"], vec![]))
            .unwrap();
        inputs.push((format!("in{index}"), action_output(&id, "out")));
    }
    graph
        .add_action(command_action("combine", &["all"], inputs))
        .unwrap();
    let target = graph.add_artifact(action_output("combine", "all"));

    let processor = RecordingProcessor::new();
    let failed = AtomicBool::new(false);
    assert!(Traverser::new(&graph, &processor, 4, &failed)
        .traverse(&[target])
        .await);

    let log = processor.log();
    assert_eq!(log.last().unwrap(), "action:combine");
    assert_eq!(log.len(), 33);
}

#[tokio::test]
async fn failure_aborts_traversal() {
    let mut graph = DependencyGraph::new(hash_function());
    graph
        .add_action(command_action("broken", &["object"], vec![]))
        .unwrap();
    graph
        .add_action(command_action(
            "link",
            &["binary"],
            vec![("object".to_owned(), action_output("broken", "object"))],
        ))
        .unwrap();
    let target = graph.add_artifact(action_output("link", "binary"));

    let processor = RecordingProcessor::failing("broken");
    let failed = AtomicBool::new(false);
    assert!(!Traverser::new(&graph, &processor, 4, &failed)
        .traverse(&[target])
        .await);
    assert!(failed.load(Ordering::SeqCst));

    // The dependent action never ran.
    assert!(!processor.log().iter().any(|e| e == "action:link"));
}

#[tokio::test]
async fn only_required_subgraphs_are_built() {
    let mut graph = DependencyGraph::new(hash_function());
    graph
        .add_action(command_action("wanted", &["out"], vec![]))
        .unwrap();
    graph
        .add_action(command_action("unwanted", &["out"], vec![]))
        .unwrap();
    let target = graph.add_artifact(action_output("wanted", "out"));
    graph.add_artifact(action_output("unwanted", "out"));

    let processor = RecordingProcessor::new();
    let failed = AtomicBool::new(false);
    assert!(Traverser::new(&graph, &processor, 2, &failed)
        .traverse(&[target])
        .await);
    assert_eq!(processor.log(), vec!["action:wanted".to_owned()]);
}

#[tokio::test]
async fn unknown_target_fails() {
    let graph = DependencyGraph::new(hash_function());
    let processor = RecordingProcessor::new();
    let failed = AtomicBool::new(false);
    assert!(!Traverser::new(&graph, &processor, 2, &failed)
        .traverse(&["does-not-exist".to_owned()])
        .await);
}
