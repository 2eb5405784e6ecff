// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ArtifactDescription;

/// Identifier of an action, unique within one build invocation.
pub type ActionId = String;

/// The kind of an action node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    /// Run a command in a staged input root.
    Command,
    /// Assemble the inputs into a single tree; no command is run.
    Tree,
    /// Fold the input trees left-to-right with the tree-overlay primitive.
    TreeOverlay { disjoint: bool },
}

impl ActionKind {
    pub fn is_command(&self) -> bool {
        matches!(self, ActionKind::Command)
    }
}

/// The content of an action node: everything needed to run (or evaluate) it
/// except the input artifacts, which the graph wires in as children.
#[derive(Clone, Debug, PartialEq)]
pub struct Action {
    pub id: ActionId,
    pub kind: ActionKind,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: String,
    pub output_files: Vec<String>,
    pub output_dirs: Vec<String>,
    pub execution_properties: BTreeMap<String, String>,
    /// Multiplier applied to the build-wide action timeout.
    pub timeout_scale: f64,
    /// If set, a non-zero exit does not abort the build; outputs are ingested
    /// and marked failed, and this message is reported.
    pub may_fail: Option<String>,
    /// If true, the result must never be written to the action cache.
    pub no_cache: bool,
}

impl Action {
    pub fn new_command(
        id: ActionId,
        command: Vec<String>,
        output_files: Vec<String>,
        output_dirs: Vec<String>,
    ) -> Action {
        Action {
            id,
            kind: ActionKind::Command,
            command,
            env: BTreeMap::new(),
            cwd: String::new(),
            output_files,
            output_dirs,
            execution_properties: BTreeMap::new(),
            timeout_scale: 1.0,
            may_fail: None,
            no_cache: false,
        }
    }

    /// A tree action has a single tree output and no command.
    pub fn new_tree(id: ActionId, output_dir: String) -> Action {
        Action {
            id,
            kind: ActionKind::Tree,
            command: vec![],
            env: BTreeMap::new(),
            cwd: String::new(),
            output_files: vec![],
            output_dirs: vec![output_dir],
            execution_properties: BTreeMap::new(),
            timeout_scale: 1.0,
            may_fail: None,
            no_cache: false,
        }
    }

    pub fn new_tree_overlay(id: ActionId, output_dir: String, disjoint: bool) -> Action {
        Action {
            kind: ActionKind::TreeOverlay { disjoint },
            ..Action::new_tree(id, output_dir)
        }
    }

    pub fn is_tree_action(&self) -> bool {
        matches!(self.kind, ActionKind::Tree)
    }

    pub fn is_tree_overlay_action(&self) -> bool {
        matches!(self.kind, ActionKind::TreeOverlay { .. })
    }

    pub fn is_overlay_disjoint(&self) -> bool {
        matches!(self.kind, ActionKind::TreeOverlay { disjoint: true })
    }
}

/// An action plus its named inputs, as handed to graph construction.
#[derive(Clone, Debug)]
pub struct ActionDescription {
    pub action: Action,
    /// Input artifacts by the path they are staged at, relative to the
    /// action's root.
    pub inputs: Vec<(String, ArtifactDescription)>,
}

impl ActionDescription {
    pub fn new(action: Action, inputs: Vec<(String, ArtifactDescription)>) -> ActionDescription {
        ActionDescription { action, inputs }
    }
}
