// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::PathBuf;
use std::sync::OnceLock;

use hashing::{Digest, HashFunction};
use serde::{Deserialize, Serialize};

use crate::{ObjectInfo, ObjectType};

/// Identifier of an artifact: the plain hash of its canonical description.
/// Identical descriptions always map to the same identifier, which is what
/// makes graph construction idempotent.
pub type ArtifactId = String;

/// A declarative reference to an artifact, before anything is known about its
/// content.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArtifactDescription {
    /// Content already identified by digest and type.
    Known {
        digest: Digest,
        object_type: ObjectType,
    },
    /// A file in a workspace root of some repository.
    Local {
        path: PathBuf,
        repository: String,
    },
    /// An output of an action, at a path relative to the action's root.
    Action {
        action_id: crate::ActionId,
        path: PathBuf,
    },
}

impl ArtifactDescription {
    /// Compute the identifier of this artifact for the given hash family.
    pub fn id(&self, hash_function: HashFunction) -> ArtifactId {
        let json = serde_json::to_string(self).expect("artifact descriptions serialize");
        hash_function.plain_hash_data(json.as_bytes()).to_hex()
    }
}

/// An artifact in the dependency graph: its description, and, once the build
/// has produced (or verified) it, its object info. The info is stamped
/// exactly once.
#[derive(Debug)]
pub struct Artifact {
    id: ArtifactId,
    description: ArtifactDescription,
    info: OnceLock<ObjectInfo>,
}

impl Artifact {
    pub fn new(id: ArtifactId, description: ArtifactDescription) -> Artifact {
        let info = OnceLock::new();
        if let ArtifactDescription::Known {
            digest,
            object_type,
        } = &description
        {
            let _ = info.set(ObjectInfo::new(*digest, *object_type));
        }
        Artifact {
            id,
            description,
            info,
        }
    }

    pub fn id(&self) -> &ArtifactId {
        &self.id
    }

    pub fn description(&self) -> &ArtifactDescription {
        &self.description
    }

    pub fn info(&self) -> Option<&ObjectInfo> {
        self.info.get()
    }

    /// Record what this artifact turned out to be. Only the first call takes
    /// effect; the traversal guarantees each artifact is processed once.
    pub fn set_object_info(&self, digest: Digest, object_type: ObjectType, failed: bool) {
        let _ = self.info.set(ObjectInfo {
            digest,
            object_type,
            failed,
        });
    }

    /// The workspace path for `Local` descriptions.
    pub fn file_path(&self) -> Option<&PathBuf> {
        match &self.description {
            ArtifactDescription::Local { path, .. } => Some(path),
            _ => None,
        }
    }

    /// The repository name for `Local` descriptions.
    pub fn repository(&self) -> Option<&str> {
        match &self.description {
            ArtifactDescription::Local { repository, .. } => Some(repository),
            _ => None,
        }
    }
}
