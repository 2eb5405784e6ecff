// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{BTreeMap, HashMap};
use std::path::Component;

use bytes::Bytes;
use common::{ObjectInfo, ObjectType};
use hashing::Digest;
use store::tree::{serialize_entries, TreeEntry};

use crate::api::{is_non_upward_target, ExecutionApi, NamedArtifact};
use crate::blob::ArtifactBlob;

enum PathTree {
    Leaf(ObjectInfo),
    Dir(BTreeMap<String, PathTree>),
}

/// Assemble the directory tree spanned by the given named artifacts.
///
/// Returns the tree-object blobs in children-before-parents order together
/// with the root digest, so that uploading the blobs in order never makes a
/// tree visible before its referenced subtrees.
pub async fn build_tree_blobs(
    api: &dyn ExecutionApi,
    artifacts: &[NamedArtifact],
) -> Result<(Vec<ArtifactBlob>, Digest), String> {
    let mut root = BTreeMap::new();
    for artifact in artifacts {
        insert_artifact(&mut root, artifact)?;
    }

    // Symlink entries carry their target inline in the compatible tree
    // format; fetch all targets up front so assembly itself stays
    // synchronous.
    let mut symlink_targets: HashMap<String, String> = HashMap::new();
    for artifact in artifacts {
        if artifact.info.object_type.is_symlink() {
            let bytes = api.retrieve_to_memory(&artifact.info).await?;
            let target = String::from_utf8(bytes.to_vec())
                .map_err(|_| format!("Symlink target at {:?} is not UTF-8", artifact.path))?;
            if !is_non_upward_target(&target) {
                return Err(format!(
                    "Symlink at {:?} has upward target {target:?}",
                    artifact.path
                ));
            }
            symlink_targets.insert(artifact.info.digest.hash.to_hex(), target);
        }
    }

    let mut blobs = vec![];
    let root_digest = build_directory(api, &root, &symlink_targets, &mut blobs)?;
    Ok((blobs, root_digest))
}

fn insert_artifact(
    root: &mut BTreeMap<String, PathTree>,
    artifact: &NamedArtifact,
) -> Result<(), String> {
    let mut components = vec![];
    for component in artifact.path.components() {
        match component {
            Component::Normal(part) => components.push(
                part.to_str()
                    .ok_or_else(|| format!("Non-UTF-8 path {:?}", artifact.path))?
                    .to_owned(),
            ),
            Component::CurDir => {}
            _ => {
                return Err(format!(
                    "Path {:?} must be relative and may not escape the tree root",
                    artifact.path
                ))
            }
        }
    }
    let leaf = components
        .pop()
        .ok_or_else(|| format!("Empty artifact path {:?}", artifact.path))?;

    let mut current = root;
    for component in components {
        let node = current
            .entry(component.clone())
            .or_insert_with(|| PathTree::Dir(BTreeMap::new()));
        current = match node {
            PathTree::Dir(children) => children,
            PathTree::Leaf(_) => {
                return Err(format!(
                    "Path conflict below {:?}: {component:?} is both a file and a directory",
                    artifact.path
                ))
            }
        };
    }
    if current
        .insert(leaf.clone(), PathTree::Leaf(artifact.info))
        .is_some()
    {
        return Err(format!("Duplicate artifact path {:?}", artifact.path));
    }
    Ok(())
}

fn build_directory(
    api: &dyn ExecutionApi,
    children: &BTreeMap<String, PathTree>,
    symlink_targets: &HashMap<String, String>,
    blobs: &mut Vec<ArtifactBlob>,
) -> Result<Digest, String> {
    let hash_function = api.hash_function();
    let mut entries = Vec::with_capacity(children.len());
    for (name, node) in children {
        match node {
            PathTree::Dir(grandchildren) => {
                let digest = build_directory(api, grandchildren, symlink_targets, blobs)?;
                entries.push(TreeEntry::new(name.clone(), digest, ObjectType::Tree));
            }
            PathTree::Leaf(info) => {
                if info.object_type.is_symlink() {
                    let target = symlink_targets
                        .get(&info.digest.hash.to_hex())
                        .expect("targets prefetched for all symlinks");
                    entries.push(TreeEntry::symlink(
                        name.clone(),
                        info.digest,
                        target.clone(),
                    ));
                } else {
                    entries.push(TreeEntry::new(name.clone(), info.digest, info.object_type));
                }
            }
        }
    }

    let (bytes, digest) = serialize_entries(hash_function, entries)?;
    blobs.push(ArtifactBlob::tree_from_bytes(
        hash_function,
        Bytes::from(bytes),
    ));
    Ok(digest)
}
