// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The tree-overlay primitive: merging two trees into one.

use bytes::Bytes;
use common::{ObjectInfo, ObjectType};
use futures::future::BoxFuture;
use futures::FutureExt;
use store::tree::{serialize_entries, TreeEntry};

use crate::api::ExecutionApi;
use crate::blob::ArtifactBlob;

/// Overlay `overlay` onto `base`: entries of the overlay win on conflicts,
/// except that two trees at the same name are merged recursively. With
/// `disjoint` set, any conflict that is not resolved by recursion (or by the
/// entries being identical) is an error.
///
/// Newly created tree objects are uploaded to the backend as they are built,
/// so the returned tree is immediately readable there.
pub async fn compute_tree_overlay(
    api: &dyn ExecutionApi,
    base: &ObjectInfo,
    overlay: &ObjectInfo,
    disjoint: bool,
) -> Result<ObjectInfo, String> {
    if !base.object_type.is_tree() || !overlay.object_type.is_tree() {
        return Err("Tree overlay requires tree inputs".to_owned());
    }
    let digest = overlay_trees(api, base.digest, overlay.digest, disjoint).await?;
    Ok(ObjectInfo::new(digest, ObjectType::Tree))
}

fn overlay_trees<'a>(
    api: &'a dyn ExecutionApi,
    base: hashing::Digest,
    overlay: hashing::Digest,
    disjoint: bool,
) -> BoxFuture<'a, Result<hashing::Digest, String>> {
    async move {
        if base.hash == overlay.hash {
            return Ok(base);
        }

        let base_entries = api.read_tree_entries(&base).await?;
        let overlay_entries = api.read_tree_entries(&overlay).await?;

        let mut merged: Vec<TreeEntry> = Vec::with_capacity(base_entries.len());
        let mut overlay_by_name: std::collections::BTreeMap<String, TreeEntry> = overlay_entries
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect();

        for base_entry in base_entries {
            match overlay_by_name.remove(&base_entry.name) {
                None => merged.push(base_entry),
                Some(overlay_entry) => {
                    if base_entry.digest.hash == overlay_entry.digest.hash
                        && base_entry.object_type == overlay_entry.object_type
                    {
                        merged.push(overlay_entry);
                    } else if base_entry.object_type.is_tree()
                        && overlay_entry.object_type.is_tree()
                    {
                        let child = overlay_trees(
                            api,
                            base_entry.digest,
                            overlay_entry.digest,
                            disjoint,
                        )
                        .await?;
                        merged.push(TreeEntry::new(
                            overlay_entry.name,
                            child,
                            ObjectType::Tree,
                        ));
                    } else if disjoint {
                        return Err(format!(
                            "Conflict at {:?} in disjoint tree overlay",
                            base_entry.name
                        ));
                    } else {
                        merged.push(overlay_entry);
                    }
                }
            }
        }
        merged.extend(overlay_by_name.into_values());

        let (bytes, digest) = serialize_entries(api.hash_function(), merged)?;
        api.upload(
            vec![ArtifactBlob::tree_from_bytes(
                api.hash_function(),
                Bytes::from(bytes),
            )],
            true,
        )
        .await?;
        Ok(digest)
    }
    .boxed()
}
