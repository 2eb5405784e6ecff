// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::PathBuf;

use common::{ObjectInfo, ObjectType};
use hashing::HashType;
use store::{Storage, StorageConfig};

use crate::local::{LocalApi, LocalExecutionConfig};
use crate::tree_ops::compute_tree_overlay;
use crate::{ExecutionApi, NamedArtifact};

fn new_api(hash_type: HashType) -> (tempfile::TempDir, LocalApi) {
    let dir = tempfile::TempDir::new().unwrap();
    let config = StorageConfig::builder()
        .build_root(dir.path().to_owned())
        .hash_type(hash_type)
        .build()
        .unwrap();
    let api = LocalApi::new(Storage::new(config), LocalExecutionConfig::default());
    (dir, api)
}

async fn tree_of(api: &LocalApi, files: &[(&str, &str)]) -> ObjectInfo {
    let mut artifacts = vec![];
    for (path, content) in files {
        let digest = api
            .storage()
            .cas()
            .store_blob_bytes(content.as_bytes(), false)
            .await
            .unwrap();
        artifacts.push(NamedArtifact {
            path: PathBuf::from(path),
            info: ObjectInfo::new(digest, ObjectType::File),
        });
    }
    let digest = api.upload_tree(&artifacts).await.unwrap();
    ObjectInfo::new(digest, ObjectType::Tree)
}

async fn entry_names(api: &LocalApi, info: &ObjectInfo) -> Vec<String> {
    api.read_tree_entries(&info.digest)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect()
}

#[tokio::test]
async fn disjoint_trees_are_unioned() {
    let (_dir, api) = new_api(HashType::Native);
    let base = tree_of(&api, &[("a", "1")]).await;
    let overlay = tree_of(&api, &[("b", "2")]).await;

    let merged = compute_tree_overlay(&api, &base, &overlay, false)
        .await
        .unwrap();
    assert_eq!(entry_names(&api, &merged).await, vec!["a", "b"]);
}

#[tokio::test]
async fn overlay_wins_on_file_conflicts() {
    let (_dir, api) = new_api(HashType::Native);
    let base = tree_of(&api, &[("conflict", "base")]).await;
    let overlay = tree_of(&api, &[("conflict", "overlay")]).await;

    let merged = compute_tree_overlay(&api, &base, &overlay, false)
        .await
        .unwrap();
    let entries = api.read_tree_entries(&merged.digest).await.unwrap();
    let expected = api.hash_function().hash_blob_data(b"overlay");
    assert_eq!(entries[0].digest.hash, expected.hash);
}

#[tokio::test]
async fn nested_trees_are_merged_recursively() {
    let (_dir, api) = new_api(HashType::Native);
    let base = tree_of(&api, &[("dir/a", "1"), ("top", "t")]).await;
    let overlay = tree_of(&api, &[("dir/b", "2")]).await;

    let merged = compute_tree_overlay(&api, &base, &overlay, false)
        .await
        .unwrap();
    assert_eq!(entry_names(&api, &merged).await, vec!["dir", "top"]);

    let entries = api.read_tree_entries(&merged.digest).await.unwrap();
    let dir = entries.iter().find(|entry| entry.name == "dir").unwrap();
    let nested = api.read_tree_entries(&dir.digest).await.unwrap();
    let nested_names: Vec<_> = nested.iter().map(|entry| entry.name.as_str()).collect();
    assert_eq!(nested_names, vec!["a", "b"]);
}

#[tokio::test]
async fn disjoint_overlay_rejects_conflicts() {
    let (_dir, api) = new_api(HashType::Native);
    let base = tree_of(&api, &[("conflict", "base")]).await;
    let overlay = tree_of(&api, &[("conflict", "overlay")]).await;

    let error = compute_tree_overlay(&api, &base, &overlay, true)
        .await
        .unwrap_err();
    assert!(error.contains("Conflict"), "{error}");
}

#[tokio::test]
async fn identical_entries_are_not_conflicts() {
    let (_dir, api) = new_api(HashType::Native);
    let base = tree_of(&api, &[("same", "content"), ("only_base", "x")]).await;
    let overlay = tree_of(&api, &[("same", "content")]).await;

    let merged = compute_tree_overlay(&api, &base, &overlay, true)
        .await
        .unwrap();
    assert_eq!(entry_names(&api, &merged).await, vec!["only_base", "same"]);
}

#[tokio::test]
async fn overlay_identity() {
    let (_dir, api) = new_api(HashType::Compatible);
    let base = tree_of(&api, &[("a", "1")]).await;
    let merged = compute_tree_overlay(&api, &base, &base, true).await.unwrap();
    assert_eq!(merged.digest, base.digest);
}
