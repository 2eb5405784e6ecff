// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use common::ObjectType;
use hashing::HashType;
use testutil::TestData;

use crate::tree::{serialize_entries, TreeEntry};
use crate::{GarbageCollector, Storage, StorageConfig};

fn storage_at(dir: &std::path::Path) -> Storage {
    let config = StorageConfig::builder()
        .build_root(dir.to_owned())
        .hash_type(HashType::Native)
        .build()
        .unwrap();
    Storage::new(config)
}

#[tokio::test]
async fn unread_content_is_dropped_after_two_rotations() {
    let dir = tempfile::TempDir::new().unwrap();
    let storage = storage_at(dir.path());

    let digest = storage
        .cas()
        .store_blob_bytes(&TestData::greeting().bytes(), false)
        .await
        .unwrap();

    GarbageCollector::collect(&storage).await.unwrap();
    GarbageCollector::collect(&storage).await.unwrap();

    assert!(storage.cas().blob_path(&digest, false).await.unwrap().is_none());
}

#[tokio::test]
async fn read_content_survives_rotation() {
    let dir = tempfile::TempDir::new().unwrap();
    let storage = storage_at(dir.path());

    let digest = storage
        .cas()
        .store_blob_bytes(&TestData::greeting().bytes(), false)
        .await
        .unwrap();

    GarbageCollector::collect(&storage).await.unwrap();

    // The read uplinks the entry into the fresh generation 0...
    assert!(storage.cas().blob_path(&digest, false).await.unwrap().is_some());

    // ...so it survives the next rotation.
    GarbageCollector::collect(&storage).await.unwrap();
    let read = storage.cas().read_blob(&digest, false).await.unwrap();
    assert_eq!(read.unwrap(), TestData::greeting().bytes());
}

#[tokio::test]
async fn tree_uplink_promotes_the_closure() {
    let dir = tempfile::TempDir::new().unwrap();
    let storage = storage_at(dir.path());
    let hash_function = storage.cas().hash_function();

    let blob = storage
        .cas()
        .store_blob_bytes(&TestData::greeting().bytes(), false)
        .await
        .unwrap();
    let (subtree_bytes, subtree) = serialize_entries(
        hash_function,
        vec![TreeEntry::new("leaf".to_owned(), blob, ObjectType::File)],
    )
    .unwrap();
    storage.cas().store_tree_bytes(&subtree_bytes).await.unwrap();
    let (root_bytes, root) = serialize_entries(
        hash_function,
        vec![TreeEntry::new("sub".to_owned(), subtree, ObjectType::Tree)],
    )
    .unwrap();
    storage.cas().store_tree_bytes(&root_bytes).await.unwrap();

    GarbageCollector::collect(&storage).await.unwrap();

    // Reading the root tree promotes the subtree and the leaf blob with it:
    // after another rotation everything reachable is still present.
    assert!(storage.cas().tree_path(&root).await.unwrap().is_some());
    GarbageCollector::collect(&storage).await.unwrap();

    assert!(storage.cas().tree_path(&subtree).await.unwrap().is_some());
    assert!(storage.cas().blob_path(&blob, false).await.unwrap().is_some());
}

#[tokio::test]
async fn cache_entries_follow_the_generational_discipline() {
    let dir = tempfile::TempDir::new().unwrap();
    let storage = storage_at(dir.path());
    let fingerprint = TestData::catnip().digest(storage.cas().hash_function());

    let result = Default::default();
    storage.action_cache().put(&fingerprint, &result).await.unwrap();

    GarbageCollector::collect(&storage).await.unwrap();
    // Old-generation hit, uplinked...
    assert!(storage.action_cache().get(&fingerprint).await.unwrap().is_some());
    GarbageCollector::collect(&storage).await.unwrap();
    // ...and therefore still present.
    assert!(storage.action_cache().get(&fingerprint).await.unwrap().is_some());

    GarbageCollector::collect(&storage).await.unwrap();
    GarbageCollector::collect(&storage).await.unwrap();
    // Two rotations with no interim read: gone.
    assert!(storage.action_cache().get(&fingerprint).await.unwrap().is_none());
}

#[tokio::test]
async fn ephemeral_area_is_cleared() {
    let dir = tempfile::TempDir::new().unwrap();
    let storage = storage_at(dir.path());

    let exec_root = storage.config().execution_root();
    std::fs::create_dir_all(exec_root.join("stale-sandbox")).unwrap();

    GarbageCollector::collect(&storage).await.unwrap();
    assert!(!exec_root.join("stale-sandbox").exists());
}
