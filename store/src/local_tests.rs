// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use common::ObjectType;
use hashing::{Digest, HashType};
use testutil::TestData;

use crate::large::LargeObjectError;
use crate::tree::{serialize_entries, TreeEntry};
use crate::{Storage, StorageConfig};

fn storage_at(dir: &std::path::Path, hash_type: HashType) -> Storage {
    let config = StorageConfig::builder()
        .build_root(dir.to_owned())
        .hash_type(hash_type)
        .build()
        .unwrap();
    Storage::new(config)
}

fn new_storage(hash_type: HashType) -> (tempfile::TempDir, Storage) {
    let dir = tempfile::TempDir::new().unwrap();
    let storage = storage_at(dir.path(), hash_type);
    (dir, storage)
}

#[tokio::test]
async fn store_and_read_blob() {
    let (_dir, storage) = new_storage(HashType::Native);
    let testdata = TestData::greeting();

    let digest = storage
        .cas()
        .store_blob_bytes(&testdata.bytes(), false)
        .await
        .unwrap();
    assert_eq!(digest, testdata.digest(storage.cas().hash_function()));

    let read = storage.cas().read_blob(&digest, false).await.unwrap();
    assert_eq!(read.unwrap(), testdata.bytes());
}

#[tokio::test]
async fn store_blob_is_idempotent() {
    let (_dir, storage) = new_storage(HashType::Native);
    let testdata = TestData::greeting();

    let first = storage
        .cas()
        .store_blob_bytes(&testdata.bytes(), false)
        .await
        .unwrap();
    let second = storage
        .cas()
        .store_blob_bytes(&testdata.bytes(), false)
        .await
        .unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn missing_blob_is_none() {
    let (_dir, storage) = new_storage(HashType::Compatible);
    let absent = TestData::catnip().digest(storage.cas().hash_function());
    assert!(storage.cas().blob_path(&absent, false).await.unwrap().is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn executable_blobs_carry_exec_bits() {
    use std::os::unix::fs::PermissionsExt;

    let (_dir, storage) = new_storage(HashType::Native);
    let script = TestData::script();
    let digest = storage
        .cas()
        .store_blob_bytes(&script.bytes(), true)
        .await
        .unwrap();
    let path = storage.cas().blob_path(&digest, true).await.unwrap().unwrap();
    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o111, 0o111);
}

#[tokio::test]
async fn blob_lookup_syncs_between_exec_areas() {
    let (_dir, storage) = new_storage(HashType::Native);
    let testdata = TestData::script();

    // Stored as non-executable, then requested as executable.
    let digest = storage
        .cas()
        .store_blob_bytes(&testdata.bytes(), false)
        .await
        .unwrap();
    let exec_path = storage.cas().blob_path(&digest, true).await.unwrap().unwrap();
    assert_eq!(std::fs::read(exec_path).unwrap(), testdata.bytes());
}

#[tokio::test]
async fn store_blob_from_file() {
    let (dir, storage) = new_storage(HashType::Compatible);
    let src = dir.path().join("input");
    std::fs::write(&src, b"file content").unwrap();

    let digest = storage
        .cas()
        .store_blob_file(&src, false, false)
        .await
        .unwrap();
    assert_eq!(
        digest,
        storage.cas().hash_function().hash_blob_data(b"file content"),
    );
    assert!(src.is_file());
    assert!(storage.cas().has_blob(&digest, false).await.unwrap());
}

#[tokio::test]
async fn tree_round_trip_native() {
    let (_dir, storage) = new_storage(HashType::Native);
    let hash_function = storage.cas().hash_function();

    let blob = storage
        .cas()
        .store_blob_bytes(&TestData::greeting().bytes(), false)
        .await
        .unwrap();
    let (tree_bytes, expected) = serialize_entries(
        hash_function,
        vec![TreeEntry::new("file".to_owned(), blob, ObjectType::File)],
    )
    .unwrap();

    let digest = storage.cas().store_tree_bytes(&tree_bytes).await.unwrap();
    assert_eq!(digest, expected);

    let entries = storage.cas().read_tree_entries(&digest).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "file");
    assert_eq!(entries[0].digest.hash, blob.hash);
}

#[tokio::test]
async fn size_unknown_tree_digests_are_readable_in_native_mode() {
    let (_dir, storage) = new_storage(HashType::Native);
    let (tree_bytes, digest) =
        serialize_entries(storage.cas().hash_function(), vec![]).unwrap();
    storage.cas().store_tree_bytes(&tree_bytes).await.unwrap();

    // Native-mode readers accept digests whose size is unknown.
    let unsized_digest = Digest::new(digest.hash, 0, true);
    assert!(storage.cas().tree_path(&unsized_digest).await.unwrap().is_some());
}

#[tokio::test]
async fn split_and_splice_round_trip() {
    let (_dir, storage) = new_storage(HashType::Native);
    let testdata = TestData::large(5 * 1024 * 1024);

    let digest = storage
        .cas()
        .store_blob_bytes(&testdata.bytes(), false)
        .await
        .unwrap();
    let parts = storage.cas().split_blob(&digest).await.unwrap();
    assert!(parts.len() > 1, "5 MiB must split into multiple chunks");

    // Every chunk is an ordinary CAS blob.
    for part in &parts {
        assert!(storage.cas().has_blob(part, false).await.unwrap());
    }

    // Splicing the recorded parts reproduces the object.
    let spliced = storage.cas().splice_blob(&digest, &parts).await.unwrap();
    assert_eq!(spliced, digest);
}

#[tokio::test]
async fn split_is_stable_across_calls() {
    let (_dir, storage) = new_storage(HashType::Compatible);
    let testdata = TestData::large(3 * 1024 * 1024);
    let digest = storage
        .cas()
        .store_blob_bytes(&testdata.bytes(), false)
        .await
        .unwrap();

    let first = storage.cas().split_blob(&digest).await.unwrap();
    let second = storage.cas().split_blob(&digest).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn split_missing_blob_fails() {
    let (_dir, storage) = new_storage(HashType::Native);
    let absent = TestData::catnip().digest(storage.cas().hash_function());
    match storage.cas().split_blob(&absent).await {
        Err(LargeObjectError::FileNotFound(_)) => {}
        other => panic!("expected FileNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn splice_mismatch_is_rejected_and_recipe_dropped() {
    let (_dir, storage) = new_storage(HashType::Native);
    let testdata = TestData::large(3 * 1024 * 1024);
    let digest = storage
        .cas()
        .store_blob_bytes(&testdata.bytes(), false)
        .await
        .unwrap();
    let mut parts = storage.cas().split_blob(&digest).await.unwrap();

    // Drop a chunk: the splice result cannot match the requested digest.
    parts.pop();
    match storage.cas().splice_blob(&digest, &parts).await {
        Err(LargeObjectError::InvalidResult(_)) => {}
        other => panic!("expected InvalidResult, got {other:?}"),
    }
}

#[tokio::test]
async fn splice_with_missing_chunk_is_invalid_tree() {
    let (_dir, storage) = new_storage(HashType::Native);
    let present = storage
        .cas()
        .store_blob_bytes(&TestData::greeting().bytes(), false)
        .await
        .unwrap();
    let absent = TestData::catnip().digest(storage.cas().hash_function());
    match storage.cas().splice_blob(&present, &[absent]).await {
        Err(LargeObjectError::InvalidTree(_)) => {}
        other => panic!("expected InvalidTree, got {other:?}"),
    }
}

#[tokio::test]
async fn large_blob_is_reconstructed_from_recipe_after_file_loss() {
    let (_dir, storage) = new_storage(HashType::Native);
    let testdata = TestData::large(3 * 1024 * 1024);
    let digest = storage
        .cas()
        .store_blob_bytes(&testdata.bytes(), false)
        .await
        .unwrap();
    storage.cas().split_blob(&digest).await.unwrap();

    // Remove the stored file; the recipe plus chunks must still serve reads.
    let path = storage.cas().blob_path(&digest, false).await.unwrap().unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o644);
    }
    std::fs::set_permissions(&path, perms).unwrap();
    std::fs::remove_file(&path).unwrap();

    let read = storage.cas().read_blob(&digest, false).await.unwrap();
    assert_eq!(read.unwrap(), testdata.bytes());
}
