// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::path::PathBuf;

use common::{ObjectInfo, ObjectType};
use hashing::HashType;
use maplit::btreemap;
use store::{Storage, StorageConfig};
use testutil::TestData;

use crate::local::{LocalApi, LocalExecutionConfig};
use crate::{CacheFlag, ExecutionApi, NamedArtifact};

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

fn empty_root(api: &LocalApi) -> hashing::Digest {
    api.hash_function().empty_tree_digest()
}

async fn store_empty_root(api: &LocalApi) -> hashing::Digest {
    api.storage().cas().store_tree_bytes(b"").await.unwrap()
}

fn command(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_owned()).collect()
}

async fn run(
    api: &LocalApi,
    root: hashing::Digest,
    args: &[&str],
    env: BTreeMap<String, String>,
    output_files: &[&str],
    cache_flag: CacheFlag,
) -> Box<dyn crate::ExecutionResponse> {
    let mut action = api.create_action(
        root,
        command(args),
        "".to_owned(),
        output_files.iter().map(|s| (*s).to_owned()).collect(),
        vec![],
        env,
        BTreeMap::new(),
    );
    action.set_cache_flag(cache_flag);
    action
        .execute()
        .await
        .unwrap()
        .expect("action has a response")
}

#[tokio::test]
async fn no_input_no_output() {
    let (_dir, api) = new_api(HashType::Native);
    let root = store_empty_root(&api).await;

    // First run executes...
    let response = run(&api, root, &["echo", "-n", "test"], BTreeMap::new(), &[], CacheFlag::CacheOutput).await;
    assert_eq!(response.exit_code(), 0);
    assert!(!response.is_cached());
    assert_eq!(response.stdout().await.unwrap(), "test");

    // ...the second is served from cache with identical output.
    let response = run(&api, root, &["echo", "-n", "test"], BTreeMap::new(), &[], CacheFlag::CacheOutput).await;
    assert!(response.is_cached());
    assert_eq!(response.stdout().await.unwrap(), "test");
}

#[tokio::test]
async fn create_one_output() {
    let (_dir, api) = new_api(HashType::Native);
    let root = store_empty_root(&api).await;

    let response = run(
        &api,
        root,
        &["sh", "-c", "echo -n test > output_file"],
        BTreeMap::new(),
        &["output_file"],
        CacheFlag::CacheOutput,
    )
    .await;
    assert_eq!(response.exit_code(), 0);

    let artifacts = response.artifacts().await.unwrap();
    let info = artifacts.get("output_file").expect("output was ingested");
    assert_eq!(info.digest, api.hash_function().hash_blob_data(b"test"));
    assert_eq!(info.object_type, ObjectType::File);
}

#[tokio::test]
async fn copy_input_to_output() {
    let (_dir, api) = new_api(HashType::Native);

    let input_digest = api
        .storage()
        .cas()
        .store_blob_bytes(b"test", false)
        .await
        .unwrap();
    let root = api
        .upload_tree(&[NamedArtifact {
            path: PathBuf::from("dir/subdir/input"),
            info: ObjectInfo::new(input_digest, ObjectType::File),
        }])
        .await
        .unwrap();

    let response = run(
        &api,
        root,
        &["cp", "dir/subdir/input", "output_file"],
        BTreeMap::new(),
        &["output_file"],
        CacheFlag::CacheOutput,
    )
    .await;
    assert_eq!(response.exit_code(), 0);

    let artifacts = response.artifacts().await.unwrap();
    assert_eq!(artifacts["output_file"].digest, input_digest);
}

#[tokio::test]
async fn environment_variables_are_passed() {
    let (_dir, api) = new_api(HashType::Native);
    let root = store_empty_root(&api).await;

    let response = run(
        &api,
        root,
        &["sh", "-c", "echo -n ${X}"],
        btreemap! { "X".to_owned() => "test from env var".to_owned() },
        &[],
        CacheFlag::CacheOutput,
    )
    .await;
    assert_eq!(response.exit_code(), 0);
    assert_eq!(response.stdout().await.unwrap(), "test from env var");
}

#[tokio::test]
async fn failures_are_not_cached_but_successes_are() {
    let (dir, api) = new_api(HashType::Native);
    let root = store_empty_root(&api).await;
    let flag = dir.path().join("FLAG");
    let probe = format!("[ -f {} ]", flag.display());
    let args = ["sh", "-c", probe.as_str()];

    // Flag absent: failure, and failures are never cached.
    let response = run(&api, root, &args, BTreeMap::new(), &[], CacheFlag::CacheOutput).await;
    assert_ne!(response.exit_code(), 0);
    assert!(!response.is_cached());

    // Flag present: success, now cached.
    std::fs::write(&flag, b"").unwrap();
    let response = run(&api, root, &args, BTreeMap::new(), &[], CacheFlag::CacheOutput).await;
    assert_eq!(response.exit_code(), 0);
    assert!(!response.is_cached());

    // Flag removed again: the cached success shadows the would-be failure.
    std::fs::remove_file(&flag).unwrap();
    let response = run(&api, root, &args, BTreeMap::new(), &[], CacheFlag::CacheOutput).await;
    assert_eq!(response.exit_code(), 0);
    assert!(response.is_cached());
}

#[tokio::test]
async fn do_not_cache_actions_always_execute() {
    let (_dir, api) = new_api(HashType::Native);
    let root = store_empty_root(&api).await;

    for _ in 0..2 {
        let response = run(
            &api,
            root,
            &["echo", "-n", "test"],
            BTreeMap::new(),
            &[],
            CacheFlag::DoNotCacheOutput,
        )
        .await;
        assert_eq!(response.exit_code(), 0);
        assert!(!response.is_cached());
    }
}

#[tokio::test]
async fn from_cache_only_misses_yield_no_response() {
    let (_dir, api) = new_api(HashType::Native);
    let root = store_empty_root(&api).await;

    let mut action = api.create_action(
        root,
        command(&["echo", "-n", "test"]),
        "".to_owned(),
        vec![],
        vec![],
        BTreeMap::new(),
        BTreeMap::new(),
    );
    action.set_cache_flag(CacheFlag::FromCacheOnly);
    assert!(action.execute().await.unwrap().is_none());
}

#[tokio::test]
async fn pretend_cached_executes_without_storing() {
    let (_dir, api) = new_api(HashType::Native);
    let root = store_empty_root(&api).await;

    let response = run(
        &api,
        root,
        &["echo", "-n", "test"],
        BTreeMap::new(),
        &[],
        CacheFlag::PretendCached,
    )
    .await;
    assert!(response.is_cached());
    assert_eq!(response.stdout().await.unwrap(), "test");

    // Nothing was written to the cache.
    let mut action = api.create_action(
        root,
        command(&["echo", "-n", "test"]),
        "".to_owned(),
        vec![],
        vec![],
        BTreeMap::new(),
        BTreeMap::new(),
    );
    action.set_cache_flag(CacheFlag::FromCacheOnly);
    assert!(action.execute().await.unwrap().is_none());
}

#[tokio::test]
async fn output_directories_are_ingested_as_trees() {
    let (_dir, api) = new_api(HashType::Native);
    let root = store_empty_root(&api).await;

    let mut action = api.create_action(
        root,
        command(&["sh", "-c", "mkdir -p out/sub && echo -n a > out/f && echo -n b > out/sub/g"]),
        "".to_owned(),
        vec![],
        vec!["out".to_owned()],
        BTreeMap::new(),
        BTreeMap::new(),
    );
    action.set_cache_flag(CacheFlag::CacheOutput);
    let response = action.execute().await.unwrap().unwrap();
    assert_eq!(response.exit_code(), 0);

    let artifacts = response.artifacts().await.unwrap();
    let info = artifacts.get("out").unwrap();
    assert_eq!(info.object_type, ObjectType::Tree);

    let entries = api.read_tree_entries(&info.digest).await.unwrap();
    let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["f", "sub"]);
}

#[cfg(unix)]
#[tokio::test]
async fn upward_symlink_outputs_are_rejected_in_compatible_mode() {
    let (_dir, api) = new_api(HashType::Compatible);
    let root = store_empty_root(&api).await;

    let mut action = api.create_action(
        root,
        command(&["sh", "-c", "ln -s ../../escape link"]),
        "".to_owned(),
        vec!["link".to_owned()],
        vec![],
        BTreeMap::new(),
        BTreeMap::new(),
    );
    action.set_cache_flag(CacheFlag::CacheOutput);
    assert!(action.execute().await.is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn relative_symlink_outputs_are_accepted() {
    let (_dir, api) = new_api(HashType::Compatible);
    let root = store_empty_root(&api).await;

    let mut action = api.create_action(
        root,
        command(&["sh", "-c", "echo -n x > file && ln -s file link"]),
        "".to_owned(),
        vec!["file".to_owned(), "link".to_owned()],
        vec![],
        BTreeMap::new(),
        BTreeMap::new(),
    );
    action.set_cache_flag(CacheFlag::CacheOutput);
    let response = action.execute().await.unwrap().unwrap();
    assert_eq!(response.exit_code(), 0);
    assert!(!response.has_upwards_symlinks().await.unwrap());

    let artifacts = response.artifacts().await.unwrap();
    assert_eq!(artifacts["link"].object_type, ObjectType::Symlink);
}

#[tokio::test]
async fn missing_declared_outputs_are_absent_from_the_result() {
    let (_dir, api) = new_api(HashType::Native);
    let root = store_empty_root(&api).await;

    let response = run(
        &api,
        root,
        &["true"],
        BTreeMap::new(),
        &["never_created"],
        CacheFlag::CacheOutput,
    )
    .await;
    assert_eq!(response.exit_code(), 0);
    assert!(response.artifacts().await.unwrap().is_empty());
}

#[tokio::test]
async fn timeouts_are_failures() {
    let (_dir, api) = new_api(HashType::Native);
    let root = store_empty_root(&api).await;

    let mut action = api.create_action(
        root,
        command(&["sleep", "10"]),
        "".to_owned(),
        vec![],
        vec![],
        BTreeMap::new(),
        BTreeMap::new(),
    );
    action.set_timeout(std::time::Duration::from_millis(100));
    let error = match action.execute().await {
        Err(error) => error,
        Ok(_) => panic!("expected the action to time out"),
    };
    assert!(error.contains("timed out"), "{error}");
}

#[tokio::test]
async fn actions_run_in_their_working_directory() {
    let (_dir, api) = new_api(HashType::Native);
    let root = store_empty_root(&api).await;

    let mut action = api.create_action(
        root,
        command(&["sh", "-c", "echo -n made > here"]),
        "work/dir".to_owned(),
        vec!["here".to_owned()],
        vec![],
        BTreeMap::new(),
        BTreeMap::new(),
    );
    action.set_cache_flag(CacheFlag::CacheOutput);
    let response = action.execute().await.unwrap().unwrap();
    assert_eq!(response.exit_code(), 0);
    let artifacts = response.artifacts().await.unwrap();
    assert_eq!(
        artifacts["here"].digest,
        api.hash_function().hash_blob_data(b"made"),
    );
}

#[tokio::test]
async fn upload_tree_makes_the_closure_available() {
    let (_dir, api) = new_api(HashType::Native);
    let blob_a = api
        .storage()
        .cas()
        .store_blob_bytes(&TestData::greeting().bytes(), false)
        .await
        .unwrap();
    let blob_b = api
        .storage()
        .cas()
        .store_blob_bytes(&TestData::catnip().bytes(), true)
        .await
        .unwrap();

    let root = api
        .upload_tree(&[
            NamedArtifact {
                path: PathBuf::from("a.txt"),
                info: ObjectInfo::new(blob_a, ObjectType::File),
            },
            NamedArtifact {
                path: PathBuf::from("bin/tool"),
                info: ObjectInfo::new(blob_b, ObjectType::Executable),
            },
        ])
        .await
        .unwrap();

    // Everything reachable from the root is available.
    assert!(api.is_available(&root).await);
    let entries = api.read_tree_entries(&root).await.unwrap();
    for entry in entries {
        assert!(api.is_available(&entry.digest).await, "{}", entry.name);
    }
}

#[tokio::test]
async fn upload_tree_requires_leaves_present() {
    let (_dir, api) = new_api(HashType::Native);
    let absent = TestData::greeting().digest(api.hash_function());
    let result = api
        .upload_tree(&[NamedArtifact {
            path: PathBuf::from("missing"),
            info: ObjectInfo::new(absent, ObjectType::File),
        }])
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn retrieve_to_paths_round_trip() {
    let (dir, api) = new_api(HashType::Native);
    let blob = api
        .storage()
        .cas()
        .store_blob_bytes(&TestData::greeting().bytes(), false)
        .await
        .unwrap();
    let root = api
        .upload_tree(&[NamedArtifact {
            path: PathBuf::from("sub/file"),
            info: ObjectInfo::new(blob, ObjectType::File),
        }])
        .await
        .unwrap();

    let out = dir.path().join("staged");
    api.retrieve_to_paths(
        &[ObjectInfo::new(root, ObjectType::Tree)],
        &[out.clone()],
    )
    .await
    .unwrap();
    assert_eq!(
        std::fs::read(out.join("sub/file")).unwrap(),
        TestData::greeting().bytes(),
    );
}

#[tokio::test]
async fn retrieve_to_cas_copies_trees_between_backends() {
    let (_dir_a, api_a) = new_api(HashType::Native);
    let (_dir_b, api_b) = new_api(HashType::Native);

    let blob = api_a
        .storage()
        .cas()
        .store_blob_bytes(&TestData::greeting().bytes(), false)
        .await
        .unwrap();
    let root = api_a
        .upload_tree(&[NamedArtifact {
            path: PathBuf::from("file"),
            info: ObjectInfo::new(blob, ObjectType::File),
        }])
        .await
        .unwrap();

    assert!(!api_b.is_available(&root).await);
    api_a
        .retrieve_to_cas(
            &[ObjectInfo::new(root, ObjectType::Tree)],
            &api_b,
        )
        .await
        .unwrap();
    assert!(api_b.is_available(&root).await);
    assert!(api_b.is_available(&blob).await);
}

#[tokio::test]
async fn split_and_splice_through_the_api() {
    let (_dir, api) = new_api(HashType::Native);
    assert!(api.blob_split_support().await);

    let data = TestData::large(3 * 1024 * 1024);
    let digest = api
        .storage()
        .cas()
        .store_blob_bytes(&data.bytes(), false)
        .await
        .unwrap();
    let chunks = api.split_blob(&digest).await.unwrap();
    assert!(chunks.len() > 1);
    let spliced = api.splice_blob(&digest, chunks).await.unwrap();
    assert_eq!(spliced, digest);
}

#[tokio::test]
async fn empty_root_digest_is_well_known() {
    let (_dir, api) = new_api(HashType::Native);
    let stored = store_empty_root(&api).await;
    assert_eq!(stored, empty_root(&api));
}
