// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use common::ObjectType;
use futures::future::BoxFuture;
use futures::FutureExt;
use hashing::{Digest, HashType};
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use store::tree::{serialize_entries, TreeEntry};
use store::Storage;

use crate::api::{is_non_upward_target, CacheFlag, ExecutionAction, ExecutionApi, ExecutionResponse};
use crate::bazel_msg::{create_action_messages, ActionMessages};
use crate::local::{LocalApi, LocalResponse};
use crate::DEFAULT_EXECUTION_TIMEOUT;

/// An action executed on this machine: inputs staged by hardlink from the
/// CAS into a fresh execution directory, the process run under the
/// configured launcher, and outputs ingested back into the CAS.
pub struct LocalAction {
    api: LocalApi,
    root_digest: Digest,
    command: Vec<String>,
    cwd: String,
    output_files: Vec<String>,
    output_dirs: Vec<String>,
    env: BTreeMap<String, String>,
    properties: BTreeMap<String, String>,
    cache_flag: CacheFlag,
    timeout: Duration,
}

impl LocalAction {
    pub(crate) fn new(
        api: LocalApi,
        root_digest: Digest,
        command: Vec<String>,
        cwd: String,
        output_files: Vec<String>,
        output_dirs: Vec<String>,
        env: BTreeMap<String, String>,
        properties: BTreeMap<String, String>,
    ) -> LocalAction {
        LocalAction {
            api,
            root_digest,
            command,
            cwd,
            output_files,
            output_dirs,
            env,
            properties,
            cache_flag: CacheFlag::CacheOutput,
            timeout: DEFAULT_EXECUTION_TIMEOUT,
        }
    }

    fn storage(&self) -> &Storage {
        self.api.storage()
    }

    fn messages(&self) -> ActionMessages {
        create_action_messages(
            self.api.hash_function(),
            &self.root_digest,
            &self.command,
            &self.cwd,
            &self.output_files,
            &self.output_dirs,
            &self.env,
            &self.properties,
            self.timeout,
            self.cache_flag == CacheFlag::DoNotCacheOutput,
        )
    }

    async fn run(&self) -> Result<remexec::ActionResult, String> {
        let exec_root = self.storage().config().execution_root();
        tokio::fs::create_dir_all(&exec_root)
            .await
            .map_err(|e| format!("Failed to create {}: {e}", exec_root.display()))?;
        // Removed on every exit path by the Drop of the TempDir.
        let sandbox = tempfile::Builder::new()
            .prefix("exec-")
            .tempdir_in(&exec_root)
            .map_err(|e| format!("Failed to create execution directory: {e}"))?;

        stage_tree(self.storage(), &self.root_digest, sandbox.path()).await?;

        let workdir = sandbox.path().join(&self.cwd);
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| format!("Failed to create working directory: {e}"))?;

        let launcher = &self.api.exec_config().launcher;
        let (program, prefix_args) = match launcher.split_first() {
            Some((program, rest)) => (program.clone(), rest.to_vec()),
            None => (
                self.command
                    .first()
                    .ok_or("Cannot execute an empty command")?
                    .clone(),
                vec![],
            ),
        };

        let mut command = tokio::process::Command::new(&program);
        if launcher.is_empty() {
            command.args(&self.command[1..]);
        } else {
            command.args(&prefix_args).args(&self.command);
        }
        command
            .env_clear()
            .envs(&self.env)
            .current_dir(&workdir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        log::trace!("Spawning {:?} in {}", self.command, workdir.display());
        let child = command
            .spawn()
            .map_err(|e| format!("Failed to spawn {program:?}: {e}"))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| format!("Failed to wait for {program:?}: {e}"))?,
            Err(_) => {
                return Err(format!(
                    "Action timed out after {:?}: {:?}",
                    self.timeout, self.command
                ))
            }
        };
        let exit_code = output.status.code().unwrap_or(-1);

        let stdout_digest = self
            .storage()
            .cas()
            .store_blob_bytes(&output.stdout, false)
            .await?;
        let stderr_digest = self
            .storage()
            .cas()
            .store_blob_bytes(&output.stderr, false)
            .await?;

        let mut result = remexec::ActionResult {
            exit_code,
            stdout_digest: Some(protos::digest_to_proto(&stdout_digest)),
            stderr_digest: Some(protos::digest_to_proto(&stderr_digest)),
            ..Default::default()
        };
        self.collect_outputs(&workdir, &mut result).await?;
        Ok(result)
    }

    /// Walk the declared outputs and ingest whatever the action produced.
    /// Missing outputs are simply absent from the result; the executor
    /// decides whether that fails the action.
    async fn collect_outputs(
        &self,
        workdir: &Path,
        result: &mut remexec::ActionResult,
    ) -> Result<(), String> {
        let compatible = self.api.hash_function().hash_type() == HashType::Compatible;

        for declared in &self.output_files {
            let path = workdir.join(declared);
            let metadata = match tokio::fs::symlink_metadata(&path).await {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            if metadata.is_symlink() {
                let target = read_symlink_target(&path).await?;
                if compatible && !is_non_upward_target(&target) {
                    return Err(format!(
                        "Action produced upward symlink {declared:?} -> {target:?}"
                    ));
                }
                self.storage()
                    .cas()
                    .store_blob_bytes(target.as_bytes(), false)
                    .await?;
                result.output_symlinks.push(remexec::OutputSymlink {
                    path: declared.clone(),
                    target,
                });
            } else if metadata.is_file() {
                let executable = is_executable(&metadata);
                let digest = self
                    .storage()
                    .cas()
                    .store_blob_file(&path, executable, true)
                    .await?;
                result.output_files.push(remexec::OutputFile {
                    path: declared.clone(),
                    digest: Some(protos::digest_to_proto(&digest)),
                    is_executable: executable,
                    contents: Default::default(),
                });
            }
        }

        for declared in &self.output_dirs {
            let path = workdir.join(declared);
            let metadata = match tokio::fs::symlink_metadata(&path).await {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            if metadata.is_symlink() {
                let target = read_symlink_target(&path).await?;
                if compatible && !is_non_upward_target(&target) {
                    return Err(format!(
                        "Action produced upward symlink {declared:?} -> {target:?}"
                    ));
                }
                self.storage()
                    .cas()
                    .store_blob_bytes(target.as_bytes(), false)
                    .await?;
                result.output_symlinks.push(remexec::OutputSymlink {
                    path: declared.clone(),
                    target,
                });
            } else if metadata.is_dir() {
                let tree_digest = ingest_directory(self.storage(), compatible, &path).await?;
                result.output_directories.push(remexec::OutputDirectory {
                    path: declared.clone(),
                    tree_digest: Some(protos::digest_to_proto(&tree_digest)),
                    is_topologically_sorted: false,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionAction for LocalAction {
    fn set_cache_flag(&mut self, flag: CacheFlag) {
        self.cache_flag = flag;
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn execute(&self) -> Result<Option<Box<dyn ExecutionResponse>>, String> {
        let messages = self.messages();

        if self.cache_flag.do_cache_lookup() {
            if let Some(result) = self
                .storage()
                .action_cache()
                .get(&messages.action_digest)
                .await?
            {
                log::debug!("Action {} served from cache", messages.action_digest.hash);
                return Ok(Some(Box::new(LocalResponse::new(
                    self.api.clone(),
                    messages.action_digest,
                    result,
                    true,
                ))));
            }
            if self.cache_flag == CacheFlag::FromCacheOnly {
                return Ok(None);
            }
        }

        // The action blob itself goes into the CAS: the entry with the
        // fingerprint digest IS the action.
        self.storage()
            .cas()
            .store_blob_bytes(&messages.action, false)
            .await?;
        self.storage()
            .cas()
            .store_blob_bytes(&messages.command, false)
            .await?;

        let result = self.run().await?;

        if result.exit_code == 0 && self.cache_flag.do_cache_store() {
            self.storage()
                .action_cache()
                .put(&messages.action_digest, &result)
                .await?;
        }

        let pretend_cached = self.cache_flag == CacheFlag::PretendCached;
        Ok(Some(Box::new(LocalResponse::new(
            self.api.clone(),
            messages.action_digest,
            result,
            pretend_cached,
        ))))
    }
}

fn is_executable(metadata: &std::fs::Metadata) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o100 != 0
    }
    #[cfg(not(unix))]
    false
}

async fn read_symlink_target(path: &Path) -> Result<String, String> {
    let target = tokio::fs::read_link(path)
        .await
        .map_err(|e| format!("Failed to read symlink {}: {e}", path.display()))?;
    target
        .to_str()
        .map(|s| s.to_owned())
        .ok_or_else(|| format!("Symlink target at {} is not UTF-8", path.display()))
}

/// Stage an input root below `dst` by hardlinking blobs out of the CAS.
fn stage_tree<'a>(
    storage: &'a Storage,
    digest: &'a Digest,
    dst: &'a Path,
) -> BoxFuture<'a, Result<(), String>> {
    async move {
        tokio::fs::create_dir_all(dst)
            .await
            .map_err(|e| format!("Failed to create {}: {e}", dst.display()))?;
        for entry in storage.cas().read_tree_entries(digest).await? {
            let entry_path = dst.join(&entry.name);
            match entry.object_type {
                ObjectType::Tree => {
                    stage_tree(storage, &entry.digest, &entry_path).await?;
                }
                ObjectType::File | ObjectType::Executable => {
                    let executable = entry.object_type.is_executable();
                    let src = storage
                        .cas()
                        .blob_path(&entry.digest, executable)
                        .await?
                        .ok_or_else(|| {
                            format!("Input blob {} not found in CAS", entry.digest.hash)
                        })?;
                    if tokio::fs::hard_link(&src, &entry_path).await.is_err() {
                        tokio::fs::copy(&src, &entry_path).await.map_err(|e| {
                            format!("Failed to stage {}: {e}", entry_path.display())
                        })?;
                    }
                }
                ObjectType::Symlink => {
                    let target = match entry.target {
                        Some(target) => target,
                        None => {
                            let bytes = storage
                                .cas()
                                .read_blob(&entry.digest, false)
                                .await?
                                .ok_or_else(|| {
                                    format!("Symlink blob {} not found", entry.digest.hash)
                                })?;
                            String::from_utf8(bytes)
                                .map_err(|_| "Symlink target is not UTF-8".to_owned())?
                        }
                    };
                    #[cfg(unix)]
                    tokio::fs::symlink(&target, &entry_path).await.map_err(|e| {
                        format!("Failed to create symlink {}: {e}", entry_path.display())
                    })?;
                }
            }
        }
        Ok(())
    }
    .boxed()
}

/// Ingest a produced output directory bottom-up, storing every file and
/// subtree, and return the root tree digest.
fn ingest_directory<'a>(
    storage: &'a Storage,
    compatible: bool,
    path: &'a Path,
) -> BoxFuture<'a, Result<Digest, String>> {
    async move {
        let mut entries = vec![];
        let mut dir = tokio::fs::read_dir(path)
            .await
            .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
        while let Some(dir_entry) = dir
            .next_entry()
            .await
            .map_err(|e| format!("Failed to read {}: {e}", path.display()))?
        {
            let name = dir_entry
                .file_name()
                .to_str()
                .ok_or_else(|| format!("Non-UTF-8 name in {}", path.display()))?
                .to_owned();
            let entry_path = dir_entry.path();
            let metadata = tokio::fs::symlink_metadata(&entry_path)
                .await
                .map_err(|e| format!("Failed to stat {}: {e}", entry_path.display()))?;

            if metadata.is_symlink() {
                let target = read_symlink_target(&entry_path).await?;
                if compatible && !is_non_upward_target(&target) {
                    return Err(format!(
                        "Output directory contains upward symlink {name:?} -> {target:?}"
                    ));
                }
                let digest = storage
                    .cas()
                    .store_blob_bytes(target.as_bytes(), false)
                    .await?;
                entries.push(TreeEntry::symlink(name, digest, target));
            } else if metadata.is_dir() {
                let digest = ingest_directory(storage, compatible, &entry_path).await?;
                entries.push(TreeEntry::new(name, digest, ObjectType::Tree));
            } else {
                let executable = is_executable(&metadata);
                let digest = storage
                    .cas()
                    .store_blob_file(&entry_path, executable, true)
                    .await?;
                let object_type = if executable {
                    ObjectType::Executable
                } else {
                    ObjectType::File
                };
                entries.push(TreeEntry::new(name, digest, object_type));
            }
        }

        let (bytes, digest) = serialize_entries(storage.config().hash_function, entries)?;
        storage.cas().store_tree_bytes(&bytes).await?;
        Ok(digest)
    }
    .boxed()
}
