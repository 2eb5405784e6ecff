// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use common::{ObjectInfo, ObjectType};
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::api::ExecutionApi;
use crate::blob::ArtifactBlob;

/// Copy objects from one backend into another, trees recursively with
/// children transferred before their parents so the target never holds a
/// tree whose content is unreachable.
pub(crate) async fn retrieve_to_cas(
    source: &dyn ExecutionApi,
    infos: &[ObjectInfo],
    target: &dyn ExecutionApi,
) -> Result<(), String> {
    for info in infos {
        transfer_object(source, info, target).await?;
    }
    Ok(())
}

fn transfer_object<'a>(
    source: &'a dyn ExecutionApi,
    info: &'a ObjectInfo,
    target: &'a dyn ExecutionApi,
) -> BoxFuture<'a, Result<(), String>> {
    async move {
        if target.is_available(&info.digest).await {
            return Ok(());
        }

        if info.object_type.is_tree() {
            for entry in source.read_tree_entries(&info.digest).await? {
                let child_type = match entry.object_type {
                    ObjectType::Symlink if entry.target.is_some() => {
                        // Compatible trees inline the target; there is no
                        // separate blob to transfer.
                        continue;
                    }
                    other => other,
                };
                let child = ObjectInfo::new(entry.digest, child_type);
                transfer_object(source, &child, target).await?;
            }
        }

        let bytes = source.retrieve_to_memory(info).await?;
        let blob = if info.object_type.is_tree() {
            ArtifactBlob::tree_from_bytes(source.hash_function(), bytes)
        } else {
            ArtifactBlob::from_parts(info.digest, bytes, info.object_type.is_executable())
        };
        target.upload(vec![blob], true).await
    }
    .boxed()
}

/// Write bytes to a raw file descriptor, taking ownership of it.
#[cfg(unix)]
pub(crate) fn write_to_fd(fd: i32, bytes: &[u8]) -> Result<(), String> {
    use std::io::Write;
    use std::os::fd::FromRawFd;

    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
    file.write_all(bytes)
        .map_err(|e| format!("Failed to write to fd {fd}: {e}"))
}

#[cfg(not(unix))]
pub(crate) fn write_to_fd(_fd: i32, _bytes: &[u8]) -> Result<(), String> {
    Err("Raw file descriptors are only supported on unix".to_owned())
}
