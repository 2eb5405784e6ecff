// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use hashing::{Digest, HashFunction};

/// Blob content either held in memory or backed by a temp file on disk.
/// Readers must not assume either: all access goes through `bytes()` or
/// `file_path()`.
#[derive(Clone, Debug)]
enum BlobContent {
    Memory(Bytes),
    File(Arc<tempfile::TempPath>),
}

/// A blob together with its digest and executable bit, as passed through
/// upload and download paths.
#[derive(Clone, Debug)]
pub struct ArtifactBlob {
    digest: Digest,
    content: BlobContent,
    is_executable: bool,
}

impl ArtifactBlob {
    /// Hash the given bytes as a blob and wrap them.
    pub fn from_bytes(hash_function: HashFunction, bytes: Bytes, is_executable: bool) -> ArtifactBlob {
        let digest = hash_function.hash_blob_data(&bytes);
        ArtifactBlob {
            digest,
            content: BlobContent::Memory(bytes),
            is_executable,
        }
    }

    /// Hash the given bytes as a tree object and wrap them.
    pub fn tree_from_bytes(hash_function: HashFunction, bytes: Bytes) -> ArtifactBlob {
        let digest = hash_function.hash_tree_data(&bytes);
        ArtifactBlob {
            digest,
            content: BlobContent::Memory(bytes),
            is_executable: false,
        }
    }

    /// Wrap bytes whose digest the caller already knows.
    pub fn from_parts(digest: Digest, bytes: Bytes, is_executable: bool) -> ArtifactBlob {
        ArtifactBlob {
            digest,
            content: BlobContent::Memory(bytes),
            is_executable,
        }
    }

    /// Wrap a temp file holding verified content for the given digest. The
    /// file lives until the last clone of this blob is dropped.
    pub fn from_temp_file(
        digest: Digest,
        path: tempfile::TempPath,
        is_executable: bool,
    ) -> ArtifactBlob {
        ArtifactBlob {
            digest,
            content: BlobContent::File(Arc::new(path)),
            is_executable,
        }
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn is_executable(&self) -> bool {
        self.is_executable
    }

    pub fn len(&self) -> usize {
        self.digest.size_bytes
    }

    /// The backing file, if this blob is file-backed.
    pub fn file_path(&self) -> Option<&Path> {
        match &self.content {
            BlobContent::Memory(_) => None,
            BlobContent::File(path) => Some(path),
        }
    }

    /// The blob's content, read from disk if necessary.
    pub async fn bytes(&self) -> Result<Bytes, String> {
        match &self.content {
            BlobContent::Memory(bytes) => Ok(bytes.clone()),
            BlobContent::File(path) => {
                let path: &Path = path;
                tokio::fs::read(path)
                    .await
                    .map(Bytes::from)
                    .map_err(|e| format!("Failed to read blob file: {e}"))
            }
        }
    }
}
