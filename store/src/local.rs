// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::ObjectType;
use hashing::Digest;
use hashing::HashFunction;

use crate::file_store::{FileStore, StoreMode};
use crate::large::{LargeObjectCas, LargeObjectError, CHUNK_AVG_SIZE, CHUNK_MAX_SIZE, CHUNK_MIN_SIZE};
use crate::tree::{self, TreeEntry};
use crate::{GcLock, StorageConfig};

/// The stores of one generation.
struct GenerationStores {
    cas_f: FileStore,
    cas_x: FileStore,
    cas_t: FileStore,
    large_f: LargeObjectCas,
    large_t: LargeObjectCas,
}

struct Inner {
    config: StorageConfig,
    generations: Vec<GenerationStores>,
    lock: GcLock,
}

/// The local content-addressed store.
///
/// Content lives in per-generation sharded file stores: regular files,
/// executables and (in native mode) trees each in their own area, plus a
/// large-object index mapping a big object to the chunks it splices from.
///
/// Reads look up generation 0 first and fall back to older generations; any
/// hit in an older generation is promoted ("uplinked") into generation 0, for
/// trees together with everything they transitively reference. Garbage
/// collection then only ever deletes the oldest generation.
#[derive(Clone)]
pub struct LocalCas {
    inner: Arc<Inner>,
}

impl LocalCas {
    pub fn new(config: StorageConfig, lock: GcLock) -> LocalCas {
        let generations = (0..config.num_generations)
            .map(|index| {
                let gen_config = config.create_generation_config(index);
                GenerationStores {
                    cas_f: FileStore::new(&gen_config.cas_f, StoreMode::FirstWins, false),
                    cas_x: FileStore::new(&gen_config.cas_x, StoreMode::FirstWins, true),
                    cas_t: FileStore::new(&gen_config.cas_t, StoreMode::FirstWins, false),
                    large_f: LargeObjectCas::new(
                        &gen_config.cas_large_f,
                        config.hash_function,
                        index == 0,
                    ),
                    large_t: LargeObjectCas::new(
                        &gen_config.cas_large_t,
                        config.hash_function,
                        index == 0,
                    ),
                }
            })
            .collect();
        LocalCas {
            inner: Arc::new(Inner {
                config,
                generations,
                lock,
            }),
        }
    }

    pub fn hash_function(&self) -> HashFunction {
        self.inner.config.hash_function
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    /// Store blob content, returning its digest. Idempotent.
    pub async fn store_blob_bytes(
        &self,
        bytes: &[u8],
        executable: bool,
    ) -> Result<Digest, String> {
        let _guard = self.inner.lock.read().await;
        let digest = self.hash_function().hash_blob_data(bytes);
        self.blob_area(0, executable)
            .add_from_bytes(&digest.hash.to_hex(), bytes)?;
        Ok(digest)
    }

    /// Store a file's content as a blob. When `is_owner` is set the source
    /// may be captured by hardlink instead of copied.
    pub async fn store_blob_file(
        &self,
        path: &Path,
        executable: bool,
        is_owner: bool,
    ) -> Result<Digest, String> {
        let _guard = self.inner.lock.read().await;
        let digest = self
            .hash_function()
            .hash_blob_file(path)
            .map_err(|e| format!("Failed to hash {}: {e}", path.display()))?;
        self.blob_area(0, executable)
            .add_from_file(&digest.hash.to_hex(), path, is_owner)?;
        Ok(digest)
    }

    /// Store serialized tree content, returning its tree digest.
    pub async fn store_tree_bytes(&self, bytes: &[u8]) -> Result<Digest, String> {
        let _guard = self.inner.lock.read().await;
        let digest = self.hash_function().hash_tree_data(bytes);
        self.tree_area(0)
            .add_from_bytes(&digest.hash.to_hex(), bytes)?;
        Ok(digest)
    }

    pub async fn store_tree_file(&self, path: &Path, is_owner: bool) -> Result<Digest, String> {
        let _guard = self.inner.lock.read().await;
        let digest = self
            .hash_function()
            .hash_tree_file(path)
            .map_err(|e| format!("Failed to hash {}: {e}", path.display()))?;
        self.tree_area(0)
            .add_from_file(&digest.hash.to_hex(), path, is_owner)?;
        Ok(digest)
    }

    /// The generation-0 path of a blob, after cross-generation lookup,
    /// uplink, and, for split objects, reconstruction by splicing.
    pub async fn blob_path(
        &self,
        digest: &Digest,
        executable: bool,
    ) -> Result<Option<PathBuf>, String> {
        let _guard = self.inner.lock.read().await;
        self.blob_path_sync(digest, executable)
    }

    /// The generation-0 path of a tree, as `blob_path`. An uplink from an
    /// older generation promotes the transitive closure of the tree.
    pub async fn tree_path(&self, digest: &Digest) -> Result<Option<PathBuf>, String> {
        let _guard = self.inner.lock.read().await;
        self.tree_path_sync(digest)
    }

    pub async fn has_blob(&self, digest: &Digest, executable: bool) -> Result<bool, String> {
        Ok(self.blob_path(digest, executable).await?.is_some())
    }

    pub async fn has_tree(&self, digest: &Digest) -> Result<bool, String> {
        Ok(self.tree_path(digest).await?.is_some())
    }

    pub async fn read_blob(
        &self,
        digest: &Digest,
        executable: bool,
    ) -> Result<Option<Vec<u8>>, String> {
        // Path resolution and the read happen under one shared-lock hold, so
        // a concurrent generation rotation cannot invalidate the path.
        let _guard = self.inner.lock.read().await;
        match self.blob_path_sync(digest, executable)? {
            Some(path) => std::fs::read(&path)
                .map(Some)
                .map_err(|e| format!("Failed to read {}: {e}", path.display())),
            None => Ok(None),
        }
    }

    pub async fn read_tree(&self, digest: &Digest) -> Result<Option<Vec<u8>>, String> {
        let _guard = self.inner.lock.read().await;
        match self.tree_path_sync(digest)? {
            Some(path) => std::fs::read(&path)
                .map(Some)
                .map_err(|e| format!("Failed to read {}: {e}", path.display())),
            None => Ok(None),
        }
    }

    /// Parse the entries of a stored tree.
    pub async fn read_tree_entries(&self, digest: &Digest) -> Result<Vec<TreeEntry>, String> {
        let bytes = self
            .read_tree(digest)
            .await?
            .ok_or_else(|| format!("Tree {} not found in CAS", digest.hash))?;
        tree::parse_entries(self.hash_function(), &bytes)
    }

    /// Split a blob into content-defined chunks, recording the recipe. An
    /// object split before is not split again.
    pub async fn split_blob(&self, digest: &Digest) -> Result<Vec<Digest>, LargeObjectError> {
        let _guard = self.inner.lock.read().await;
        self.split_sync(digest, false)
    }

    /// Split a stored tree object, as `split_blob`.
    pub async fn split_tree(&self, digest: &Digest) -> Result<Vec<Digest>, LargeObjectError> {
        let _guard = self.inner.lock.read().await;
        self.split_sync(digest, true)
    }

    /// Splice a blob from the given chunks and insert it, verifying that the
    /// result matches `digest`.
    pub async fn splice_blob(
        &self,
        digest: &Digest,
        parts: &[Digest],
    ) -> Result<Digest, LargeObjectError> {
        let _guard = self.inner.lock.read().await;
        self.splice_sync(digest, parts, false)?;
        Ok(*digest)
    }

    pub async fn splice_tree(
        &self,
        digest: &Digest,
        parts: &[Digest],
    ) -> Result<Digest, LargeObjectError> {
        let _guard = self.inner.lock.read().await;
        self.splice_sync(digest, parts, true)?;
        Ok(*digest)
    }

    fn generation(&self, index: usize) -> &GenerationStores {
        &self.inner.generations[index]
    }

    fn num_generations(&self) -> usize {
        self.inner.generations.len()
    }

    fn blob_area(&self, generation: usize, executable: bool) -> &FileStore {
        if executable {
            &self.generation(generation).cas_x
        } else {
            &self.generation(generation).cas_f
        }
    }

    fn tree_area(&self, generation: usize) -> &FileStore {
        &self.generation(generation).cas_t
    }

    fn large_index(&self, generation: usize, is_tree: bool) -> &LargeObjectCas {
        if is_tree {
            &self.generation(generation).large_t
        } else {
            &self.generation(generation).large_f
        }
    }

    fn blob_path_sync(
        &self,
        digest: &Digest,
        executable: bool,
    ) -> Result<Option<PathBuf>, String> {
        let id = digest.hash.to_hex();
        let target = self.blob_area(0, executable);

        if target.has_entry(&id) {
            return Ok(Some(target.entry_path(&id)));
        }

        // The same content may exist with the other executable-ness; sync it
        // over rather than treating it as missing.
        for generation in 0..self.num_generations() {
            for other in [executable, !executable] {
                let area = self.blob_area(generation, other);
                if area.has_entry(&id) {
                    target.add_from_file(&id, &area.entry_path(&id), false)?;
                    return Ok(Some(target.entry_path(&id)));
                }
            }
        }

        // Not present as a file anywhere; perhaps it is recorded as a large
        // object and can be reconstructed from its chunks.
        match self.locate_large_entry(digest, false) {
            Ok(Some(parts)) => {
                self.splice_sync(digest, &parts, false)
                    .map_err(|e| format!("Failed to reconstruct large blob {}: {e}", digest.hash))?;
                let path = target.entry_path(&id);
                if executable {
                    // Splice lands content in the regular area first.
                    target.add_from_file(&id, &self.blob_area(0, false).entry_path(&id), false)?;
                }
                Ok(Some(path))
            }
            Ok(None) => Ok(None),
            Err(LargeObjectError::FileNotFound(_)) | Err(LargeObjectError::InvalidTree(_)) => {
                Ok(None)
            }
            Err(e) => Err(format!("Large-object lookup for {} failed: {e}", digest.hash)),
        }
    }

    fn tree_path_sync(&self, digest: &Digest) -> Result<Option<PathBuf>, String> {
        let id = digest.hash.to_hex();
        let target = self.tree_area(0);

        if target.has_entry(&id) {
            return Ok(Some(target.entry_path(&id)));
        }

        for generation in 1..self.num_generations() {
            let area = self.tree_area(generation);
            if area.has_entry(&id) {
                target.add_from_file(&id, &area.entry_path(&id), false)?;
                // A tree in generation 0 implies its whole closure is
                // recoverable from generation 0, so promote the children.
                if self.hash_function().hash_type().is_native() {
                    self.uplink_tree_children(&target.entry_path(&id))?;
                }
                return Ok(Some(target.entry_path(&id)));
            }
        }

        match self.locate_large_entry(digest, true) {
            Ok(Some(parts)) => {
                self.splice_sync(digest, &parts, true)
                    .map_err(|e| format!("Failed to reconstruct large tree {}: {e}", digest.hash))?;
                if self.hash_function().hash_type().is_native() {
                    self.uplink_tree_children(&target.entry_path(&id))?;
                }
                Ok(Some(target.entry_path(&id)))
            }
            Ok(None) => Ok(None),
            Err(LargeObjectError::FileNotFound(_)) | Err(LargeObjectError::InvalidTree(_)) => {
                Ok(None)
            }
            Err(e) => Err(format!("Large-object lookup for {} failed: {e}", digest.hash)),
        }
    }

    /// Promote everything a freshly uplinked tree references.
    fn uplink_tree_children(&self, tree_path: &Path) -> Result<(), String> {
        let bytes = std::fs::read(tree_path)
            .map_err(|e| format!("Failed to read {}: {e}", tree_path.display()))?;
        let entries = tree::parse_entries(self.hash_function(), &bytes)?;
        for entry in entries {
            match entry.object_type {
                ObjectType::Tree => {
                    self.tree_path_sync(&entry.digest)?;
                }
                ObjectType::Executable => {
                    self.blob_path_sync(&entry.digest, true)?;
                }
                ObjectType::File | ObjectType::Symlink => {
                    self.blob_path_sync(&entry.digest, false)?;
                }
            }
        }
        Ok(())
    }

    /// Find a reconstruction recipe across generations, promoting chunks
    /// first and then the recipe itself into generation 0.
    fn locate_large_entry(
        &self,
        digest: &Digest,
        is_tree: bool,
    ) -> Result<Option<Vec<Digest>>, LargeObjectError> {
        for generation in 0..self.num_generations() {
            let index = self.large_index(generation, is_tree);
            if let Some(parts) = index.read_entry(digest)? {
                if generation > 0 {
                    for part in &parts {
                        self.blob_path_sync(part, false)
                            .map_err(LargeObjectError::Internal)?;
                    }
                    self.large_index(0, is_tree).write_entry(digest, &parts)?;
                }
                return Ok(Some(parts));
            }
        }
        Ok(None)
    }

    fn split_sync(&self, digest: &Digest, is_tree: bool) -> Result<Vec<Digest>, LargeObjectError> {
        if let Some(parts) = self.locate_large_entry(digest, is_tree)? {
            return Ok(parts);
        }

        let path = if is_tree {
            self.tree_path_sync(digest)
        } else {
            self.blob_path_sync(digest, false)
        }
        .map_err(LargeObjectError::Internal)?
        .ok_or_else(|| {
            LargeObjectError::FileNotFound(format!("{} not in CAS, cannot split", digest.hash))
        })?;

        let file = std::fs::File::open(&path).map_err(|e| {
            LargeObjectError::Internal(format!("Failed to open {}: {e}", path.display()))
        })?;
        let mut parts = Vec::new();
        for chunk in fastcdc::v2020::StreamCDC::new(file, CHUNK_MIN_SIZE, CHUNK_AVG_SIZE, CHUNK_MAX_SIZE)
        {
            let chunk = chunk
                .map_err(|e| LargeObjectError::Internal(format!("Chunking failed: {e}")))?;
            let chunk_digest = self.hash_function().hash_blob_data(&chunk.data);
            self.blob_area(0, false)
                .add_from_bytes(&chunk_digest.hash.to_hex(), &chunk.data)
                .map_err(LargeObjectError::Internal)?;
            parts.push(chunk_digest);
        }

        self.large_index(0, is_tree).write_entry(digest, &parts)?;
        Ok(parts)
    }

    fn splice_sync(
        &self,
        digest: &Digest,
        parts: &[Digest],
        is_tree: bool,
    ) -> Result<PathBuf, LargeObjectError> {
        let tmp_dir = self
            .inner
            .config
            .create_typed_tmp_dir("splice")
            .map_err(LargeObjectError::Internal)?;
        let result_path = tmp_dir.path().join("result");

        {
            let mut out = std::fs::File::create(&result_path).map_err(|e| {
                LargeObjectError::Internal(format!("Failed to create splice result: {e}"))
            })?;
            for part in parts {
                let part_path = self
                    .blob_path_sync(part, false)
                    .map_err(LargeObjectError::Internal)?
                    .ok_or_else(|| {
                        LargeObjectError::InvalidTree(format!(
                            "Chunk {} of {} is missing from the CAS",
                            part.hash, digest.hash
                        ))
                    })?;
                let mut chunk = std::fs::File::open(&part_path).map_err(|e| {
                    LargeObjectError::Internal(format!(
                        "Failed to open chunk {}: {e}",
                        part_path.display()
                    ))
                })?;
                std::io::copy(&mut chunk, &mut out).map_err(|e| {
                    LargeObjectError::Internal(format!("Failed to splice chunk: {e}"))
                })?;
            }
        }

        let spliced = if is_tree {
            self.hash_function().hash_tree_file(&result_path)
        } else {
            self.hash_function().hash_blob_file(&result_path)
        }
        .map_err(|e| LargeObjectError::Internal(format!("Failed to hash splice result: {e}")))?;

        let size_matches = digest.size_bytes == 0 || digest.size_bytes == spliced.size_bytes;
        if spliced.hash != digest.hash || !size_matches {
            // The recipe reproduced the wrong object: treat as corruption.
            self.large_index(0, is_tree).remove_entry(digest);
            return Err(LargeObjectError::InvalidResult(format!(
                "Splice of {} produced {} ({} bytes)",
                digest.hash, spliced.hash, spliced.size_bytes
            )));
        }

        let id = digest.hash.to_hex();
        let area = if is_tree {
            self.tree_area(0)
        } else {
            self.blob_area(0, false)
        };
        area.add_from_file(&id, &result_path, true)
            .map_err(LargeObjectError::Internal)?;
        self.large_index(0, is_tree)
            .write_entry(digest, parts)?;
        Ok(area.entry_path(&id))
    }
}
