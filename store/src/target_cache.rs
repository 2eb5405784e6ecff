// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::sync::Arc;

use common::ObjectInfo;
use hashing::{Digest, HashFunction};
use serde::{Deserialize, Serialize};

use crate::file_store::{FileStore, StoreMode};
use crate::{GcLock, StorageConfig};

/// Key of a target-cache entry: the plain hash over the canonical JSON of
/// `[repository key, target name, effective configuration]`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TargetCacheKey(pub Digest);

impl TargetCacheKey {
    pub fn new(
        hash_function: HashFunction,
        repo_key: &str,
        target: &str,
        effective_config: &serde_json::Value,
    ) -> TargetCacheKey {
        let canonical = serde_json::json!([repo_key, target, effective_config]);
        let json = canonical.to_string();
        let hash = hash_function.plain_hash_data(json.as_bytes());
        TargetCacheKey(Digest::new(hash, json.len(), false))
    }
}

/// A cached high-level target result: the artifacts the target is known to
/// produce, and whether the result is tainted (derived from actions that may
/// fail or must not be cached).
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TargetCacheEntry {
    pub artifacts: BTreeMap<String, ObjectInfo>,
    #[serde(default)]
    pub tainted: bool,
}

struct Inner {
    generations: Vec<FileStore>,
    lock: GcLock,
}

/// Maps `(repository × target × configuration)` keys to known target
/// results, sharded by the hash of the execution backend description (the
/// shard is baked into the per-generation paths): results from different
/// backends never alias.
#[derive(Clone)]
pub struct TargetCache {
    inner: Arc<Inner>,
}

impl TargetCache {
    pub fn new(config: &StorageConfig, lock: GcLock) -> TargetCache {
        let generations = (0..config.num_generations)
            .map(|index| {
                FileStore::new(
                    config.create_generation_config(index).target_cache,
                    StoreMode::LastWins,
                    false,
                )
            })
            .collect();
        TargetCache {
            inner: Arc::new(Inner { generations, lock }),
        }
    }

    pub async fn get(&self, key: &TargetCacheKey) -> Result<Option<TargetCacheEntry>, String> {
        let _guard = self.inner.lock.read().await;
        let id = key.0.hash.to_hex();

        for (generation, store) in self.inner.generations.iter().enumerate() {
            if store.has_entry(&id) {
                if generation > 0 {
                    self.inner.generations[0].add_from_file(
                        &id,
                        &store.entry_path(&id),
                        false,
                    )?;
                }
                let path = self.inner.generations[0].entry_path(&id);
                let bytes = std::fs::read(&path)
                    .map_err(|e| format!("Failed to read cache entry {}: {e}", path.display()))?;
                let entry = serde_json::from_slice(&bytes)
                    .map_err(|e| format!("Corrupt target cache entry {id}: {e}"))?;
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    pub async fn put(&self, key: &TargetCacheKey, entry: &TargetCacheEntry) -> Result<(), String> {
        let _guard = self.inner.lock.read().await;
        let id = key.0.hash.to_hex();
        let bytes = serde_json::to_vec(entry)
            .map_err(|e| format!("Failed to encode target cache entry: {e}"))?;
        self.inner.generations[0].add_from_bytes(&id, &bytes)
    }
}
