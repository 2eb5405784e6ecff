// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use hashing::Digest;
use prost::Message;
use protos::gen::build::bazel::remote::execution::v2 as remexec;

use crate::file_store::{FileStore, StoreMode};
use crate::{GcLock, StorageConfig};

struct Inner {
    generations: Vec<FileStore>,
    lock: GcLock,
}

/// Maps an action fingerprint (the digest of the serialized `Action`
/// message) to its serialized `ActionResult`.
///
/// Entries follow the same generational discipline as the CAS: reads promote
/// hits from older generations into generation 0. Cache entries may be
/// legitimately overwritten, hence last-wins staging.
///
/// An entry is consistent only if every digest inside the result is
/// recoverable from the CAS; `get` does not re-validate that, the caller
/// does implicitly by requesting the outputs.
#[derive(Clone)]
pub struct ActionCache {
    inner: Arc<Inner>,
}

impl ActionCache {
    pub fn new(config: &StorageConfig, lock: GcLock) -> ActionCache {
        let generations = (0..config.num_generations)
            .map(|index| {
                FileStore::new(
                    config.create_generation_config(index).action_cache,
                    StoreMode::LastWins,
                    false,
                )
            })
            .collect();
        ActionCache {
            inner: Arc::new(Inner { generations, lock }),
        }
    }

    /// Look up a cached result, uplinking the entry on an old-generation hit.
    pub async fn get(
        &self,
        action_digest: &Digest,
    ) -> Result<Option<remexec::ActionResult>, String> {
        let _guard = self.inner.lock.read().await;
        let id = action_digest.hash.to_hex();

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
                let result = remexec::ActionResult::decode(bytes.as_slice())
                    .map_err(|e| format!("Corrupt action cache entry {id}: {e}"))?;
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    /// Record a result for the given action fingerprint.
    pub async fn put(
        &self,
        action_digest: &Digest,
        result: &remexec::ActionResult,
    ) -> Result<(), String> {
        let _guard = self.inner.lock.read().await;
        let id = action_digest.hash.to_hex();
        self.inner.generations[0].add_from_bytes(&id, &result.encode_to_vec())
    }
}
