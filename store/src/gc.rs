// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::Path;

use crate::Storage;

/// Garbage collection by generation rotation.
///
/// The oldest generation directory is removed, every younger generation
/// shifts one slot back, and generation 0 is recreated empty. Uplink-on-read
/// has already promoted everything live into generation 0, so rotation only
/// ever discards content that has not been touched for a full cycle.
pub struct GarbageCollector;

impl GarbageCollector {
    /// Rotate the storage generations. Takes the storage lock exclusively:
    /// no build operation runs concurrently with a rotation.
    pub async fn collect(storage: &Storage) -> Result<(), String> {
        let _guard = storage.lock().write().await;
        let config = storage.config();

        // The ephemeral area lives below generation 0 and holds only
        // reproducible state (execution sandboxes, scoped temp dirs).
        remove_dir_if_present(&config.ephemeral_root())?;

        Self::rotate(&config.cache_root(), config.num_generations)?;
        Self::rotate(&config.repository_root(), config.num_generations)?;

        std::fs::create_dir_all(config.generation_cache_root(0))
            .map_err(|e| format!("Failed to recreate generation 0: {e}"))?;
        Ok(())
    }

    fn rotate(root: &Path, num_generations: usize) -> Result<(), String> {
        remove_dir_if_present(&root.join(format!("generation-{}", num_generations - 1)))?;
        for index in (0..num_generations.saturating_sub(1)).rev() {
            let from = root.join(format!("generation-{index}"));
            let to = root.join(format!("generation-{}", index + 1));
            if from.exists() {
                std::fs::rename(&from, &to).map_err(|e| {
                    format!("Failed to rotate {} -> {}: {e}", from.display(), to.display())
                })?;
            }
        }
        Ok(())
    }
}

fn remove_dir_if_present(path: &Path) -> Result<(), String> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(format!("Failed to remove {}: {e}", path.display())),
    }
}
