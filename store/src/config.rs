// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use hashing::{HashFunction, HashType};
use serde::{Deserialize, Serialize};

/// Description of the execution backend a cache entry was produced against.
/// Its canonical-JSON hash shards the target cache, so that results obtained
/// from different backends never alias.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct BackendDescription {
    pub remote_address: Option<String>,
    pub platform_properties: BTreeMap<String, String>,
}

impl BackendDescription {
    pub fn new(
        remote_address: Option<String>,
        platform_properties: BTreeMap<String, String>,
    ) -> BackendDescription {
        BackendDescription {
            remote_address,
            platform_properties,
        }
    }

    /// The shard directory name: SHA-256 over the canonical JSON rendering.
    /// Always SHA-256, independent of the active hash family, so that the
    /// shard name is stable across protocol modes.
    pub fn hash(&self) -> String {
        let json = serde_json::to_string(self).expect("backend descriptions serialize");
        HashFunction::new(HashType::Compatible)
            .plain_hash_data(json.as_bytes())
            .to_hex()
    }
}

/// Paths of one storage generation, per the active hash family.
#[derive(Clone, Debug)]
pub struct GenerationConfig {
    pub cas_f: PathBuf,
    pub cas_x: PathBuf,
    pub cas_t: PathBuf,
    pub cas_large_f: PathBuf,
    pub cas_large_t: PathBuf,
    pub action_cache: PathBuf,
    pub target_cache: PathBuf,
}

/// Build-root layout and storage-wide settings.
///
/// All storage directories are subdirectories of `build_root`, which defaults
/// to `$HOME/.cache/<tool>`. Cache directories are versioned twice over:
/// by generation (for garbage collection) and by hash family (the two
/// protocol modes must never share content).
#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub build_root: PathBuf,
    /// Number of storage generations (default: two).
    pub num_generations: usize,
    pub hash_function: HashFunction,
    /// Hash of the execution backend description.
    pub backend_description: BackendDescription,
}

impl StorageConfig {
    pub fn builder() -> StorageConfigBuilder {
        StorageConfigBuilder::default()
    }

    pub fn default_build_root() -> PathBuf {
        match dirs_next::home_dir() {
            Some(home_dir) => home_dir.join(".cache").join("buildcore"),
            None => PathBuf::from(".cache").join("buildcore"),
        }
    }

    /// Root directory of all storage generations.
    pub fn cache_root(&self) -> PathBuf {
        self.build_root.join("protocol-dependent")
    }

    /// Root directory of all repository generations.
    pub fn repository_root(&self) -> PathBuf {
        self.build_root.join("repositories")
    }

    /// Directory for the git repository of the given generation.
    pub fn git_generation_root(&self, index: usize) -> PathBuf {
        self.repository_root()
            .join(format!("generation-{index}"))
            .join("git")
    }

    /// Directory for the git repository storing fetched workspace roots.
    pub fn git_root(&self) -> PathBuf {
        self.git_generation_root(0)
    }

    /// Root directory of a specific storage generation.
    pub fn generation_cache_root(&self, index: usize) -> PathBuf {
        debug_assert!(index < self.num_generations);
        self.cache_root().join(format!("generation-{index}"))
    }

    /// Root directory for all ephemeral directories: those that can (and
    /// should) be removed by garbage collection at any time.
    pub fn ephemeral_root(&self) -> PathBuf {
        self.generation_cache_root(0).join("ephemeral")
    }

    /// Root directory for local action executions; individual actions create
    /// a working directory below this root.
    pub fn execution_root(&self) -> PathBuf {
        self.ephemeral_root().join("exec_root")
    }

    /// Create a scoped temp directory for a specific kind of operation. The
    /// directory is removed when the returned handle is dropped, and lives in
    /// the ephemeral area so garbage collection sweeps up leftovers.
    pub fn create_typed_tmp_dir(&self, kind: &str) -> Result<tempfile::TempDir, String> {
        let parent = self.ephemeral_root().join("tmp-workspaces").join(kind);
        std::fs::create_dir_all(&parent)
            .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
        tempfile::TempDir::new_in(&parent)
            .map_err(|e| format!("Failed to create temp dir below {}: {e}", parent.display()))
    }

    fn family_dir(&self, cache_root: &Path) -> PathBuf {
        let family = match self.hash_function.hash_type() {
            HashType::Native => "git-sha1",
            HashType::Compatible => "compatible-sha256",
        };
        cache_root.join(family)
    }

    pub fn create_generation_config(&self, generation: usize) -> GenerationConfig {
        let native = self.hash_function.hash_type().is_native();
        let cache_dir = self.family_dir(&self.generation_cache_root(generation));

        GenerationConfig {
            cas_f: cache_dir.join("cas-f"),
            cas_x: cache_dir.join("cas-x"),
            // Compatible mode has no separate tree area: trees are plain
            // blobs there, so the tree paths alias the file paths.
            cas_t: cache_dir.join(if native { "cas-t" } else { "cas-f" }),
            cas_large_f: cache_dir.join("cas-large-f"),
            cas_large_t: cache_dir.join(if native { "cas-large-t" } else { "cas-large-f" }),
            action_cache: cache_dir.join("ac"),
            target_cache: cache_dir
                .join("tc")
                .join(self.backend_description.hash()),
        }
    }
}

#[derive(Default)]
pub struct StorageConfigBuilder {
    build_root: Option<PathBuf>,
    num_generations: Option<usize>,
    hash_type: Option<HashType>,
    backend_description: Option<BackendDescription>,
}

impl StorageConfigBuilder {
    pub fn build_root(mut self, value: PathBuf) -> Self {
        self.build_root = Some(value);
        self
    }

    pub fn num_generations(mut self, value: usize) -> Self {
        self.num_generations = Some(value);
        self
    }

    pub fn hash_type(mut self, value: HashType) -> Self {
        self.hash_type = Some(value);
        self
    }

    pub fn backend_description(mut self, value: BackendDescription) -> Self {
        self.backend_description = Some(value);
        self
    }

    pub fn build(self) -> Result<StorageConfig, String> {
        let build_root = match self.build_root {
            Some(root) => {
                if root.is_relative() {
                    return Err(format!(
                        "Build root must be an absolute path but got '{}'.",
                        root.display()
                    ));
                }
                root
            }
            None => StorageConfig::default_build_root(),
        };

        let num_generations = self.num_generations.unwrap_or(2);
        if num_generations == 0 {
            return Err("The number of generations must be greater than 0.".to_owned());
        }

        Ok(StorageConfig {
            build_root,
            num_generations,
            hash_function: HashFunction::new(self.hash_type.unwrap_or(HashType::Native)),
            backend_description: self.backend_description.unwrap_or_default(),
        })
    }
}
