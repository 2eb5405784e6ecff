// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

use std::sync::Arc;

mod action_cache;
mod config;
mod file_store;
mod gc;
mod large;
mod local;
mod target_cache;
pub mod tree;

pub use action_cache::ActionCache;
pub use config::{BackendDescription, GenerationConfig, StorageConfig, StorageConfigBuilder};
pub use file_store::{FileStore, StoreMode};
pub use gc::GarbageCollector;
pub use large::{LargeObjectError, LARGE_OBJECT_THRESHOLD};
pub use local::LocalCas;
pub use target_cache::{TargetCache, TargetCacheEntry, TargetCacheKey};
pub use tree::TreeEntry;

/// All storage operations hold this lock shared; garbage collection holds it
/// exclusively while rotating generations.
pub(crate) type GcLock = Arc<tokio::sync::RwLock<()>>;

/// The three local stores, sharing one build root and one GC lock.
#[derive(Clone)]
pub struct Storage {
    config: Arc<StorageConfig>,
    cas: LocalCas,
    action_cache: ActionCache,
    target_cache: TargetCache,
    lock: GcLock,
}

impl Storage {
    pub fn new(config: StorageConfig) -> Storage {
        let lock: GcLock = Arc::new(tokio::sync::RwLock::new(()));
        let cas = LocalCas::new(config.clone(), lock.clone());
        let action_cache = ActionCache::new(&config, lock.clone());
        let target_cache = TargetCache::new(&config, lock.clone());
        Storage {
            config: Arc::new(config),
            cas,
            action_cache,
            target_cache,
            lock,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn cas(&self) -> &LocalCas {
        &self.cas
    }

    pub fn action_cache(&self) -> &ActionCache {
        &self.action_cache
    }

    pub fn target_cache(&self) -> &TargetCache {
        &self.target_cache
    }

    pub(crate) fn lock(&self) -> &GcLock {
        &self.lock
    }
}

#[cfg(test)]
mod local_tests;


#[cfg(test)]
mod gc_tests;
