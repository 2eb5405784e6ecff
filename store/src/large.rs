// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::path::PathBuf;

use hashing::{Digest, HashFunction};
use serde::{Deserialize, Serialize};

use crate::file_store::{FileStore, StoreMode};

/// Objects at least this large are transferred as chunks: a batch request
/// slot cannot hold them, and a re-request is served by splicing.
pub const LARGE_OBJECT_THRESHOLD: usize = 2 * 1024 * 1024;

/// FastCDC parameters. Stable across versions: a recipe written by one
/// process must reproduce under another.
pub(crate) const CHUNK_MIN_SIZE: u32 = 512 * 1024;
pub(crate) const CHUNK_AVG_SIZE: u32 = 1024 * 1024;
pub(crate) const CHUNK_MAX_SIZE: u32 = 2 * 1024 * 1024;

/// Error kinds of the split/splice facility. Callers branch on these: a
/// `FileNotFound` is routinely recoverable (fetch the object whole), while an
/// `InvalidResult` means corruption and deletes the offending recipe.
#[derive(Debug)]
pub enum LargeObjectError {
    /// An internal error occurred.
    Internal(String),
    /// The digest is not in the CAS.
    FileNotFound(String),
    /// The result is different from what was expected.
    InvalidResult(String),
    /// Some parts of the object are not in the storage.
    InvalidTree(String),
}

impl fmt::Display for LargeObjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LargeObjectError::Internal(msg) => write!(f, "internal error: {msg}"),
            LargeObjectError::FileNotFound(msg) => write!(f, "not found: {msg}"),
            LargeObjectError::InvalidResult(msg) => write!(f, "invalid result: {msg}"),
            LargeObjectError::InvalidTree(msg) => write!(f, "invalid tree: {msg}"),
        }
    }
}

impl std::error::Error for LargeObjectError {}

/// One chunk reference inside a recipe.
#[derive(Serialize, Deserialize)]
struct RecipePart {
    hash: String,
    size: usize,
}

/// The index of large objects for one generation and object kind.
///
/// Entries are keyed by the digest of the spliced result; the value is the
/// ordered list of chunk digests the object is composed of. Chunks themselves
/// are ordinary CAS blobs.
#[derive(Clone, Debug)]
pub struct LargeObjectCas {
    store: FileStore,
    hash_function: HashFunction,
}

impl LargeObjectCas {
    /// The latest generation overwrites recipes freely; older generations are
    /// only ever read and uplinked, so they keep whatever they had first.
    pub fn new<P: AsRef<std::path::Path>>(
        root: P,
        hash_function: HashFunction,
        latest_generation: bool,
    ) -> LargeObjectCas {
        let mode = if latest_generation {
            StoreMode::LastWins
        } else {
            StoreMode::FirstWins
        };
        LargeObjectCas {
            store: FileStore::new(root, mode, false),
            hash_function,
        }
    }

    pub fn entry_path(&self, digest: &Digest) -> PathBuf {
        self.store.entry_path(&digest.hash.to_hex())
    }

    #[allow(dead_code)]
    pub fn has_entry(&self, digest: &Digest) -> bool {
        self.store.has_entry(&digest.hash.to_hex())
    }

    /// Obtain the reconstruction recipe for a large object, if present.
    pub fn read_entry(&self, digest: &Digest) -> Result<Option<Vec<Digest>>, LargeObjectError> {
        let path = self.entry_path(digest);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(LargeObjectError::Internal(format!(
                    "Failed to read recipe {}: {e}",
                    path.display()
                )))
            }
        };
        let parts: Vec<RecipePart> = serde_json::from_slice(&bytes).map_err(|e| {
            LargeObjectError::Internal(format!("Corrupt recipe {}: {e}", path.display()))
        })?;
        parts
            .into_iter()
            .map(|part| {
                Digest::from_known(
                    &part.hash,
                    part.size,
                    false,
                    self.hash_function.hash_type(),
                )
                .map_err(LargeObjectError::Internal)
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    /// Record the reconstruction recipe for a large object.
    pub fn write_entry(&self, digest: &Digest, parts: &[Digest]) -> Result<(), LargeObjectError> {
        let recipe: Vec<RecipePart> = parts
            .iter()
            .map(|part| RecipePart {
                hash: part.hash.to_hex(),
                size: part.size_bytes,
            })
            .collect();
        let bytes = serde_json::to_vec(&recipe)
            .map_err(|e| LargeObjectError::Internal(format!("Failed to encode recipe: {e}")))?;
        self.store
            .add_from_bytes(&digest.hash.to_hex(), &bytes)
            .map_err(LargeObjectError::Internal)
    }

    /// Drop a recipe, e.g. after a splice produced the wrong digest.
    pub fn remove_entry(&self, digest: &Digest) {
        let _ = self.store.remove(&digest.hash.to_hex());
    }
}
