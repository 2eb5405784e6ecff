// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use hashing::{Digest, HashType};

use crate::gen::build::bazel::remote::execution::v2 as remexec;

/// Render a digest in its wire form: hex hash plus size.
///
/// The wire form does not carry the blob/tree distinction; that is implied by
/// the field the digest appears in, and restored by `digest_from_proto`.
pub fn digest_to_proto(digest: &Digest) -> remexec::Digest {
    remexec::Digest {
        hash: digest.hash.to_hex(),
        size_bytes: digest.size_bytes as i64,
    }
}

/// Reconstruct a digest from its wire form, restoring the blob/tree
/// distinction from the context the digest appeared in.
pub fn digest_from_proto(
    digest: &remexec::Digest,
    is_tree: bool,
    hash_type: HashType,
) -> Result<Digest, String> {
    if digest.size_bytes < 0 {
        return Err(format!(
            "Invalid digest {}: negative size {}",
            digest.hash, digest.size_bytes
        ));
    }
    Digest::from_known(&digest.hash, digest.size_bytes as usize, is_tree, hash_type)
}

/// Extract a required digest field from a message, failing if it is unset.
pub fn require_digest<'a, D: Into<Option<&'a remexec::Digest>>>(
    digest_opt: D,
    is_tree: bool,
    hash_type: HashType,
) -> Result<Digest, String> {
    match digest_opt.into() {
        Some(digest) => digest_from_proto(digest, is_tree, hash_type),
        None => Err("Protocol violation: Digest missing from a Remote Execution API request."
            .to_owned()),
    }
}
