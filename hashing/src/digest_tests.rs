// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::{Digest, Fingerprint, HashType};

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

#[test]
fn from_known_validates_hex_length_per_family() {
    let sha1_hex = "30d74d258442c7c65512eafab474568dd706c430";
    let sha256_hex = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    assert!(Digest::from_known(sha1_hex, 4, false, HashType::Native).is_ok());
    assert!(Digest::from_known(sha1_hex, 4, false, HashType::Compatible).is_err());
    assert!(Digest::from_known(sha256_hex, 4, false, HashType::Compatible).is_ok());
    assert!(Digest::from_known(sha256_hex, 4, false, HashType::Native).is_err());
    assert!(Digest::from_known("not-hex", 4, false, HashType::Native).is_err());
}

#[test]
fn equality_covers_all_fields() {
    let hash = Fingerprint::from_hex_string(&"ab".repeat(20)).unwrap();
    let blob = Digest::new(hash, 4, false);
    assert_ne!(blob, Digest::new(hash, 4, true));
    assert_ne!(blob, Digest::new(hash, 5, false));
    assert_eq!(blob, Digest::new(hash, 4, false));
}

#[test]
fn map_key_hash_ignores_size_and_tree_flag() {
    fn hash_of(digest: Digest) -> u64 {
        let mut hasher = DefaultHasher::new();
        digest.hash(&mut hasher);
        hasher.finish()
    }

    let hash = Fingerprint::from_hex_string(&"ab".repeat(20)).unwrap();
    assert_eq!(
        hash_of(Digest::new(hash, 4, false)),
        hash_of(Digest::new(hash, 0, true)),
    );
}

#[test]
fn serde_round_trip() {
    let digest = Digest::from_known(
        "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08",
        4,
        true,
        HashType::Compatible,
    )
    .unwrap();
    let json = serde_json::to_string(&digest).unwrap();
    let back: Digest = serde_json::from_str(&json).unwrap();
    assert_eq!(back, digest);
}
