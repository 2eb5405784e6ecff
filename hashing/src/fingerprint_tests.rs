// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::Fingerprint;

#[test]
fn from_hex_string_sha1_width() {
    let fp = Fingerprint::from_hex_string("30d74d258442c7c65512eafab474568dd706c430").unwrap();
    assert_eq!(fp.len(), 20);
    assert_eq!(fp.to_hex(), "30d74d258442c7c65512eafab474568dd706c430");
}

#[test]
fn from_hex_string_sha256_width() {
    let hex = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
    let fp = Fingerprint::from_hex_string(hex).unwrap();
    assert_eq!(fp.len(), 32);
    assert_eq!(fp.to_hex(), hex);
}

#[test]
fn rejects_bad_lengths_and_characters() {
    assert!(Fingerprint::from_hex_string("abcd").is_err());
    assert!(Fingerprint::from_hex_string("").is_err());
    assert!(Fingerprint::from_hex_string(&"zz".repeat(20)).is_err());
}

#[test]
fn widths_do_not_collide() {
    // A SHA-1 fingerprint zero-extended to 32 bytes must not equal the
    // SHA-256 fingerprint with the same leading bytes.
    let narrow = Fingerprint::from_hex_string(&"ab".repeat(20)).unwrap();
    let wide = Fingerprint::from_hex_string(&("ab".repeat(20) + &"00".repeat(12))).unwrap();
    assert_ne!(narrow, wide);
}

#[test]
fn display_is_hex() {
    let fp = Fingerprint::from_hex_string(&"0f".repeat(20)).unwrap();
    assert_eq!(format!("{fp}"), "0f".repeat(20));
    assert_eq!(format!("{fp:?}"), format!("Fingerprint<{}>", "0f".repeat(20)));
}

#[test]
fn serializes_as_hex_string() {
    let fp = Fingerprint::from_hex_string(&"a1".repeat(32)).unwrap();
    let json = serde_json::to_string(&fp).unwrap();
    assert_eq!(json, format!("\"{}\"", "a1".repeat(32)));
    let back: Fingerprint = serde_json::from_str(&json).unwrap();
    assert_eq!(back, fp);
}
