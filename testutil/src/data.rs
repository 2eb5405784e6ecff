// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use bytes::Bytes;
use hashing::{Digest, HashFunction};

/// Deterministic blob fixtures shared across crate tests.
#[derive(Clone, Debug)]
pub struct TestData {
    string: String,
}

impl TestData {
    pub fn empty() -> TestData {
        TestData::new("")
    }

    pub fn greeting() -> TestData {
        TestData::new("hello build\n")
    }

    pub fn catnip() -> TestData {
        TestData::new("eats evenings, cat snacks\n")
    }

    pub fn script() -> TestData {
        TestData::new("#!/bin/sh\necho -n test\n")
    }

    /// A pseudo-random-looking blob of the given size, for chunking and
    /// streaming-fallback tests. Deterministic for a given size.
    pub fn large(len: usize) -> TestData {
        let mut string = String::with_capacity(len + 16);
        let mut state: u64 = 0x243f_6a88_85a3_08d3;
        while string.len() < len {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            string.push_str(&format!("{state:016x}\n"));
        }
        string.truncate(len);
        TestData { string }
    }

    pub fn new(s: &str) -> TestData {
        TestData {
            string: s.to_owned(),
        }
    }

    pub fn string(&self) -> String {
        self.string.clone()
    }

    pub fn bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.string.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.string.len()
    }

    pub fn digest(&self, hash_function: HashFunction) -> Digest {
        hash_function.hash_blob_data(self.string.as_bytes())
    }
}
