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

use std::fmt;
use std::io::{self, Read, Write};

use serde::de::Visitor;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde::{Deserialize, Deserializer};
use digest::Digest as DigestImpl;
use sha1::Sha1;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The widest fingerprint we ever produce (SHA-256).
pub const MAX_FINGERPRINT_SIZE: usize = 32;

const SHA1_SIZE: usize = 20;
const SHA256_SIZE: usize = 32;

/// The process-wide choice of hash family.
///
/// `Native` hashes blobs and trees the way Git does (with a `"<tag> <size>\0"`
/// prefix, SHA-1), which makes every stored object directly exchangeable with
/// a Git object database. `Compatible` uses plain SHA-256 over the payload for
/// blobs and trees alike, matching what stock remote-execution services
/// expect. The choice is made once at startup and never changes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HashType {
    Native,
    Compatible,
}

impl HashType {
    pub fn fingerprint_size(&self) -> usize {
        match self {
            HashType::Native => SHA1_SIZE,
            HashType::Compatible => SHA256_SIZE,
        }
    }

    /// Length of the hex rendering of a fingerprint of this family.
    pub fn hex_len(&self) -> usize {
        self.fingerprint_size() * 2
    }

    pub fn is_native(&self) -> bool {
        matches!(self, HashType::Native)
    }
}

///
/// A fingerprint: the raw hash bytes of one of the two families. The width is
/// carried alongside the bytes so that digests of both families share one
/// type; all comparisons are over the significant bytes.
///
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct Fingerprint {
    bytes: [u8; MAX_FINGERPRINT_SIZE],
    len: u8,
}

impl Fingerprint {
    pub fn from_bytes(bytes: &[u8]) -> Result<Fingerprint, String> {
        if bytes.len() != SHA1_SIZE && bytes.len() != SHA256_SIZE {
            return Err(format!(
                "Input value was not a fingerprint; had length: {}",
                bytes.len()
            ));
        }
        let mut buf = [0; MAX_FINGERPRINT_SIZE];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Fingerprint {
            bytes: buf,
            len: bytes.len() as u8,
        })
    }

    pub fn from_hex_string(hex_string: &str) -> Result<Fingerprint, String> {
        let bytes = hex::decode(hex_string).map_err(|e| format!("{e:?}"))?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[allow(clippy::wrong_self_convention)]
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl std::hash::Hash for Fingerprint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint<{}>", self.to_hex())
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Fingerprint::from_hex_string(s)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.to_hex().as_str())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FingerprintVisitor;

        impl Visitor<'_> for FingerprintVisitor {
            type Value = Fingerprint;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> Result<(), fmt::Error> {
                formatter.write_str("a hex-encoded fingerprint")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Fingerprint::from_hex_string(v).map_err(|err| {
                    serde::de::Error::invalid_value(
                        serde::de::Unexpected::Str(&format!("{v:?}: {err}")),
                        &"a hex representation of a SHA-1 or SHA-256 value",
                    )
                })
            }
        }

        deserializer.deserialize_str(FingerprintVisitor)
    }
}

///
/// A Digest identifies content: the fingerprint of the content, its size in
/// bytes, and whether the content is a tree object or a blob.
///
/// It carries the same information as a remote-execution Digest plus the
/// blob/tree distinction, which the wire protocol encodes positionally but
/// the storage layers need explicitly (trees live in their own store area in
/// native mode and must never be looked up as blobs).
///
/// A `size_bytes` of zero on a non-empty object means "size unknown"; it is
/// accepted on read paths in native mode only, where the hash alone
/// identifies the object.
///
/// Note that only the fingerprint feeds the `Hash` impl: digests are used as
/// map keys, and the size and tree flag are redundant for that purpose.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Digest {
    pub hash: Fingerprint,
    pub size_bytes: usize,
    pub is_tree: bool,
}

impl std::hash::Hash for Digest {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl Digest {
    pub fn new(hash: Fingerprint, size_bytes: usize, is_tree: bool) -> Digest {
        Digest {
            hash,
            size_bytes,
            is_tree,
        }
    }

    ///
    /// Reconstruct a digest from externally supplied parts, validating that
    /// the hex string is well formed for the family.
    ///
    pub fn from_known(
        hex_string: &str,
        size_bytes: usize,
        is_tree: bool,
        hash_type: HashType,
    ) -> Result<Digest, String> {
        if hex_string.len() != hash_type.hex_len() {
            return Err(format!(
                "Invalid digest: got {} hex characters, but {:?} digests have {}",
                hex_string.len(),
                hash_type,
                hash_type.hex_len(),
            ));
        }
        let hash = Fingerprint::from_hex_string(hex_string)?;
        Ok(Digest::new(hash, size_bytes, is_tree))
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut obj = serializer.serialize_struct("digest", 3)?;
        obj.serialize_field("fingerprint", &self.hash)?;
        obj.serialize_field("size_bytes", &self.size_bytes)?;
        obj.serialize_field("is_tree", &self.is_tree)?;
        obj.end()
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RawDigest {
            fingerprint: Fingerprint,
            size_bytes: usize,
            #[serde(default)]
            is_tree: bool,
        }
        let raw = RawDigest::deserialize(deserializer)?;
        Ok(Digest::new(raw.fingerprint, raw.size_bytes, raw.is_tree))
    }
}

enum HasherKind {
    Sha1(Sha1),
    Sha256(Sha256),
}

///
/// An incremental hasher for one of the two families. For the Git-framed
/// cases the object-size prefix has already been fed in by the constructor,
/// so feeding the payload and calling `finish` yields the framed hash.
///
pub struct Hasher {
    kind: HasherKind,
    byte_count: usize,
}

impl Hasher {
    fn new(hash_type: HashType) -> Hasher {
        let kind = match hash_type {
            HashType::Native => HasherKind::Sha1(Sha1::default()),
            HashType::Compatible => HasherKind::Sha256(Sha256::default()),
        };
        Hasher {
            kind,
            byte_count: 0,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match &mut self.kind {
            HasherKind::Sha1(h) => DigestImpl::update(h, bytes),
            HasherKind::Sha256(h) => DigestImpl::update(h, bytes),
        }
        self.byte_count += bytes.len();
    }

    /// The number of payload bytes hashed so far (excluding any framing).
    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    pub fn finish(self) -> Fingerprint {
        let fingerprint = match self.kind {
            HasherKind::Sha1(h) => Fingerprint::from_bytes(&DigestImpl::finalize(h)),
            HasherKind::Sha256(h) => Fingerprint::from_bytes(&DigestImpl::finalize(h)),
        };
        fingerprint.expect("hash output width is fixed")
    }
}

///
/// The hash function in effect for the whole process. Carried by value into
/// every component that hashes; the two instances only differ in `HashType`.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HashFunction {
    hash_type: HashType,
}

impl HashFunction {
    pub fn new(hash_type: HashType) -> HashFunction {
        HashFunction { hash_type }
    }

    pub fn hash_type(&self) -> HashType {
        self.hash_type
    }

    /// Hasher for blob content of the given payload length.
    pub fn blob_hasher(&self, payload_len: usize) -> Hasher {
        self.tagged_hasher("blob", payload_len)
    }

    /// Hasher for tree content of the given payload length.
    pub fn tree_hasher(&self, payload_len: usize) -> Hasher {
        self.tagged_hasher("tree", payload_len)
    }

    /// Hasher for internal keys: no framing in either family.
    pub fn plain_hasher(&self) -> Hasher {
        Hasher::new(self.hash_type)
    }

    fn tagged_hasher(&self, tag: &str, payload_len: usize) -> Hasher {
        let mut hasher = Hasher::new(self.hash_type);
        if self.hash_type.is_native() {
            let mut header = Vec::with_capacity(tag.len() + 24);
            header.extend_from_slice(tag.as_bytes());
            header.push(b' ');
            header.extend_from_slice(payload_len.to_string().as_bytes());
            header.push(0);
            match &mut hasher.kind {
                HasherKind::Sha1(h) => DigestImpl::update(h, &header),
                HasherKind::Sha256(h) => DigestImpl::update(h, &header),
            }
        }
        hasher
    }

    pub fn hash_blob_data(&self, data: &[u8]) -> Digest {
        let mut hasher = self.blob_hasher(data.len());
        hasher.update(data);
        Digest::new(hasher.finish(), data.len(), false)
    }

    pub fn hash_tree_data(&self, data: &[u8]) -> Digest {
        let mut hasher = self.tree_hasher(data.len());
        hasher.update(data);
        Digest::new(hasher.finish(), data.len(), true)
    }

    pub fn plain_hash_data(&self, data: &[u8]) -> Fingerprint {
        let mut hasher = self.plain_hasher();
        hasher.update(data);
        hasher.finish()
    }

    /// Hash a file as a blob without loading it into memory.
    pub fn hash_blob_file(&self, path: &std::path::Path) -> io::Result<Digest> {
        self.hash_tagged_file(path, false)
    }

    /// Hash a file holding tree content without loading it into memory.
    pub fn hash_tree_file(&self, path: &std::path::Path) -> io::Result<Digest> {
        self.hash_tagged_file(path, true)
    }

    fn hash_tagged_file(&self, path: &std::path::Path, is_tree: bool) -> io::Result<Digest> {
        let file = std::fs::File::open(path)?;
        let len = file.metadata()?.len() as usize;
        let mut hasher = if is_tree {
            self.tree_hasher(len)
        } else {
            self.blob_hasher(len)
        };
        let mut reader = io::BufReader::new(file);
        let mut buf = [0_u8; 65536];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        if hasher.byte_count() != len {
            return Err(io::Error::other(format!(
                "{} changed size while hashing (expected {len}, read {})",
                path.display(),
                hasher.byte_count(),
            )));
        }
        Ok(Digest::new(hasher.finish(), len, is_tree))
    }

    pub fn empty_blob_digest(&self) -> Digest {
        self.hash_blob_data(b"")
    }

    pub fn empty_tree_digest(&self) -> Digest {
        self.hash_tree_data(b"")
    }
}

///
/// Copy `expected_digest.size_bytes` bytes from reader to writer, hashing
/// them per the blob rules of `hash_function`, and return whether the copied
/// data matches the expected digest. When the data is known to be immutable,
/// only its length is validated.
///
pub async fn async_verified_copy<R, W>(
    expected_digest: Digest,
    data_is_immutable: bool,
    hash_function: HashFunction,
    reader: &mut R,
    writer: &mut W,
) -> io::Result<bool>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    if data_is_immutable {
        // Trust that the data hasn't changed, and only validate its length.
        let copied = tokio::io::copy(reader, writer).await?;
        return Ok(copied as usize == expected_digest.size_bytes);
    }

    let mut hasher = if expected_digest.is_tree {
        hash_function.tree_hasher(expected_digest.size_bytes)
    } else {
        hash_function.blob_hasher(expected_digest.size_bytes)
    };
    let mut buf = [0_u8; 65536];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        hasher.update(&buf[..n]);
    }
    Ok(hasher.byte_count() == expected_digest.size_bytes
        && hasher.finish() == expected_digest.hash)
}

///
/// Copy all data from reader to writer and return its blob digest.
///
/// Git framing needs the payload length up front, so the data is staged
/// through an in-memory buffer in native mode; callers with a known length
/// should prefer `hash_blob_file` or a pre-sized `blob_hasher`.
///
pub async fn async_copy_and_hash<R, W>(
    hash_function: HashFunction,
    reader: &mut R,
    writer: &mut W,
) -> io::Result<Digest>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    if hash_function.hash_type().is_native() {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        writer.write_all(&data).await?;
        return Ok(hash_function.hash_blob_data(&data));
    }

    let mut hasher = hash_function.plain_hasher();
    let mut buf = [0_u8; 65536];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        hasher.update(&buf[..n]);
    }
    let size = hasher.byte_count();
    Ok(Digest::new(hasher.finish(), size, false))
}

///
/// A Write adapter that feeds everything written through a plain hasher.
/// Useful for hashing while spooling to disk in compatible mode.
///
pub struct WriterHasher<T> {
    hasher: Hasher,
    inner: T,
}

impl<T> WriterHasher<T> {
    pub fn new(hash_function: HashFunction, inner: T) -> WriterHasher<T> {
        WriterHasher {
            hasher: hash_function.plain_hasher(),
            inner,
        }
    }

    ///
    /// Returns the result of fingerprinting this stream, and Drops the stream.
    ///
    pub fn finish(self) -> (Fingerprint, usize, T) {
        let byte_count = self.hasher.byte_count();
        (self.hasher.finish(), byte_count, self.inner)
    }
}

impl<W: Write> Write for WriterHasher<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        // Hash the bytes that were successfully written.
        self.hasher.update(&buf[0..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod fingerprint_tests;

#[cfg(test)]
mod digest_tests;
