// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::cmp::Ordering;

use common::ObjectType;
use hashing::{Digest, Fingerprint, HashFunction, HashType};
use prost::Message;
use protos::gen::build::bazel::remote::execution::v2 as remexec;

/// One child of a directory manifest.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeEntry {
    pub name: String,
    pub digest: Digest,
    pub object_type: ObjectType,
    /// Symlink target, for symlink entries in the compatible format (which
    /// carries targets inline rather than as blobs).
    pub target: Option<String>,
}

impl TreeEntry {
    pub fn new(name: String, digest: Digest, object_type: ObjectType) -> TreeEntry {
        TreeEntry {
            name,
            digest,
            object_type,
            target: None,
        }
    }

    pub fn symlink(name: String, digest: Digest, target: String) -> TreeEntry {
        TreeEntry {
            name,
            digest,
            object_type: ObjectType::Symlink,
            target: Some(target),
        }
    }
}

/// Git orders tree entries byte-wise by name, with directory names compared
/// as if they had a trailing slash.
fn git_entry_order(a: &TreeEntry, b: &TreeEntry) -> Ordering {
    let a_name = a.name.as_bytes();
    let b_name = b.name.as_bytes();
    let common = a_name.len().min(b_name.len());
    match a_name[..common].cmp(&b_name[..common]) {
        Ordering::Equal => {}
        other => return other,
    }
    let suffix = |entry: &TreeEntry, name: &[u8]| -> u8 {
        match name.get(common) {
            Some(byte) => *byte,
            None if entry.object_type.is_tree() => b'/',
            None => 0,
        }
    };
    suffix(a, a_name).cmp(&suffix(b, b_name))
}

/// Serialize directory entries in the format of the active family: a Git
/// tree object in native mode, a canonical `Directory` message otherwise.
/// Returns the serialized bytes and their tree digest.
pub fn serialize_entries(
    hash_function: HashFunction,
    mut entries: Vec<TreeEntry>,
) -> Result<(Vec<u8>, Digest), String> {
    for entry in &entries {
        if entry.name.is_empty() || entry.name.contains('/') || entry.name == "." {
            return Err(format!("Invalid tree entry name {:?}", entry.name));
        }
    }

    let bytes = match hash_function.hash_type() {
        HashType::Native => {
            entries.sort_by(git_entry_order);
            let mut out = Vec::new();
            for entry in &entries {
                if entry.digest.hash.len() != HashType::Native.fingerprint_size() {
                    return Err(format!(
                        "Tree entry {:?} carries a digest of the wrong family",
                        entry.name
                    ));
                }
                out.extend_from_slice(format!("{:o} ", entry.object_type.mode()).as_bytes());
                out.extend_from_slice(entry.name.as_bytes());
                out.push(0);
                out.extend_from_slice(entry.digest.hash.as_bytes());
            }
            out
        }
        HashType::Compatible => {
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            let mut directory = remexec::Directory::default();
            for entry in entries {
                match entry.object_type {
                    ObjectType::File | ObjectType::Executable => {
                        directory.files.push(remexec::FileNode {
                            name: entry.name,
                            digest: Some(protos::digest_to_proto(&entry.digest)),
                            is_executable: entry.object_type.is_executable(),
                        });
                    }
                    ObjectType::Tree => {
                        directory.directories.push(remexec::DirectoryNode {
                            name: entry.name,
                            digest: Some(protos::digest_to_proto(&entry.digest)),
                        });
                    }
                    ObjectType::Symlink => {
                        let target = entry.target.ok_or_else(|| {
                            format!("Symlink entry {:?} without target", entry.name)
                        })?;
                        directory.symlinks.push(remexec::SymlinkNode {
                            name: entry.name,
                            target,
                        });
                    }
                }
            }
            directory.encode_to_vec()
        }
    };

    let digest = hash_function.hash_tree_data(&bytes);
    Ok((bytes, digest))
}

/// Parse a serialized directory manifest of the active family.
pub fn parse_entries(
    hash_function: HashFunction,
    bytes: &[u8],
) -> Result<Vec<TreeEntry>, String> {
    match hash_function.hash_type() {
        HashType::Native => parse_git_tree(bytes),
        HashType::Compatible => {
            let directory = remexec::Directory::decode(bytes)
                .map_err(|e| format!("Invalid directory message: {e}"))?;
            parse_directory(hash_function, &directory)
        }
    }
}

/// Convert a decoded `Directory` message into tree entries.
pub fn parse_directory(
    hash_function: HashFunction,
    directory: &remexec::Directory,
) -> Result<Vec<TreeEntry>, String> {
    let hash_type = hash_function.hash_type();
    let mut entries = Vec::with_capacity(
        directory.files.len() + directory.directories.len() + directory.symlinks.len(),
    );
    for file in &directory.files {
        let digest = protos::require_digest(file.digest.as_ref(), false, hash_type)?;
        let object_type = if file.is_executable {
            ObjectType::Executable
        } else {
            ObjectType::File
        };
        entries.push(TreeEntry::new(file.name.clone(), digest, object_type));
    }
    for dir in &directory.directories {
        let digest = protos::require_digest(dir.digest.as_ref(), true, hash_type)?;
        entries.push(TreeEntry::new(dir.name.clone(), digest, ObjectType::Tree));
    }
    for symlink in &directory.symlinks {
        // The digest of a symlink node is that of a blob holding the target,
        // which is how the native format stores it; carrying it here keeps
        // the two representations interchangeable.
        let digest = hash_function.hash_blob_data(symlink.target.as_bytes());
        entries.push(TreeEntry::symlink(
            symlink.name.clone(),
            digest,
            symlink.target.clone(),
        ));
    }
    Ok(entries)
}

fn parse_git_tree(bytes: &[u8]) -> Result<Vec<TreeEntry>, String> {
    const RAW_SHA1_LEN: usize = 20;
    let mut entries = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let space = rest
            .iter()
            .position(|b| *b == b' ')
            .ok_or("Malformed git tree: missing mode terminator")?;
        let mode_str = std::str::from_utf8(&rest[..space])
            .map_err(|_| "Malformed git tree: non-UTF-8 mode")?;
        let mode = u32::from_str_radix(mode_str, 8)
            .map_err(|_| format!("Malformed git tree: bad mode {mode_str:?}"))?;
        rest = &rest[space + 1..];

        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or("Malformed git tree: missing name terminator")?;
        let name = std::str::from_utf8(&rest[..nul])
            .map_err(|_| "Malformed git tree: non-UTF-8 name")?
            .to_owned();
        rest = &rest[nul + 1..];

        if rest.len() < RAW_SHA1_LEN {
            return Err("Malformed git tree: truncated entry hash".to_owned());
        }
        let hash = Fingerprint::from_bytes(&rest[..RAW_SHA1_LEN])?;
        rest = &rest[RAW_SHA1_LEN..];

        let object_type = ObjectType::from_mode(mode)?;
        // Git trees record no sizes; zero means "unknown", which native-mode
        // readers accept.
        entries.push(TreeEntry::new(
            name,
            Digest::new(hash, 0, object_type.is_tree()),
            object_type,
        ));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use common::ObjectType;
    use hashing::{HashFunction, HashType};

    use super::{parse_entries, serialize_entries, TreeEntry};

    fn native() -> HashFunction {
        HashFunction::new(HashType::Native)
    }

    fn compatible() -> HashFunction {
        HashFunction::new(HashType::Compatible)
    }

    #[test]
    fn native_round_trip() {
        let blob = native().hash_blob_data(b"content");
        let subtree = native().hash_tree_data(b"");
        let entries = vec![
            TreeEntry::new("b.txt".to_owned(), blob, ObjectType::File),
            TreeEntry::new("a".to_owned(), subtree, ObjectType::Tree),
            TreeEntry::new("c".to_owned(), blob, ObjectType::Executable),
        ];
        let (bytes, digest) = serialize_entries(native(), entries).unwrap();
        assert!(digest.is_tree);

        let parsed = parse_entries(native(), &bytes).unwrap();
        let names: Vec<_> = parsed.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b.txt", "c"]);
        assert_eq!(parsed[0].object_type, ObjectType::Tree);
        assert_eq!(parsed[0].digest.hash, subtree.hash);
        // Git trees carry no sizes.
        assert_eq!(parsed[0].digest.size_bytes, 0);
        assert_eq!(parsed[2].object_type, ObjectType::Executable);
    }

    #[test]
    fn native_empty_tree_matches_git() {
        let (bytes, digest) = serialize_entries(native(), vec![]).unwrap();
        assert!(bytes.is_empty());
        assert_eq!(
            digest.hash.to_hex(),
            "4b825dc642cb6eb9a060e54bf8d69288fbee4904",
        );
    }

    #[test]
    fn git_orders_directories_with_trailing_slash() {
        // "foo" (tree) sorts after "foo.bar" (file) in git ordering, because
        // it compares as "foo/".
        let blob = native().hash_blob_data(b"");
        let tree = native().hash_tree_data(b"");
        let entries = vec![
            TreeEntry::new("foo".to_owned(), tree, ObjectType::Tree),
            TreeEntry::new("foo.bar".to_owned(), blob, ObjectType::File),
        ];
        let (bytes, _) = serialize_entries(native(), entries).unwrap();
        let parsed = parse_entries(native(), &bytes).unwrap();
        assert_eq!(parsed[0].name, "foo.bar");
        assert_eq!(parsed[1].name, "foo");
    }

    #[test]
    fn compatible_round_trip_with_symlink() {
        let blob = compatible().hash_blob_data(b"content");
        let entries = vec![
            TreeEntry::new("file".to_owned(), blob, ObjectType::File),
            TreeEntry::symlink(
                "link".to_owned(),
                compatible().hash_blob_data(b"file"),
                "file".to_owned(),
            ),
        ];
        let (bytes, digest) = serialize_entries(compatible(), entries).unwrap();
        assert_eq!(digest, compatible().hash_tree_data(&bytes));

        let parsed = parse_entries(compatible(), &bytes).unwrap();
        let link = parsed.iter().find(|e| e.name == "link").unwrap();
        assert_eq!(link.object_type, ObjectType::Symlink);
        assert_eq!(link.target.as_deref(), Some("file"));
    }

    #[test]
    fn rejects_invalid_names() {
        let blob = native().hash_blob_data(b"");
        for name in ["", "a/b", "."] {
            let entries = vec![TreeEntry::new(name.to_owned(), blob, ObjectType::File)];
            assert!(serialize_entries(native(), entries).is_err(), "{name:?}");
        }
    }

    #[test]
    fn rejects_cross_family_digests() {
        let wide = compatible().hash_blob_data(b"x");
        let entries = vec![TreeEntry::new("f".to_owned(), wide, ObjectType::File)];
        assert!(serialize_entries(native(), entries).is_err());
    }
}
