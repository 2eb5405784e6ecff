// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use hashing::Digest;
use serde::{Deserialize, Serialize};

/// The type of a stored object.
///
/// `File` and `Executable` differ only in the permission bits of the stored
/// file. A `Symlink` is stored as a blob whose content is the link target. A
/// `Tree` is a directory manifest and lives in its own storage area in native
/// mode.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    File,
    Executable,
    Symlink,
    Tree,
}

impl ObjectType {
    pub fn is_tree(&self) -> bool {
        matches!(self, ObjectType::Tree)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, ObjectType::Symlink)
    }

    pub fn is_file(&self) -> bool {
        matches!(self, ObjectType::File | ObjectType::Executable)
    }

    pub fn is_executable(&self) -> bool {
        matches!(self, ObjectType::Executable)
    }

    /// The Git tree-entry mode for this type.
    pub fn mode(&self) -> u32 {
        match self {
            ObjectType::File => 0o100644,
            ObjectType::Executable => 0o100755,
            ObjectType::Symlink => 0o120000,
            ObjectType::Tree => 0o040000,
        }
    }

    pub fn from_mode(mode: u32) -> Result<ObjectType, String> {
        match mode {
            0o100644 | 0o100664 => Ok(ObjectType::File),
            0o100755 => Ok(ObjectType::Executable),
            0o120000 => Ok(ObjectType::Symlink),
            0o040000 => Ok(ObjectType::Tree),
            _ => Err(format!("Unsupported tree entry mode {mode:o}")),
        }
    }

    /// Single-character rendering used in object-info strings.
    pub fn as_char(&self) -> char {
        match self {
            ObjectType::File => 'f',
            ObjectType::Executable => 'x',
            ObjectType::Symlink => 'l',
            ObjectType::Tree => 't',
        }
    }
}

/// What is known about a built (or source) object: its digest, its type, and
/// whether the action producing it was allowed to fail and did.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub digest: Digest,
    pub object_type: ObjectType,
    #[serde(default)]
    pub failed: bool,
}

impl ObjectInfo {
    pub fn new(digest: Digest, object_type: ObjectType) -> ObjectInfo {
        ObjectInfo {
            digest,
            object_type,
            failed: false,
        }
    }

    pub fn failed(digest: Digest, object_type: ObjectType) -> ObjectInfo {
        ObjectInfo {
            digest,
            object_type,
            failed: true,
        }
    }
}

impl fmt::Display for ObjectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}:{}:{}{}]",
            self.digest.hash,
            self.digest.size_bytes,
            self.object_type.as_char(),
            if self.failed { " (failed)" } else { "" },
        )
    }
}
