// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::io::Write;
use std::path::{Path, PathBuf};

/// What happens when two writers race on the same entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreMode {
    /// First thread to stage the conflicting file wins. Used for CAS content,
    /// where every writer stages identical bytes.
    FirstWins,
    /// Last thread to stage the conflicting file wins, overwriting existing
    /// entries. Used only for cache entries, which may legitimately change.
    LastWins,
}

/// A sharded file store under a root directory: content identified by hex
/// string `h` lives at `root/h[0..2]/h[2..]`, the same sharding git uses.
///
/// All insertions are atomic: content is staged to a unique sibling temp file
/// and then linked or renamed into place, so readers never observe partial
/// writes and racing writers all report success.
#[derive(Clone, Debug)]
pub struct FileStore {
    root: PathBuf,
    mode: StoreMode,
    executable: bool,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(root: P, mode: StoreMode, executable: bool) -> FileStore {
        FileStore {
            root: root.as_ref().to_owned(),
            mode,
            executable,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The storage path of the entry with the given hex id.
    pub fn entry_path(&self, id: &str) -> PathBuf {
        debug_assert!(id.len() > 2);
        self.root.join(&id[..2]).join(&id[2..])
    }

    pub fn has_entry(&self, id: &str) -> bool {
        self.entry_path(id).is_file()
    }

    /// Add an entry from a byte buffer. Returns Ok if the entry exists
    /// afterwards, regardless of which racing writer staged it.
    pub fn add_from_bytes(&self, id: &str, bytes: &[u8]) -> Result<(), String> {
        let entry = self.entry_path(id);
        if self.mode == StoreMode::FirstWins && entry.is_file() {
            return Ok(());
        }
        let parent = self.create_parent(&entry)?;

        let mut temp = tempfile::Builder::new()
            .suffix(".tmp")
            .tempfile_in(parent)
            .map_err(|e| format!("Failed to create temp file below {}: {e}", parent.display()))?;
        temp.write_all(bytes)
            .map_err(|e| format!("Failed to write {}: {e}", entry.display()))?;
        // Flush and close before the entry becomes visible: stored
        // executables must never be reachable through a still-open writable
        // descriptor that a spawned action could inherit.
        temp.as_file()
            .sync_all()
            .map_err(|e| format!("Failed to sync {}: {e}", entry.display()))?;
        self.set_entry_permissions(temp.path())?;
        let (file, temp_path) = temp
            .keep()
            .map_err(|e| format!("Failed to keep temp file: {e}"))?;
        drop(file);
        self.stage(&temp_path, &entry)
    }

    /// Add an entry from a source file, by hardlink where the caller owns the
    /// source (e.g. a file generated in an execution directory), else by copy
    /// plus atomic rename.
    pub fn add_from_file(&self, id: &str, src: &Path, is_owner: bool) -> Result<(), String> {
        let entry = self.entry_path(id);
        if self.mode == StoreMode::FirstWins && entry.is_file() {
            return Ok(());
        }
        let parent = self.create_parent(&entry)?;

        if is_owner && self.mode == StoreMode::FirstWins {
            // Entry does not exist and we own the source: link it directly,
            // or accept that a racing writer staged it by now.
            match std::fs::hard_link(src, &entry) {
                Ok(()) => {
                    self.set_entry_permissions(&entry)?;
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(()),
                Err(e) => {
                    log::debug!(
                        "Hardlink {} -> {} failed ({e}), falling back to copy",
                        src.display(),
                        entry.display(),
                    );
                }
            }
            if entry.is_file() {
                return Ok(());
            }
        }

        let mut temp = tempfile::Builder::new()
            .suffix(".tmp")
            .tempfile_in(parent)
            .map_err(|e| format!("Failed to create temp file below {}: {e}", parent.display()))?;
        let mut reader = std::fs::File::open(src)
            .map_err(|e| format!("Failed to open {}: {e}", src.display()))?;
        std::io::copy(&mut reader, temp.as_file_mut())
            .map_err(|e| format!("Failed to copy {} into store: {e}", src.display()))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| format!("Failed to sync {}: {e}", entry.display()))?;
        self.set_entry_permissions(temp.path())?;
        let (file, temp_path) = temp
            .keep()
            .map_err(|e| format!("Failed to keep temp file: {e}"))?;
        drop(file);
        self.stage(&temp_path, &entry)
    }

    /// Remove an entry, reporting whether it existed.
    pub fn remove(&self, id: &str) -> Result<bool, String> {
        match std::fs::remove_file(self.entry_path(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(format!("Failed to remove entry {id}: {e}")),
        }
    }

    fn create_parent<'a>(&self, entry: &'a Path) -> Result<&'a Path, String> {
        let parent = entry.parent().expect("sharded entries have parents");
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
        Ok(parent)
    }

    fn set_entry_permissions(&self, path: &Path) -> Result<(), String> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = if self.executable { 0o555 } else { 0o444 };
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                .map_err(|e| format!("Failed to set permissions on {}: {e}", path.display()))?;
        }
        Ok(())
    }

    /// Move the staged temp file into place per the store mode.
    fn stage(&self, src: &Path, dst: &Path) -> Result<(), String> {
        match self.mode {
            StoreMode::FirstWins => {
                // link(2) never clobbers, unlike rename(2): the first
                // completed link wins and everyone else sees EEXIST.
                let result = match std::fs::hard_link(src, dst) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
                    Err(e) => Err(format!(
                        "Failed to stage entry {}: {e}",
                        dst.display()
                    )),
                };
                let _ = std::fs::remove_file(src);
                result
            }
            StoreMode::LastWins => std::fs::rename(src, dst)
                .map_err(|e| format!("Failed to stage entry {}: {e}", dst.display())),
        }
    }
}
