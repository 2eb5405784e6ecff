// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::Path;

use crate::{FileRoot, RepositoryConfig};

#[test]
fn filesystem_root_reads_files_and_exec_bits() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("plain"), b"content").unwrap();
    std::fs::write(dir.path().join("tool"), b"#!/bin/sh\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(
            dir.path().join("tool"),
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();
    }

    let root = FileRoot::Filesystem(dir.path().to_owned());
    let plain = root.read_file(Path::new("plain")).unwrap();
    assert_eq!(plain.content, b"content");
    assert!(!plain.is_executable);

    #[cfg(unix)]
    {
        let tool = root.read_file(Path::new("tool")).unwrap();
        assert!(tool.is_executable);
    }

    assert!(root.read_file(Path::new("missing")).is_err());
}

#[test]
fn repository_config_maps_names_to_roots() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = RepositoryConfig::new();
    assert!(config.root("main").is_none());
    config.add_root("main".to_owned(), FileRoot::Filesystem(dir.path().to_owned()));
    assert!(config.root("main").is_some());
}
