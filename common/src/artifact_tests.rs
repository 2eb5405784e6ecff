// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::PathBuf;

use hashing::{HashFunction, HashType};

use crate::{Artifact, ArtifactDescription, ObjectType};

fn native() -> HashFunction {
    HashFunction::new(HashType::Native)
}

#[test]
fn identical_descriptions_have_identical_ids() {
    let a = ArtifactDescription::Local {
        path: PathBuf::from("src/main.rs"),
        repository: "".to_owned(),
    };
    let b = ArtifactDescription::Local {
        path: PathBuf::from("src/main.rs"),
        repository: "".to_owned(),
    };
    assert_eq!(a.id(native()), b.id(native()));
}

#[test]
fn different_descriptions_have_different_ids() {
    let local = ArtifactDescription::Local {
        path: PathBuf::from("src/main.rs"),
        repository: "".to_owned(),
    };
    let action = ArtifactDescription::Action {
        action_id: "action0".to_owned(),
        path: PathBuf::from("src/main.rs"),
    };
    assert_ne!(local.id(native()), action.id(native()));
}

#[test]
fn known_artifacts_are_stamped_at_construction() {
    let digest = native().hash_blob_data(b"test");
    let description = ArtifactDescription::Known {
        digest,
        object_type: ObjectType::File,
    };
    let artifact = Artifact::new(description.id(native()), description);
    let info = artifact.info().unwrap();
    assert_eq!(info.digest, digest);
    assert_eq!(info.object_type, ObjectType::File);
    assert!(!info.failed);
}

#[test]
fn object_info_is_stamped_once() {
    let description = ArtifactDescription::Action {
        action_id: "action0".to_owned(),
        path: PathBuf::from("out"),
    };
    let artifact = Artifact::new(description.id(native()), description);
    assert!(artifact.info().is_none());

    let first = native().hash_blob_data(b"first");
    let second = native().hash_blob_data(b"second");
    artifact.set_object_info(first, ObjectType::File, false);
    artifact.set_object_info(second, ObjectType::File, true);
    assert_eq!(artifact.info().unwrap().digest, first);
    assert!(!artifact.info().unwrap().failed);
}
