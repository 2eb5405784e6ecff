// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use hashing::{Digest, HashFunction};
use prost::Message;
use protos::gen::build::bazel::remote::execution::v2 as remexec;

/// The wire messages describing one action, plus their digests. The digest
/// of the serialized `Action` message is the action fingerprint: the CAS
/// blob with that digest IS the action, and both backends key the action
/// cache by it, so local and remote executions share cache entries.
pub(crate) struct ActionMessages {
    pub action: Bytes,
    pub command: Bytes,
    pub action_digest: Digest,
    #[allow(dead_code)]
    pub command_digest: Digest,
}

pub(crate) fn create_action_messages(
    hash_function: HashFunction,
    root_digest: &Digest,
    command_line: &[String],
    cwd: &str,
    output_files: &[String],
    output_dirs: &[String],
    env: &BTreeMap<String, String>,
    properties: &BTreeMap<String, String>,
    timeout: Duration,
    do_not_cache: bool,
) -> ActionMessages {
    let platform = remexec::Platform {
        // BTreeMap iteration yields the lexicographic order the protocol
        // requires.
        properties: properties
            .iter()
            .map(|(name, value)| remexec::platform::Property {
                name: name.clone(),
                value: value.clone(),
            })
            .collect(),
    };

    let mut sorted_files: Vec<String> = output_files.to_vec();
    sorted_files.sort();
    let mut sorted_dirs: Vec<String> = output_dirs.to_vec();
    sorted_dirs.sort();

    #[allow(deprecated)]
    let command = remexec::Command {
        arguments: command_line.to_vec(),
        environment_variables: env
            .iter()
            .map(|(name, value)| remexec::command::EnvironmentVariable {
                name: name.clone(),
                value: value.clone(),
            })
            .collect(),
        output_files: sorted_files,
        output_directories: sorted_dirs,
        platform: Some(platform.clone()),
        working_directory: cwd.to_owned(),
        output_paths: vec![],
    };
    let command_bytes = Bytes::from(command.encode_to_vec());
    let command_digest = hash_function.hash_blob_data(&command_bytes);

    let action = remexec::Action {
        command_digest: Some(protos::digest_to_proto(&command_digest)),
        input_root_digest: Some(protos::digest_to_proto(root_digest)),
        timeout: Some(prost_types::Duration {
            seconds: timeout.as_secs() as i64,
            nanos: timeout.subsec_nanos() as i32,
        }),
        do_not_cache,
        salt: Bytes::new(),
        platform: Some(platform),
    };
    let action_bytes = Bytes::from(action.encode_to_vec());
    let action_digest = hash_function.hash_blob_data(&action_bytes);

    ActionMessages {
        action: action_bytes,
        command: command_bytes,
        action_digest,
        command_digest,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use hashing::{HashFunction, HashType};

    use super::create_action_messages;

    fn messages(env_value: &str, timeout: Duration) -> super::ActionMessages {
        let hash_function = HashFunction::new(HashType::Compatible);
        let root = hash_function.hash_tree_data(b"");
        let env: BTreeMap<String, String> =
            [("X".to_owned(), env_value.to_owned())].into_iter().collect();
        create_action_messages(
            hash_function,
            &root,
            &["echo".to_owned()],
            "",
            &["out".to_owned()],
            &[],
            &env,
            &BTreeMap::new(),
            timeout,
            false,
        )
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = messages("v", Duration::from_secs(60));
        let b = messages("v", Duration::from_secs(60));
        assert_eq!(a.action_digest, b.action_digest);
        assert_eq!(a.command_digest, b.command_digest);
    }

    #[test]
    fn fingerprint_covers_environment_and_timeout() {
        let base = messages("v", Duration::from_secs(60));
        assert_ne!(
            base.action_digest,
            messages("w", Duration::from_secs(60)).action_digest,
        );
        assert_ne!(
            base.action_digest,
            messages("v", Duration::from_secs(90)).action_digest,
        );
    }
}
