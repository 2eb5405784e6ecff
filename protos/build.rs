// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use prost_build::Config;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    let mut config = Config::new();
    config.bytes(["."]);

    tonic_build::configure()
        .build_client(true)
        .build_server(false)
        .compile_protos_with_config(
            config,
            &[
                "protos/bazel_remote_apis/build/bazel/remote/execution/v2/remote_execution.proto",
                "protos/bazel_remote_apis/build/bazel/semver/semver.proto",
                "protos/googleapis/google/bytestream/bytestream.proto",
                "protos/googleapis/google/rpc/status.proto",
                "protos/googleapis/google/longrunning/operations.proto",
            ],
            &["protos/bazel_remote_apis", "protos/googleapis"],
        )?;

    Ok(())
}
