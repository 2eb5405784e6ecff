// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

/// Configuration of the local execution backend.
#[derive(Clone, Debug)]
pub struct LocalExecutionConfig {
    /// Prefix prepended to every spawned command line. The default runs the
    /// command through `env --`, which gives a PATH lookup of the program
    /// without involving a shell.
    pub launcher: Vec<String>,
}

impl Default for LocalExecutionConfig {
    fn default() -> Self {
        LocalExecutionConfig {
            launcher: vec!["env".to_owned(), "--".to_owned()],
        }
    }
}
