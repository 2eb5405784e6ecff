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

mod context;
mod executor;
mod rebuilder;
mod traverse;

pub use context::ExecutionContext;
pub use executor::Executor;
pub use rebuilder::{Rebuilder, RebuildRecord};
pub use traverse::build_artifacts;

/// Process exit codes of embedding binaries: success, failure, and the
/// in-between case where the build completed but produced at least one
/// artifact marked failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuildExitCode {
    Success,
    Failure,
    FailedArtifacts,
}

impl BuildExitCode {
    pub fn code(&self) -> i32 {
        match self {
            BuildExitCode::Success => 0,
            BuildExitCode::Failure => 1,
            BuildExitCode::FailedArtifacts => 2,
        }
    }
}
