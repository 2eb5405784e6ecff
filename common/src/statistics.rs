// Copyright 2024 Build Core Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicUsize, Ordering};

/// Build-wide counters. Constructed at startup and threaded into the
/// components that report; read once at the end of a build.
#[derive(Debug, Default)]
pub struct Statistics {
    actions_queued: AtomicUsize,
    actions_executed: AtomicUsize,
    actions_cached: AtomicUsize,
    actions_flaky: AtomicUsize,
    actions_flaky_tainted: AtomicUsize,
    rebuilt_actions_compared: AtomicUsize,
    rebuilt_actions_missing: AtomicUsize,
    trees_analysed: AtomicUsize,
}

impl Statistics {
    pub fn new() -> Statistics {
        Statistics::default()
    }

    pub fn increment_actions_queued(&self) {
        self.actions_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_actions_executed(&self) {
        self.actions_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_actions_cached(&self) {
        self.actions_cached.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_actions_flaky(&self) {
        self.actions_flaky.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_actions_flaky_tainted(&self) {
        self.actions_flaky_tainted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rebuilt_actions_compared(&self) {
        self.rebuilt_actions_compared.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rebuilt_actions_missing(&self) {
        self.rebuilt_actions_missing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_trees_analysed(&self) {
        self.trees_analysed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn actions_queued(&self) -> usize {
        self.actions_queued.load(Ordering::Relaxed)
    }

    pub fn actions_executed(&self) -> usize {
        self.actions_executed.load(Ordering::Relaxed)
    }

    pub fn actions_cached(&self) -> usize {
        self.actions_cached.load(Ordering::Relaxed)
    }

    pub fn actions_flaky(&self) -> usize {
        self.actions_flaky.load(Ordering::Relaxed)
    }

    pub fn actions_flaky_tainted(&self) -> usize {
        self.actions_flaky_tainted.load(Ordering::Relaxed)
    }

    pub fn rebuilt_actions_compared(&self) -> usize {
        self.rebuilt_actions_compared.load(Ordering::Relaxed)
    }

    pub fn rebuilt_actions_missing(&self) -> usize {
        self.rebuilt_actions_missing.load(Ordering::Relaxed)
    }

    pub fn trees_analysed(&self) -> usize {
        self.trees_analysed.load(Ordering::Relaxed)
    }
}
