// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Minimal `tracing` setup shared by tests across the workspace.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a `tracing` subscriber suitable for `cargo test` output, once per process.
///
/// Tests call this at the top of every `#[test]` fn, mirroring the `testutil::init()`
/// convention used throughout this codebase.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
