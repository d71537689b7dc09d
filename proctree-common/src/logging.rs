// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One-line `tracing` bootstrap: an `EnvFilter` defaulting to `info`, a
//! compact formatter, installed at most once per process.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install a process-wide `tracing` subscriber reading `RUST_LOG` (default
/// `info`). Idempotent — later calls are no-ops, matching the pattern of a
/// Unit being actuated once per process.
pub fn enable_logging() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}
