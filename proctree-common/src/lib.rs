// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

//! Shared vocabulary for the processor-tree runtime: the error taxonomy,
//! environment-driven configuration, endpoint value types, and a couple of
//! small extension traits used throughout the other `proctree-*` crates.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod logging;

use std::sync::{Mutex, MutexGuard};

pub use config::Config;
pub use endpoint::Endpoint;
pub use error::{Result, RuntimeError};

/// Extension trait providing `lock_or_panic`: avoids
/// sprinkling `#[allow(clippy::unwrap_used)]` across call sites that treat
/// mutex poisoning (an already-fatal bug) as fatal rather than threading
/// `PoisonError` through every caller.
pub trait MutexExt<T> {
    fn lock_or_panic(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[inline(always)]
    #[track_caller]
    fn lock_or_panic(&self) -> MutexGuard<'_, T> {
        #[allow(clippy::unwrap_used)]
        self.lock().unwrap()
    }
}

/// Monotonic identifier allocator used for placement keys, task ids, and
/// layer handles. Not `Copy` across crates on purpose: each domain defines
/// its own newtype wrapping a `u64` drawn from one of these.
#[derive(Debug, Default)]
pub struct IdSequence(std::sync::atomic::AtomicU64);

impl IdSequence {
    pub const fn new() -> Self {
        IdSequence(std::sync::atomic::AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_sequence_is_monotonic_and_nonzero() {
        let seq = IdSequence::new();
        let a = seq.next();
        let b = seq.next();
        assert!(a > 0);
        assert!(b > a);
    }

    #[test]
    fn lock_or_panic_returns_guard() {
        let m = Mutex::new(5);
        *m.lock_or_panic() += 1;
        assert_eq!(*m.lock_or_panic(), 6);
    }
}
