// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

//! OS-process supervision (§4.10): `Subprocess` tracks a set of pids and
//! surfaces their exit through the processor lifecycle; `ProcessManager`
//! is the fixed-concurrency fork-identity worker pool built on top of it.

pub mod process_manager;
pub mod subprocess;

pub use process_manager::{ProcessManager, WorkerCommand, SECTORS_VAR};
pub use subprocess::{ExitOutcome, Subprocess};
