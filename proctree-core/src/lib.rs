// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

//! The processor-tree kernel: lifecycle, fault propagation, scheduling and
//! the execution context every other crate in this workspace builds on.

pub mod call;
pub mod condition;
pub mod context;
pub mod processor;
pub mod scheduler;
pub mod sector;

pub use call::{Call, Coroutine, Thread};
pub use condition::Condition;
pub use context::{ExecutionContext, FaultSink, TimerHandle};
pub use processor::{Controller, ExitCallback, Processor, ProcessorBase, ProcessorId, ProcessorState};
pub use scheduler::Scheduler;
pub use sector::Sector;
