// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

//! Kernel-bound I/O channels (§4.5) and the bidirectional protocol stack
//! (§4.6) built on top of the flow graph.

pub mod kernel;
pub mod transports;

pub use kernel::{KInput, KOutput};
pub use transports::{Layer, Polarity, Transports};
