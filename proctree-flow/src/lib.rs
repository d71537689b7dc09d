// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

//! The obstruction-aware flow/channel subsystem (§4.4): connectable event
//! nodes with back-pressure signalling, plus the stock variants built on
//! top of the base.

pub mod flow;
pub mod mitre;
pub mod variants;

pub use flow::{ClearFn, Flow, FlowBase, ObstructFn};
pub use mitre::{Mitre, MitreInbound, MitreOutbound};
pub use variants::{Collection, Funnel, Iteration, Null, Trace, Transformation};
