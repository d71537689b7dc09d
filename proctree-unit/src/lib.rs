// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

//! The root of a processor tree (§4.11): `Unit`'s address-keyed namespace
//! and fault sink, the `Ports` kernel descriptor table it conventionally
//! exposes at `dev/ports`, and `accept_subflows`, the assembly helper that
//! turns one accepted connection into a wired sub-flow multiplexer pair.

pub mod ports;
pub mod subflows;
pub mod unit;

pub use ports::Ports;
pub use subflows::{accept_subflows, Subflows, PRIMARY_LAYER};
pub use unit::{Address, RootInitializer, Unit, UnitAtExit};
