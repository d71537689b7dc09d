// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The wire vocabulary shared by `Catenation` and `Division` (§9 "dynamic
//! dispatch by event kind"): a tagged enum with a fixed `match`, not a
//! runtime attribute lookup.

/// Identifies one logical sub-flow multiplexed over a shared channel.
pub type LayerId = u64;

/// One multiplexed protocol event. `Catenation` emits these in reservation
/// order; `Division` consumes them to re-demultiplex into per-layer flows.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FlowEvent {
    Initiate(LayerId),
    Transfer(LayerId, Vec<u8>),
    Terminate(LayerId),
    /// The protocol overran its framing boundary; carries whatever
    /// trailing bytes were salvageable.
    Overflow(Vec<u8>),
    /// A layer on the sending side is backed up; untagged by layer, since
    /// it rides the same overflow feedback Catenation already applies at
    /// the channel level. Crosses the wire so the receiving side can
    /// reflect the slowdown rather than keep assuming steady delivery.
    Obstruct,
    /// The matching release for [`FlowEvent::Obstruct`].
    Clear,
}
