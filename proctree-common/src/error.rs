// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The error taxonomy described by the fault-handling design: a processor
//! faults by reporting one of these into its `exceptions` set, never by
//! panicking or silently swallowing the failure.

use std::fmt;
use std::time::Instant;

/// Crate-wide result alias. Every fallible public operation in the
/// processor-tree runtime returns this rather than a bespoke error type per
/// module, so callers crossing crate boundaries don't need per-crate `From`
/// impls.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// The identity of whatever was implicated in a fault, e.g. a processor's
/// placement path or a layer handle. Kept as a plain string so this crate
/// does not need to know about `proctree-core`'s `Processor` type.
pub type Association = String;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// A processor step raised during actuation, processing, or
    /// termination. Reported via `Processor::fault`; the processor is
    /// placed under the Unit's `faults/` tree and its sector is
    /// interrupted.
    #[error("fault in {assoc}: {source}")]
    Fault {
        assoc: Association,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// A deadline or rate constraint was violated.
    #[error("expiry: {constraint} was not met by {at:?}")]
    Expiry { constraint: String, at: Instant },

    /// The peer closed, or a protocol layer terminated. This is propagated
    /// as ordinary downstream termination, not routed through `fault`; the
    /// variant exists so call sites that need to distinguish "the stream
    /// ended" from "the stream broke" have a typed signal to match on.
    #[error("transport shut down")]
    TransportShutdown,

    /// Binding an endpoint over a filesystem entry that isn't a socket.
    #[error("port conflict on slot {slot:?}: {endpoint} is not a free socket path")]
    PortConflict { slot: String, endpoint: String },

    /// Transports detected unreachable opposite-side work while the input
    /// polarity was terminating: the drain recursion bound (§4.6, §9) was
    /// exhausted without the stack settling.
    #[error("transport stack deadlock at recursion depth {depth}")]
    StackDeadlock { depth: usize },

    /// IO failure surfaced from a kernel-bound channel or the ports device.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    pub fn fault(
        assoc: impl Into<Association>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        RuntimeError::Fault {
            assoc: assoc.into(),
            source: Box::new(source),
        }
    }

    pub fn fault_msg(assoc: impl Into<Association>, message: impl fmt::Display) -> Self {
        RuntimeError::fault(assoc, AdHoc(message.to_string()))
    }

    /// Whether this error is categorically a fault (programming error) as
    /// opposed to an expected shutdown/expiry condition.
    pub fn is_fault(&self) -> bool {
        matches!(self, RuntimeError::Fault { .. } | RuntimeError::StackDeadlock { .. })
    }
}

#[derive(Debug)]
struct AdHoc(String);

impl fmt::Display for AdHoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for AdHoc {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_msg_is_a_fault() {
        let e = RuntimeError::fault_msg("bin/worker", "divide by zero");
        assert!(e.is_fault());
        assert_eq!(
            e.to_string(),
            "fault in bin/worker: divide by zero"
        );
    }

    #[test]
    fn transport_shutdown_is_not_a_fault() {
        assert!(!RuntimeError::TransportShutdown.is_fault());
    }
}
