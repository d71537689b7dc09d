// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `Mitre`: the pivot channel between an input chain and an output chain
//! (§2 item 11, §11 glossary). A socket's accepted connection flows in
//! through one [`FlowBase`] side and application replies flow back out
//! through the other; `accept_subflows` (proctree-unit) wires a `Mitre`'s
//! two sides to the `Division`/`Catenation` sub-flow multiplexers it
//! pivots between.

use std::sync::Arc;

use crate::flow::{Flow, FlowBase};

/// Two independently connectable sides sharing a placement: `inbound`
/// carries protocol events up from the accepted socket, `outbound` carries
/// application replies back down to it.
pub struct Mitre<E: Send + 'static> {
    inbound: FlowBase<E>,
    outbound: FlowBase<E>,
}

impl<E: Send + 'static> Mitre<E> {
    pub fn new() -> Arc<Self> {
        Arc::new(Mitre { inbound: FlowBase::new(), outbound: FlowBase::new() })
    }

    /// Accepts an event from the input chain and forwards it to whatever
    /// consumer connected to the inbound side.
    pub fn receive(&self, event: E) {
        self.inbound.emit(event);
    }

    /// Accepts a reply from the application and forwards it to whatever
    /// consumer connected to the outbound side (typically the output
    /// chain's `Catenation`).
    pub fn reply(&self, event: E) {
        self.outbound.emit(event);
    }

    pub fn inbound(&self) -> &FlowBase<E> {
        &self.inbound
    }

    pub fn outbound(&self) -> &FlowBase<E> {
        &self.outbound
    }
}

/// The inbound side, exposed as an ordinary [`Flow`] so `Division` (the
/// demultiplexer feeding application logic) can connect to it directly.
pub struct MitreInbound<E: Send + 'static> {
    mitre: Arc<Mitre<E>>,
}

impl<E: Send + 'static> MitreInbound<E> {
    pub fn new(mitre: Arc<Mitre<E>>) -> Arc<Self> {
        Arc::new(MitreInbound { mitre })
    }
}

impl<E: Send + 'static> Flow<E> for MitreInbound<E> {
    fn base(&self) -> &FlowBase<E> {
        self.mitre.inbound()
    }

    fn process(&self, events: E) {
        self.mitre.receive(events);
    }
}

/// The outbound side, exposed as a [`Flow`] so `Catenation` (the
/// multiplexer feeding the output chain) can connect to it directly.
pub struct MitreOutbound<E: Send + 'static> {
    mitre: Arc<Mitre<E>>,
}

impl<E: Send + 'static> MitreOutbound<E> {
    pub fn new(mitre: Arc<Mitre<E>>) -> Arc<Self> {
        Arc::new(MitreOutbound { mitre })
    }
}

impl<E: Send + 'static> Flow<E> for MitreOutbound<E> {
    fn base(&self) -> &FlowBase<E> {
        self.mitre.outbound()
    }

    fn process(&self, events: E) {
        self.mitre.reply(events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variants::Collection;

    #[test]
    fn inbound_and_outbound_sides_are_independent() {
        let mitre = Mitre::new();
        let from_input = Collection::new();
        let to_output = Collection::new();
        mitre.inbound().watch(Box::new(|_| {}), Box::new(|_| {}));
        let inbound_flow = MitreInbound::new(mitre.clone());
        let outbound_flow = MitreOutbound::new(mitre.clone());
        inbound_flow.f_connect(from_input.clone() as Arc<dyn Flow<&'static str>>);
        outbound_flow.f_connect(to_output.clone() as Arc<dyn Flow<&'static str>>);

        mitre.receive("request");
        mitre.reply("response");

        assert_eq!(from_input.drain(), vec!["request"]);
        assert_eq!(to_output.drain(), vec!["response"]);
    }
}
