// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `Transports` (§4.6): a bidirectional pair sharing one layer stack.
//! Events travel down through the stack in one order for the input
//! polarity and the reverse order for output; a layer that produces work
//! for the opposite polarity triggers a bounded recursive drain rather
//! than waiting for the next externally-driven call.
//!
//! Resolves Open Question (b) with the *flows-variant* semantics: an
//! explicit [`Shared::termination_started`] transition is recorded before
//! any per-layer `terminate` is issued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use proctree_common::error::Result;
use proctree_common::{MutexExt, RuntimeError};
use proctree_flow::{Flow, FlowBase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Input,
    Output,
}

impl Polarity {
    fn opposite(self) -> Polarity {
        match self {
            Polarity::Input => Polarity::Output,
            Polarity::Output => Polarity::Input,
        }
    }
}

/// One protocol layer contributed to a `Transports` stack. `xfer`
/// transforms a batch for the given polarity; `opposite_has_work` lets a
/// layer (e.g. a framing codec that just unwrapped a control frame
/// requiring an immediate reply) request a drain of the other side before
/// this call returns.
pub trait Layer: Send + Sync + 'static {
    fn xfer(&self, events: Vec<u8>, polarity: Polarity) -> Vec<u8>;

    fn opposite_has_work(&self) -> bool {
        false
    }

    fn terminate(&self);

    fn is_torn_down(&self) -> bool;
}

struct Shared {
    layers: Mutex<Vec<Arc<dyn Layer>>>,
    termination_started: AtomicBool,
    recursion_cap: usize,
}

/// The bidirectional pair. Both polarities share one `Shared` layer stack
/// but have independent downstream connections and termination state.
pub struct Transports {
    shared: Arc<Shared>,
    input_base: FlowBase<Vec<u8>>,
    output_base: FlowBase<Vec<u8>>,
    input_terminating: AtomicBool,
    output_terminating: AtomicBool,
}

impl Transports {
    pub fn new(recursion_cap: usize) -> Arc<Self> {
        Arc::new(Transports {
            shared: Arc::new(Shared {
                layers: Mutex::new(Vec::new()),
                termination_started: AtomicBool::new(false),
                recursion_cap,
            }),
            input_base: FlowBase::new(),
            output_base: FlowBase::new(),
            input_terminating: AtomicBool::new(false),
            output_terminating: AtomicBool::new(false),
        })
    }

    pub fn push_layer(&self, layer: Arc<dyn Layer>) {
        self.shared.layers.lock_or_panic().push(layer);
    }

    pub fn input(&self) -> &FlowBase<Vec<u8>> {
        &self.input_base
    }

    pub fn output(&self) -> &FlowBase<Vec<u8>> {
        &self.output_base
    }

    pub fn process_input(self: &Arc<Self>, events: Vec<u8>) -> Result<()> {
        self.process(events, Polarity::Input, 0)
    }

    pub fn process_output(self: &Arc<Self>, events: Vec<u8>) -> Result<()> {
        self.process(events, Polarity::Output, 0)
    }

    /// §4.6: mark terminating, signal every layer, flush with an empty
    /// batch; once the stack empties the terminate reaches downstream.
    pub fn terminate_input(self: &Arc<Self>) -> Result<()> {
        self.shared.termination_started.store(true, Ordering::Release);
        self.input_terminating.store(true, Ordering::Release);
        for layer in self.shared.layers.lock_or_panic().iter() {
            layer.terminate();
        }
        self.process(Vec::new(), Polarity::Input, 0)
    }

    /// §4.6: request terminate at the top of the stack; the cascading
    /// pops from subsequent drains carry termination the rest of the way.
    pub fn terminate_output(self: &Arc<Self>) -> Result<()> {
        self.shared.termination_started.store(true, Ordering::Release);
        self.output_terminating.store(true, Ordering::Release);
        if let Some(top) = self.shared.layers.lock_or_panic().last() {
            top.terminate();
        }
        self.process(Vec::new(), Polarity::Output, 0)
    }

    fn process(self: &Arc<Self>, mut events: Vec<u8>, polarity: Polarity, depth: usize) -> Result<()> {
        if depth > self.shared.recursion_cap {
            return Err(RuntimeError::StackDeadlock { depth });
        }

        let layers: Vec<Arc<dyn Layer>> = self.shared.layers.lock_or_panic().clone();
        let mut opposite_has_work = false;
        match polarity {
            Polarity::Input => {
                for layer in &layers {
                    events = layer.xfer(events, polarity);
                    opposite_has_work |= layer.opposite_has_work();
                }
            }
            Polarity::Output => {
                for layer in layers.iter().rev() {
                    events = layer.xfer(events, polarity);
                    opposite_has_work |= layer.opposite_has_work();
                }
            }
        }

        self.base_for(polarity).emit(events);
        self.reap_torn_down_layers();

        if opposite_has_work {
            return self.process(Vec::new(), polarity.opposite(), depth + 1);
        }

        if self.is_terminating(polarity) && self.shared.layers.lock_or_panic().is_empty() {
            self.finish_side(polarity);
        }
        Ok(())
    }

    fn base_for(&self, polarity: Polarity) -> &FlowBase<Vec<u8>> {
        match polarity {
            Polarity::Input => &self.input_base,
            Polarity::Output => &self.output_base,
        }
    }

    fn is_terminating(&self, polarity: Polarity) -> bool {
        match polarity {
            Polarity::Input => self.input_terminating.load(Ordering::Acquire),
            Polarity::Output => self.output_terminating.load(Ordering::Acquire),
        }
    }

    fn reap_torn_down_layers(&self) {
        self.shared.layers.lock_or_panic().retain(|layer| !layer.is_torn_down());
    }

    fn finish_side(&self, polarity: Polarity) {
        if let Some(downstream) = self.base_for(polarity).finish() {
            downstream.on_terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctree_flow::{Collection, Flow};

    struct Uppercase;

    impl Layer for Uppercase {
        fn xfer(&self, events: Vec<u8>, _polarity: Polarity) -> Vec<u8> {
            events.to_ascii_uppercase()
        }

        fn terminate(&self) {}

        fn is_torn_down(&self) -> bool {
            false
        }
    }

    #[test]
    fn input_side_transforms_and_emits() {
        let transports = Transports::new(64);
        transports.push_layer(Arc::new(Uppercase));
        let sink = Collection::new();
        transports.input().connect_with(sink.clone() as Arc<dyn Flow<Vec<u8>>>, Box::new(|_| {}), Box::new(|_| {}));
        transports.process_input(b"hi".to_vec()).unwrap();
        assert_eq!(sink.drain(), vec![b"HI".to_vec()]);
    }

    #[test]
    fn output_side_applies_layers_in_reverse_order() {
        struct Reverser;
        impl Layer for Reverser {
            fn xfer(&self, mut events: Vec<u8>, _polarity: Polarity) -> Vec<u8> {
                events.reverse();
                events
            }
            fn terminate(&self) {}
            fn is_torn_down(&self) -> bool {
                false
            }
        }
        let transports = Transports::new(64);
        transports.push_layer(Arc::new(Uppercase));
        transports.push_layer(Arc::new(Reverser));
        let sink = Collection::new();
        transports.output().connect_with(sink.clone() as Arc<dyn Flow<Vec<u8>>>, Box::new(|_| {}), Box::new(|_| {}));
        transports.process_output(b"ab".to_vec()).unwrap();
        // output order is reversed relative to input: Reverser then Uppercase
        assert_eq!(sink.drain(), vec![b"BA".to_vec()]);
    }

    #[test]
    fn terminate_input_drains_and_propagates_once_stack_empties() {
        struct SelfRemoving {
            torn: std::sync::atomic::AtomicBool,
        }
        impl Layer for SelfRemoving {
            fn xfer(&self, events: Vec<u8>, _polarity: Polarity) -> Vec<u8> {
                events
            }
            fn terminate(&self) {
                self.torn.store(true, Ordering::SeqCst);
            }
            fn is_torn_down(&self) -> bool {
                self.torn.load(Ordering::SeqCst)
            }
        }
        let transports = Transports::new(64);
        transports.push_layer(Arc::new(SelfRemoving { torn: AtomicBool::new(false) }));
        let sink = Collection::new();
        transports.input().connect_with(sink.clone() as Arc<dyn Flow<Vec<u8>>>, Box::new(|_| {}), Box::new(|_| {}));
        transports.terminate_input().unwrap();
        assert!(sink.base().is_terminated());
    }

    #[test]
    fn recursion_cap_is_enforced() {
        struct NeverSettles;
        impl Layer for NeverSettles {
            fn xfer(&self, events: Vec<u8>, _polarity: Polarity) -> Vec<u8> {
                events
            }
            fn opposite_has_work(&self) -> bool {
                true
            }
            fn terminate(&self) {}
            fn is_torn_down(&self) -> bool {
                false
            }
        }
        let transports = Transports::new(3);
        transports.push_layer(Arc::new(NeverSettles));
        let err = transports.process_input(Vec::new()).unwrap_err();
        assert!(matches!(err, RuntimeError::StackDeadlock { .. }));
    }
}
