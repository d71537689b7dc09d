// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `Catenation` (§4.7): a sequenced multiplexer. Multiple logical
//! sub-flows share one downstream channel; their events appear in the
//! order their layers were *reserved*, never interleaved, regardless of
//! the order upstream data actually arrives.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use proctree_common::MutexExt;
use proctree_core::condition::Condition;
use proctree_flow::{Flow, FlowBase};

use crate::event::{FlowEvent, LayerId};

pub const CAT_OVERFLOWING: Condition = Condition::new("cat_overflowing");

struct ConnEntry {
    queue: Option<VecDeque<Vec<u8>>>,
    terminated: bool,
    inlet: Weak<CatenationInlet>,
}

pub struct Catenation {
    order: Mutex<VecDeque<LayerId>>,
    connections: Mutex<HashMap<LayerId, ConnEntry>>,
    downstream: FlowBase<FlowEvent>,
    overflow_limit: usize,
}

impl Catenation {
    pub fn new(overflow_limit: usize) -> Arc<Self> {
        Arc::new(Catenation {
            order: Mutex::new(VecDeque::new()),
            connections: Mutex::new(HashMap::new()),
            downstream: FlowBase::new(),
            overflow_limit,
        })
    }

    pub fn downstream(&self) -> &FlowBase<FlowEvent> {
        &self.downstream
    }

    /// Wires `flow` as the downstream sink and cascades its real
    /// obstruction state to every connected per-layer inlet — a congested
    /// physical channel must stall every layer's producer, not just the
    /// head-of-line one.
    pub fn connect_downstream(self: &Arc<Self>, flow: Arc<dyn Flow<FlowEvent>>) {
        let obstruct_cat = self.clone();
        let clear_cat = self.clone();
        self.downstream.connect_with(
            flow,
            Box::new(move |condition| obstruct_cat.cascade_obstruct(condition)),
            Box::new(move |condition| clear_cat.cascade_clear(condition)),
        );
    }

    fn cascade_obstruct(&self, condition: Condition) {
        for entry in self.connections.lock_or_panic().values() {
            if let Some(inlet) = entry.inlet.upgrade() {
                inlet.base().obstruct(condition.clone());
            }
        }
    }

    fn cascade_clear(&self, condition: Condition) {
        for entry in self.connections.lock_or_panic().values() {
            if let Some(inlet) = entry.inlet.upgrade() {
                inlet.base().clear(&condition);
            }
        }
    }

    /// §4.7 `reserve`: appends `layer` to the reservation order.
    pub fn reserve(&self, layer: LayerId) {
        self.order.lock_or_panic().push_back(layer);
    }

    fn is_head_of_line(&self, layer: LayerId) -> bool {
        self.order.lock_or_panic().front() == Some(&layer)
    }

    /// §4.7 `connect`: wires `layer`'s upstream, if any, and emits the
    /// layer's `initiate` immediately if it is already head-of-line.
    /// Returns the inlet the upstream flow should `f_connect` into
    /// (already connected if `flow` was provided).
    pub fn connect(self: &Arc<Self>, layer: LayerId, flow: Option<Arc<dyn Flow<Vec<u8>>>>) -> Arc<CatenationInlet> {
        let hol = self.is_head_of_line(layer);
        let inlet = CatenationInlet::new(self.clone(), layer);
        let entry = ConnEntry {
            queue: if hol { None } else { Some(VecDeque::new()) },
            terminated: false,
            inlet: Arc::downgrade(&inlet),
        };
        self.connections.lock_or_panic().insert(layer, entry);
        if hol {
            self.downstream.emit(FlowEvent::Initiate(layer));
        }

        match flow {
            Some(flow) => {
                let up_obstruct = flow.clone();
                let up_clear = flow.clone();
                flow.base().connect_with(
                    inlet.clone() as Arc<dyn Flow<Vec<u8>>>,
                    Box::new(move |condition| up_obstruct.base().obstruct(condition)),
                    Box::new(move |condition| {
                        up_clear.base().clear(&condition);
                    }),
                );
            }
            None if hol => self.transition(),
            None => {}
        }
        inlet
    }

    fn upstream_process(&self, layer: LayerId, events: Vec<u8>) {
        if self.is_head_of_line(layer) {
            self.downstream.emit(FlowEvent::Transfer(layer, events));
            return;
        }
        let (overflowing, inlet) = {
            let mut connections = self.connections.lock_or_panic();
            let Some(entry) = connections.get_mut(&layer) else { return };
            let queue = entry.queue.get_or_insert_with(VecDeque::new);
            queue.push_back(events);
            (queue.len() > self.overflow_limit, entry.inlet.upgrade())
        };
        if overflowing {
            if let Some(inlet) = inlet {
                let was_clear = !inlet.base().is_obstructed();
                inlet.base().obstruct(CAT_OVERFLOWING);
                if was_clear {
                    self.downstream.emit(FlowEvent::Obstruct);
                }
            }
        }
    }

    fn upstream_terminated(self: &Arc<Self>, layer: LayerId) {
        if self.is_head_of_line(layer) {
            self.transition();
        } else if let Some(entry) = self.connections.lock_or_panic().get_mut(&layer) {
            entry.terminated = true;
        }
    }

    /// §4.7 `transition`: pop the head-of-line layer, emit its
    /// `terminate`, and drain the next layer if it already has a
    /// connected flow.
    fn transition(self: &Arc<Self>) {
        if let Some(layer) = self.order.lock_or_panic().pop_front() {
            self.connections.lock_or_panic().remove(&layer);
            self.downstream.emit(FlowEvent::Terminate(layer));
        }
        let next = self.order.lock_or_panic().front().copied();
        if let Some(next_layer) = next {
            let connected = self.connections.lock_or_panic().contains_key(&next_layer);
            if connected {
                self.drain(next_layer);
            }
        }
    }

    /// §4.7 `drain`: emit the next layer's `initiate`, flush its stored
    /// queue, and immediately transition again if it had terminated early.
    fn drain(self: &Arc<Self>, layer: LayerId) {
        self.downstream.emit(FlowEvent::Initiate(layer));
        let (queue, terminated, inlet) = {
            let mut connections = self.connections.lock_or_panic();
            match connections.get_mut(&layer) {
                Some(entry) => (entry.queue.take().unwrap_or_default(), entry.terminated, entry.inlet.upgrade()),
                None => (VecDeque::new(), false, None),
            }
        };
        for payload in queue {
            self.downstream.emit(FlowEvent::Transfer(layer, payload));
        }
        if let Some(inlet) = inlet {
            if inlet.base().clear(&CAT_OVERFLOWING) {
                self.downstream.emit(FlowEvent::Clear);
            }
        }
        if terminated {
            self.transition();
        }
    }
}

/// The per-layer upstream endpoint handed back by [`Catenation::connect`].
/// Obstructing it (directly via [`Flow::base`]) is how a slow head-of-line
/// layer applies back-pressure to one lagging upstream without affecting
/// the others (§4.7: "back-pressure is applied only to the upstream(s)
/// that are behind the HoL").
pub struct CatenationInlet {
    base: FlowBase<Vec<u8>>,
    catenation: Arc<Catenation>,
    layer: LayerId,
}

impl CatenationInlet {
    fn new(catenation: Arc<Catenation>, layer: LayerId) -> Arc<Self> {
        Arc::new(CatenationInlet { base: FlowBase::new(), catenation, layer })
    }

    pub fn layer(&self) -> LayerId {
        self.layer
    }
}

impl Flow<Vec<u8>> for CatenationInlet {
    fn base(&self) -> &FlowBase<Vec<u8>> {
        &self.base
    }

    fn process(&self, events: Vec<u8>) {
        self.catenation.upstream_process(self.layer, events);
    }

    fn on_terminate(self: Arc<Self>) {
        let catenation = self.catenation.clone();
        catenation.upstream_terminated(self.layer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctree_common::Config;
    use proctree_core::context::ExecutionContext;
    use proctree_flow::{Collection, Iteration};

    #[tokio::test]
    async fn head_of_line_layer_emits_immediately() {
        let ctx = ExecutionContext::new(Config::default());
        let catenation = Catenation::new(8);
        catenation.reserve(1);
        let sink = Collection::new();
        catenation.downstream().connect_with(sink.clone() as Arc<dyn Flow<FlowEvent>>, Box::new(|_| {}), Box::new(|_| {}));

        let source = Iteration::new(ctx, vec![b"a".to_vec()]);
        catenation.connect(1, Some(source.clone() as Arc<dyn Flow<Vec<u8>>>));
        source.pump();

        assert_eq!(
            sink.drain(),
            vec![FlowEvent::Initiate(1), FlowEvent::Transfer(1, b"a".to_vec())]
        );
    }

    #[tokio::test]
    async fn later_layer_is_queued_until_its_turn() {
        let ctx = ExecutionContext::new(Config::default());
        let catenation = Catenation::new(8);
        catenation.reserve(1);
        catenation.reserve(2);
        let sink = Collection::new();
        catenation.downstream().connect_with(sink.clone() as Arc<dyn Flow<FlowEvent>>, Box::new(|_| {}), Box::new(|_| {}));

        let second = Iteration::new(ctx.clone(), vec![b"second".to_vec()]);
        catenation.connect(2, Some(second.clone() as Arc<dyn Flow<Vec<u8>>>));
        second.pump();
        // layer 2 isn't head-of-line yet: nothing should have reached the sink.
        assert!(sink.drain().is_empty());

        let first = Iteration::new(ctx, Vec::<Vec<u8>>::new());
        catenation.connect(1, Some(first.clone() as Arc<dyn Flow<Vec<u8>>>));
        first.pump();
        (first as Arc<dyn Flow<Vec<u8>>>).terminate();

        assert_eq!(
            sink.drain(),
            vec![
                FlowEvent::Initiate(1),
                FlowEvent::Terminate(1),
                FlowEvent::Initiate(2),
                FlowEvent::Transfer(2, b"second".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn queue_overflow_emits_obstruct_and_drain_emits_clear() {
        let ctx = ExecutionContext::new(Config::default());
        let catenation = Catenation::new(1);
        catenation.reserve(1);
        catenation.reserve(2);
        let sink = Collection::new();
        catenation.downstream().connect_with(sink.clone() as Arc<dyn Flow<FlowEvent>>, Box::new(|_| {}), Box::new(|_| {}));

        let second = Iteration::new(ctx.clone(), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        let inlet = catenation.connect(2, Some(second.clone() as Arc<dyn Flow<Vec<u8>>>));
        second.pump();
        assert!(inlet.base().is_obstructed());

        let first = Iteration::new(ctx, Vec::<Vec<u8>>::new());
        catenation.connect(1, Some(first.clone() as Arc<dyn Flow<Vec<u8>>>));
        first.pump();

        let events = sink.drain();
        assert!(events.contains(&FlowEvent::Obstruct));
        assert!(events.contains(&FlowEvent::Clear));
    }
}
