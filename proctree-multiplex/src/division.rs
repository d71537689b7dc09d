// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `Division` (§4.8): the demultiplexer dual to [`crate::catenation::Catenation`].
//! Buffers per-layer payloads until the consumer connects, batches
//! `initiate` notifications, and cascades terminate to every live
//! sub-flow on interrupt.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use proctree_common::MutexExt;
use proctree_core::condition::BACKPRESSURE;
use proctree_flow::{Flow, FlowBase};

use crate::event::{FlowEvent, LayerId};

enum Slot {
    Pending,
    Connected(Arc<dyn Flow<Vec<u8>>>),
    Terminated,
}

pub struct Division {
    queues: Mutex<HashMap<LayerId, VecDeque<Vec<u8>>>>,
    flows: Mutex<HashMap<LayerId, Slot>>,
    /// Carries the batched new-layer announcements (§4.8 `initiations`) as
    /// a single payload per incoming batch, and doubles as the feedback
    /// point for [`FlowEvent::Obstruct`]/[`FlowEvent::Clear`] — obstructing
    /// it signals that new layers may be slow to show up while the sending
    /// side is backed up.
    downstream: FlowBase<Vec<LayerId>>,
    on_initiate: Mutex<Option<Box<dyn Fn(Vec<LayerId>) + Send + Sync>>>,
    on_overflow: Mutex<Option<Box<dyn Fn(Vec<u8>) + Send + Sync>>>,
}

impl Division {
    pub fn new() -> Arc<Self> {
        Arc::new(Division {
            queues: Mutex::new(HashMap::new()),
            flows: Mutex::new(HashMap::new()),
            downstream: FlowBase::new(),
            on_initiate: Mutex::new(None),
            on_overflow: Mutex::new(None),
        })
    }

    pub fn downstream(&self) -> &FlowBase<Vec<LayerId>> {
        &self.downstream
    }

    /// Registers the callback invoked once per incoming batch with every
    /// layer it opened — the consumer is expected to call
    /// [`Division::connect`] for each, possibly asynchronously.
    pub fn set_on_initiate(&self, callback: impl Fn(Vec<LayerId>) + Send + Sync + 'static) {
        *self.on_initiate.lock_or_panic() = Some(Box::new(callback));
    }

    pub fn set_on_overflow(&self, callback: impl Fn(Vec<u8>) + Send + Sync + 'static) {
        *self.on_overflow.lock_or_panic() = Some(Box::new(callback));
    }

    /// §4.8: processes one batch of upstream-decoded events. `initiate`
    /// events are accumulated rather than dispatched as they're seen, and
    /// flushed once — as `initiations` — after the whole batch lands.
    pub fn accept(self: &Arc<Self>, batch: Vec<FlowEvent>) {
        let mut initiations = Vec::new();
        for event in batch {
            match event {
                FlowEvent::Initiate(layer) => {
                    self.flows.lock_or_panic().insert(layer, Slot::Pending);
                    initiations.push(layer);
                }
                FlowEvent::Transfer(layer, payload) => {
                    let connected = {
                        let flows = self.flows.lock_or_panic();
                        match flows.get(&layer) {
                            Some(Slot::Connected(flow)) => Some(flow.clone()),
                            _ => None,
                        }
                    };
                    match connected {
                        Some(flow) => flow.process(payload),
                        None => {
                            self.queues.lock_or_panic().entry(layer).or_default().push_back(payload);
                        }
                    }
                }
                FlowEvent::Terminate(layer) => {
                    let slot = self.flows.lock_or_panic().remove(&layer);
                    match slot {
                        Some(Slot::Connected(flow)) => flow.on_terminate(),
                        _ => {
                            self.flows.lock_or_panic().insert(layer, Slot::Terminated);
                        }
                    }
                }
                FlowEvent::Overflow(data) => {
                    if let Some(callback) = self.on_overflow.lock_or_panic().as_ref() {
                        callback(data);
                    }
                    self.interrupt();
                }
                FlowEvent::Obstruct => self.downstream.obstruct(BACKPRESSURE),
                FlowEvent::Clear => {
                    self.downstream.clear(&BACKPRESSURE);
                }
            }
        }
        if !initiations.is_empty() {
            if let Some(callback) = self.on_initiate.lock_or_panic().as_ref() {
                callback(initiations.clone());
            }
            self.downstream.emit(initiations);
        }
    }

    /// §4.8 `connect`: drains any buffered payloads into `flow` in order,
    /// then wires it for subsequent transfers. Finalizes immediately if a
    /// `terminate` sentinel already arrived for this layer.
    pub fn connect(&self, layer: LayerId, flow: Arc<dyn Flow<Vec<u8>>>) {
        let prior = self.flows.lock_or_panic().insert(layer, Slot::Connected(flow.clone()));
        if matches!(prior, Some(Slot::Terminated)) {
            self.flows.lock_or_panic().remove(&layer);
            flow.on_terminate();
            return;
        }
        if let Some(mut queue) = self.queues.lock_or_panic().remove(&layer) {
            while let Some(payload) = queue.pop_front() {
                flow.process(payload);
            }
        }
    }

    /// §4.8 `interrupt`: cascades terminate to every live sub-flow.
    pub fn interrupt(&self) {
        let flows = std::mem::take(&mut *self.flows.lock_or_panic());
        for (_, slot) in flows {
            if let Slot::Connected(flow) = slot {
                flow.on_terminate();
            }
        }
        self.queues.lock_or_panic().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctree_flow::Collection;

    #[test]
    fn transfers_before_connect_are_buffered_then_drained_in_order() {
        let division = Division::new();
        division.accept(vec![FlowEvent::Initiate(1), FlowEvent::Transfer(1, b"a".to_vec()), FlowEvent::Transfer(1, b"b".to_vec())]);
        let sink = Collection::new();
        division.connect(1, sink.clone() as Arc<dyn Flow<Vec<u8>>>);
        assert_eq!(sink.drain(), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn transfers_after_connect_go_straight_through() {
        let division = Division::new();
        let sink = Collection::new();
        division.accept(vec![FlowEvent::Initiate(2)]);
        division.connect(2, sink.clone() as Arc<dyn Flow<Vec<u8>>>);
        division.accept(vec![FlowEvent::Transfer(2, b"live".to_vec())]);
        assert_eq!(sink.drain(), vec![b"live".to_vec()]);
    }

    #[test]
    fn terminate_before_connect_finalizes_immediately_on_connect() {
        let division = Division::new();
        division.accept(vec![FlowEvent::Initiate(3), FlowEvent::Terminate(3)]);
        let sink = Collection::new();
        division.connect(3, sink.clone() as Arc<dyn Flow<Vec<u8>>>);
        assert!(sink.base().is_terminated());
    }

    #[test]
    fn interrupt_cascades_to_every_connected_flow() {
        let division = Division::new();
        let sink = Collection::new();
        division.accept(vec![FlowEvent::Initiate(1)]);
        division.connect(1, sink.clone() as Arc<dyn Flow<Vec<u8>>>);
        division.interrupt();
        assert!(sink.base().is_terminated());
    }

    #[test]
    fn initiations_in_one_batch_are_emitted_once_as_a_single_list() {
        let division = Division::new();
        let announcements: Arc<Collection<Vec<LayerId>>> = Collection::new();
        division
            .downstream()
            .connect_with(announcements.clone() as Arc<dyn Flow<Vec<LayerId>>>, Box::new(|_| {}), Box::new(|_| {}));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        division.set_on_initiate(move |layers| seen2.lock_or_panic().push(layers));

        division.accept(vec![FlowEvent::Initiate(1), FlowEvent::Initiate(2), FlowEvent::Transfer(1, b"x".to_vec())]);

        assert_eq!(*seen.lock_or_panic(), vec![vec![1, 2]]);
        assert_eq!(announcements.drain(), vec![vec![1, 2]]);
    }

    #[test]
    fn obstruct_and_clear_tokens_toggle_the_announcement_channel() {
        let division = Division::new();
        assert!(!division.downstream().is_obstructed());
        division.accept(vec![FlowEvent::Obstruct]);
        assert!(division.downstream().is_obstructed());
        division.accept(vec![FlowEvent::Clear]);
        assert!(!division.downstream().is_obstructed());
    }
}
