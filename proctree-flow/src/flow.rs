// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `Flow`: the obstruction-aware connectable event node (§4.4). Generic
//! over the event payload type so the same base serves kernel byte
//! buffers, multiplexer frames, and in-process values alike.

use std::sync::{Arc, Mutex};

use proctree_common::MutexExt;
use proctree_core::Condition;

pub type ObstructFn = Box<dyn Fn(Condition) + Send + Sync>;
pub type ClearFn = Box<dyn Fn(Condition) + Send + Sync>;

/// Shared obstruction bookkeeping and downstream wiring every `Flow`
/// implementation embeds.
pub struct FlowBase<E: Send + 'static> {
    downstream: Mutex<Option<Arc<dyn Flow<E>>>>,
    obstructions: Mutex<Vec<Condition>>,
    monitors: Mutex<Vec<(ObstructFn, ClearFn)>>,
    terminated: Mutex<bool>,
}

impl<E: Send + 'static> Default for FlowBase<E> {
    fn default() -> Self {
        FlowBase {
            downstream: Mutex::new(None),
            obstructions: Mutex::new(Vec::new()),
            monitors: Mutex::new(Vec::new()),
            terminated: Mutex::new(false),
        }
    }
}

impl<E: Send + 'static> FlowBase<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn downstream(&self) -> Option<Arc<dyn Flow<E>>> {
        self.downstream.lock_or_panic().clone()
    }

    pub fn is_obstructed(&self) -> bool {
        !self.obstructions.lock_or_panic().is_empty()
    }

    pub fn is_terminated(&self) -> bool {
        *self.terminated.lock_or_panic()
    }

    /// §4.4: register a pair of edge-triggered monitors, invoked on the
    /// zero→one and one→zero transitions of the obstruction set.
    pub fn watch(&self, on_obstruct: ObstructFn, on_clear: ClearFn) {
        self.monitors.lock_or_panic().push((on_obstruct, on_clear));
    }

    /// §4.4: obstruct self by `condition`; monitors fire only the first
    /// time the set goes from empty to non-empty.
    pub fn obstruct(&self, condition: Condition) {
        let fire = {
            let mut obstructions = self.obstructions.lock_or_panic();
            let was_clear = obstructions.is_empty();
            if !obstructions.contains(&condition) {
                obstructions.push(condition.clone());
            }
            was_clear
        };
        if fire {
            for (on_obstruct, _) in self.monitors.lock_or_panic().iter() {
                on_obstruct(condition.clone());
            }
        }
    }

    /// §4.4: clear `condition`; monitors fire only when the set empties.
    /// Returns whether this call actually cleared the set (used by
    /// sources deciding whether to resume). [`Condition::is_inexorable`]
    /// conditions are never removed — once a flow is obstructed for a
    /// reason that will never clear, no caller gets to pretend otherwise.
    pub fn clear(&self, condition: &Condition) -> bool {
        if condition.is_inexorable() {
            return false;
        }
        let became_clear = {
            let mut obstructions = self.obstructions.lock_or_panic();
            let Some(idx) = obstructions.iter().position(|c| c == condition) else {
                return false;
            };
            obstructions.remove(idx);
            obstructions.is_empty()
        };
        if became_clear {
            for (_, on_clear) in self.monitors.lock_or_panic().iter() {
                on_clear(condition.clone());
            }
        }
        became_clear
    }

    /// Forwards `events` to the connected downstream, if any and not
    /// terminated. No-op otherwise — the Rust equivalent of rebinding
    /// `f_emit` to a discarder after termination.
    pub fn emit(&self, events: E) {
        if *self.terminated.lock_or_panic() {
            return;
        }
        if let Some(downstream) = self.downstream() {
            downstream.process(events);
        }
    }

    fn mark_terminated(&self) {
        *self.terminated.lock_or_panic() = true;
        *self.downstream.lock_or_panic() = None;
    }

    /// Wires `downstream` exactly as [`Flow::f_connect`] does, but without
    /// requiring `self` to itself implement `Flow<E>` — the obstruction
    /// propagation closures are supplied directly by the caller. Lets
    /// non-`Flow` processors (e.g. `KInput`/`KOutput`, which are also
    /// `Processor`s and would collide on the `base`/`terminate` method
    /// names if they implemented both traits) still participate in the
    /// flow graph.
    pub fn connect_with(&self, downstream: Arc<dyn Flow<E>>, on_obstruct: ObstructFn, on_clear: ClearFn) {
        downstream.base().watch(on_obstruct, on_clear);
        *self.downstream.lock_or_panic() = Some(downstream);
    }

    /// Marks this side terminated and hands back the downstream that was
    /// connected, if any and if this is the first call — the caller is
    /// responsible for invoking `downstream.on_terminate()` to propagate.
    pub fn finish(&self) -> Option<Arc<dyn Flow<E>>> {
        if *self.terminated.lock_or_panic() {
            return None;
        }
        *self.terminated.lock_or_panic() = true;
        self.downstream.lock_or_panic().take()
    }
}

/// Object-safe flow interface. `process` is the only method every variant
/// must supply; connection, obstruction and termination are handled once
/// here as default methods over [`FlowBase`].
pub trait Flow<E: Send + 'static>: Send + Sync + 'static {
    fn base(&self) -> &FlowBase<E>;

    /// Receives an event batch, transforms/buffers/emits per variant.
    fn process(&self, events: E);

    /// §4.4 `f_terminate`: downstream-termination signal. Default action
    /// terminates self and propagates; override to drain first.
    fn on_terminate(self: Arc<Self>) {
        self.terminate();
    }

    /// Connects `downstream`: wires obstruction propagation and a direct
    /// `process` forwarding path (§4.4).
    fn f_connect(self: &Arc<Self>, downstream: Arc<dyn Flow<E>>)
    where
        Self: Sized,
    {
        let upstream: Arc<dyn Flow<E>> = self.clone();
        let up_obstruct = upstream.clone();
        let up_clear = upstream;
        downstream.base().watch(
            Box::new(move |condition| up_obstruct.base().obstruct(condition)),
            Box::new(move |condition| {
                up_clear.base().clear(&condition);
            }),
        );
        *self.base().downstream.lock_or_panic() = Some(downstream);
    }

    /// §4.4: terminate self — marks terminated, rebinds to a discarder,
    /// and propagates the terminate signal one hop downstream.
    fn terminate(self: Arc<Self>) {
        if self.base().is_terminated() {
            return;
        }
        let downstream = self.base().downstream();
        self.base().mark_terminated();
        if let Some(downstream) = downstream {
            downstream.on_terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctree_core::condition::{INEXORABLE, OVERFLOW};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        base: FlowBase<i32>,
        received: Mutex<Vec<i32>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Recorder { base: FlowBase::new(), received: Mutex::new(Vec::new()) })
        }
    }

    impl Flow<i32> for Recorder {
        fn base(&self) -> &FlowBase<i32> {
            &self.base
        }

        fn process(&self, events: i32) {
            self.received.lock_or_panic().push(events);
        }
    }

    struct Passthrough {
        base: FlowBase<i32>,
    }

    impl Passthrough {
        fn new() -> Arc<Self> {
            Arc::new(Passthrough { base: FlowBase::new() })
        }
    }

    impl Flow<i32> for Passthrough {
        fn base(&self) -> &FlowBase<i32> {
            &self.base
        }

        fn process(&self, events: i32) {
            self.base.emit(events);
        }
    }

    #[test]
    fn connected_events_reach_the_sink() {
        let source = Passthrough::new();
        let sink = Recorder::new();
        source.f_connect(sink.clone() as Arc<dyn Flow<i32>>);
        source.process(7);
        assert_eq!(*sink.received.lock_or_panic(), vec![7]);
    }

    #[test]
    fn obstruction_propagates_upstream_and_clears_once() {
        let source = Passthrough::new();
        let sink = Passthrough::new();
        source.f_connect(sink.clone() as Arc<dyn Flow<i32>>);

        let obstruct_calls = Arc::new(AtomicUsize::new(0));
        let clear_calls = Arc::new(AtomicUsize::new(0));
        let oc = obstruct_calls.clone();
        let cc = clear_calls.clone();
        source.base().watch(
            Box::new(move |_| {
                oc.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(move |_| {
                cc.fetch_add(1, Ordering::SeqCst);
            }),
        );

        sink.base().obstruct(OVERFLOW);
        sink.base().obstruct(OVERFLOW);
        assert_eq!(obstruct_calls.load(Ordering::SeqCst), 1);
        assert!(source.base().is_obstructed());

        sink.base().clear(&OVERFLOW);
        assert_eq!(clear_calls.load(Ordering::SeqCst), 1);
        assert!(!source.base().is_obstructed());
    }

    #[test]
    fn inexorable_obstruction_never_clears() {
        let sink = Passthrough::new();
        sink.base().obstruct(INEXORABLE);
        assert!(!sink.base().clear(&INEXORABLE));
        assert!(sink.base().is_obstructed());
    }

    #[test]
    fn terminate_propagates_one_hop_downstream() {
        let source = Passthrough::new();
        let sink = Recorder::new();
        source.f_connect(sink.clone() as Arc<dyn Flow<i32>>);
        (source as Arc<dyn Flow<i32>>).terminate();
        assert!(sink.base().is_terminated());
    }
}
