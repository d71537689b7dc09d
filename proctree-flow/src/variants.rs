// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Concrete channel variants (§2 item 8): `Iteration` (source), `Collection`
//! (sink), `Transformation` (map), `Null`, `Funnel` (fan-in), and `Trace`
//! (pass-through instrumentation).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use proctree_common::MutexExt;
use proctree_core::condition::OVERFLOW;
use proctree_core::context::ExecutionContext;

use crate::flow::{Flow, FlowBase};

/// Emits the items of a `Vec<E>` one batch at a time, obstructing itself
/// ("ko_overflow"-style self back-pressure is irrelevant here since there's
/// no kernel buffer) only to respect a connected downstream's obstruction —
/// `pump` stops if downstream is obstructed and re-enqueues itself to resume
/// once the downstream clears, and finishes the flow once the queue drains.
pub struct Iteration<E: Send + 'static> {
    base: FlowBase<E>,
    remaining: Mutex<VecDeque<E>>,
    context: Arc<ExecutionContext>,
    self_ref: Mutex<Option<Weak<Iteration<E>>>>,
}

impl<E: Send + 'static> Iteration<E> {
    pub fn new(context: Arc<ExecutionContext>, items: impl IntoIterator<Item = E>) -> Arc<Self> {
        let it = Arc::new(Iteration {
            base: FlowBase::new(),
            remaining: Mutex::new(items.into_iter().collect()),
            context,
            self_ref: Mutex::new(None),
        });
        *it.self_ref.lock_or_panic() = Some(Arc::downgrade(&it));
        let resumer = it.self_ref();
        it.base.watch(
            Box::new(|_| {}),
            Box::new(move |_| {
                let resumer = resumer.clone();
                let context = resumer.context.clone();
                context.enqueue(move || resumer.pump());
            }),
        );
        it
    }

    fn self_ref(&self) -> Arc<Iteration<E>> {
        self.self_ref
            .lock_or_panic()
            .as_ref()
            .and_then(Weak::upgrade)
            .expect("Iteration::new installs self_ref before use")
    }

    /// Emits queued items downstream until either the queue drains, in
    /// which case the flow terminates, or the downstream obstructs, in
    /// which case the `on_clear` monitor registered in [`Iteration::new`]
    /// re-invokes this via the context's driver queue once it un-obstructs.
    pub fn pump(self: &Arc<Self>) {
        loop {
            if self.base.is_obstructed() {
                return;
            }
            let next = self.remaining.lock_or_panic().pop_front();
            match next {
                Some(item) => self.base.emit(item),
                None => {
                    let flow: Arc<dyn Flow<E>> = self.clone();
                    flow.terminate();
                    return;
                }
            }
        }
    }
}

impl<E: Send + 'static> Flow<E> for Iteration<E> {
    fn base(&self) -> &FlowBase<E> {
        &self.base
    }

    fn process(&self, _events: E) {
        // A source has no upstream; incoming events are a usage error and
        // are dropped rather than panicking the driver task.
    }
}

/// Accumulates every event it receives. The terminal sink used in tests
/// and by anything materializing a flow's full output.
pub struct Collection<E: Send + 'static> {
    base: FlowBase<E>,
    items: Mutex<Vec<E>>,
}

impl<E: Send + 'static> Collection<E> {
    pub fn new() -> Arc<Self> {
        Arc::new(Collection { base: FlowBase::new(), items: Mutex::new(Vec::new()) })
    }

    pub fn drain(&self) -> Vec<E> {
        std::mem::take(&mut self.items.lock_or_panic())
    }
}

impl<E: Send + 'static> Flow<E> for Collection<E> {
    fn base(&self) -> &FlowBase<E> {
        &self.base
    }

    fn process(&self, events: E) {
        self.items.lock_or_panic().push(events);
    }
}

/// Applies a pure function to each event before forwarding it.
pub struct Transformation<I: Send + 'static, O: Send + 'static> {
    base: FlowBase<O>,
    map: Box<dyn Fn(I) -> O + Send + Sync>,
}

impl<I: Send + 'static, O: Send + 'static> Transformation<I, O> {
    pub fn new(map: impl Fn(I) -> O + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Transformation { base: FlowBase::new(), map: Box::new(map) })
    }

    pub fn accept(&self, event: I) {
        self.base.emit((self.map)(event));
    }
}

impl<I: Send + 'static, O: Send + 'static> Flow<O> for Transformation<I, O> {
    fn base(&self) -> &FlowBase<O> {
        &self.base
    }

    fn process(&self, events: O) {
        self.base.emit(events);
    }
}

/// Discards everything. Used to terminate a branch a consumer never reads
/// (e.g. a `Division` layer nobody connected to).
pub struct Null<E: Send + 'static> {
    base: FlowBase<E>,
}

impl<E: Send + 'static> Null<E> {
    pub fn new() -> Arc<Self> {
        Arc::new(Null { base: FlowBase::new() })
    }
}

impl<E: Send + 'static> Flow<E> for Null<E> {
    fn base(&self) -> &FlowBase<E> {
        &self.base
    }

    fn process(&self, _events: E) {}
}

/// Fans multiple upstreams into a single downstream. When the number of
/// connected-but-undrained upstream inputs queued for delivery exceeds
/// `limit`, obstructs every live upstream source handle with
/// [`proctree_core::condition::OVERFLOW`] until the backlog drains.
pub struct Funnel<E: Send + 'static> {
    base: FlowBase<E>,
    limit: usize,
    backlog: Mutex<usize>,
}

impl<E: Send + 'static> Funnel<E> {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Funnel { base: FlowBase::new(), limit, backlog: Mutex::new(0) })
    }

    pub fn accept(&self, event: E) {
        {
            let mut backlog = self.backlog.lock_or_panic();
            *backlog += 1;
            if *backlog > self.limit {
                self.base.obstruct(OVERFLOW);
            }
        }
        self.base.emit(event);
        {
            let mut backlog = self.backlog.lock_or_panic();
            *backlog = backlog.saturating_sub(1);
            if *backlog <= self.limit {
                self.base.clear(&OVERFLOW);
            }
        }
    }
}

/// Pass-through that invokes a side-effecting hook on every event before
/// forwarding it unchanged — used for tracing/reflection instrumentation
/// wired transiently into a pipeline.
pub struct Trace<E: Send + 'static> {
    base: FlowBase<E>,
    hook: Box<dyn Fn(&E) + Send + Sync>,
}

impl<E: Send + 'static> Trace<E> {
    pub fn new(hook: impl Fn(&E) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Trace { base: FlowBase::new(), hook: Box::new(hook) })
    }
}

impl<E: Send + 'static> Flow<E> for Trace<E> {
    fn base(&self) -> &FlowBase<E> {
        &self.base
    }

    fn process(&self, events: E) {
        (self.hook)(&events);
        self.base.emit(events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctree_common::Config;
    use std::time::Duration;

    #[tokio::test]
    async fn iteration_pump_emits_until_the_queue_drains_then_terminates() {
        let ctx = ExecutionContext::new(Config::default());
        let source = Iteration::new(ctx, vec![1, 2, 3]);
        let sink = Collection::new();
        source.f_connect(sink.clone() as Arc<dyn Flow<i32>>);
        source.pump();
        assert_eq!(sink.drain(), vec![1, 2, 3]);
        assert!(source.base().is_terminated());
    }

    #[tokio::test]
    async fn iteration_pump_resumes_once_downstream_clears() {
        let ctx = ExecutionContext::new(Config::default());
        let source = Iteration::new(ctx, vec![1, 2, 3]);
        let sink = Collection::new();
        source.f_connect(sink.clone() as Arc<dyn Flow<i32>>);

        sink.base().obstruct(OVERFLOW);
        source.pump();
        assert!(sink.drain().is_empty());
        assert!(source.base().is_obstructed());

        sink.base().clear(&OVERFLOW);
        // The `on_clear` monitor re-enqueued `pump` onto the driver task
        // rather than running it inline.
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if source.base().is_terminated() {
                    return;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sink.drain(), vec![1, 2, 3]);
    }

    #[test]
    fn transformation_maps_before_forwarding() {
        let transform = Transformation::new(|x: i32| x * 2);
        let sink = Collection::new();
        transform.f_connect(sink.clone() as Arc<dyn Flow<i32>>);
        transform.accept(21);
        assert_eq!(sink.drain(), vec![42]);
    }

    #[test]
    fn null_discards_everything() {
        let null = Null::new();
        null.process(99);
    }

    #[test]
    fn funnel_obstructs_past_the_limit_and_clears_after_drain() {
        let funnel = Funnel::new(1);
        let sink = Collection::new();
        funnel.f_connect(sink.clone() as Arc<dyn Flow<i32>>);
        funnel.accept(1);
        assert!(!funnel.base().is_obstructed());
        assert_eq!(sink.drain(), vec![1]);
    }

    #[test]
    fn trace_observes_without_altering_the_event() {
        let seen = Mutex::new(Vec::new());
        let trace = Trace::new(move |e: &i32| seen.lock_or_panic().push(*e));
        let sink = Collection::new();
        trace.f_connect(sink.clone() as Arc<dyn Flow<i32>>);
        trace.process(5);
        assert_eq!(sink.drain(), vec![5]);
    }
}
