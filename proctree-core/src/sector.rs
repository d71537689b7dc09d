// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `Sector` (§4.3): a processor that owns a set of children indexed by
//! placement key, cascades terminate/interrupt down to them, and reaps
//! their exits before declaring itself terminated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use proctree_common::error::Association;
use proctree_common::MutexExt;
use tracing::trace;

use crate::context::ExecutionContext;
use crate::processor::{Controller, ExitCallback, Processor, ProcessorBase, ProcessorId};
use crate::scheduler::Scheduler;

#[derive(Default)]
struct Children {
    by_id: HashMap<ProcessorId, Arc<dyn Processor>>,
    by_placement: HashMap<&'static str, Vec<ProcessorId>>,
    exit_callbacks: HashMap<ProcessorId, Vec<ExitCallback>>,
}

pub struct Sector {
    base: ProcessorBase,
    scheduler: Mutex<Option<Arc<Scheduler>>>,
    children: Mutex<Children>,
}

impl Sector {
    pub fn new(context: Arc<ExecutionContext>) -> Arc<Self> {
        let sector = Arc::new(Sector {
            base: ProcessorBase::new(context),
            scheduler: Mutex::new(None),
            children: Mutex::new(Children::default()),
        });
        Processor::install(&sector);
        sector
    }

    /// Gives this sector its own scheduler slot that delegates to the
    /// nearest ancestor's scheduler (§4.9), rather than the context's raw
    /// timer.
    pub fn install_scheduler(self: &Arc<Self>, ancestor: Option<Arc<Scheduler>>) {
        let scheduler = match ancestor {
            Some(ancestor) => Scheduler::delegating(ancestor),
            None => Scheduler::root(self.base.context().clone()),
        };
        *self.scheduler.lock_or_panic() = Some(scheduler);
    }

    /// §4.3: places `child` under this sector indexed by `placement()`,
    /// sets the back-reference, and actuates it.
    pub fn dispatch(self: &Arc<Self>, child: Arc<dyn Processor>) {
        let id = child.base().id();
        let placement = child.placement();
        child.base().set_controller(Arc::downgrade(self) as Weak<dyn Controller>);
        {
            let mut children = self.children.lock_or_panic();
            children.by_id.insert(id, child.clone());
            children.by_placement.entry(placement).or_default().push(id);
        }
        child.actuate();
    }

    pub fn child_count(&self) -> usize {
        self.children.lock_or_panic().by_id.len()
    }

    pub fn children_at(&self, placement: &str) -> Vec<Arc<dyn Processor>> {
        let children = self.children.lock_or_panic();
        children
            .by_placement
            .get(placement)
            .into_iter()
            .flatten()
            .filter_map(|id| children.by_id.get(id).cloned())
            .collect()
    }
}

impl Processor for Sector {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    fn placement(&self) -> &'static str {
        "Sector"
    }

    /// §4.3: cascade terminate to every live child; `exited` drives the
    /// eventual `finish_termination` once the last one reaps.
    fn on_terminate(&self, self_arc: Arc<dyn Processor>) {
        let by = self.base.terminator_snapshot();
        let children: Vec<Arc<dyn Processor>> = self.children.lock_or_panic().by_id.values().cloned().collect();
        if children.is_empty() {
            self_arc.finish_termination();
            return;
        }
        for child in children {
            child.terminate(by.clone());
        }
    }

    /// §5: immediate cascade, no reap wait — children are interrupted in
    /// the same call rather than asked to drain first.
    fn on_interrupt(&self, _self_arc: Arc<dyn Processor>) {
        let by = self.base.interruptor_snapshot();
        let children: Vec<Arc<dyn Processor>> = self.children.lock_or_panic().by_id.values().cloned().collect();
        for child in children {
            child.interrupt(by.clone());
        }
    }

    /// §5: a `Sector` overrides the default `interrupt` rather than
    /// inheriting it — an interrupted sector freezes in place under its
    /// own controller instead of signalling an exit. The default's
    /// `controller.exited` call is meant for a processor actually leaving
    /// its slot; a sector that's just had a fault cascade through it is
    /// still occupying `placement()` under its parent and must not be
    /// reaped as if it had terminated.
    fn interrupt(&self, by: Option<Association>) -> bool {
        if !self.base.begin_interrupt(by) {
            return false;
        }
        let arc = self.self_arc();
        self.on_interrupt(arc);
        true
    }
}

impl Controller for Sector {
    fn as_processor(self: Arc<Self>) -> Arc<dyn Processor> {
        self
    }

    fn exited(self: Arc<Self>, child: Arc<dyn Processor>) {
        let id = child.base().id();
        let callbacks = {
            let mut children = self.children.lock_or_panic();
            children.by_id.remove(&id);
            for ids in children.by_placement.values_mut() {
                ids.retain(|cid| *cid != id);
            }
            children.exit_callbacks.remove(&id).unwrap_or_default()
        };
        if !child.base().interrupted() {
            for callback in callbacks {
                callback(child.clone());
            }
        }
        trace!(child = id, remaining = self.child_count(), "sector child exited");
        if self.base.terminating() && self.child_count() == 0 {
            self.finish_termination();
        }
    }

    fn exit_event_connect(&self, child: ProcessorId, callback: ExitCallback) {
        self.children
            .lock_or_panic()
            .exit_callbacks
            .entry(child)
            .or_default()
            .push(callback);
    }

    fn scheduler(self: Arc<Self>) -> Option<Arc<Scheduler>> {
        self.scheduler.lock_or_panic().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctree_common::Config;

    struct LeafProcessor {
        base: ProcessorBase,
    }

    impl Processor for LeafProcessor {
        fn base(&self) -> &ProcessorBase {
            &self.base
        }
    }

    fn leaf(context: Arc<ExecutionContext>) -> Arc<LeafProcessor> {
        let p = Arc::new(LeafProcessor { base: ProcessorBase::new(context) });
        Processor::install(&p);
        p
    }

    #[tokio::test]
    async fn dispatch_actuates_and_indexes_by_placement() {
        let ctx = ExecutionContext::new(Config::default());
        let sector = Sector::new(ctx.clone());
        let child = leaf(ctx);
        sector.dispatch(child.clone());
        assert!(child.base().functioning());
        assert_eq!(sector.child_count(), 1);
        assert_eq!(sector.children_at("Processor").len(), 1);
    }

    #[tokio::test]
    async fn terminate_cascades_and_waits_for_reap() {
        let ctx = ExecutionContext::new(Config::default());
        let sector = Sector::new(ctx.clone());
        let child = leaf(ctx);
        sector.dispatch(child.clone());
        sector.clone().terminate(None);
        assert!(child.base().terminated());
        assert_eq!(sector.child_count(), 0);
        assert!(sector.base().terminated());
    }
}
