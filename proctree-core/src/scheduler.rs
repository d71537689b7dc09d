// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The deadline scheduler (§4.9). Every `Sector` may own one; rather than
//! each arming its own OS timer, a scheduler delegates up through its
//! controller chain and only the Unit-level scheduler ever touches
//! [`ExecutionContext::defer`] directly. This keeps the number of live
//! `tokio::time::sleep` tasks bounded by tree depth, not by task count.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use priority_queue::PriorityQueue;
use proctree_common::MutexExt;

use crate::context::{ExecutionContext, TimerHandle};

pub type TaskId = u64;

type SchedTask = Box<dyn FnOnce() + Send + 'static>;

/// What a scheduler arms against to be woken at its earliest deadline.
enum Arm {
    /// This is the root: arm the context's raw timer directly.
    Context(Arc<ExecutionContext>, Option<TimerHandle>),
    /// Delegate to an ancestor's scheduler, holding the task id we booked
    /// with it so we can cancel/rebook as our own earliest deadline moves.
    Delegate(Arc<Scheduler>, Option<TaskId>),
}

pub struct Scheduler {
    arm: Mutex<Arm>,
    pending: Mutex<PriorityQueue<TaskId, Reverse<Instant>>>,
    callbacks: Mutex<HashMap<TaskId, SchedTask>>,
    next_id: AtomicU64,
}

impl Scheduler {
    /// A scheduler whose deadlines are serviced directly by the execution
    /// context. Used at the `Unit` root.
    pub fn root(context: Arc<ExecutionContext>) -> Arc<Self> {
        Arc::new(Scheduler {
            arm: Mutex::new(Arm::Context(context, None)),
            pending: Mutex::new(PriorityQueue::new()),
            callbacks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// A scheduler that delegates its own arming to a nearer or farther
    /// ancestor's scheduler (§4.9's nested-delegation rule).
    pub fn delegating(ancestor: Arc<Scheduler>) -> Arc<Self> {
        Arc::new(Scheduler {
            arm: Mutex::new(Arm::Delegate(ancestor, None)),
            pending: Mutex::new(PriorityQueue::new()),
            callbacks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Books `task` to run at `deadline`. Returns an id usable with
    /// [`Scheduler::cancel`].
    pub fn schedule_at(self: &Arc<Self>, deadline: Instant, task: impl FnOnce() + Send + 'static) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock_or_panic().insert(id, Box::new(task));
        self.pending.lock_or_panic().push(id, Reverse(deadline));
        self.rearm();
        id
    }

    pub fn schedule_after(self: &Arc<Self>, delay: Duration, task: impl FnOnce() + Send + 'static) -> TaskId {
        self.schedule_at(Instant::now() + delay, task)
    }

    /// §4.9 `recur`: reschedules itself after each firing until cancelled.
    /// The closure returns `true` to keep recurring.
    pub fn recur(self: &Arc<Self>, period: Duration, mut task: impl FnMut() -> bool + Send + 'static) {
        let scheduler = self.clone();
        let boxed: SchedTask = Box::new(move || {
            if task() {
                scheduler.recur(period, task);
            }
        });
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock_or_panic().insert(id, boxed);
        self.pending.lock_or_panic().push(id, Reverse(Instant::now() + period));
        self.rearm();
    }

    pub fn cancel(self: &Arc<Self>, id: TaskId) {
        self.pending.lock_or_panic().remove(&id);
        self.callbacks.lock_or_panic().remove(&id);
        self.rearm();
    }

    fn earliest(&self) -> Option<Instant> {
        self.pending.lock_or_panic().peek().map(|(_, Reverse(t))| *t)
    }

    /// Fires every task whose deadline has passed, then re-arms against
    /// whatever remains.
    fn fire_due(self: &Arc<Self>) {
        let now = Instant::now();
        let due: Vec<TaskId> = {
            let mut pending = self.pending.lock_or_panic();
            let mut due = Vec::new();
            while let Some((_, Reverse(t))) = pending.peek() {
                if *t > now {
                    break;
                }
                let (id, _) = pending.pop().expect("peeked entry must pop");
                due.push(id);
            }
            due
        };
        for id in due {
            if let Some(task) = self.callbacks.lock_or_panic().remove(&id) {
                task();
            }
        }
        self.rearm();
    }

    fn rearm(self: &Arc<Self>) {
        let Some(deadline) = self.earliest() else {
            self.disarm();
            return;
        };
        let mut arm = self.arm.lock_or_panic();
        match &mut *arm {
            Arm::Context(context, handle) => {
                if let Some(h) = handle.take() {
                    context.cancel(h);
                }
                let delay = deadline.saturating_duration_since(Instant::now());
                let scheduler = self.clone();
                *handle = Some(context.defer(delay, move || scheduler.fire_due()));
            }
            Arm::Delegate(ancestor, id) => {
                if let Some(old) = id.take() {
                    ancestor.cancel(old);
                }
                let scheduler = self.clone();
                *id = Some(ancestor.schedule_at(deadline, move || scheduler.fire_due()));
            }
        }
    }

    fn disarm(self: &Arc<Self>) {
        let mut arm = self.arm.lock_or_panic();
        match &mut *arm {
            Arm::Context(context, handle) => {
                if let Some(h) = handle.take() {
                    context.cancel(h);
                }
            }
            Arm::Delegate(ancestor, id) => {
                if let Some(old) = id.take() {
                    ancestor.cancel(old);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctree_common::Config;

    #[tokio::test]
    async fn root_scheduler_fires_in_deadline_order() {
        let ctx = ExecutionContext::new(Config::default());
        let scheduler = Scheduler::root(ctx);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let tx2 = tx.clone();
        scheduler.schedule_after(Duration::from_millis(30), move || {
            let _ = tx2.send("second");
        });
        scheduler.schedule_after(Duration::from_millis(5), move || {
            let _ = tx.send("first");
        });
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!((first, second), ("first", "second"));
    }

    #[tokio::test]
    async fn delegating_scheduler_fires_through_its_ancestor() {
        let ctx = ExecutionContext::new(Config::default());
        let root = Scheduler::root(ctx);
        let nested = Scheduler::delegating(root);
        let (tx, rx) = tokio::sync::oneshot::channel();
        nested.schedule_after(Duration::from_millis(5), move || {
            let _ = tx.send(());
        });
        tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancel_prevents_firing() {
        let ctx = ExecutionContext::new(Config::default());
        let scheduler = Scheduler::root(ctx);
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = fired.clone();
        let id = scheduler.schedule_after(Duration::from_millis(10), move || {
            fired2.store(true, Ordering::SeqCst);
        });
        scheduler.cancel(id);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
