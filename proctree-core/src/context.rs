// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `ExecutionContext`: the single point of contact every processor in a
//! tree shares with the surrounding `tokio` runtime (§4.9, §7). It owns
//! the FIFO task queue, the raw timer primitives the root `Scheduler`
//! delegates to, and the fault sink a `Unit` registers itself as.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use proctree_common::{Config, MutexExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::processor::Processor;

/// Registered on a context by whatever processor is meant to see faults
/// that reach the top of the tree (normally `Unit`). Kept as a trait
/// rather than a concrete dependency so `proctree-core` never needs to
/// know about `proctree-unit`.
pub trait FaultSink: Send + Sync + 'static {
    fn receive_fault(&self, processor: Arc<dyn Processor>);
}

type Task = Box<dyn FnOnce() + Send + 'static>;

/// An opaque handle to a scheduled timer, returned by
/// [`ExecutionContext::defer`] and accepted by [`ExecutionContext::cancel`].
#[derive(Debug)]
pub struct TimerHandle(u64);

pub struct ExecutionContext {
    config: Config,
    sender: mpsc::UnboundedSender<Task>,
    runtime: tokio::runtime::Handle,
    fault_sink: std::sync::Mutex<Option<Weak<dyn FaultSink>>>,
    timers: std::sync::Mutex<HashMap<u64, JoinHandle<()>>>,
    timer_seq: AtomicU64,
}

impl ExecutionContext {
    /// Builds a context bound to the calling `tokio` runtime and spawns its
    /// driver task, which is the only task permitted to execute entries
    /// from the FIFO queue — this is what gives the tree its
    /// single-suspension-point cooperative scheduling (§4.9's "Concurrency
    /// model").
    pub fn new(config: Config) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let runtime = tokio::runtime::Handle::current();
        let ctx = Arc::new(ExecutionContext {
            config,
            sender,
            runtime: runtime.clone(),
            fault_sink: std::sync::Mutex::new(None),
            timers: std::sync::Mutex::new(HashMap::new()),
            timer_seq: AtomicU64::new(1),
        });
        runtime.spawn(drive(receiver));
        ctx
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn runtime(&self) -> &tokio::runtime::Handle {
        &self.runtime
    }

    /// Enqueues a task onto the FIFO queue. Used by everything that needs
    /// to hand control back to the tree's single driver rather than act
    /// inline (flow delivery, timer firing, process-exit callbacks).
    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) {
        if self.sender.send(Box::new(task)).is_err() {
            debug!("task enqueued after context shutdown, dropping");
        }
    }

    /// §4.9: the low-level timer primitive nested `Scheduler`s bottom out
    /// on at the Unit root. Fires `task` on the FIFO queue (never inline on
    /// the timer thread) after `delay`.
    pub fn defer(self: &Arc<Self>, delay: Duration, task: impl FnOnce() + Send + 'static) -> TimerHandle {
        let id = self.timer_seq.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(ctx) = weak.upgrade() {
                ctx.timers.lock_or_panic().remove(&id);
                ctx.enqueue(task);
            }
        });
        self.timers.lock_or_panic().insert(id, handle);
        TimerHandle(id)
    }

    /// Cancels a pending timer. No-op if it already fired.
    pub fn cancel(&self, handle: TimerHandle) {
        if let Some(join) = self.timers.lock_or_panic().remove(&handle.0) {
            join.abort();
        }
    }

    /// §4.8 `execute`: runs a blocking task off the cooperative queue (via
    /// `spawn_blocking`, the idiomatic replacement for the original's
    /// dedicated `Thread` worker pool) and funnels its outcome back onto
    /// the FIFO queue so continuations never touch other processors from a
    /// foreign thread.
    pub fn execute_blocking<T, F>(self: &Arc<Self>, task: F, on_done: impl FnOnce(std::thread::Result<T>) + Send + 'static)
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let ctx = self.clone();
        self.runtime.spawn(async move {
            let outcome = tokio::task::spawn_blocking(task).await;
            let result = outcome.map_err(|join_err| -> Box<dyn std::any::Any + Send> {
                Box::new(join_err.to_string())
            });
            ctx.enqueue(move || on_done(result));
        });
    }

    /// §7: installs the processor that should be notified when a fault
    /// reaches the top of the tree with nowhere else to go.
    pub fn associate(&self, sink: Weak<dyn FaultSink>) {
        *self.fault_sink.lock_or_panic() = Some(sink);
    }

    /// Routes a fault to the associated sink, if one is alive. A fault with
    /// no live sink is logged and dropped rather than panicking the
    /// driver task.
    pub fn faulted(&self, processor: Arc<dyn Processor>) {
        let sink = self.fault_sink.lock_or_panic().as_ref().and_then(Weak::upgrade);
        match sink {
            Some(sink) => sink.receive_fault(processor),
            None => error!(processor_id = processor.base().id(), "fault with no associated sink"),
        }
    }
}

async fn drive(mut receiver: mpsc::UnboundedReceiver<Task>) {
    while let Some(task) = receiver.recv().await {
        task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn enqueued_task_runs_on_the_driver() {
        let ctx = ExecutionContext::new(Config::default());
        let (tx, rx) = tokio::sync::oneshot::channel();
        ctx.enqueue(move || {
            let _ = tx.send(42);
        });
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn defer_fires_after_delay_on_the_queue() {
        let ctx = ExecutionContext::new(Config::default());
        let (tx, rx) = tokio::sync::oneshot::channel();
        ctx.defer(Duration::from_millis(5), move || {
            let _ = tx.send(());
        });
        tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancel_prevents_a_pending_timer_from_firing() {
        let ctx = ExecutionContext::new(Config::default());
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let handle = ctx.defer(Duration::from_millis(50), move || {
            fired2.store(true, Ordering::SeqCst);
        });
        ctx.cancel(handle);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
