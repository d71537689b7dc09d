// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The three leaf processor variants from §4.8: `Call` (run a closure once
//! on actuation), `Coroutine` (drive a boxed `Future` to completion on the
//! context's driver), and `Thread` (run blocking work off the cooperative
//! queue via [`ExecutionContext::execute_blocking`]).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use proctree_common::RuntimeError;

use crate::context::ExecutionContext;
use crate::processor::{Processor, ProcessorBase};

/// Runs `body` once, synchronously, the moment the processor actuates,
/// then terminates. The Rust analogue of the original's `Call`, which
/// invoked a zero-argument callable and exited immediately afterward.
pub struct Call {
    base: ProcessorBase,
    body: std::sync::Mutex<Option<Box<dyn FnOnce() -> Result<(), RuntimeError> + Send>>>,
}

impl Call {
    pub fn new(context: Arc<ExecutionContext>, body: impl FnOnce() -> Result<(), RuntimeError> + Send + 'static) -> Arc<Self> {
        let call = Arc::new(Call {
            base: ProcessorBase::new(context),
            body: std::sync::Mutex::new(Some(Box::new(body))),
        });
        Processor::install(&call);
        call
    }
}

impl Processor for Call {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    fn placement(&self) -> &'static str {
        "Call"
    }

    fn on_actuate(&self, self_arc: Arc<dyn Processor>) {
        let body = self.body.lock().ok().and_then(|mut b| b.take());
        if let Some(body) = body {
            if let Err(err) = body() {
                self_arc.fault(err, None);
                return;
            }
        }
        self_arc.terminate(None);
    }
}

type BoxedFuture = Pin<Box<dyn Future<Output = Result<(), RuntimeError>> + Send>>;

/// Drives an async computation to completion on the context's `tokio`
/// runtime, terminating (or faulting) when it resolves. The `Coroutine`
/// sibling of `Call`: where `Call` runs synchronously inline, `Coroutine`
/// yields control back to the runtime at its own `.await` points.
pub struct Coroutine {
    base: ProcessorBase,
    future: std::sync::Mutex<Option<BoxedFuture>>,
}

impl Coroutine {
    pub fn new(context: Arc<ExecutionContext>, future: impl Future<Output = Result<(), RuntimeError>> + Send + 'static) -> Arc<Self> {
        let coroutine = Arc::new(Coroutine {
            base: ProcessorBase::new(context),
            future: std::sync::Mutex::new(Some(Box::pin(future))),
        });
        Processor::install(&coroutine);
        coroutine
    }
}

impl Processor for Coroutine {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    fn placement(&self) -> &'static str {
        "Coroutine"
    }

    fn on_actuate(&self, self_arc: Arc<dyn Processor>) {
        let future = self.future.lock().ok().and_then(|mut f| f.take());
        let Some(future) = future else { return };
        let context = self.base.context().clone();
        let runtime = context.runtime().clone();
        runtime.spawn(async move {
            let outcome = future.await;
            context.enqueue(move || match outcome {
                Ok(()) => {
                    self_arc.terminate(None);
                }
                Err(err) => self_arc.fault(err, None),
            });
        });
    }
}

/// Runs `body` on a blocking thread pool via
/// [`ExecutionContext::execute_blocking`], terminating once it returns.
/// The analogue of the original's dedicated `Thread` processor variant,
/// backed here by `tokio::task::spawn_blocking` rather than a hand-rolled
/// worker pool.
pub struct Thread {
    base: ProcessorBase,
    body: std::sync::Mutex<Option<Box<dyn FnOnce() -> Result<(), RuntimeError> + Send>>>,
}

impl Thread {
    pub fn new(context: Arc<ExecutionContext>, body: impl FnOnce() -> Result<(), RuntimeError> + Send + 'static) -> Arc<Self> {
        let thread = Arc::new(Thread {
            base: ProcessorBase::new(context),
            body: std::sync::Mutex::new(Some(Box::new(body))),
        });
        Processor::install(&thread);
        thread
    }
}

impl Processor for Thread {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    fn placement(&self) -> &'static str {
        "Thread"
    }

    fn on_actuate(&self, self_arc: Arc<dyn Processor>) {
        let body = self.body.lock().ok().and_then(|mut b| b.take());
        let Some(body) = body else { return };
        self.base.context().execute_blocking(body, move |outcome| match outcome {
            Ok(Ok(())) => {
                self_arc.terminate(None);
            }
            Ok(Err(err)) => self_arc.fault(err, None),
            Err(_panic) => self_arc.fault(RuntimeError::fault_msg("Thread", "thread body panicked"), None),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctree_common::Config;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn call_runs_body_then_terminates() {
        let ctx = ExecutionContext::new(Config::default());
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let call = Call::new(ctx, move || {
            ran2.store(true, Ordering::SeqCst);
            Ok(())
        });
        call.actuate();
        assert!(ran.load(Ordering::SeqCst));
        assert!(call.base().terminated());
    }

    #[tokio::test]
    async fn call_faults_on_error() {
        let ctx = ExecutionContext::new(Config::default());
        let call = Call::new(ctx, || Err(RuntimeError::fault_msg("Call", "boom")));
        call.actuate();
        assert!(!call.base().exceptions().is_empty());
    }

    #[tokio::test]
    async fn coroutine_terminates_when_future_resolves() {
        let ctx = ExecutionContext::new(Config::default());
        let coroutine = Coroutine::new(ctx, async { Ok(()) });
        coroutine.actuate();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(coroutine.base().terminated());
    }

    #[tokio::test]
    async fn thread_runs_blocking_body_then_terminates() {
        let ctx = ExecutionContext::new(Config::default());
        let thread = Thread::new(ctx, || Ok(()));
        thread.actuate();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(thread.base().terminated());
    }
}
