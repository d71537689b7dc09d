// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `KInput`/`KOutput` (§4.5): the kernel-bound channels that bridge a
//! nonblocking OS descriptor into the flow graph, built on `tokio`'s
//! readiness-driven `AsyncRead`/`AsyncWrite` rather than a hand-rolled
//! reactor.
//!
//! Both are `Processor`s that each own one [`FlowBase`] side rather than
//! implementing [`Flow`] themselves — `Processor` and `Flow` both define a
//! `terminate`/`base` method, and a single type implementing both would
//! make every call site disambiguate. [`FlowBase::connect_with`] gives
//! them the same downstream wiring and obstruction propagation a `Flow`
//! impl would, without the name collision.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use proctree_common::MutexExt;
use proctree_core::condition::OVERFLOW;
use proctree_core::{ExecutionContext, Processor, ProcessorBase};
use proctree_flow::{Flow, FlowBase};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::debug;

/// Reads chunks of up to `chunk_size` bytes from `R` and emits each
/// non-empty chunk downstream; a downstream obstruction stalls the next
/// kernel read (§4.5's "feedback edge").
pub struct KInput {
    proc_base: ProcessorBase,
    flow_base: FlowBase<Vec<u8>>,
    chunk_size: usize,
    resume: Arc<Notify>,
}

impl KInput {
    pub fn new(context: Arc<ExecutionContext>, chunk_size: usize) -> Arc<Self> {
        let kinput = Arc::new(KInput {
            proc_base: ProcessorBase::new(context),
            flow_base: FlowBase::new(),
            chunk_size,
            resume: Arc::new(Notify::new()),
        });
        Processor::install(&kinput);
        kinput
    }

    pub fn flow(&self) -> &FlowBase<Vec<u8>> {
        &self.flow_base
    }

    /// Connects `downstream` and wires obstruction propagation, then
    /// returns `self` so construction reads as a single pipeline.
    pub fn connect(self: &Arc<Self>, downstream: Arc<dyn Flow<Vec<u8>>>) -> Arc<Self> {
        let up_obstruct = self.clone();
        let up_clear = self.clone();
        self.flow_base.connect_with(
            downstream,
            Box::new(move |c| up_obstruct.flow_base.obstruct(c)),
            Box::new(move |c| {
                up_clear.flow_base.clear(&c);
            }),
        );
        self.clone()
    }

    /// Begins the read loop over `reader`. Call once, typically from
    /// `on_actuate`, after [`KInput::connect`].
    pub fn run<R>(self: &Arc<Self>, mut reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let kinput = self.clone();
        let resume = self.resume.clone();
        self.flow_base.watch(Box::new(|_| {}), Box::new(move |_| resume.notify_one()));
        let context = self.proc_base.context().clone();
        context.runtime().clone().spawn(async move {
            let mut buf = vec![0u8; kinput.chunk_size];
            loop {
                if kinput.flow_base.is_obstructed() {
                    kinput.resume.notified().await;
                    continue;
                }
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        let kinput2 = kinput.clone();
                        kinput.proc_base.context().enqueue(move || {
                            if let Some(downstream) = kinput2.flow_base.finish() {
                                downstream.on_terminate();
                            }
                            kinput2.self_arc().terminate(None);
                        });
                        break;
                    }
                    Ok(n) => {
                        let chunk = buf[..n].to_vec();
                        let kinput2 = kinput.clone();
                        kinput.proc_base.context().enqueue(move || kinput2.flow_base.emit(chunk));
                    }
                    Err(err) => {
                        debug!(error = %err, "kernel input read failed");
                        let kinput2 = kinput.clone();
                        kinput.proc_base.context().enqueue(move || {
                            kinput2.self_arc().fault(proctree_common::RuntimeError::Io(err), None)
                        });
                        break;
                    }
                }
            }
        });
    }
}

impl Processor for KInput {
    fn base(&self) -> &ProcessorBase {
        &self.proc_base
    }

    fn placement(&self) -> &'static str {
        "KInput"
    }
}

/// Object-safe alias so `KOutput` doesn't need to be generic over its
/// writer type at the struct level — the concrete writer is boxed once at
/// construction.
pub trait AsyncWriteHalf: AsyncWrite + Unpin + Send {}
impl<T: AsyncWrite + Unpin + Send> AsyncWriteHalf for T {}

/// A bounded FIFO of byte chunks draining into a kernel-bound writer.
/// Entries (not bytes) are counted against the limit so upstream chunking
/// choices aren't second-guessed (§4.5).
pub struct KOutput {
    proc_base: ProcessorBase,
    flow_base: FlowBase<Vec<u8>>,
    queue: Mutex<VecDeque<Vec<u8>>>,
    limit: usize,
    in_flight: AtomicBool,
    terminating: AtomicBool,
    writer: Mutex<Option<Box<dyn AsyncWriteHalf>>>,
    queued_len: AtomicUsize,
}

impl KOutput {
    pub fn new<W>(context: Arc<ExecutionContext>, writer: W, limit: usize) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let koutput = Arc::new(KOutput {
            proc_base: ProcessorBase::new(context),
            flow_base: FlowBase::new(),
            queue: Mutex::new(VecDeque::new()),
            limit,
            in_flight: AtomicBool::new(false),
            terminating: AtomicBool::new(false),
            writer: Mutex::new(Some(Box::new(writer))),
            queued_len: AtomicUsize::new(0),
        });
        Processor::install(&koutput);
        koutput
    }

    pub fn flow(&self) -> &FlowBase<Vec<u8>> {
        &self.flow_base
    }

    /// §4.5 `process`: enqueue `events` for the kernel writer, obstructing
    /// self once the queue exceeds `limit`.
    pub fn accept(self: &Arc<Self>, events: Vec<u8>) {
        if events.is_empty() {
            return;
        }
        self.queue.lock_or_panic().push_back(events);
        let newlen = self.queued_len.fetch_add(1, Ordering::AcqRel) + 1;
        if newlen > self.limit {
            self.flow_base.obstruct(OVERFLOW);
        }
        self.pump();
    }

    /// §4.5 `f_terminate`: stop accepting new writes; close once the
    /// queue and any in-flight transfer are empty.
    pub fn begin_terminate(self: &Arc<Self>) {
        self.terminating.store(true, Ordering::Release);
        self.maybe_close();
    }

    fn pump(self: &Arc<Self>) {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(chunk) = self.queue.lock_or_panic().pop_front() else {
            self.in_flight.store(false, Ordering::Release);
            self.maybe_close();
            return;
        };
        self.queued_len.fetch_sub(1, Ordering::AcqRel);
        self.maybe_clear();
        let koutput = self.clone();
        let context = self.proc_base.context().clone();
        context.runtime().clone().spawn(async move {
            let mut taken = koutput.writer.lock_or_panic().take();
            let write_result = if let Some(writer) = taken.as_mut() {
                writer.write_all(&chunk).await
            } else {
                Ok(())
            };
            *koutput.writer.lock_or_panic() = taken;
            koutput.in_flight.store(false, Ordering::Release);
            match write_result {
                Ok(()) => koutput.pump(),
                Err(err) => {
                    let koutput2 = koutput.clone();
                    context.enqueue(move || koutput2.self_arc().fault(proctree_common::RuntimeError::Io(err), None));
                }
            }
        });
    }

    fn maybe_clear(&self) {
        if self.queued_len.load(Ordering::Acquire) <= self.limit {
            self.flow_base.clear(&OVERFLOW);
        }
    }

    fn maybe_close(self: &Arc<Self>) {
        if self.terminating.load(Ordering::Acquire)
            && self.queue.lock_or_panic().is_empty()
            && !self.in_flight.load(Ordering::Acquire)
        {
            if let Some(mut writer) = self.writer.lock_or_panic().take() {
                let context = self.proc_base.context().clone();
                context.runtime().clone().spawn(async move {
                    let _ = writer.shutdown().await;
                });
            }
            self.self_arc().terminate(None);
        }
    }
}

impl Processor for KOutput {
    fn base(&self) -> &ProcessorBase {
        &self.proc_base
    }

    fn placement(&self) -> &'static str {
        "KOutput"
    }
}
