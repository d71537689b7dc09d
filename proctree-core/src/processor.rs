// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The `Processor` lifecycle state machine (§4.2) and the `Controller`
//! relationship a processor holds with whatever sector dispatched it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use proctree_common::error::Association;
use proctree_common::{MutexExt, RuntimeError};
use tracing::{trace, warn};

use crate::context::ExecutionContext;

static PROCESSOR_IDS: AtomicU64 = AtomicU64::new(1);

pub type ProcessorId = u64;

pub(crate) fn next_processor_id() -> ProcessorId {
    PROCESSOR_IDS.fetch_add(1, Ordering::Relaxed)
}

/// The processor lifecycle state (§4.2), represented as a single enum field
/// rather than the independent `terminating`/`terminated` booleans the
/// original set non-atomically (Open Question (a)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Created,
    Actuated,
    Terminating,
    Terminated,
    Interrupted,
}

/// Shared state every concrete processor embeds. Mirrors the attribute list
/// in §3's Processor data model.
pub struct ProcessorBase {
    id: ProcessorId,
    state: Mutex<ProcessorState>,
    terminator: Mutex<Option<Association>>,
    interruptor: Mutex<Option<Association>>,
    exceptions: Mutex<Vec<(Option<Association>, RuntimeError)>>,
    controller: Mutex<Option<Weak<dyn Controller>>>,
    context: Arc<ExecutionContext>,
    /// Self-referential weak handle, populated by `Processor::install` right
    /// after the concrete type is wrapped in an `Arc`. Lets `&self` methods
    /// hand an `Arc<dyn Processor>` to collaborators without requiring
    /// every trait method to take `self: Arc<Self>` (which isn't object
    /// safe).
    self_arc: Mutex<Option<Weak<dyn Processor>>>,
}

impl ProcessorBase {
    pub fn new(context: Arc<ExecutionContext>) -> Self {
        ProcessorBase {
            id: next_processor_id(),
            state: Mutex::new(ProcessorState::Created),
            terminator: Mutex::new(None),
            interruptor: Mutex::new(None),
            exceptions: Mutex::new(Vec::new()),
            controller: Mutex::new(None),
            context,
            self_arc: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ProcessorId {
        self.id
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.lock_or_panic()
    }

    pub fn functioning(&self) -> bool {
        matches!(self.state(), ProcessorState::Actuated | ProcessorState::Terminating)
    }

    pub fn terminating(&self) -> bool {
        self.state() == ProcessorState::Terminating
    }

    pub fn terminated(&self) -> bool {
        self.state() == ProcessorState::Terminated
    }

    pub fn interrupted(&self) -> bool {
        self.state() == ProcessorState::Interrupted
    }

    pub fn controller(&self) -> Option<Arc<dyn Controller>> {
        self.controller.lock_or_panic().as_ref().and_then(Weak::upgrade)
    }

    pub fn set_controller(&self, controller: Weak<dyn Controller>) {
        *self.controller.lock_or_panic() = Some(controller);
    }

    pub fn exceptions(&self) -> Vec<(Option<Association>, String)> {
        self.exceptions
            .lock_or_panic()
            .iter()
            .map(|(a, e)| (a.clone(), e.to_string()))
            .collect()
    }

    pub fn terminator_snapshot(&self) -> Option<Association> {
        self.terminator.lock_or_panic().clone()
    }

    pub fn interruptor_snapshot(&self) -> Option<Association> {
        self.interruptor.lock_or_panic().clone()
    }

    /// Shared state transition for `Processor::interrupt` overrides: marks
    /// `Interrupted` and records `by`, returning `false` without touching
    /// anything if already interrupted. Exposed at `pub(crate)` so a
    /// controller-shaped processor (`Sector`) can reuse the transition while
    /// substituting its own post-interrupt notification.
    pub(crate) fn begin_interrupt(&self, by: Option<Association>) -> bool {
        {
            let mut state = self.state.lock_or_panic();
            if *state == ProcessorState::Interrupted {
                return false;
            }
            *state = ProcessorState::Interrupted;
        }
        *self.interruptor.lock_or_panic() = by;
        true
    }
}

/// Object-safe processor interface. Concrete types embed a
/// [`ProcessorBase`] and expose it via [`Processor::base`]; lifecycle
/// transitions are implemented once here as default methods operating on
/// that shared state, while subclass-specific completion is delegated to
/// the `on_*` hooks.
pub trait Processor: Send + Sync + 'static {
    fn base(&self) -> &ProcessorBase;

    /// The class-like placement key a controlling `Sector` indexes this
    /// processor under (§3: "indexed by placement key").
    fn placement(&self) -> &'static str {
        "Processor"
    }

    /// Subclass actuation hook, run after `actuated` flips to `true`.
    fn on_actuate(&self, _self_arc: Arc<dyn Processor>) {}

    /// Subclass termination hook. Implementations that need to drain
    /// something before finishing must call [`Processor::finish_termination`]
    /// themselves once drained; the default calls it immediately.
    fn on_terminate(&self, self_arc: Arc<dyn Processor>) {
        self_arc.finish_termination();
    }

    /// Subclass interrupt hook, run after `interrupted` flips to `true` but
    /// before the exit is signalled to the controller.
    fn on_interrupt(&self, _self_arc: Arc<dyn Processor>) {}

    /// Installs the self-referential weak pointer. Every constructor must
    /// call this immediately after wrapping the value in an `Arc`, e.g.
    /// `Processor::install(&arc)`.
    fn install(self: &Arc<Self>)
    where
        Self: Sized,
    {
        let weak: Weak<dyn Processor> = Arc::downgrade(self) as Weak<dyn Processor>;
        *self.base().self_arc.lock_or_panic() = Some(weak);
    }

    fn self_arc(&self) -> Arc<dyn Processor> {
        self.base()
            .self_arc
            .lock_or_panic()
            .as_ref()
            .and_then(Weak::upgrade)
            .expect("Processor::install must be called before use")
    }

    fn actuate(&self) {
        {
            let mut state = self.base().state.lock_or_panic();
            if *state != ProcessorState::Created {
                return;
            }
            *state = ProcessorState::Actuated;
        }
        self.on_actuate(self.self_arc());
    }

    /// §4.2: no-op, returns `false`, unless functioning and not already
    /// terminating.
    fn terminate(&self, by: Option<Association>) -> bool {
        {
            let mut state = self.base().state.lock_or_panic();
            if !matches!(*state, ProcessorState::Actuated) {
                return false;
            }
            *state = ProcessorState::Terminating;
        }
        *self.base().terminator.lock_or_panic() = by;
        self.on_terminate(self.self_arc());
        true
    }

    /// Called by subclasses once drained to complete the terminate →
    /// terminated transition and notify the controller. Hands the
    /// controller an owned `Arc<dyn Processor>` via `self_arc()`; callable
    /// directly on either a concrete processor or an `Arc<dyn Processor>`.
    fn finish_termination(&self) {
        {
            let mut state = self.base().state.lock_or_panic();
            if *state == ProcessorState::Terminated || *state == ProcessorState::Interrupted {
                return;
            }
            *state = ProcessorState::Terminated;
        }
        if let Some(controller) = self.base().controller() {
            controller.exited(self.self_arc());
        }
    }

    /// §4.2/§5: immediate, cascades, never fires at-exit callbacks.
    fn interrupt(&self, by: Option<Association>) -> bool {
        if !self.base().begin_interrupt(by) {
            return false;
        }
        let arc = self.self_arc();
        self.on_interrupt(arc.clone());
        if let Some(controller) = self.base().controller() {
            if controller.clone().as_processor().base().functioning() {
                controller.exited(arc);
            }
        }
        true
    }

    /// §4.2/§7: record the exception and delegate to the context's fault
    /// sink (normally the owning `Unit`).
    fn fault(&self, err: RuntimeError, assoc: Option<Association>) {
        warn!(assoc = assoc.as_deref().unwrap_or(""), error = %err, "processor fault");
        self.base()
            .exceptions
            .lock_or_panic()
            .push((assoc, err));
        self.base().context.faulted(self.self_arc());
    }

    /// §4.2: register a callback to run once this processor has exited
    /// normally (never on interrupt). Delegates to the controller's
    /// exit-event bookkeeping.
    fn atexit(&self, callback: ExitCallback) {
        if self.base().terminated() {
            trace!("atexit callback invoked immediately: already terminated");
            callback(self.self_arc());
            return;
        }
        if self.base().interrupted() {
            // §3: interrupted processors never fire at-exit callbacks.
            return;
        }
        if let Some(controller) = self.base().controller() {
            controller.exit_event_connect(self.base().id(), callback);
        }
    }
}

pub type ExitCallback = Box<dyn FnOnce(Arc<dyn Processor>) + Send>;

/// Implemented by processors that supervise children: `Sector` and `Unit`.
/// Kept separate from `Processor` so a weak `controller` backref can be
/// typed concretely without every processor needing sector-shaped state.
pub trait Controller: Send + Sync + 'static {
    fn as_processor(self: Arc<Self>) -> Arc<dyn Processor>;

    /// §4.3: record the child as exiting and (idempotently) enqueue a reap.
    fn exited(self: Arc<Self>, child: Arc<dyn Processor>);

    /// §4.2 `atexit`: register a callback against a specific child id.
    fn exit_event_connect(&self, child: ProcessorId, callback: ExitCallback);

    /// §4.9: nearest-ancestor scheduler delegation. `None` at the Unit
    /// root means "use the context's raw timer primitives directly".
    fn scheduler(self: Arc<Self>) -> Option<Arc<crate::scheduler::Scheduler>> {
        None
    }
}
