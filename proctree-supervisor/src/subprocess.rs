// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `Subprocess` (§4.10): a `Processor` that tracks a set of OS pids and
//! surfaces their exit through the ordinary lifecycle machinery instead of
//! a bespoke "wait for process" API. Delivery is driven by a shared
//! `SIGCHLD`-adjacent `tokio::signal::unix` listener that drains
//! `waitpid(WNOHANG)` rather than blocking on `wait4` directly.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use proctree_common::MutexExt;
use proctree_core::{Processor, ProcessorBase};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, warn};

/// The outcome `sp_exit` records for one pid: `Some(code)` for a normal
/// exit, `None` if the process was killed by a signal.
pub type ExitOutcome = Option<i32>;

fn outcome_of(status: &WaitStatus) -> ExitOutcome {
    match status {
        WaitStatus::Exited(_, code) => Some(*code),
        _ => None,
    }
}

/// Reaps `pid` if it has already exited. Only valid to call for a pid no
/// other `waitpid` has yet consumed the status of.
fn reap(pid: Pid) -> ExitOutcome {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(status) if status != WaitStatus::StillAlive => outcome_of(&status),
        _ => None,
    }
}

pub struct Subprocess {
    base: ProcessorBase,
    pids: Mutex<HashSet<Pid>>,
    exit_status: Mutex<HashMap<Pid, ExitOutcome>>,
    self_ref: Mutex<Option<Weak<Subprocess>>>,
}

impl Subprocess {
    pub fn new(base: ProcessorBase, pids: impl IntoIterator<Item = Pid>) -> Arc<Self> {
        let sp = Arc::new(Subprocess {
            base,
            pids: Mutex::new(pids.into_iter().collect()),
            exit_status: Mutex::new(HashMap::new()),
            self_ref: Mutex::new(None),
        });
        *sp.self_ref.lock_or_panic() = Some(Arc::downgrade(&sp));
        Processor::install(&sp);
        sp
    }

    fn self_ref(&self) -> Arc<Subprocess> {
        self.self_ref
            .lock_or_panic()
            .as_ref()
            .and_then(Weak::upgrade)
            .expect("Subprocess::new installs self_ref before use")
    }

    pub fn exit_status(&self) -> HashMap<Pid, ExitOutcome> {
        self.exit_status.lock_or_panic().clone()
    }

    /// §4.10 `sp_exit`: records the reaped outcome and, once every tracked
    /// pid has exited and this processor is not interrupted, completes
    /// termination. `outcome` must already have been determined by the
    /// single `waitpid` call that observed `pid` leave `StillAlive`.
    fn sp_exit(self: &Arc<Self>, pid: Pid, outcome: ExitOutcome) {
        self.exit_status.lock_or_panic().insert(pid, outcome);
        self.pids.lock_or_panic().remove(&pid);
        debug!(pid = pid.as_raw(), ?outcome, "subprocess exited");
        let drained = self.pids.lock_or_panic().is_empty();
        if drained && !self.base().interrupted() {
            self.clone().finish_termination();
        }
    }

    /// Sends `sig` to every still-tracked pid. Dead pids (`ESRCH`) are
    /// quietly dropped rather than treated as a fault — exiting is exactly
    /// what this call is trying to cause.
    pub fn sp_signal(&self, sig: Signal) {
        for pid in self.pids.lock_or_panic().iter() {
            if let Err(err) = signal::kill(*pid, sig) {
                if err != nix::errno::Errno::ESRCH {
                    warn!(pid = pid.as_raw(), signal = ?sig, %err, "failed to signal subprocess");
                }
            }
        }
    }

    /// §4.10 `abort`: SIGQUIT every tracked pid (typically to request a
    /// core dump), without otherwise touching the lifecycle state.
    pub fn abort(&self) {
        self.sp_signal(Signal::SIGQUIT);
    }

    fn is_alive(pid: Pid) -> bool {
        signal::kill(pid, None).is_ok()
    }

    /// Spawns the shared exit-delivery listener: polls `waitpid(WNOHANG)`
    /// for any reapable child every time the kernel schedules this process
    /// a `SIGCHLD`, and routes matches for tracked pids back onto the
    /// driver queue via [`proctree_core::ExecutionContext::enqueue`].
    fn watch(self: &Arc<Self>) {
        let sp = self.clone();
        let context = self.base().context().clone();
        context.runtime().clone().spawn(async move {
            let Ok(mut sigchld) = signal(SignalKind::child()) else {
                warn!("failed to install SIGCHLD listener; subprocess exits will not be observed");
                return;
            };
            loop {
                if sigchld.recv().await.is_none() {
                    return;
                }
                loop {
                    let tracked: Vec<Pid> = sp.pids.lock_or_panic().iter().copied().collect();
                    if tracked.is_empty() {
                        break;
                    }
                    let mut any_reaped = false;
                    for pid in tracked {
                        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                            Ok(WaitStatus::StillAlive) | Err(_) => {}
                            Ok(status) => {
                                any_reaped = true;
                                let outcome = outcome_of(&status);
                                let sp2 = sp.clone();
                                sp.base().context().enqueue(move || sp2.sp_exit(pid, outcome));
                            }
                        }
                    }
                    if !any_reaped {
                        break;
                    }
                }
            }
        });
    }
}

impl Processor for Subprocess {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    fn placement(&self) -> &'static str {
        "Subprocess"
    }

    /// §4.10 `actuate`: subscribe to exit, then validate each pid is still
    /// alive. A pid already gone between spawn and subscribe is reaped
    /// synchronously rather than waiting for a `SIGCHLD` that already fired.
    fn on_actuate(&self, _self_arc: Arc<dyn Processor>) {
        let sp = self.self_ref();
        sp.watch();
        let dead: Vec<Pid> = self
            .pids
            .lock_or_panic()
            .iter()
            .copied()
            .filter(|pid| !Self::is_alive(*pid))
            .collect();
        for pid in dead {
            let outcome = reap(pid);
            sp.sp_exit(pid, outcome);
        }
    }

    /// §4.10 `terminate`: SIGTERM every tracked pid; completion waits for
    /// `sp_exit` to observe them all gone.
    fn on_terminate(&self, _self_arc: Arc<dyn Processor>) {
        self.sp_signal(Signal::SIGTERM);
        if self.pids.lock_or_panic().is_empty() {
            self.self_ref().finish_termination();
        }
    }

    /// §4.10 `interrupt`: SIGKILL every tracked pid immediately; does not
    /// wait for the reap (interrupts never fire at-exit callbacks anyway).
    fn on_interrupt(&self, _self_arc: Arc<dyn Processor>) {
        self.sp_signal(Signal::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctree_common::Config;
    use proctree_core::context::ExecutionContext;

    fn spawn_sleeper() -> Pid {
        let child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep(1) for test");
        Pid::from_raw(child.id() as i32)
    }

    #[tokio::test]
    async fn terminate_sends_sigterm_and_waits_for_the_reap() {
        let ctx = ExecutionContext::new(Config::default());
        let pid = spawn_sleeper();
        let sp = Subprocess::new(ProcessorBase::new(ctx), vec![pid]);
        sp.actuate();
        assert!(Subprocess::is_alive(pid));

        sp.terminate(None);
        // give the SIGTERM + SIGCHLD + waitpid round trip time to land
        for _ in 0..50 {
            if sp.base().terminated() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(sp.base().terminated());
        assert!(sp.exit_status().contains_key(&pid));
    }

    #[tokio::test]
    async fn interrupt_signals_without_waiting_for_the_reap() {
        let ctx = ExecutionContext::new(Config::default());
        let pid = spawn_sleeper();
        let sp = Subprocess::new(ProcessorBase::new(ctx), vec![pid]);
        sp.actuate();
        sp.interrupt(None);
        assert!(sp.base().interrupted());
        // cleanup: make sure the test doesn't leak a sleeping child
        let _ = signal::kill(pid, Signal::SIGKILL);
        let _ = waitpid(pid, None);
    }
}
