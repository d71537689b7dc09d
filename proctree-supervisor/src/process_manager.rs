// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `ProcessManager` (§4.10): a fixed-`concurrency` fork-identity worker
//! pool. Each slot `1..=concurrency` is kept alive by respawning the worker
//! command under it whenever the previous occupant exits, for as long as
//! the manager itself is still functioning.

use std::collections::HashMap;
use std::sync::Arc;

use proctree_common::MutexExt;
use proctree_core::{Processor, ProcessorBase, ProcessorState};
use std::sync::Mutex;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// The environment variable a forked worker reads its fork-id from (§6).
pub const SECTORS_VAR: &str = "SECTORS";

/// Builds the `tokio::process::Command` for a given fork-id. Implemented
/// per-deployment (e.g. re-exec the current binary, or launch a fixed
/// worker executable) and handed to [`ProcessManager::new`].
pub type WorkerCommand = Box<dyn Fn(u32) -> Command + Send + Sync>;

pub struct ProcessManager {
    base: ProcessorBase,
    concurrency: u32,
    command: WorkerCommand,
    /// Pids of currently-live children, tracked only so `on_terminate` can
    /// signal them; the owning `Child` handle lives inside the spawned
    /// watcher task for the duration of its `wait()`.
    children: Mutex<HashMap<u32, u32>>,
    self_ref: Mutex<Option<std::sync::Weak<ProcessManager>>>,
}

impl ProcessManager {
    pub fn new(base: ProcessorBase, concurrency: u32, command: WorkerCommand) -> Arc<Self> {
        let pm = Arc::new(ProcessManager {
            base,
            concurrency,
            command,
            children: Mutex::new(HashMap::new()),
            self_ref: Mutex::new(None),
        });
        *pm.self_ref.lock_or_panic() = Some(Arc::downgrade(&pm));
        Processor::install(&pm);
        pm
    }

    fn self_ref(&self) -> Arc<ProcessManager> {
        self.self_ref
            .lock_or_panic()
            .as_ref()
            .and_then(std::sync::Weak::upgrade)
            .expect("ProcessManager::new installs self_ref before use")
    }

    pub fn concurrency(&self) -> u32 {
        self.concurrency
    }

    fn spawn_fid(self: &Arc<Self>, fid: u32) {
        let mut command = (self.command)(fid);
        command.env(SECTORS_VAR, fid.to_string());
        match command.spawn() {
            Ok(child) => {
                let pid = child.id().unwrap_or(0);
                debug!(fid, pid, "spawned worker");
                self.children.lock_or_panic().insert(fid, pid);
                self.watch_fid(fid, child);
            }
            Err(err) => warn!(fid, %err, "failed to spawn worker"),
        }
    }

    /// Owns `child` for the duration of its `wait()`, then re-enters the
    /// exit via [`ExecutionContext::enqueue`] so the crash-loop restart
    /// decision happens on the driver like everything else (ambient
    /// addition: directly-spawned workers are reaped through
    /// `tokio::process::Child` rather than the `waitpid`/`SIGCHLD` path
    /// `Subprocess` uses for pids adopted from elsewhere).
    fn watch_fid(self: &Arc<Self>, fid: u32, mut child: Child) {
        let pm = self.clone();
        let context = self.base().context().clone();
        context.runtime().clone().spawn(async move {
            let status = child.wait().await;
            if let Err(err) = status {
                warn!(fid, %err, "failed to wait for worker");
            }
            context.enqueue(move || pm.fid_exited(fid));
        });
    }

    /// §4.10: if this manager is still functioning and `fid` is within the
    /// current `concurrency`, immediately re-forks the same fid. No restart
    /// once the manager itself has terminated.
    fn fid_exited(self: &Arc<Self>, fid: u32) {
        self.children.lock_or_panic().remove(&fid);
        debug!(fid, "worker exited");
        if self.base().state() == ProcessorState::Actuated && fid <= self.concurrency {
            self.spawn_fid(fid);
        }
    }
}

impl Processor for ProcessManager {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    fn placement(&self) -> &'static str {
        "ProcessManager"
    }

    /// §4.10 `actuate`: fork `concurrency` children numbered `1..=N`.
    fn on_actuate(&self, _self_arc: Arc<dyn Processor>) {
        let pm = self.self_ref();
        for fid in 1..=self.concurrency {
            pm.spawn_fid(fid);
        }
    }

    /// §4.10: no restart once the manager terminates; SIGTERM every live
    /// child and wait for the reaper loop to empty `children` before
    /// completing.
    fn on_terminate(&self, _self_arc: Arc<dyn Processor>) {
        for pid in self.children.lock_or_panic().values() {
            let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(*pid as i32), nix::sys::signal::Signal::SIGTERM);
        }
        if self.children.lock_or_panic().is_empty() {
            self.self_ref().finish_termination();
        } else {
            self.poll_for_drain();
        }
    }
}

impl ProcessManager {
    fn poll_for_drain(&self) {
        let pm = self.self_ref();
        let context = self.base().context().clone();
        context.runtime().clone().spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                if pm.children.lock_or_panic().is_empty() {
                    let pm2 = pm.clone();
                    pm.base().context().enqueue(move || {
                        if !pm2.base().terminated() {
                            pm2.finish_termination();
                        }
                    });
                    return;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctree_common::Config;
    use proctree_core::context::ExecutionContext;

    #[tokio::test]
    async fn actuate_spawns_one_worker_per_fid_with_sectors_set() {
        let ctx = ExecutionContext::new(Config::default());
        let pm = ProcessManager::new(
            ProcessorBase::new(ctx),
            2,
            Box::new(|_fid| {
                let mut cmd = Command::new("sh");
                cmd.args(["-c", "sleep 0.2"]);
                cmd
            }),
        );
        pm.actuate();
        assert_eq!(pm.children.lock_or_panic().len(), 2);
    }

    #[tokio::test]
    async fn terminate_stops_respawning_once_children_drain() {
        let ctx = ExecutionContext::new(Config::default());
        let pm = ProcessManager::new(
            ProcessorBase::new(ctx),
            1,
            Box::new(|_fid| {
                let mut cmd = Command::new("sh");
                cmd.args(["-c", "sleep 0.05"]);
                cmd
            }),
        );
        pm.actuate();
        pm.terminate(None);
        for _ in 0..50 {
            if pm.base().terminated() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert!(pm.base().terminated());
    }
}
