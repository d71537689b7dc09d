// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `Unit` (§4.11): the root processor. Owns a flat address-keyed namespace
//! (`index`) plus a directory-style `hierarchy` mirroring it, doubles as
//! the `Controller` every directly-placed processor reports its exit to,
//! and is the tree's `FaultSink` — a faulted processor's sector is
//! interrupted and the processor itself is refiled under `faults/*`.
//!
//! Standard addresses (not enforced structurally, just convention every
//! caller is expected to follow): `bin/*`, `lib/*`, `libexec/*`, `etc/*`,
//! `dev/ports`, `dev/scheduler`, `dev/process`, `faults/*`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use proctree_common::{MutexExt, Result, RuntimeError};
use proctree_core::{Controller, ExecutionContext, ExitCallback, FaultSink, Processor, ProcessorBase, ProcessorId, Scheduler};
use proctree_supervisor::ProcessManager;
use tracing::{debug, warn};

use crate::ports::Ports;

/// A placement path, most-significant segment first, e.g. `["bin",
/// "worker-1"]`. Kept as an owned `Vec<String>` rather than a richer type:
/// the unit never interprets segments beyond using them as hierarchy keys.
pub type Address = Vec<String>;

/// Run once, in registration order, the first time the unit actuates.
/// Each initializer typically `place`s one or more root-level processors.
pub type RootInitializer = Box<dyn FnOnce(&Arc<Unit>) + Send>;

/// Fires when `bin/*` empties, in registration order; registered via
/// [`Unit::atexit`]. Distinct from [`Processor::atexit`]'s per-child
/// callback — this one belongs to the unit itself, not to any one child.
pub type UnitAtExit = Box<dyn FnOnce() + Send>;

pub struct Unit {
    base: ProcessorBase,
    scheduler: Mutex<Option<Arc<Scheduler>>>,
    /// The unit's kernel descriptor table, conventionally addressed at
    /// `dev/ports`. Owned here rather than by any one worker so a
    /// restarted worker re-`acquire`s the same bound sockets.
    ports: Ports,
    index: Mutex<HashMap<Address, Arc<dyn Processor>>>,
    hierarchy: Mutex<HashMap<Address, Vec<String>>>,
    reverse_index: Mutex<HashMap<ProcessorId, Address>>,
    exit_callbacks: Mutex<HashMap<ProcessorId, Vec<ExitCallback>>>,
    on_bin_empty: Mutex<Vec<UnitAtExit>>,
    roots: Mutex<Vec<RootInitializer>>,
    result_code: Mutex<i32>,
    self_ref: Mutex<Option<Weak<Unit>>>,
}

impl Unit {
    pub fn new(context: Arc<ExecutionContext>) -> Arc<Self> {
        let scheduler = Scheduler::root(context.clone());
        let unit = Arc::new(Unit {
            base: ProcessorBase::new(context.clone()),
            scheduler: Mutex::new(Some(scheduler)),
            ports: Ports::new(),
            index: Mutex::new(HashMap::new()),
            hierarchy: Mutex::new(HashMap::new()),
            reverse_index: Mutex::new(HashMap::new()),
            exit_callbacks: Mutex::new(HashMap::new()),
            on_bin_empty: Mutex::new(Vec::new()),
            roots: Mutex::new(Vec::new()),
            result_code: Mutex::new(0),
            self_ref: Mutex::new(None),
        });
        *unit.self_ref.lock_or_panic() = Some(Arc::downgrade(&unit));
        Processor::install(&unit);
        context.associate(Arc::downgrade(&unit) as Weak<dyn FaultSink>);
        unit
    }

    fn self_ref(&self) -> Arc<Unit> {
        self.self_ref
            .lock_or_panic()
            .as_ref()
            .and_then(Weak::upgrade)
            .expect("Unit::new installs self_ref before use")
    }

    /// Registers an initializer to run once, when this unit actuates.
    pub fn add_root(&self, init: RootInitializer) {
        self.roots.lock_or_panic().push(init);
    }

    /// The kernel descriptor table conventionally addressed at `dev/ports`.
    /// Bind under slot names like `"dev/ports/control"` so `listdir`
    /// mirrors what's actually bound.
    pub fn ports(&self) -> &Ports {
        &self.ports
    }

    /// The root scheduler, conventionally addressed at `dev/scheduler`.
    /// Returns `None` only after [`Unit::on_terminate`] has released it.
    pub fn scheduler_handle(&self) -> Option<Arc<Scheduler>> {
        self.scheduler.lock_or_panic().clone()
    }

    /// Places a [`ProcessManager`] at `dev/process`, the unit's
    /// conventional address for OS-process supervision.
    pub fn place_process_manager(self: &Arc<Self>, manager: Arc<ProcessManager>) -> Result<()> {
        self.place(manager as Arc<dyn Processor>, &["dev", "process"])
    }

    /// Registers a callback to run once `bin/*` empties. If `bin/*` is
    /// already empty by the time this is called, it fires immediately.
    pub fn atexit(self: &Arc<Self>, cb: UnitAtExit) {
        self.on_bin_empty.lock_or_panic().push(cb);
        if self.bin_is_empty() {
            self.check_bin_empty();
        }
    }

    /// The code [`std::process::exit`] is called with once the unit
    /// decides to terminate the OS process. Defaults to 0; a controller
    /// wanting a non-zero exit should call this before `bin/*` empties.
    pub fn set_result_code(&self, code: i32) {
        *self.result_code.lock_or_panic() = code;
    }

    fn seg(address: &[&str]) -> Address {
        address.iter().map(|s| s.to_string()).collect()
    }

    fn path_string(address: &Address) -> String {
        address.join("/")
    }

    fn link_hierarchy(&self, key: &Address) {
        if key.is_empty() {
            return;
        }
        let parent = key[..key.len() - 1].to_vec();
        let name = key[key.len() - 1].clone();
        let mut hierarchy = self.hierarchy.lock_or_panic();
        let children = hierarchy.entry(parent).or_default();
        if !children.contains(&name) {
            children.push(name);
        }
    }

    fn unlink_hierarchy(&self, key: &Address) {
        if key.is_empty() {
            return;
        }
        let parent = key[..key.len() - 1].to_vec();
        let name = &key[key.len() - 1];
        if let Some(children) = self.hierarchy.lock_or_panic().get_mut(&parent) {
            children.retain(|c| c != name);
        }
    }

    fn unlink(&self, key: &Address, id: ProcessorId) {
        self.index.lock_or_panic().remove(key);
        self.reverse_index.lock_or_panic().remove(&id);
        self.unlink_hierarchy(key);
    }

    /// §4.11 `place`: atomic to the index and hierarchy — if actuation
    /// causes the child to fault and unwind immediately, the placement is
    /// rolled back rather than left dangling.
    pub fn place(self: &Arc<Self>, obj: Arc<dyn Processor>, address: &[&str]) -> Result<()> {
        let key = Self::seg(address);
        if self.index.lock_or_panic().contains_key(&key) {
            return Err(RuntimeError::fault_msg(Self::path_string(&key), "address already occupied"));
        }
        let id = obj.base().id();
        self.index.lock_or_panic().insert(key.clone(), obj.clone());
        self.reverse_index.lock_or_panic().insert(id, key.clone());
        self.link_hierarchy(&key);
        obj.base().set_controller(Arc::downgrade(self) as Weak<dyn Controller>);
        obj.actuate();
        if obj.base().terminated() || obj.base().interrupted() {
            self.unlink(&key, id);
            return Err(RuntimeError::fault_msg(Self::path_string(&key), "actuation unwound immediately"));
        }
        Ok(())
    }

    /// §4.11 `delete`: terminates the named processor; namespace cleanup
    /// happens when its exit is reaped through the ordinary `Controller`
    /// path, same as any other exit.
    pub fn delete(&self, address: &[&str]) -> bool {
        let key = Self::seg(address);
        match self.index.lock_or_panic().get(&key).cloned() {
            Some(proc) => {
                proc.terminate(Some(Self::path_string(&key)));
                true
            }
            None => false,
        }
    }

    /// §4.11 `listdir`: immediate child names under `address`.
    pub fn listdir(&self, address: &[&str]) -> Vec<String> {
        let key = Self::seg(address);
        self.hierarchy.lock_or_panic().get(&key).cloned().unwrap_or_default()
    }

    /// Re-indexes `obj` under `faults/<path>` without touching its
    /// lifecycle — the caller is responsible for ensuring it is (or is
    /// about to be) interrupted.
    fn refile(&self, obj: Arc<dyn Processor>, address: &[&str]) -> Result<()> {
        let id = obj.base().id();
        if let Some(prior) = self.reverse_index.lock_or_panic().remove(&id) {
            self.index.lock_or_panic().remove(&prior);
            self.unlink_hierarchy(&prior);
        }
        let key = Self::seg(address);
        if self.index.lock_or_panic().contains_key(&key) {
            return Err(RuntimeError::fault_msg(Self::path_string(&key), "fault address already occupied"));
        }
        self.index.lock_or_panic().insert(key.clone(), obj.clone());
        self.reverse_index.lock_or_panic().insert(id, key.clone());
        self.link_hierarchy(&key);
        Ok(())
    }

    /// §4.11 `faulted`: files `resource` under `faults/<path>`.
    pub fn faulted(&self, resource: Arc<dyn Processor>, path: &[&str]) {
        let mut full: Vec<String> = vec!["faults".to_string()];
        full.extend(path.iter().map(|s| s.to_string()));
        let full_refs: Vec<&str> = full.iter().map(String::as_str).collect();
        if let Err(err) = self.refile(resource, &full_refs) {
            warn!(%err, "failed to file fault record");
        }
    }

    fn bin_is_empty(&self) -> bool {
        self.hierarchy
            .lock_or_panic()
            .get(&vec!["bin".to_string()])
            .map(Vec::is_empty)
            .unwrap_or(true)
    }

    /// Exit rule (§4.11): when `bin/*` empties, run the unit's own at-exit
    /// callbacks; if none were registered, terminate the OS process.
    fn check_bin_empty(self: &Arc<Self>) {
        if !self.bin_is_empty() {
            return;
        }
        let callbacks = std::mem::take(&mut *self.on_bin_empty.lock_or_panic());
        if callbacks.is_empty() {
            let code = *self.result_code.lock_or_panic();
            debug!(code, "bin/* empty with no at-exit callbacks, exiting process");
            std::process::exit(code);
        }
        for cb in callbacks {
            cb();
        }
    }
}

impl Processor for Unit {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    fn placement(&self) -> &'static str {
        "Unit"
    }

    fn on_actuate(&self, _self_arc: Arc<dyn Processor>) {
        let roots = std::mem::take(&mut *self.roots.lock_or_panic());
        let unit = self.self_ref();
        for init in roots {
            init(&unit);
        }
    }

    fn on_terminate(&self, self_arc: Arc<dyn Processor>) {
        let by = self.base.terminator_snapshot();
        let children: Vec<Arc<dyn Processor>> = self.index.lock_or_panic().values().cloned().collect();
        if children.is_empty() {
            self_arc.finish_termination();
            return;
        }
        for child in children {
            child.terminate(by.clone());
        }
    }

    fn on_interrupt(&self, _self_arc: Arc<dyn Processor>) {
        let by = self.base.interruptor_snapshot();
        let children: Vec<Arc<dyn Processor>> = self.index.lock_or_panic().values().cloned().collect();
        for child in children {
            child.interrupt(by.clone());
        }
    }
}

impl Controller for Unit {
    fn as_processor(self: Arc<Self>) -> Arc<dyn Processor> {
        self
    }

    fn exited(self: Arc<Self>, child: Arc<dyn Processor>) {
        let id = child.base().id();
        let address = self.reverse_index.lock_or_panic().remove(&id);
        if let Some(key) = &address {
            self.index.lock_or_panic().remove(key);
            self.unlink_hierarchy(key);
        }
        let callbacks = self.exit_callbacks.lock_or_panic().remove(&id).unwrap_or_default();
        if !child.base().interrupted() {
            for callback in callbacks {
                callback(child.clone());
            }
        }
        if self.base.terminating() && self.index.lock_or_panic().is_empty() {
            self.finish_termination();
        }
        if let Some(key) = address {
            if key.first().map(String::as_str) == Some("bin") {
                self.check_bin_empty();
            }
        }
    }

    fn exit_event_connect(&self, child: ProcessorId, callback: ExitCallback) {
        self.exit_callbacks.lock_or_panic().entry(child).or_default().push(callback);
    }

    fn scheduler(self: Arc<Self>) -> Option<Arc<Scheduler>> {
        self.scheduler.lock_or_panic().clone()
    }
}

impl FaultSink for Unit {
    /// §4.2/§7: the faulted processor's sector is interrupted; the
    /// processor itself is refiled under `faults/*` keyed by its former
    /// identity path.
    fn receive_fault(&self, processor: Arc<dyn Processor>) {
        if let Some(controller) = processor.base().controller() {
            let controller_proc = controller.clone().as_processor();
            if controller_proc.base().functioning() {
                controller_proc.interrupt(Some("fault".to_string()));
            }
        }
        let key = self.reverse_index.lock_or_panic().get(&processor.base().id()).cloned();
        let path = key.map(|k| k.join("-")).unwrap_or_else(|| processor.base().id().to_string());
        self.faulted(processor, &[path.as_str()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctree_common::{Config, Endpoint};
    use proctree_core::Sector;
    use proctree_supervisor::ProcessManager;
    use tokio::process::Command;

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
    async fn place_indexes_by_address_and_listdir_reports_it() {
        let ctx = ExecutionContext::new(Config::default());
        let unit = Unit::new(ctx.clone());
        unit.actuate();
        let worker = leaf(ctx);
        unit.place(worker.clone(), &["bin", "worker-1"]).unwrap();
        assert_eq!(unit.listdir(&["bin"]), vec!["worker-1".to_string()]);
        assert!(worker.base().functioning());
    }

    #[tokio::test]
    async fn placing_over_an_occupied_address_fails_without_side_effects() {
        let ctx = ExecutionContext::new(Config::default());
        let unit = Unit::new(ctx.clone());
        unit.actuate();
        let first = leaf(ctx.clone());
        unit.place(first, &["bin", "worker-1"]).unwrap();
        let second = leaf(ctx);
        assert!(unit.place(second, &["bin", "worker-1"]).is_err());
        assert_eq!(unit.listdir(&["bin"]), vec!["worker-1".to_string()]);
    }

    #[tokio::test]
    async fn delete_terminates_and_exit_empties_the_directory() {
        let ctx = ExecutionContext::new(Config::default());
        let unit = Unit::new(ctx.clone());
        unit.actuate();
        let worker = leaf(ctx);
        unit.place(worker.clone(), &["bin", "worker-1"]).unwrap();
        // Keeps `bin/*` emptying from falling through to `std::process::exit`
        // inside this test process.
        unit.atexit(Box::new(|| {}));
        assert!(unit.delete(&["bin", "worker-1"]));
        assert!(worker.base().terminated());
        assert!(unit.listdir(&["bin"]).is_empty());
    }

    #[tokio::test]
    async fn bin_emptying_runs_registered_atexit_callbacks() {
        let ctx = ExecutionContext::new(Config::default());
        let unit = Unit::new(ctx.clone());
        unit.actuate();
        let worker = leaf(ctx);
        unit.place(worker.clone(), &["bin", "worker-1"]).unwrap();

        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = fired.clone();
        unit.atexit(Box::new(move || {
            fired2.store(true, std::sync::atomic::Ordering::SeqCst);
        }));

        unit.delete(&["bin", "worker-1"]);
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn a_fault_interrupts_the_sector_and_files_under_faults() {
        let ctx = ExecutionContext::new(Config::default());
        let unit = Unit::new(ctx.clone());
        unit.actuate();
        let sector = Sector::new(ctx.clone());
        unit.place(sector.clone(), &["bin", "worker-1"]).unwrap();
        let child = leaf(ctx);
        sector.dispatch(child.clone());

        child.fault(RuntimeError::fault_msg("bin/worker-1", "boom"), None);

        // The sector freezes in place rather than exiting its slot: an
        // interrupted sector must not empty `bin/*`.
        assert!(sector.base().interrupted());
        assert_eq!(unit.listdir(&["bin"]), vec!["worker-1".to_string()]);
        assert_eq!(unit.listdir(&["faults"]).len(), 1);
    }

    #[tokio::test]
    async fn ports_are_reachable_off_the_unit_and_scheduler_handle_resolves() {
        let ctx = ExecutionContext::new(Config::default());
        let unit = Unit::new(ctx);
        unit.actuate();

        unit.ports().bind("dev/ports/control", &[Endpoint::coprocess(1, 1)]).unwrap();
        assert_eq!(unit.ports().endpoints("dev/ports/control").len(), 1);
        assert!(unit.scheduler_handle().is_some());
    }

    #[tokio::test]
    async fn process_manager_places_at_dev_process() {
        let ctx = ExecutionContext::new(Config::default());
        let unit = Unit::new(ctx.clone());
        unit.actuate();

        let manager = ProcessManager::new(ProcessorBase::new(ctx), 1, Box::new(|_fork_id| Command::new("true")));
        unit.place_process_manager(manager.clone()).unwrap();

        assert_eq!(unit.listdir(&["dev"]), vec!["process".to_string()]);
        assert!(manager.base().functioning());
    }
}
