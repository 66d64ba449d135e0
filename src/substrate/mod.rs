//! The OS substrate tasks are realized on.
//!
//! Chosen once from the negotiated mode and dispatched once per operation:
//!
//! ```text
//!              ┌──────────────── Thread ────────────────┐
//! spawn  ──►   │ std::thread + emulated mailbox signals │
//! kill   ──►   ├─────────────── Process ────────────────┤
//! wait   ──►   │ fork/exec + tgkill + sigwait + waitpid │
//!              └────────────────────────────────────────┘
//! ```

mod control;
pub(crate) mod handoff;
mod mailbox;
mod process;
mod thread;

pub(crate) use process::{ProcessSubstrate, exit_child, is_forked_task};
pub(crate) use thread::ThreadSubstrate;

use crate::error::Result;
use crate::mode::ExecutionMode;
use crate::registry::Registry;
use crate::runtime::Instance;
use crate::signal::{MaskHow, SignalSet};
use crate::task::{CpuCore, ExitStatus, Program, TaskId};

use nix::sys::signal::Signal;
use std::sync::Arc;

pub(crate) enum Substrate {
    Thread(ThreadSubstrate),
    Process(ProcessSubstrate),
}

impl Substrate {
    pub(crate) fn new(mode: ExecutionMode, ntasks: usize) -> Result<Self> {
        if mode.is_thread() {
            Ok(Substrate::Thread(ThreadSubstrate::new(ntasks)?))
        } else {
            Ok(Substrate::Process(ProcessSubstrate::new(mode, ntasks)?))
        }
    }

    pub(crate) fn spawn(
        &self,
        instance: &Arc<Instance>,
        index: u32,
        program: Program,
        cpu: CpuCore,
    ) -> Result<()> {
        match self {
            Substrate::Thread(threads) => threads.spawn(instance, index, program, cpu),
            Substrate::Process(processes) => processes.spawn(instance, index, program, cpu),
        }
    }

    pub(crate) fn route(
        &self,
        registry: &Registry,
        caller: TaskId,
        target: TaskId,
        signal: Signal,
    ) -> Result<()> {
        match self {
            Substrate::Thread(threads) => threads.route(registry, caller, target, signal),
            Substrate::Process(processes) => processes.route(target, signal),
        }
    }

    pub(crate) fn sigmask(
        &self,
        caller: TaskId,
        how: MaskHow,
        set: SignalSet,
    ) -> Result<SignalSet> {
        match self {
            Substrate::Thread(threads) => threads.sigmask(caller, how, set),
            Substrate::Process(processes) => processes.sigmask(how, set),
        }
    }

    pub(crate) fn sigwait(&self, caller: TaskId, set: SignalSet) -> Result<Signal> {
        match self {
            Substrate::Thread(threads) => threads.sigwait(caller, set),
            Substrate::Process(processes) => processes.sigwait(set),
        }
    }

    pub(crate) fn reap(&self, registry: &Registry, index: u32) -> Result<ExitStatus> {
        match self {
            Substrate::Thread(threads) => threads.reap(registry, index),
            Substrate::Process(processes) => processes.reap(registry, index),
        }
    }

    pub(crate) fn reap_any(&self, registry: &Registry) -> Result<(u32, ExitStatus)> {
        match self {
            Substrate::Thread(threads) => threads.reap_any(registry),
            Substrate::Process(processes) => processes.reap_any(registry),
        }
    }

    /// Ends the calling child task with `code`.
    pub(crate) fn exit_task(&self, index: u32, code: i32) -> ! {
        match self {
            Substrate::Thread(threads) => threads.exit_task(index, code),
            Substrate::Process(_) => exit_child(code),
        }
    }
}
