//! Thread substrate: every task is a thread of the root's process.
//!
//! Signals between tasks never touch the OS here. Each task owns a
//! [`Mailbox`], the router posts into it and `sigwait` parks on it. Task
//! threads keep the reserved set blocked at the OS level so a stray
//! process-directed signal is never taken by the wrong task.

use super::mailbox::{Delivery, Mailbox};
use crate::affinity;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::runtime::Instance;
use crate::runtime::context::{self, Unwind};
use crate::signal::{self, MaskHow, SignalSet};
use crate::task::{CpuCore, ExitStatus, Program, ProgramKind, TaskId, TaskMain};

use nix::sys::signal::{Signal, kill};
use nix::unistd::getpid;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::warn;

pub(crate) struct ThreadSubstrate {
    /// One mailbox per child, followed by the root's.
    mailboxes: Arc<[Mailbox]>,
    handles: Mutex<Vec<Option<JoinHandle<()>>>>,
}

impl ThreadSubstrate {
    pub(crate) fn new(ntasks: usize) -> Result<Self> {
        let mailboxes: Arc<[Mailbox]> = (0..=ntasks).map(|_| Mailbox::new()).collect();

        // The root starts from whatever its thread already blocks.
        mailboxes[ntasks].reset(signal::current_thread_mask()?);

        Ok(Self {
            mailboxes,
            handles: Mutex::new((0..ntasks).map(|_| None).collect()),
        })
    }

    fn mailbox(&self, task: TaskId) -> Result<&Mailbox> {
        let ntasks = self.mailboxes.len() - 1;
        let slot = match task {
            TaskId::Root => Some(ntasks),
            TaskId::Child(index) if (index as usize) < ntasks => Some(index as usize),
            TaskId::Child(_) => None,
        };

        slot.and_then(|slot| self.mailboxes.get(slot)).ok_or(Error::OutOfRange(task))
    }

    pub(crate) fn spawn(
        &self,
        instance: &Arc<Instance>,
        index: u32,
        program: Program,
        cpu: CpuCore,
    ) -> Result<()> {
        let main = match program.kind {
            ProgramKind::Entry(main) => main,
            ProgramKind::Image { path, .. } => {
                return Err(Error::InvalidArgument(format!(
                    "cannot run image {} in thread mode",
                    path.display()
                )));
            }
        };

        let inherited = self.mailbox(TaskId::Root)?.mask();
        self.mailbox(TaskId::Child(index))?.reset(inherited);

        let instance = Arc::clone(instance);
        let mailboxes = Arc::clone(&self.mailboxes);

        // New threads inherit the spawner's mask, so the task never runs
        // with the reserved set unblocked.
        let previous = signal::thread_mask(MaskHow::Block, signal::reserved())?;

        let spawned = thread::Builder::new()
            .name(format!("tandem-task-{index}"))
            .spawn(move || {
                if let Err(err) = affinity::apply(cpu) {
                    warn!(task = index, ?cpu, error = %err, "could not apply cpu affinity");
                }

                let mailbox = &mailboxes[index as usize];
                let status = context::enter_task(TaskId::Child(index), || {
                    run_body(index, main, mailbox)
                });

                instance.registry.record_exit(index, status);
            });

        if let Err(err) = signal::thread_mask(MaskHow::SetMask, previous) {
            warn!(error = %err, "could not restore the spawner's signal mask");
        }

        self.handles.lock()[index as usize] = Some(spawned?);

        Ok(())
    }

    pub(crate) fn route(
        &self,
        registry: &Registry,
        caller: TaskId,
        target: TaskId,
        signal: Signal,
    ) -> Result<()> {
        self.checkpoint(caller)?;

        if let TaskId::Child(index) = target {
            registry.ensure_reapable(index)?;

            // Terminated but unreaped: the signal is accepted and dropped.
            if registry.state(index)?.is_terminated() {
                return Ok(());
            }
        }

        match self.mailbox(target)?.post(signal) {
            Delivery::Fatal if target.is_root() || target == caller => {
                self.terminate(target, signal)
            }
            Delivery::Queued | Delivery::Discarded | Delivery::Fatal => Ok(()),
        }
    }

    pub(crate) fn sigmask(
        &self,
        caller: TaskId,
        how: MaskHow,
        set: SignalSet,
    ) -> Result<SignalSet> {
        let mailbox = self.mailbox(caller)?;
        let (previous, fatal) = mailbox.update_mask(how, set);

        let os_mask = match caller {
            TaskId::Root => mailbox.mask(),
            TaskId::Child(_) => mailbox.mask().union(signal::reserved()),
        };
        signal::thread_mask(MaskHow::SetMask, os_mask)?;

        if let Some(signal) = fatal {
            self.terminate(caller, signal)?;
        }

        Ok(previous)
    }

    pub(crate) fn sigwait(&self, caller: TaskId, set: SignalSet) -> Result<Signal> {
        let mailbox = self.mailbox(caller)?;

        loop {
            match mailbox.wait(set) {
                Ok(signal) => return Ok(signal),
                Err(fatal) => self.terminate(caller, fatal)?,
            }
        }
    }

    pub(crate) fn reap(&self, registry: &Registry, index: u32) -> Result<ExitStatus> {
        let status = registry.wait_terminated(index)?;
        self.join(index);
        Ok(status)
    }

    pub(crate) fn reap_any(&self, registry: &Registry) -> Result<(u32, ExitStatus)> {
        let (index, status) = registry.wait_any_terminated()?;
        self.join(index);
        Ok((index, status))
    }

    /// Ends the calling child task, reporting a pending fatal signal over
    /// the requested code.
    pub(crate) fn exit_task(&self, index: u32, code: i32) -> ! {
        let fatal = self.mailbox(TaskId::Child(index)).ok().and_then(Mailbox::fatal);

        context::unwind(match fatal {
            Some(signal) => Unwind::Signal(signal),
            None => Unwind::Exit(code),
        })
    }

    /// Unwinds the calling task if a fatal signal reached it since its last
    /// runtime call.
    fn checkpoint(&self, caller: TaskId) -> Result<()> {
        if let TaskId::Child(_) = caller
            && let Some(signal) = self.mailbox(caller)?.fatal()
        {
            context::unwind(Unwind::Signal(signal));
        }

        Ok(())
    }

    /// Applies a fatal signal to `task`, which must be the caller or the root.
    ///
    /// The root task is the process, so its fatal signals are raised for real.
    /// Returns only if the process survives (a handler is installed).
    fn terminate(&self, task: TaskId, signal: Signal) -> Result<()> {
        match task {
            TaskId::Root => {
                self.mailbox(TaskId::Root)?.clear_fatal();
                kill(getpid(), signal)?;
                Ok(())
            }
            TaskId::Child(_) => context::unwind(Unwind::Signal(signal)),
        }
    }

    fn join(&self, index: u32) {
        let handle = self
            .handles
            .lock()
            .get_mut(index as usize)
            .and_then(Option::take);

        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!(task = index, "task thread did not shut down cleanly");
        }
    }
}

/// Runs a task body and turns however it ended into an exit status.
fn run_body(index: u32, main: TaskMain, mailbox: &Mailbox) -> ExitStatus {
    match panic::catch_unwind(AssertUnwindSafe(|| main(index))) {
        Ok(code) => match mailbox.fatal() {
            Some(signal) => ExitStatus::Signaled(signal),
            None => ExitStatus::Exited(code),
        },
        Err(payload) => match payload.downcast::<Unwind>() {
            Ok(reason) => match *reason {
                Unwind::Exit(code) => ExitStatus::Exited(code),
                Unwind::Signal(signal) => ExitStatus::Signaled(signal),
            },
            Err(_) => {
                warn!(task = index, "task body panicked");
                ExitStatus::Exited(101)
            }
        },
    }
}
