//! Task registry: the fixed-size table of task records.
//!
//! The root is the only writer of the table, with one exception: a thread-mode
//! task records its own terminal state when its body returns. That transition
//! is append-only (`Running` to `Exited`/`Signaled`, once) and wakes anyone
//! blocked in a reap.

mod slot;

use crate::error::{Error, Result};
use crate::task::{CpuCore, ExitStatus, TaskId, TaskState};

use parking_lot::{Condvar, Mutex};
use slot::Slot;
use tracing::debug;

pub(crate) struct Registry {
    ntasks: usize,
    slots: Mutex<Vec<Slot>>,
    terminated: Condvar,
}

impl Registry {
    pub(crate) fn new(ntasks: usize) -> Self {
        Self {
            ntasks,
            slots: Mutex::new(vec![Slot::PENDING; ntasks]),
            terminated: Condvar::new(),
        }
    }

    pub(crate) fn ntasks(&self) -> usize {
        self.ntasks
    }

    /// Checks that `target` names a task of this instance.
    pub(crate) fn check_target(&self, target: TaskId) -> Result<()> {
        match target {
            TaskId::Root => Ok(()),
            TaskId::Child(index) if (index as usize) < self.ntasks => Ok(()),
            TaskId::Child(_) => Err(Error::OutOfRange(target)),
        }
    }

    /// Claims a pending slot for a spawn and marks it `Running`.
    ///
    /// The slot is marked before the task is realized so that a task which
    /// terminates immediately still finds itself running. Call
    /// [`Registry::release`] if realization fails.
    pub(crate) fn reserve(&self, desired: Option<u32>, cpu: CpuCore) -> Result<u32> {
        let mut slots = self.slots.lock();

        let index = match desired {
            Some(index) => {
                let slot = slots.get(index as usize).ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "task id {index} is outside [0, {})",
                        self.ntasks
                    ))
                })?;

                if !matches!(slot.state, TaskState::Pending) || slot.reaped {
                    return Err(Error::InvalidArgument(format!(
                        "task id {index} is already taken"
                    )));
                }

                index
            }
            None => slots
                .iter()
                .position(|slot| matches!(slot.state, TaskState::Pending) && !slot.reaped)
                .map(|index| index as u32)
                .ok_or_else(|| Error::InvalidArgument("every task id is taken".into()))?,
        };

        let slot = &mut slots[index as usize];
        slot.state = TaskState::Running;
        slot.cpu = cpu;

        Ok(index)
    }

    /// Returns a reserved slot to `Pending` after a failed realization.
    pub(crate) fn release(&self, index: u32) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(index as usize) {
            *slot = Slot::PENDING;
        }
    }

    pub(crate) fn state(&self, index: u32) -> Result<TaskState> {
        self.slots
            .lock()
            .get(index as usize)
            .map(|slot| slot.state)
            .ok_or(Error::OutOfRange(TaskId::Child(index)))
    }

    /// Records the terminal state of a running task and wakes reapers.
    ///
    /// Ignored unless the task is `Running`, so the transition happens once.
    pub(crate) fn record_exit(&self, index: u32, status: ExitStatus) {
        let mut slots = self.slots.lock();

        if let Some(slot) = slots.get_mut(index as usize)
            && matches!(slot.state, TaskState::Running)
        {
            slot.state = status.into();
            debug!(task = index, %status, cpu = ?slot.cpu, "task terminated");
            self.terminated.notify_all();
        }
    }

    /// Fails unless `index` holds a task that can still be reaped.
    pub(crate) fn ensure_reapable(&self, index: u32) -> Result<()> {
        let slots = self.slots.lock();
        let slot = slots
            .get(index as usize)
            .ok_or(Error::OutOfRange(TaskId::Child(index)))?;

        if slot.is_outstanding() {
            Ok(())
        } else {
            Err(Error::NoSuchTask(TaskId::Child(index)))
        }
    }

    /// Marks a terminated task as collected and returns its status.
    pub(crate) fn mark_reaped(&self, index: u32, status: ExitStatus) -> ExitStatus {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(index as usize) {
            if matches!(slot.state, TaskState::Running) {
                slot.state = status.into();
            }
            slot.reaped = true;
        }
        status
    }

    /// Blocks until task `index` terminates, then reaps it.
    pub(crate) fn wait_terminated(&self, index: u32) -> Result<ExitStatus> {
        let mut slots = self.slots.lock();

        loop {
            let slot = slots
                .get_mut(index as usize)
                .ok_or(Error::OutOfRange(TaskId::Child(index)))?;

            if !slot.is_outstanding() {
                return Err(Error::NoSuchTask(TaskId::Child(index)));
            }

            if let Some(status) = slot.state.exit_status() {
                slot.reaped = true;
                return Ok(status);
            }

            self.terminated.wait(&mut slots);
        }
    }

    /// Blocks until any outstanding task terminates, then reaps it.
    pub(crate) fn wait_any_terminated(&self) -> Result<(u32, ExitStatus)> {
        let mut slots = self.slots.lock();

        loop {
            if let Some(index) = slots.iter().position(Slot::is_reapable) {
                let slot = &mut slots[index];
                slot.reaped = true;

                let status = slot
                    .state
                    .exit_status()
                    .ok_or(Error::NoSuchTask(TaskId::Child(index as u32)))?;

                return Ok((index as u32, status));
            }

            if !slots.iter().any(Slot::is_outstanding) {
                return Err(Error::NoOutstandingTasks);
            }

            self.terminated.wait(&mut slots);
        }
    }

    /// Indices of every spawned task that has not been reaped.
    pub(crate) fn outstanding(&self) -> Vec<u32> {
        self.slots
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_outstanding())
            .map(|(index, _)| index as u32)
            .collect()
    }

    /// True while any spawned task has not been reaped.
    pub(crate) fn has_outstanding(&self) -> bool {
        self.slots.lock().iter().any(Slot::is_outstanding)
    }
}
