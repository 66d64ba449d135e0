use crate::task::{CpuCore, TaskState};

/// One task record. Only the registry touches these.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Slot {
    pub(crate) state: TaskState,
    pub(crate) reaped: bool,
    pub(crate) cpu: CpuCore,
}

impl Slot {
    pub(crate) const PENDING: Self = Self {
        state: TaskState::Pending,
        reaped: false,
        cpu: CpuCore::AsIs,
    };

    /// Holds a live or terminated-but-unreaped task.
    pub(crate) fn is_outstanding(&self) -> bool {
        !self.reaped && !matches!(self.state, TaskState::Pending)
    }

    /// Terminated and waiting for the root to collect it.
    pub(crate) fn is_reapable(&self) -> bool {
        !self.reaped && self.state.is_terminated()
    }
}
