//! Task identity, lifecycle state and the programs tasks run.
//!
//! A task is one member of the fixed-size group an instance manages. It is
//! named by a [`TaskId`]: either [`TaskId::Root`], the task that called `init`,
//! or [`TaskId::Child`] with an index in `[0, ntasks)`.
//!
//! # Lifecycle
//!
//! ```text
//! Pending ──spawn──► Running ──┬──► Exited(code)
//!                              └──► Signaled(signal)
//! ```
//!
//! The terminal transition happens exactly once and never reverts. Reaping a
//! terminated task consumes it; it cannot be reaped or spawned again.
//!
//! # Programs
//!
//! [`Program::entry`] runs a closure as the task body and works in every mode.
//! [`Program::image`] executes a program image and needs a process mode; the
//! image joins the instance by calling `init` itself.
//!
//! ```ignore
//! use tandem::{CpuCore, Program};
//!
//! let id = tandem::spawn(Program::entry(|id| {
//!     println!("task {id} running");
//!     0
//! }), CpuCore::AsIs, None)?;
//! ```

use crate::error::{Error, Result};

use nix::sys::signal::Signal;
use std::fmt;
use std::path::PathBuf;

/// Identity of a task within an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskId {
    /// The task that initialized the instance.
    Root,
    /// A spawned task, indexed in `[0, ntasks)`.
    Child(u32),
}

impl TaskId {
    /// Raw value of the root sentinel, for callers that flatten ids to integers.
    pub const ROOT_RAW: i64 = -1;

    pub fn is_root(self) -> bool {
        matches!(self, TaskId::Root)
    }

    /// The child index, or `None` for the root.
    pub fn index(self) -> Option<u32> {
        match self {
            TaskId::Root => None,
            TaskId::Child(index) => Some(index),
        }
    }

    /// Flattens the id: the root becomes [`TaskId::ROOT_RAW`].
    pub fn as_raw(self) -> i64 {
        match self {
            TaskId::Root => Self::ROOT_RAW,
            TaskId::Child(index) => i64::from(index),
        }
    }

    /// Inverse of [`TaskId::as_raw`].
    ///
    /// Only the shape of the value is checked here; whether a child index is
    /// inside an instance's range is decided by the operation that uses it.
    pub fn from_raw(raw: i64) -> Result<Self> {
        if raw == Self::ROOT_RAW {
            return Ok(TaskId::Root);
        }

        u32::try_from(raw)
            .map(TaskId::Child)
            .map_err(|_| Error::InvalidArgument(format!("{raw} is not a task id")))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskId::Root => f.write_str("root"),
            TaskId::Child(index) => write!(f, "#{index}"),
        }
    }
}

/// Lifecycle state of a task record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Declared at `init`, not yet realized.
    Pending,
    /// Realized by `spawn` and not yet terminated.
    Running,
    /// Terminated through a normal exit path.
    Exited(i32),
    /// Terminated by a signal.
    Signaled(Signal),
}

impl TaskState {
    pub fn is_terminated(self) -> bool {
        matches!(self, TaskState::Exited(_) | TaskState::Signaled(_))
    }

    pub(crate) fn exit_status(self) -> Option<ExitStatus> {
        match self {
            TaskState::Exited(code) => Some(ExitStatus::Exited(code)),
            TaskState::Signaled(signal) => Some(ExitStatus::Signaled(signal)),
            TaskState::Pending | TaskState::Running => None,
        }
    }
}

impl From<ExitStatus> for TaskState {
    fn from(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Exited(code) => TaskState::Exited(code),
            ExitStatus::Signaled(signal) => TaskState::Signaled(signal),
        }
    }
}

/// How a reaped task terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(Signal),
}

impl ExitStatus {
    pub fn code(self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(code),
            ExitStatus::Signaled(_) => None,
        }
    }

    pub fn signal(self) -> Option<Signal> {
        match self {
            ExitStatus::Exited(_) => None,
            ExitStatus::Signaled(signal) => Some(signal),
        }
    }

    pub fn success(self) -> bool {
        self == ExitStatus::Exited(0)
    }

    /// The exit code, or `Unresolved` when the task died from a signal.
    pub fn into_code(self, task: u32) -> Result<i32> {
        match self {
            ExitStatus::Exited(code) => Ok(code),
            ExitStatus::Signaled(signal) => Err(Error::Unresolved { task, signal }),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exited with {code}"),
            ExitStatus::Signaled(signal) => write!(f, "terminated by {signal}"),
        }
    }
}

/// CPU placement requested for a spawned task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CpuCore {
    /// Inherit the spawner's placement.
    #[default]
    AsIs,
    /// Pin the task to one core.
    Core(usize),
}

/// Body of an entry task: receives its child index, returns its exit code.
pub type TaskMain = Box<dyn FnOnce(u32) -> i32 + Send + 'static>;

/// What a spawned task runs.
pub struct Program {
    pub(crate) kind: ProgramKind,
}

pub(crate) enum ProgramKind {
    Entry(TaskMain),
    Image { path: PathBuf, args: Vec<String> },
}

impl Program {
    /// A closure run as the task body; its return value is the exit code.
    pub fn entry<F>(main: F) -> Self
    where
        F: FnOnce(u32) -> i32 + Send + 'static,
    {
        Self {
            kind: ProgramKind::Entry(Box::new(main)),
        }
    }

    /// An executable image started with `args` (not including the program
    /// name, which is taken from `path`).
    pub fn image<P, I, S>(path: P, args: I) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: ProgramKind::Image {
                path: path.into(),
                args: args.into_iter().map(Into::into).collect(),
            },
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self.kind, ProgramKind::Image { .. })
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ProgramKind::Entry(_) => f.write_str("Program::Entry"),
            ProgramKind::Image { path, args } => f
                .debug_struct("Program::Image")
                .field("path", path)
                .field("args", args)
                .finish(),
        }
    }
}
