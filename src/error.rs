//! Error taxonomy for the runtime.
//!
//! Every public operation returns [`Result`]. Each variant maps onto the C
//! errno an embedding caller would expect (see [`Error::errno`]), and carries a
//! stable label for logs (see [`Error::as_label`]).

use crate::task::TaskId;

use nix::sys::signal::Signal;
use thiserror::Error;

/// Errors produced by the runtime.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed task count, option bits, task id or program.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The instance is in a state that forbids the request (re-initialization,
    /// or finalizing while tasks are still unreaped).
    #[error("runtime busy: {0}")]
    Busy(&'static str),

    /// Requested task count exceeds [`crate::NTASKS_MAX`].
    #[error("task count {requested} exceeds the maximum of {max}")]
    Overflow {
        /// The task count passed to `init`.
        requested: usize,
        /// The supported maximum.
        max: usize,
    },

    /// A signal was routed to a task id outside the declared range.
    #[error("task {0} is outside the declared task range")]
    OutOfRange(TaskId),

    /// The request is valid but cannot be satisfied by this environment, or
    /// a root-only operation was attempted by another task.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A reaped task died from a signal, so there is no exit code to report.
    #[error("task {task} was terminated by {signal}")]
    Unresolved {
        /// The reaped task.
        task: u32,
        /// The signal that terminated it.
        signal: Signal,
    },

    /// Operation attempted before `init` or after `fin`.
    #[error("runtime is not initialized")]
    NotInitialized,

    /// `wait_any` found nothing left to reap.
    #[error("no outstanding tasks")]
    NoOutstandingTasks,

    /// The task id is declared but no live task holds it.
    #[error("no live task {0}")]
    NoSuchTask(TaskId),

    /// Unexpected failure of an OS primitive.
    #[error("os error: {0}")]
    Os(#[from] nix::Error),

    /// I/O failure while preparing shared memory or an executable image.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the C errno matching this error, for callers bridging to C.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::Busy(_) => libc::EBUSY,
            Error::Overflow { .. } => libc::EOVERFLOW,
            Error::OutOfRange(_) => libc::ERANGE,
            Error::PermissionDenied(_) => libc::EPERM,
            Error::Unresolved { .. } => libc::ECANCELED,
            Error::NotInitialized => libc::ENXIO,
            Error::NoOutstandingTasks => libc::ECHILD,
            Error::NoSuchTask(_) => libc::ESRCH,
            Error::Os(errno) => *errno as i32,
            Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::Busy(_) => "busy",
            Error::Overflow { .. } => "overflow",
            Error::OutOfRange(_) => "out_of_range",
            Error::PermissionDenied(_) => "permission_denied",
            Error::Unresolved { .. } => "unresolved",
            Error::NotInitialized => "not_initialized",
            Error::NoOutstandingTasks => "no_outstanding_tasks",
            Error::NoSuchTask(_) => "no_such_task",
            Error::Os(_) => "os",
            Error::Io(_) => "io",
        }
    }

    /// True when the failure is not attributable to the caller: the request
    /// was fine but the task it observed died from a signal.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Error::Unresolved { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
