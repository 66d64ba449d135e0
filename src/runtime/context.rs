//! Thread-local task context.
//!
//! In thread mode several tasks share one process, so "who am I" cannot be a
//! process-wide fact. Each task thread runs its body inside [`enter_task`],
//! which records the task identity in thread-local storage for the duration
//! of the body. Threads without a context (the root's own thread, or any
//! thread of a process-mode task) fall back to the instance's process-wide
//! identity.
//!
//! The context also carries the task's private view of the instance: a task
//! that self-finalizes only finalizes its own view.
//!
//! # Termination
//!
//! A thread task cannot be killed from outside. Fatal signals and `exit`
//! instead unwind the task body with an [`Unwind`] payload, caught by the task
//! wrapper and turned into the task's exit status.

use crate::task::TaskId;

use nix::sys::signal::Signal;
use std::cell::RefCell;

/// Identity and view state of the task running on this thread.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TaskContext {
    pub(crate) id: TaskId,
    pub(crate) finalized: bool,
}

thread_local! {
    /// Context of the task whose body is running on this thread.
    ///
    /// Set by [`enter_task`] for the lifetime of a thread task's body.
    static CURRENT_TASK: RefCell<Option<TaskContext>> = const { RefCell::new(None) };
}

/// Runs `function` as the body of task `id` on this thread.
///
/// The previous context is restored on exit.
pub(crate) fn enter_task<F, R>(id: TaskId, function: F) -> R
where
    F: FnOnce() -> R,
{
    CURRENT_TASK.with(|current| {
        let previous = current.borrow_mut().replace(TaskContext {
            id,
            finalized: false,
        });

        let result = function();

        *current.borrow_mut() = previous;

        result
    })
}

/// Returns the context of the task running on this thread, if any.
pub(crate) fn current() -> Option<TaskContext> {
    CURRENT_TASK.with(|current| *current.borrow())
}

/// Marks this thread's task view as finalized.
///
/// Returns `false` when the thread runs no task body.
pub(crate) fn finalize_current() -> bool {
    CURRENT_TASK.with(|current| match current.borrow_mut().as_mut() {
        Some(context) => {
            context.finalized = true;
            true
        }
        None => false,
    })
}

/// Payload carried out of a thread task's body when it terminates early.
#[derive(Debug)]
pub(crate) enum Unwind {
    Exit(i32),
    Signal(Signal),
}

/// Leaves the current thread task's body.
///
/// Uses `resume_unwind`, so no panic hook runs and nothing is printed.
pub(crate) fn unwind(reason: Unwind) -> ! {
    std::panic::resume_unwind(Box::new(reason))
}
