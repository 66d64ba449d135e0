//! Collecting terminated tasks.
//!
//! Every spawned task is reaped exactly once, by the root, through [`wait`],
//! [`wait_status`] or [`wait_any`].

use crate::error::{Error, Result};
use crate::runtime::{self, Instance, context};
use crate::runtime::context::Unwind;
use crate::substrate;
use crate::task::{ExitStatus, TaskId};

use std::sync::Arc;
use tracing::debug;

fn root_instance(operation: &str) -> Result<Arc<Instance>> {
    let (instance, caller) = runtime::acquire()?;

    if !caller.is_root() {
        return Err(Error::PermissionDenied(format!(
            "task {caller} cannot {operation}; only the root can"
        )));
    }

    Ok(instance)
}

/// Blocks until child `task` terminates, reaps it and returns how it ended.
///
/// # Errors
/// - [`Error::OutOfRange`] if `task >= ntasks`.
/// - [`Error::NoSuchTask`] if it was never spawned or is already reaped.
/// - [`Error::PermissionDenied`] unless called by the root.
pub fn wait_status(task: u32) -> Result<ExitStatus> {
    let instance = root_instance("wait")?;
    instance.registry.check_target(TaskId::Child(task))?;

    let status = instance.substrate.reap(&instance.registry, task)?;
    debug!(task, %status, "collected task");

    Ok(status)
}

/// Blocks until child `task` terminates, reaps it and returns its exit code.
///
/// A task killed by a signal is still reaped, and reported as
/// [`Error::Unresolved`] with the signal.
///
/// # Example
/// ```ignore
/// match tandem::wait(id) {
///     Ok(code) => println!("task {id} exited with {code}"),
///     Err(Error::Unresolved { signal, .. }) => println!("task {id} killed by {signal}"),
///     Err(err) => return Err(err),
/// }
/// ```
pub fn wait(task: u32) -> Result<i32> {
    wait_status(task)?.into_code(task)
}

/// Blocks until any outstanding child terminates, reaps it and returns its id
/// and exit code.
///
/// # Errors
/// - [`Error::NoOutstandingTasks`] once every spawned task has been reaped.
/// - [`Error::Unresolved`] if the reaped task died from a signal.
pub fn wait_any() -> Result<(u32, i32)> {
    let instance = root_instance("wait")?;

    let (task, status) = instance.substrate.reap_any(&instance.registry)?;
    debug!(task, %status, "collected task");

    status.into_code(task).map(|code| (task, code))
}

/// Terminates the calling task with `code`.
///
/// A thread task ends its own thread, a process task ends its own process,
/// and the root (or a caller outside any instance) exits the whole process.
/// A forked task never runs the root's exit handlers, even after its `fin`.
/// A thread of the root process that is not a task ends only itself.
pub fn exit(code: i32) -> ! {
    if substrate::is_forked_task() {
        substrate::exit_child(code)
    }

    let instance = runtime::current();

    let caller = match (context::current(), &instance) {
        (Some(context), _) => Ok(context.id),
        (None, Some(instance)) => instance.caller(),
        (None, None) => Ok(TaskId::Root),
    };

    match (caller, instance) {
        (Ok(TaskId::Child(index)), Some(instance)) => instance.substrate.exit_task(index, code),
        (Ok(TaskId::Child(_)), None) | (Err(_), _) => context::unwind(Unwind::Exit(code)),
        (Ok(TaskId::Root), _) => std::process::exit(code),
    }
}
