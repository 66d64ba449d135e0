//! Realizing pending tasks.

use crate::affinity;
use crate::error::{Error, Result};
use crate::runtime;
use crate::task::{CpuCore, Program};

use tracing::debug;

/// Realizes a pending task running `program` and returns its id.
///
/// In thread mode the task is a new thread that starts with the root's
/// emulated mask and the reserved signals blocked at the OS level. In process
/// modes it is a forked child, exec'd for [`Program::image`]. The task is
/// `Running` by the time this returns; it may not have started executing yet.
///
/// # Arguments
/// * `program` - what the task runs
/// * `cpu` - core to pin the task to, or [`CpuCore::AsIs`]
/// * `desired` - a specific pending id, or `None` for the lowest unused one
///
/// # Errors
/// - [`Error::PermissionDenied`] unless called by the root.
/// - [`Error::InvalidArgument`] if `desired` is out of range or already used,
///   every id is used, or an image is spawned in thread mode.
///
/// # Example
/// ```ignore
/// let id = tandem::spawn(Program::entry(|id| id as i32), CpuCore::AsIs, None)?;
/// assert_eq!(tandem::wait(id)?, id as i32);
/// ```
pub fn spawn(program: Program, cpu: CpuCore, desired: Option<u32>) -> Result<u32> {
    let (instance, caller) = runtime::acquire()?;

    if !caller.is_root() {
        return Err(Error::PermissionDenied(format!(
            "task {caller} cannot spawn; only the root can"
        )));
    }

    affinity::validate(cpu)?;

    let index = instance.registry.reserve(desired, cpu)?;

    if let Err(err) = instance.substrate.spawn(&instance, index, program, cpu) {
        instance.registry.release(index);
        return Err(err);
    }

    debug!(task = index, mode = %instance.mode, ?cpu, "spawned task");

    Ok(index)
}
