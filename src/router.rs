//! Signal routing between tasks.
//!
//! [`kill`] targets a task id rather than an OS entity; the substrate decides
//! whether that is a real signal or a mailbox post. [`sigmask`] and
//! [`sigwait`] act on the calling task only.
//!
//! Signals are not ordered: several signals pending on one task are taken
//! lowest-numbered first, and repeated deliveries of a pending signal merge.

use crate::error::{Error, Result};
use crate::runtime;
use crate::signal::{self, MaskHow, SignalSet};
use crate::task::TaskId;

use nix::sys::signal::Signal;
use tracing::trace;

/// Sends `signal` to `target`.
///
/// Returns once the signal is at least pending on the target.
///
/// # Errors
/// - [`Error::OutOfRange`] if `target` is a child id `>= ntasks`.
/// - [`Error::NoSuchTask`] if the child was never spawned or was reaped.
pub fn kill(target: TaskId, signal: Signal) -> Result<()> {
    let (instance, caller) = runtime::acquire()?;
    instance.registry.check_target(target)?;

    trace!(from = %caller, to = %target, %signal, "routing signal");

    instance
        .substrate
        .route(&instance.registry, caller, target, signal)
}

/// Changes the calling task's signal mask and returns the previous one.
///
/// Before `init` (or after `fin`) this is the plain thread mask operation.
pub fn sigmask(how: MaskHow, set: &SignalSet) -> Result<SignalSet> {
    match runtime::acquire() {
        Ok((instance, caller)) => instance.substrate.sigmask(caller, how, *set),
        Err(Error::NotInitialized) => signal::thread_mask(how, *set),
        Err(err) => Err(err),
    }
}

/// Blocks until a member of `set` is pending for the calling task, consumes
/// it and returns it.
///
/// Members of `set` should be blocked first; an unblocked signal may take its
/// default action instead. Signals outside `set` stay pending.
///
/// # Errors
/// [`Error::InvalidArgument`] if `set` is empty.
pub fn sigwait(set: &SignalSet) -> Result<Signal> {
    if set.is_empty() {
        return Err(Error::InvalidArgument(
            "cannot wait on an empty signal set".into(),
        ));
    }

    match runtime::acquire() {
        Ok((instance, caller)) => instance.substrate.sigwait(caller, *set),
        Err(Error::NotInitialized) => Ok(set.to_sigset().wait()?),
        Err(err) => Err(err),
    }
}
