//! Execution mode negotiation.
//!
//! The mode is decided once, at `init`, from three inputs: the explicit
//! option bits, the `TANDEM_MODE` environment override, and what the platform
//! can do. Explicit bits win over the override, except that the preload and
//! GOT primitives refuse to run in an environment prepared for the other one.
//!
//! ```text
//!  Options ──┐
//!            ├──► validate bits ──► resolve ──► ExecutionMode
//!  Override ─┘        │                │
//!                 InvalidArgument  PermissionDenied
//! ```

mod env;

pub use env::{MODE_ENV, ModeOverride};

use crate::error::{Error, Result};
use crate::options::Options;

use std::fmt;
use tracing::debug;

/// The substrate every task of an instance runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// Tasks are threads sharing the root's address space.
    Thread,
    /// Tasks are processes created through the preload-prepared primitive.
    ProcessPreload,
    /// Tasks are processes created by duplicating the root.
    ProcessClone,
    /// Tasks are processes created through GOT interception.
    #[cfg(target_os = "linux")]
    ProcessGot,
}

impl ExecutionMode {
    pub fn is_thread(self) -> bool {
        matches!(self, ExecutionMode::Thread)
    }

    pub fn is_process(self) -> bool {
        !self.is_thread()
    }

    /// The override that re-selects this mode, handed to exec'd children.
    pub fn as_override(self) -> ModeOverride {
        match self {
            ExecutionMode::Thread => ModeOverride::Thread,
            ExecutionMode::ProcessPreload => ModeOverride::ProcessPreload,
            ExecutionMode::ProcessClone => ModeOverride::ProcessPipclone,
            #[cfg(target_os = "linux")]
            ExecutionMode::ProcessGot => ModeOverride::ProcessGot,
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_override().as_str())
    }
}

/// Picks the execution mode for a new instance.
///
/// Performs no allocation and has no side effects.
///
/// # Errors
/// - `InvalidArgument` if `requested` carries unknown bits, mixes thread and
///   process bits, or names more than one process primitive.
/// - `PermissionDenied` if the requested primitive conflicts with the one the
///   environment was prepared for, or the platform lacks it.
pub fn negotiate(requested: Options, env: Option<ModeOverride>) -> Result<ExecutionMode> {
    let unknown = requested.unknown();
    if !unknown.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "unrecognized option bits {unknown}"
        )));
    }

    if requested.contains(Options::THREAD) && requested.intersects(Options::ANY_PROCESS) {
        return Err(Error::InvalidArgument(
            "thread and process modes are mutually exclusive".into(),
        ));
    }

    if requested.primitive_count() > 1 {
        return Err(Error::InvalidArgument(
            "at most one process-creation primitive may be requested".into(),
        ));
    }

    let mode = if requested.is_empty() {
        from_override(env)?
    } else if requested.contains(Options::THREAD) {
        ExecutionMode::Thread
    } else if requested.contains(Options::PROCESS_PRELOAD) {
        preload(env)?
    } else if requested.contains(Options::PROCESS_CLONE) {
        ExecutionMode::ProcessClone
    } else if requested.intersects(Options::PRIMITIVES) {
        got(env)?
    } else {
        any_process(env)?
    };

    debug!(options = %requested, env = ?env, %mode, "negotiated execution mode");

    Ok(mode)
}

fn from_override(env: Option<ModeOverride>) -> Result<ExecutionMode> {
    match env {
        None | Some(ModeOverride::Thread) | Some(ModeOverride::Pthread) => {
            Ok(ExecutionMode::Thread)
        }
        Some(ModeOverride::Process) | Some(ModeOverride::ProcessPipclone) => {
            Ok(ExecutionMode::ProcessClone)
        }
        Some(ModeOverride::ProcessPreload) => Ok(ExecutionMode::ProcessPreload),
        Some(ModeOverride::ProcessGot) => got(env),
    }
}

fn any_process(env: Option<ModeOverride>) -> Result<ExecutionMode> {
    match env {
        Some(ModeOverride::ProcessPreload) => preload(env),
        Some(ModeOverride::ProcessGot) => got(env),
        _ => Ok(ExecutionMode::ProcessClone),
    }
}

// Preload needs the loader step to have been prepared before the process
// started; an environment prepared for anything else cannot provide it.
fn preload(env: Option<ModeOverride>) -> Result<ExecutionMode> {
    match env {
        None | Some(ModeOverride::ProcessPreload) => Ok(ExecutionMode::ProcessPreload),
        Some(other) => Err(Error::PermissionDenied(format!(
            "process:preload requested but the environment was prepared for {other}"
        ))),
    }
}

#[cfg(target_os = "linux")]
fn got(env: Option<ModeOverride>) -> Result<ExecutionMode> {
    match env {
        Some(ModeOverride::ProcessPreload) => Err(Error::PermissionDenied(
            "process:got cannot run in an environment prepared for process:preload".into(),
        )),
        _ => Ok(ExecutionMode::ProcessGot),
    }
}

#[cfg(not(target_os = "linux"))]
fn got(_env: Option<ModeOverride>) -> Result<ExecutionMode> {
    Err(Error::PermissionDenied(
        "process:got is not available on this platform".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_without_override_is_thread() {
        assert_eq!(negotiate(Options::AUTO, None).unwrap(), ExecutionMode::Thread);
    }

    #[test]
    fn auto_follows_the_override() {
        let cases = [
            (ModeOverride::Pthread, ExecutionMode::Thread),
            (ModeOverride::Process, ExecutionMode::ProcessClone),
            (ModeOverride::ProcessPreload, ExecutionMode::ProcessPreload),
            (ModeOverride::ProcessPipclone, ExecutionMode::ProcessClone),
        ];

        for (env, expected) in cases {
            assert_eq!(negotiate(Options::AUTO, Some(env)).unwrap(), expected);
        }
    }

    #[test]
    fn explicit_request_beats_the_override() {
        let mode = negotiate(Options::THREAD, Some(ModeOverride::ProcessPipclone)).unwrap();
        assert_eq!(mode, ExecutionMode::Thread);

        let mode = negotiate(Options::PROCESS_CLONE, Some(ModeOverride::Thread)).unwrap();
        assert_eq!(mode, ExecutionMode::ProcessClone);
    }

    #[test]
    fn preload_refuses_a_foreign_environment() {
        assert_eq!(
            negotiate(Options::PROCESS_PRELOAD, None).unwrap(),
            ExecutionMode::ProcessPreload
        );

        let err = negotiate(Options::PROCESS_PRELOAD, Some(ModeOverride::Thread)).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));

        let err =
            negotiate(Options::PROCESS_PRELOAD, Some(ModeOverride::ProcessPipclone)).unwrap_err();
        assert_eq!(err.errno(), libc::EPERM);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn got_refuses_a_preload_environment() {
        assert_eq!(
            negotiate(Options::PROCESS_GOT, Some(ModeOverride::Thread)).unwrap(),
            ExecutionMode::ProcessGot
        );

        let err =
            negotiate(Options::PROCESS_GOT, Some(ModeOverride::ProcessPreload)).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[test]
    fn generic_process_bit_uses_the_prepared_primitive() {
        assert_eq!(
            negotiate(Options::PROCESS, None).unwrap(),
            ExecutionMode::ProcessClone
        );
        assert_eq!(
            negotiate(Options::PROCESS, Some(ModeOverride::ProcessPreload)).unwrap(),
            ExecutionMode::ProcessPreload
        );
    }

    #[test]
    fn conflicting_bits_are_invalid_before_the_environment_is_consulted() {
        let both = Options::THREAD | Options::PROCESS;
        assert!(matches!(
            negotiate(both, Some(ModeOverride::Thread)),
            Err(Error::InvalidArgument(_))
        ));

        let both = Options::PROCESS_PRELOAD | Options::PROCESS_CLONE;
        assert!(matches!(negotiate(both, None), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn complement_of_valid_mask_is_rejected() {
        let err = negotiate(Options::VALID.complement(), None).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
    }
}
