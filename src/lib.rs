//! Hybrid task runtime running a fixed group of cooperating tasks as either
//! threads or processes behind one API.
//!
//! A root task initializes the runtime with a task count, an optional
//! exported memory region and option bits, then spawns its children. Tasks
//! signal each other by task id, wait for signals, and share the exported
//! region; the root reaps every child and finalizes.
//!
//! # Architecture
//!
//! - **Mode negotiation**: option bits plus the `TANDEM_MODE` override pick a
//!   [`ExecutionMode`] once per instance
//! - **Registry**: fixed table of task records, ids and lifecycle states
//! - **Spawner**: realizes a task as a thread or a forked/exec'd process
//! - **Router**: task-to-task signals, real in process modes and emulated
//!   through per-task mailboxes in thread mode
//! - **Reaper**: `wait`/`wait_any`, each task collected once
//! - **RuntimeBuilder**: fluent configuration surface for `init`
//!
//! # Example
//! ```ignore
//! use tandem::{CpuCore, Options, Program, TaskId};
//!
//! let init = tandem::init(4, 0, Options::AUTO)?;
//! assert_eq!(init.id, TaskId::Root);
//!
//! for _ in 0..init.ntasks {
//!     tandem::spawn(Program::entry(|id| id as i32), CpuCore::AsIs, None)?;
//! }
//! while let Ok((id, code)) = tandem::wait_any() {
//!     assert_eq!(code, id as i32);
//! }
//! tandem::fin()?;
//! ```

mod affinity;
mod builder;
mod error;
mod memory;
mod mode;
mod options;
mod reaper;
mod registry;
mod router;
mod runtime;
mod signal;
mod spawner;
mod substrate;
mod task;

pub use builder::{Init, RuntimeBuilder};
pub use error::{Error, Result};
pub use memory::ExportedRegion;
pub use mode::{ExecutionMode, MODE_ENV, ModeOverride, negotiate};
pub use nix::sys::signal::Signal;
pub use options::Options;
pub use reaper::{exit, wait, wait_any, wait_status};
pub use router::{kill, sigmask, sigwait};
pub use runtime::{export, fin, is_initialized, mode, my_id, ntasks, state};
pub use signal::{MaskHow, SignalSet, reserved as reserved_signals};
pub use spawner::spawn;
pub use task::{CpuCore, ExitStatus, Program, TaskId, TaskMain, TaskState};

/// Largest task count an instance accepts.
pub const NTASKS_MAX: usize = 300;

/// Initializes the runtime, taking the mode override from `TANDEM_MODE`.
///
/// Shorthand for
/// `RuntimeBuilder::from_env().ntasks(ntasks).export_len(export_len).options(options).init()`.
pub fn init(ntasks: usize, export_len: usize, options: Options) -> Result<Init> {
    RuntimeBuilder::from_env()
        .ntasks(ntasks)
        .export_len(export_len)
        .options(options)
        .init()
}
