//! Runtime subsystem modules.

pub(crate) mod context;
mod core;

pub(crate) use core::{Instance, acquire, current, initialize};
pub use core::{export, fin, is_initialized, mode, my_id, ntasks, state};
