//! Environment handed to an exec'd image so it can join its instance.
//!
//! The spawner writes these variables into the image's environment; `init`
//! in the image reads them back and attaches to the inherited descriptors
//! instead of creating a new root.

use crate::error::{Error, Result};
use crate::mode::{self, ExecutionMode, MODE_ENV, ModeOverride};
use crate::options::Options;

use std::env;
use std::os::fd::RawFd;
use std::str::FromStr;

pub(crate) const TASK_ID_ENV: &str = "TANDEM_TASK_ID";
const NTASKS_ENV: &str = "TANDEM_NTASKS";
const CONTROL_FD_ENV: &str = "TANDEM_CONTROL_FD";
const CONTROL_LEN_ENV: &str = "TANDEM_CONTROL_LEN";
const EXPORT_FD_ENV: &str = "TANDEM_EXPORT_FD";
const EXPORT_LEN_ENV: &str = "TANDEM_EXPORT_LEN";

const HANDOFF_VARS: [&str; 7] = [
    TASK_ID_ENV,
    NTASKS_ENV,
    MODE_ENV,
    CONTROL_FD_ENV,
    CONTROL_LEN_ENV,
    EXPORT_FD_ENV,
    EXPORT_LEN_ENV,
];

/// Prefix shared by every variable the runtime owns.
pub(crate) const ENV_PREFIX: &[u8] = b"TANDEM_";

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Handoff {
    pub(crate) task: u32,
    pub(crate) ntasks: usize,
    pub(crate) mode: ExecutionMode,
    pub(crate) control: (RawFd, usize),
    pub(crate) export: Option<(RawFd, usize)>,
}

impl Handoff {
    /// Reads a handoff left by a spawner, if this process is a spawned image.
    pub(crate) fn from_env() -> Result<Option<Self>> {
        let Some(task) = read::<u32>(TASK_ID_ENV)? else {
            return Ok(None);
        };

        let ntasks = require::<usize>(NTASKS_ENV)?;
        if task as usize >= ntasks {
            return Err(Error::InvalidArgument(format!(
                "{TASK_ID_ENV}={task} is outside [0, {ntasks})"
            )));
        }

        let mode = match ModeOverride::from_env()? {
            Some(mode) if !mode.is_thread() => mode::negotiate(Options::AUTO, Some(mode))?,
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "{MODE_ENV} must name a process mode in a spawned image"
                )));
            }
        };

        let control = (
            require::<RawFd>(CONTROL_FD_ENV)?,
            require::<usize>(CONTROL_LEN_ENV)?,
        );

        let export = match read::<RawFd>(EXPORT_FD_ENV)? {
            Some(fd) => Some((fd, require::<usize>(EXPORT_LEN_ENV)?)),
            None => None,
        };

        Ok(Some(Self {
            task,
            ntasks,
            mode,
            control,
            export,
        }))
    }

    /// Removes every handoff variable from this process's environment, so
    /// nothing this image executes later attaches to descriptors it does not
    /// own.
    pub(crate) fn consume(&self) {
        for name in HANDOFF_VARS {
            // The runtime lock is held; std's own environment accessors are
            // serialized against this.
            unsafe { env::remove_var(name) };
        }
    }

    /// Variables to place in the image's environment.
    pub(crate) fn to_env(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            (TASK_ID_ENV, self.task.to_string()),
            (NTASKS_ENV, self.ntasks.to_string()),
            (MODE_ENV, self.mode.as_override().as_str().to_string()),
            (CONTROL_FD_ENV, self.control.0.to_string()),
            (CONTROL_LEN_ENV, self.control.1.to_string()),
        ];

        if let Some((fd, len)) = self.export {
            vars.push((EXPORT_FD_ENV, fd.to_string()));
            vars.push((EXPORT_LEN_ENV, len.to_string()));
        }

        vars
    }
}

fn read<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidArgument(format!("{name}={value} is malformed"))),
        _ => Ok(None),
    }
}

fn require<T: FromStr>(name: &str) -> Result<T> {
    read(name)?
        .ok_or_else(|| Error::InvalidArgument(format!("{name} is missing from the handoff")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exports_only_what_the_image_needs() {
        let handoff = Handoff {
            task: 2,
            ntasks: 4,
            mode: ExecutionMode::ProcessClone,
            control: (7, 96),
            export: None,
        };

        let vars = handoff.to_env();

        assert!(vars.contains(&(TASK_ID_ENV, "2".to_string())));
        assert!(vars.contains(&(MODE_ENV, "process:pipclone".to_string())));
        assert!(vars.iter().all(|(name, _)| *name != EXPORT_FD_ENV));
        assert!(vars.iter().all(|(name, _)| name.as_bytes().starts_with(ENV_PREFIX)));
        assert!(vars.iter().all(|(name, _)| HANDOFF_VARS.contains(name)));
    }
}
