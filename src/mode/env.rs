//! Environment override for the execution mode.
//!
//! The override is a closed set of names read from `TANDEM_MODE`. Parsing is
//! case-insensitive and accepts either `:` or `-` between `process` and the
//! primitive name.

use crate::error::{Error, Result};

use std::fmt;
use std::str::FromStr;

/// Name of the environment variable holding the mode override.
pub const MODE_ENV: &str = "TANDEM_MODE";

/// Mode requested out of band through the environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModeOverride {
    Thread,
    /// Alias of [`ModeOverride::Thread`].
    Pthread,
    /// Any process mode, primitive left to the negotiator.
    Process,
    ProcessPreload,
    ProcessPipclone,
    ProcessGot,
}

impl ModeOverride {
    /// Reads `TANDEM_MODE`.
    ///
    /// Returns `Ok(None)` when the variable is unset or empty, and
    /// `InvalidArgument` when it names no known mode.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var(MODE_ENV) {
            Ok(value) if value.trim().is_empty() => Ok(None),
            Ok(value) => value.parse().map(Some),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(std::env::VarError::NotUnicode(_)) => Err(Error::InvalidArgument(format!(
                "{MODE_ENV} is not valid unicode"
            ))),
        }
    }

    pub fn is_thread(self) -> bool {
        matches!(self, ModeOverride::Thread | ModeOverride::Pthread)
    }

    /// Canonical spelling, also used when handing the mode to exec'd children.
    pub fn as_str(self) -> &'static str {
        match self {
            ModeOverride::Thread => "thread",
            ModeOverride::Pthread => "pthread",
            ModeOverride::Process => "process",
            ModeOverride::ProcessPreload => "process:preload",
            ModeOverride::ProcessPipclone => "process:pipclone",
            ModeOverride::ProcessGot => "process:got",
        }
    }
}

impl FromStr for ModeOverride {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', ":");

        match normalized.as_str() {
            "thread" => Ok(ModeOverride::Thread),
            "pthread" => Ok(ModeOverride::Pthread),
            "process" => Ok(ModeOverride::Process),
            "process:preload" => Ok(ModeOverride::ProcessPreload),
            "process:pipclone" => Ok(ModeOverride::ProcessPipclone),
            "process:got" => Ok(ModeOverride::ProcessGot),
            _ => Err(Error::InvalidArgument(format!(
                "unrecognized {MODE_ENV} value {s:?}"
            ))),
        }
    }
}

impl fmt::Display for ModeOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
