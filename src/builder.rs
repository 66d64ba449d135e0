//! Fluent builder for runtime initialization.
//!
//! Provides a builder pattern interface for configuring and initializing the
//! process-wide runtime instance.

use crate::error::Result;
use crate::mode::ModeOverride;
use crate::options::Options;
use crate::runtime;
use crate::task::TaskId;

/// Outcome of a successful `init`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Init {
    /// Identity of the caller: [`TaskId::Root`] for the task that created the
    /// instance, [`TaskId::Child`] for a spawned task calling `init` again.
    pub id: TaskId,
    /// Number of child tasks the instance manages.
    pub ntasks: usize,
}

/// Where the mode override comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OverrideSource {
    /// Read `TANDEM_MODE` when `init` runs.
    Environment,
    Explicit(Option<ModeOverride>),
}

/// Builder for initializing the runtime with fluent API.
///
/// # Example
/// ```ignore
/// let init = RuntimeBuilder::new()
///     .ntasks(4)
///     .export_len(4096)
///     .options(Options::THREAD)
///     .init()?;
/// ```
#[derive(Clone, Debug)]
pub struct RuntimeBuilder {
    pub(crate) ntasks: usize,
    pub(crate) export_len: usize,
    pub(crate) options: Options,
    pub(crate) mode_override: OverrideSource,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    /// Creates a builder for one child task, no exported region, automatic
    /// mode selection and no mode override.
    ///
    /// # Example
    /// ```ignore
    /// let builder = RuntimeBuilder::new();
    /// ```
    pub fn new() -> Self {
        Self {
            ntasks: 1,
            export_len: 0,
            options: Options::AUTO,
            mode_override: OverrideSource::Explicit(None),
        }
    }

    /// Creates a builder whose mode override is read from `TANDEM_MODE` at
    /// `init` time.
    pub fn from_env() -> Self {
        Self {
            mode_override: OverrideSource::Environment,
            ..Self::new()
        }
    }

    /// Number of child tasks, in `[1, NTASKS_MAX]`.
    pub fn ntasks(mut self, ntasks: usize) -> Self {
        self.ntasks = ntasks;
        self
    }

    /// Size in bytes of the zero-filled region shared with every task.
    /// Zero means no region.
    pub fn export_len(mut self, len: usize) -> Self {
        self.export_len = len;
        self
    }

    /// Requested option bits.
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Sets the mode override explicitly, replacing any environment lookup.
    ///
    /// `None` means "no override".
    pub fn mode_override(mut self, mode: Option<ModeOverride>) -> Self {
        self.mode_override = OverrideSource::Explicit(mode);
        self
    }

    pub(crate) fn resolve_override(&self) -> Result<Option<ModeOverride>> {
        match self.mode_override {
            OverrideSource::Environment => ModeOverride::from_env(),
            OverrideSource::Explicit(mode) => Ok(mode),
        }
    }

    /// Initializes the runtime and returns the caller's identity.
    ///
    /// Negotiates the execution mode, allocates the task table and the
    /// exported region, and registers the caller as the root. Nothing is
    /// published unless every step succeeds.
    ///
    /// A spawned task calling `init` (a task thread, a forked child, or an
    /// exec'd image) joins the existing instance and gets its own
    /// [`TaskId::Child`] back.
    ///
    /// # Errors
    /// - [`crate::Error::Busy`] if the root calls it twice.
    /// - [`crate::Error::InvalidArgument`] for zero tasks, unknown or
    ///   conflicting option bits, or an unknown override.
    /// - [`crate::Error::Overflow`] for more than [`crate::NTASKS_MAX`] tasks.
    /// - [`crate::Error::PermissionDenied`] when the requested mode cannot run
    ///   under the override.
    ///
    /// # Example
    /// ```ignore
    /// let init = RuntimeBuilder::from_env().ntasks(8).init()?;
    /// if init.id.is_root() {
    ///     // spawn tasks
    /// }
    /// ```
    pub fn init(self) -> Result<Init> {
        runtime::initialize(&self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_override_replaces_the_environment() {
        let builder = RuntimeBuilder::from_env().mode_override(Some(ModeOverride::Thread));

        assert_eq!(
            builder.resolve_override().unwrap(),
            Some(ModeOverride::Thread)
        );
        assert_eq!(
            RuntimeBuilder::new().resolve_override().unwrap(),
            None,
            "a plain builder must not consult the environment"
        );
    }
}
