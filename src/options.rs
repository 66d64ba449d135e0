//! Option bitmask accepted by `init`.
//!
//! An empty mask means "auto": the mode comes from the environment override
//! or the platform default. Any bit outside [`Options::VALID`] is rejected.

use std::fmt;
use std::ops::BitOr;

/// Bitmask of requested initialization options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Options(u32);

impl Options {
    /// No explicit request.
    pub const AUTO: Self = Self(0);

    /// Run every task as a thread of the root's process.
    pub const THREAD: Self = Self(0x1000);

    /// Run every task as a process, with whichever creation primitive the
    /// environment prepared.
    pub const PROCESS: Self = Self(0x2000);

    /// Process tasks created through the preload-prepared primitive.
    pub const PROCESS_PRELOAD: Self = Self(0x0100);

    /// Process tasks created by duplicating the root.
    pub const PROCESS_CLONE: Self = Self(0x0200);

    /// Process tasks created through GOT interception.
    #[cfg(target_os = "linux")]
    pub const PROCESS_GOT: Self = Self(0x0400);

    /// Every recognized bit on this platform.
    #[cfg(target_os = "linux")]
    pub const VALID: Self = Self(0x1000 | 0x2000 | 0x0100 | 0x0200 | 0x0400);

    /// Every recognized bit on this platform.
    #[cfg(not(target_os = "linux"))]
    pub const VALID: Self = Self(0x1000 | 0x2000 | 0x0100 | 0x0200);

    /// Bits naming a specific process-creation primitive.
    pub(crate) const PRIMITIVES: Self = Self(0x0100 | 0x0200 | 0x0400);

    /// Bits asking for any process mode.
    pub(crate) const ANY_PROCESS: Self = Self(0x2000 | 0x0100 | 0x0200 | 0x0400);

    /// Wraps raw bits without validation; `init` performs the validation.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any bit of `other` is set in `self`.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Bits that are not recognized on this platform.
    pub const fn unknown(self) -> Self {
        Self(self.0 & !Self::VALID.0)
    }

    /// Complement of the given mask, used to probe validation.
    pub const fn complement(self) -> Self {
        Self(!self.0)
    }

    pub(crate) const fn primitive_count(self) -> u32 {
        (self.0 & Self::PRIMITIVES.0).count_ones()
    }
}

impl BitOr for Options {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}
