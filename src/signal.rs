//! Signal sets and mask operations shared by both substrates.
//!
//! [`SignalSet`] is a plain value type so masks can be compared and stored in
//! mailboxes; it converts to the OS representation only at the syscall edge.

use crate::error::Result;

use nix::sys::signal::{SigSet, SigmaskHow, Signal, pthread_sigmask};
use std::fmt;

/// A set of standard signals.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SignalSet(u64);

impl SignalSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn add(&mut self, signal: Signal) {
        self.0 |= bit(signal);
    }

    pub fn remove(&mut self, signal: Signal) {
        self.0 &= !bit(signal);
    }

    pub fn with(mut self, signal: Signal) -> Self {
        self.add(signal);
        self
    }

    pub fn contains(self, signal: Signal) -> bool {
        self.0 & bit(signal) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn iter(self) -> impl Iterator<Item = Signal> {
        Signal::iterator().filter(move |signal| self.contains(*signal))
    }

    /// Lowest-numbered member, used when draining a pending set.
    pub(crate) fn first(self) -> Option<Signal> {
        self.iter().next()
    }

    /// The mask that results from applying `how` with `set` to `self`.
    pub fn apply(self, how: MaskHow, set: Self) -> Self {
        match how {
            MaskHow::Block => self.union(set),
            MaskHow::Unblock => self.difference(set),
            MaskHow::SetMask => set,
        }
    }

    pub(crate) fn to_sigset(self) -> SigSet {
        let mut sigset = SigSet::empty();
        for signal in self.iter() {
            sigset.add(signal);
        }
        sigset
    }

    pub(crate) fn from_sigset(sigset: &SigSet) -> Self {
        Signal::iterator()
            .filter(|signal| sigset.contains(*signal))
            .collect()
    }
}

fn bit(signal: Signal) -> u64 {
    1u64 << (signal as i32 as u32)
}

impl FromIterator<Signal> for SignalSet {
    fn from_iter<I: IntoIterator<Item = Signal>>(iter: I) -> Self {
        let mut set = SignalSet::empty();
        for signal in iter {
            set.add(signal);
        }
        set
    }
}

impl<const N: usize> From<[Signal; N]> for SignalSet {
    fn from(signals: [Signal; N]) -> Self {
        signals.into_iter().collect()
    }
}

impl fmt::Debug for SignalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// How `sigmask` combines the given set with the current mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaskHow {
    Block,
    Unblock,
    SetMask,
}

impl From<MaskHow> for SigmaskHow {
    fn from(how: MaskHow) -> Self {
        match how {
            MaskHow::Block => SigmaskHow::SIG_BLOCK,
            MaskHow::Unblock => SigmaskHow::SIG_UNBLOCK,
            MaskHow::SetMask => SigmaskHow::SIG_SETMASK,
        }
    }
}

/// Signals the runtime routes itself. Thread-mode task threads keep these
/// blocked at the OS level so only the router delivers them.
pub fn reserved() -> SignalSet {
    SignalSet::from([
        Signal::SIGUSR1,
        Signal::SIGUSR2,
        Signal::SIGHUP,
        Signal::SIGINT,
        Signal::SIGQUIT,
        Signal::SIGTERM,
        Signal::SIGALRM,
    ])
}

/// Signals no mask can hold back or wait for.
pub(crate) fn unblockable() -> SignalSet {
    SignalSet::from([Signal::SIGKILL, Signal::SIGSTOP])
}

/// Signals whose default disposition is to be discarded.
pub(crate) fn ignored_by_default(signal: Signal) -> bool {
    matches!(
        signal,
        Signal::SIGCHLD | Signal::SIGURG | Signal::SIGWINCH | Signal::SIGCONT
    )
}

/// Changes the calling thread's OS mask and returns the previous one.
pub(crate) fn thread_mask(how: MaskHow, set: SignalSet) -> Result<SignalSet> {
    let mut old = SigSet::empty();
    pthread_sigmask(how.into(), Some(&set.to_sigset()), Some(&mut old))?;
    Ok(SignalSet::from_sigset(&old))
}

/// The calling thread's OS mask.
pub(crate) fn current_thread_mask() -> Result<SignalSet> {
    Ok(SignalSet::from_sigset(&SigSet::thread_get_mask()?))
}
